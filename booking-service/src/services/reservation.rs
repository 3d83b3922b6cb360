//! Reservation engine: booking lifecycle, slot conflicts and access codes.
//!
//! Every state change runs in one Postgres transaction. Creation and
//! confirmation serialise on the pod row (`FOR UPDATE`), so two requests for
//! overlapping windows on the same pod cannot both pass the conflict check.
//! Locks are always taken pod first, then booking.

use crate::models::{
    AccessCode, AccessCodeStatus, Booking, BookingDetail, BookingDetailRow, BookingStatus,
    BookingWithAccessCode, Pod, PodSearch, PodSearchResult, PodSummary, UserSummary,
};
use crate::services::access_code::AccessCodeIssuer;
use crate::services::database::Database;
use crate::services::error::ServiceError;
use crate::services::metrics::{record_booking_operation, DB_QUERY_DURATION};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MILLIS_PER_HOUR: i64 = 3_600_000;
const DEFAULT_SEARCH_LIMIT: i64 = 50;
const MAX_SEARCH_LIMIT: i64 = 200;

/// Half-open interval overlap: `[a_start, a_end)` and `[b_start, b_end)` share
/// at least one instant.
pub fn intervals_overlap<T: PartialOrd>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && a_end > b_start
}

/// Reject empty, inverted or past booking windows.
pub fn validate_window(
    check_in: DateTime<Utc>,
    check_out: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if check_in >= check_out {
        return Err(ServiceError::InvalidInput(
            "check_in must be before check_out".to_string(),
        ));
    }
    if check_in < now {
        return Err(ServiceError::InvalidInput(
            "check_in must not be in the past".to_string(),
        ));
    }
    Ok(())
}

/// Billable hours: any started hour counts in full.
pub fn billable_hours(check_in: DateTime<Utc>, check_out: DateTime<Utc>) -> i64 {
    let millis = (check_out - check_in).num_milliseconds().max(0);
    (millis + MILLIS_PER_HOUR - 1) / MILLIS_PER_HOUR
}

pub fn compute_total_price(
    check_in: DateTime<Utc>,
    check_out: DateTime<Utc>,
    price_per_hour: Decimal,
) -> Decimal {
    Decimal::from(billable_hours(check_in, check_out)) * price_per_hour
}

/// Result of confirming a booking inside a caller's transaction.
#[derive(Debug)]
pub enum ConfirmOutcome {
    Confirmed(Booking),
    AlreadyConfirmed(Booking),
    /// Booking exists but is not `pending` (or `confirmed`).
    NotPending(Booking),
    /// Another confirmed booking now holds an overlapping window.
    SlotTaken(Booking),
    Missing,
}

#[derive(Clone)]
pub struct ReservationEngine {
    db: Database,
    issuer: Arc<dyn AccessCodeIssuer>,
    pending_hold: Duration,
}

impl ReservationEngine {
    pub fn new(db: Database, issuer: Arc<dyn AccessCodeIssuer>, pending_hold: Duration) -> Self {
        Self {
            db,
            issuer,
            pending_hold,
        }
    }

    /// Pending bookings created after this instant still hold their slot.
    fn hold_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.pending_hold
    }

    /// Reserve `[check_in, check_out)` on a pod and issue its access code.
    #[instrument(skip(self), fields(user_id = %user_id, pod_id = %pod_id))]
    pub async fn create_booking(
        &self,
        user_id: Uuid,
        pod_id: Uuid,
        check_in: DateTime<Utc>,
        check_out: DateTime<Utc>,
    ) -> Result<BookingWithAccessCode, ServiceError> {
        let result = self
            .create_booking_inner(user_id, pod_id, check_in, check_out)
            .await;

        match &result {
            Ok(created) => {
                record_booking_operation("create", "success");
                info!(
                    booking_id = %created.booking.booking_id,
                    total_price = %created.booking.total_price,
                    "Booking created"
                );
            }
            Err(e) => record_booking_operation("create", e.label()),
        }
        result
    }

    async fn create_booking_inner(
        &self,
        user_id: Uuid,
        pod_id: Uuid,
        check_in: DateTime<Utc>,
        check_out: DateTime<Utc>,
    ) -> Result<BookingWithAccessCode, ServiceError> {
        validate_window(check_in, check_out, Utc::now())?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_booking"])
            .start_timer();

        // Dropping `tx` without commit rolls everything back.
        let mut tx = self.db.pool().begin().await?;

        let pod = lock_pod(&mut tx, pod_id).await?;
        let pod = match pod {
            Some(pod) if pod.is_available() => pod,
            _ => return Err(ServiceError::PodUnavailable(pod_id)),
        };

        let user = fetch_user(&mut tx, user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User", user_id))?;

        if has_blocking_overlap(&mut tx, pod_id, None, check_in, check_out, Some(self.hold_cutoff()))
            .await?
        {
            return Err(ServiceError::SlotConflict);
        }

        let total_price = compute_total_price(check_in, check_out, pod.price_per_hour);

        let booking = sqlx::query_as::<_, Booking>(
            r#"
            INSERT INTO bookings (booking_id, user_id, pod_id, status, check_in, check_out, total_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(pod_id)
        .bind(BookingStatus::Pending.as_str())
        .bind(check_in)
        .bind(check_out)
        .bind(total_price)
        .fetch_one(&mut *tx)
        .await?;

        let pin = self.issuer.generate_pin();
        let qr_code =
            self.issuer
                .encode_access_payload(booking.booking_id, &pin, check_in, check_out)?;

        let access_code = sqlx::query_as::<_, AccessCode>(
            r#"
            INSERT INTO access_codes (access_code_id, booking_id, pin, qr_code, valid_from, valid_until, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(booking.booking_id)
        .bind(&pin)
        .bind(&qr_code)
        .bind(check_in)
        .bind(check_out)
        .bind(AccessCodeStatus::Active.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        timer.observe_duration();

        Ok(BookingWithAccessCode {
            pod: PodSummary::from(&pod),
            user,
            booking,
            access_code,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_booking_by_id(&self, booking_id: Uuid) -> Result<BookingDetail, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_booking_by_id"])
            .start_timer();

        let mut conn = self.db.pool().acquire().await?;
        let row = sqlx::query_as::<_, BookingDetailRow>(&format!(
            "{} WHERE b.booking_id = $1",
            BOOKING_DETAIL_SELECT
        ))
        .bind(booking_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Booking", booking_id))?;

        let access_code = fetch_access_code(&mut conn, booking_id).await?;
        timer.observe_duration();

        Ok(row.into_detail(access_code))
    }

    /// A user's bookings, newest first.
    #[instrument(skip(self))]
    pub async fn get_user_bookings(&self, user_id: Uuid) -> Result<Vec<BookingDetail>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_user_bookings"])
            .start_timer();

        let rows = sqlx::query_as::<_, BookingDetailRow>(&format!(
            "{} WHERE b.user_id = $1 ORDER BY b.created_utc DESC",
            BOOKING_DETAIL_SELECT
        ))
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        let booking_ids: Vec<Uuid> = rows.iter().map(|r| r.booking.booking_id).collect();
        let mut codes = sqlx::query_as::<_, AccessCode>(
            "SELECT * FROM access_codes WHERE booking_id = ANY($1)",
        )
        .bind(&booking_ids)
        .fetch_all(self.db.pool())
        .await?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(|row| {
                let code = codes
                    .iter()
                    .position(|c| c.booking_id == row.booking.booking_id)
                    .map(|i| codes.swap_remove(i));
                row.into_detail(code)
            })
            .collect())
    }

    /// `pending -> confirmed`, re-checking confirmed overlaps under the pod lock.
    #[instrument(skip(self))]
    pub async fn confirm_booking(&self, booking_id: Uuid) -> Result<Booking, ServiceError> {
        let mut tx = self.db.pool().begin().await?;
        let outcome = confirm_in_tx(&mut tx, booking_id).await?;

        let result = match outcome {
            ConfirmOutcome::Confirmed(booking) => {
                tx.commit().await?;
                Ok(booking)
            }
            ConfirmOutcome::SlotTaken(_) => Err(ServiceError::SlotConflict),
            ConfirmOutcome::Missing => Err(ServiceError::InvalidTransition(format!(
                "booking {} not found or already processed",
                booking_id
            ))),
            ConfirmOutcome::AlreadyConfirmed(b) | ConfirmOutcome::NotPending(b) => {
                Err(ServiceError::InvalidTransition(format!(
                    "booking {} is {}",
                    booking_id, b.status
                )))
            }
        };

        match &result {
            Ok(_) => {
                record_booking_operation("confirm", "success");
                info!(booking_id = %booking_id, "Booking confirmed");
            }
            Err(e) => record_booking_operation("confirm", e.label()),
        }
        result
    }

    /// Cancel an owned booking and revoke its access code in one transaction.
    #[instrument(skip(self), fields(booking_id = %booking_id, user_id = %requesting_user))]
    pub async fn cancel_booking(
        &self,
        booking_id: Uuid,
        requesting_user: Uuid,
    ) -> Result<Booking, ServiceError> {
        let result = self.cancel_booking_inner(booking_id, requesting_user).await;
        match &result {
            Ok(_) => {
                record_booking_operation("cancel", "success");
                info!("Booking cancelled, access code revoked");
            }
            Err(e) => record_booking_operation("cancel", e.label()),
        }
        result
    }

    async fn cancel_booking_inner(
        &self,
        booking_id: Uuid,
        requesting_user: Uuid,
    ) -> Result<Booking, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_booking"])
            .start_timer();

        let mut tx = self.db.pool().begin().await?;

        let booking = lock_booking(&mut tx, booking_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Booking", booking_id))?;

        if booking.user_id != requesting_user {
            return Err(ServiceError::Unauthorized(
                "booking belongs to another user".to_string(),
            ));
        }
        if !booking
            .parsed_status()
            .can_transition_to(BookingStatus::Cancelled)
        {
            return Err(ServiceError::InvalidTransition(format!(
                "booking {} is already {}",
                booking_id, booking.status
            )));
        }

        let booking = set_booking_status(&mut tx, booking_id, BookingStatus::Cancelled).await?;

        sqlx::query(
            r#"
            UPDATE access_codes
            SET status = $2, revoked_utc = NOW()
            WHERE booking_id = $1 AND status <> $2
            "#,
        )
        .bind(booking_id)
        .bind(AccessCodeStatus::Revoked.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        timer.observe_duration();

        Ok(booking)
    }

    /// Available pods within `range_km`, nearest first. With a window given,
    /// pods holding a blocking booking in it are left out.
    #[instrument(skip(self, search))]
    pub async fn search_pods(&self, search: &PodSearch) -> Result<Vec<PodSearchResult>, ServiceError> {
        if !(-90.0..=90.0).contains(&search.latitude)
            || !(-180.0..=180.0).contains(&search.longitude)
        {
            return Err(ServiceError::InvalidInput(
                "coordinates out of range".to_string(),
            ));
        }
        if search.range_km <= 0.0 {
            return Err(ServiceError::InvalidInput(
                "range_km must be positive".to_string(),
            ));
        }
        if let (Some(check_in), Some(check_out)) = (search.check_in, search.check_out) {
            if check_in >= check_out {
                return Err(ServiceError::InvalidInput(
                    "check_in must be before check_out".to_string(),
                ));
            }
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["search_pods"])
            .start_timer();

        let limit = search
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);

        let pods = sqlx::query_as::<_, PodSearchResult>(
            r#"
            SELECT s.* FROM (
                SELECT p.*,
                    (6371.0 * acos(LEAST(1.0, GREATEST(-1.0,
                        cos(radians($1)) * cos(radians(p.latitude))
                            * cos(radians(p.longitude) - radians($2))
                        + sin(radians($1)) * sin(radians(p.latitude))
                    ))))::DOUBLE PRECISION AS distance_km
                FROM pods p
                WHERE p.status = 'available'
                  AND ($4::INTEGER IS NULL OR p.max_capacity >= $4)
                  AND ($5::TIMESTAMPTZ IS NULL OR $6::TIMESTAMPTZ IS NULL OR NOT EXISTS (
                      SELECT 1 FROM bookings b
                      WHERE b.pod_id = p.pod_id
                        AND (b.status = 'confirmed' OR (b.status = 'pending' AND b.created_utc > $7))
                        AND b.check_in < $6
                        AND b.check_out > $5
                  ))
            ) s
            WHERE s.distance_km <= $3
            ORDER BY s.distance_km
            LIMIT $8
            "#,
        )
        .bind(search.latitude)
        .bind(search.longitude)
        .bind(search.range_km)
        .bind(search.min_capacity)
        .bind(search.check_in)
        .bind(search.check_out)
        .bind(self.hold_cutoff())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        timer.observe_duration();
        Ok(pods)
    }
}

const BOOKING_DETAIL_SELECT: &str = r#"
    SELECT b.*,
        p.pod_number, p.description AS pod_description, p.address AS pod_address,
        p.price_per_hour, p.max_capacity, p.latitude, p.longitude,
        u.name AS user_name, u.email AS user_email, u.phone_number AS user_phone_number
    FROM bookings b
    JOIN pods p ON p.pod_id = b.pod_id
    JOIN users u ON u.user_id = b.user_id
"#;

async fn lock_pod(conn: &mut PgConnection, pod_id: Uuid) -> Result<Option<Pod>, sqlx::Error> {
    sqlx::query_as::<_, Pod>("SELECT * FROM pods WHERE pod_id = $1 FOR UPDATE")
        .bind(pod_id)
        .fetch_optional(conn)
        .await
}

async fn lock_booking(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<Option<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE booking_id = $1 FOR UPDATE")
        .bind(booking_id)
        .fetch_optional(conn)
        .await
}

async fn fetch_user(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Option<UserSummary>, sqlx::Error> {
    sqlx::query_as::<_, UserSummary>(
        "SELECT user_id, name, email, phone_number FROM users WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

async fn fetch_access_code(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<Option<AccessCode>, sqlx::Error> {
    sqlx::query_as::<_, AccessCode>("SELECT * FROM access_codes WHERE booking_id = $1")
        .bind(booking_id)
        .fetch_optional(conn)
        .await
}

async fn set_booking_status(
    conn: &mut PgConnection,
    booking_id: Uuid,
    status: BookingStatus,
) -> Result<Booking, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "UPDATE bookings SET status = $2, updated_utc = NOW() WHERE booking_id = $1 RETURNING *",
    )
    .bind(booking_id)
    .bind(status.as_str())
    .fetch_one(conn)
    .await
}

/// Whether another booking on the pod blocks `[check_in, check_out)`.
///
/// Confirmed bookings always block. Pending ones block only when
/// `pending_since` is given and they were created after it.
async fn has_blocking_overlap(
    conn: &mut PgConnection,
    pod_id: Uuid,
    exclude_booking: Option<Uuid>,
    check_in: DateTime<Utc>,
    check_out: DateTime<Utc>,
    pending_since: Option<DateTime<Utc>>,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM bookings
            WHERE pod_id = $1
              AND ($2::UUID IS NULL OR booking_id <> $2)
              AND (status = 'confirmed'
                   OR ($5::TIMESTAMPTZ IS NOT NULL AND status = 'pending' AND created_utc > $5))
              AND check_in < $4
              AND check_out > $3
        )
        "#,
    )
    .bind(pod_id)
    .bind(exclude_booking)
    .bind(check_in)
    .bind(check_out)
    .bind(pending_since)
    .fetch_one(conn)
    .await
}

/// Confirm a pending booking inside the caller's transaction.
///
/// Takes the pod lock before the booking lock. The caller decides whether
/// anything but [`ConfirmOutcome::Confirmed`] is an error.
pub(crate) async fn confirm_in_tx(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> Result<ConfirmOutcome, ServiceError> {
    let pod_id = sqlx::query_scalar::<_, Uuid>("SELECT pod_id FROM bookings WHERE booking_id = $1")
        .bind(booking_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(pod_id) = pod_id else {
        return Ok(ConfirmOutcome::Missing);
    };

    lock_pod(&mut *conn, pod_id).await?;
    let Some(booking) = lock_booking(&mut *conn, booking_id).await? else {
        return Ok(ConfirmOutcome::Missing);
    };

    match booking.parsed_status() {
        BookingStatus::Pending => {}
        BookingStatus::Confirmed => return Ok(ConfirmOutcome::AlreadyConfirmed(booking)),
        BookingStatus::Cancelled => return Ok(ConfirmOutcome::NotPending(booking)),
    }

    if has_blocking_overlap(
        &mut *conn,
        pod_id,
        Some(booking_id),
        booking.check_in,
        booking.check_out,
        None,
    )
    .await?
    {
        warn!(booking_id = %booking_id, pod_id = %pod_id, "Confirmation blocked by overlapping confirmed booking");
        return Ok(ConfirmOutcome::SlotTaken(booking));
    }

    let confirmed = set_booking_status(&mut *conn, booking_id, BookingStatus::Confirmed).await?;
    Ok(ConfirmOutcome::Confirmed(confirmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 15, hour, minute, 0).unwrap()
    }

    #[test]
    fn back_to_back_windows_do_not_overlap() {
        assert!(!intervals_overlap(at(10, 0), at(12, 0), at(12, 0), at(13, 0)));
        assert!(!intervals_overlap(at(12, 0), at(13, 0), at(10, 0), at(12, 0)));
    }

    #[test]
    fn partial_and_containing_windows_overlap() {
        assert!(intervals_overlap(at(10, 0), at(12, 0), at(11, 0), at(13, 0)));
        assert!(intervals_overlap(at(10, 0), at(12, 0), at(10, 30), at(11, 0)));
        assert!(intervals_overlap(at(10, 30), at(11, 0), at(10, 0), at(12, 0)));
        assert!(intervals_overlap(at(10, 0), at(12, 0), at(10, 0), at(12, 0)));
    }

    #[test]
    fn price_rounds_started_hours_up() {
        let rate = Decimal::new(100, 0);
        assert_eq!(compute_total_price(at(10, 0), at(12, 0), rate), Decimal::new(200, 0));
        assert_eq!(compute_total_price(at(10, 0), at(12, 1), rate), Decimal::new(300, 0));
        assert_eq!(compute_total_price(at(10, 0), at(10, 1), rate), Decimal::new(100, 0));
        assert_eq!(
            compute_total_price(at(10, 0), at(11, 30), Decimal::new(4999, 2)),
            Decimal::new(9998, 2)
        );
    }

    #[test]
    fn window_validation() {
        let now = at(9, 0);
        assert!(validate_window(at(10, 0), at(12, 0), now).is_ok());
        assert!(matches!(
            validate_window(at(12, 0), at(10, 0), now),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(validate_window(at(10, 0), at(10, 0), now).is_err());
        assert!(validate_window(at(8, 0), at(10, 0), now).is_err());
    }

    /// Greedy acceptance the way the engine applies it: a candidate is
    /// accepted only if it overlaps nothing accepted so far.
    fn accept_all(candidates: &[(i64, i64)]) -> Vec<(i64, i64)> {
        let mut accepted: Vec<(i64, i64)> = Vec::new();
        for &(s, e) in candidates {
            if !accepted.iter().any(|&(as_, ae)| intervals_overlap(as_, ae, s, e)) {
                accepted.push((s, e));
            }
        }
        accepted
    }

    fn interval() -> impl Strategy<Value = (i64, i64)> {
        (0i64..1_000, 1i64..100).prop_map(|(start, len)| (start, start + len))
    }

    proptest! {
        #[test]
        fn accepted_bookings_never_overlap(candidates in prop::collection::vec(interval(), 0..40)) {
            let accepted = accept_all(&candidates);
            for (i, a) in accepted.iter().enumerate() {
                for b in accepted.iter().skip(i + 1) {
                    prop_assert!(!intervals_overlap(a.0, a.1, b.0, b.1));
                }
            }
        }

        #[test]
        fn disjoint_sets_are_fully_accepted(lengths in prop::collection::vec(1i64..50, 0..30)) {
            let mut cursor = 0;
            let mut disjoint = Vec::new();
            for len in lengths {
                disjoint.push((cursor, cursor + len));
                cursor += len;
            }
            prop_assert_eq!(accept_all(&disjoint), disjoint);
        }

        #[test]
        fn overlap_is_symmetric(a in interval(), b in interval()) {
            prop_assert_eq!(
                intervals_overlap(a.0, a.1, b.0, b.1),
                intervals_overlap(b.0, b.1, a.0, a.1)
            );
        }
    }
}
