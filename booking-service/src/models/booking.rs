//! Booking and access code models.

use super::pod::{PodSummary, UserSummary};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Booking lifecycle: `pending -> confirmed`, `pending|confirmed -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "confirmed" => Self::Confirmed,
            _ => Self::Cancelled,
        }
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Confirmed, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessCodeStatus {
    Active,
    Revoked,
}

impl AccessCodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Revoked,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub pod_id: Uuid,
    pub status: String,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
    pub total_price: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Booking {
    pub fn parsed_status(&self) -> BookingStatus {
        BookingStatus::from_str(&self.status)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AccessCode {
    pub access_code_id: Uuid,
    pub booking_id: Uuid,
    pub pin: String,
    pub qr_code: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl AccessCode {
    pub fn parsed_status(&self) -> AccessCodeStatus {
        AccessCodeStatus::from_str(&self.status)
    }
}

/// Booking returned from creation, with its freshly issued access code.
#[derive(Debug, Clone, Serialize)]
pub struct BookingWithAccessCode {
    pub booking: Booking,
    pub pod: PodSummary,
    pub user: UserSummary,
    pub access_code: AccessCode,
}

/// Read model joining a booking with its pod, user and access code.
#[derive(Debug, Clone, Serialize)]
pub struct BookingDetail {
    pub booking: Booking,
    pub pod: PodSummary,
    pub user: UserSummary,
    pub access_code: Option<AccessCode>,
}

/// Flat row for the booking/pod/user join.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct BookingDetailRow {
    #[sqlx(flatten)]
    pub booking: Booking,
    pub pod_number: String,
    pub pod_description: Option<String>,
    pub pod_address: Option<String>,
    pub price_per_hour: Decimal,
    pub max_capacity: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub user_name: String,
    pub user_email: Option<String>,
    pub user_phone_number: Option<String>,
}

impl BookingDetailRow {
    pub(crate) fn into_detail(self, access_code: Option<AccessCode>) -> BookingDetail {
        BookingDetail {
            pod: PodSummary {
                pod_id: self.booking.pod_id,
                pod_number: self.pod_number,
                description: self.pod_description,
                address: self.pod_address,
                price_per_hour: self.price_per_hour,
                max_capacity: self.max_capacity,
                latitude: self.latitude,
                longitude: self.longitude,
            },
            user: UserSummary {
                user_id: self.booking.user_id,
                name: self.user_name,
                email: self.user_email,
                phone_number: self.user_phone_number,
            },
            booking: self.booking,
            access_code,
        }
    }
}
