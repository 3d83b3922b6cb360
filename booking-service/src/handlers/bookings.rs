//! Booking endpoints. The caller is identified by `X-User-ID`.

use crate::dtos::CreateBookingRequest;
use crate::middleware::UserId;
use crate::models::{Booking, BookingDetail, BookingWithAccessCode};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

pub async fn create_booking(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingWithAccessCode>), AppError> {
    tracing::info!(
        user_id = %user_id,
        pod_id = %payload.pod_id,
        check_in = %payload.check_in,
        check_out = %payload.check_out,
        "Creating booking"
    );

    let booking = state
        .reservations
        .create_booking(user_id, payload.pod_id, payload.check_in, payload.check_out)
        .await?;

    Ok((StatusCode::CREATED, Json(booking)))
}

pub async fn list_bookings(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<BookingDetail>>, AppError> {
    let bookings = state.reservations.get_user_bookings(user_id).await?;
    Ok(Json(bookings))
}

pub async fn get_booking(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingDetail>, AppError> {
    Ok(Json(owned_booking(&state, user_id, booking_id).await?))
}

pub async fn confirm_booking(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    tracing::info!(user_id = %user_id, booking_id = %booking_id, "Confirming booking");
    owned_booking(&state, user_id, booking_id).await?;
    let booking = state.reservations.confirm_booking(booking_id).await?;
    Ok(Json(booking))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    tracing::info!(user_id = %user_id, booking_id = %booking_id, "Cancelling booking");
    let booking = state
        .reservations
        .cancel_booking(booking_id, user_id)
        .await?;
    Ok(Json(booking))
}

/// Other users' bookings answer with the same 404 as missing ones.
async fn owned_booking(
    state: &AppState,
    user_id: Uuid,
    booking_id: Uuid,
) -> Result<BookingDetail, AppError> {
    let detail = state.reservations.get_booking_by_id(booking_id).await?;
    if detail.booking.user_id != user_id {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Booking not found: {}",
            booking_id
        )));
    }
    Ok(detail)
}
