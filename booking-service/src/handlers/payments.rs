//! Payment order, refund, link and history endpoints.

use crate::dtos::{
    CreatePaymentLinkRequest, CreatePaymentOrderRequest, CreateRefundRequest, PaymentHistoryQuery,
};
use crate::middleware::UserId;
use crate::services::payments::{
    PaymentHistoryPage, PaymentLinkResult, PaymentOrderResult, RefundResult, StatusSnapshot,
};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;

pub async fn create_order(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<CreatePaymentOrderRequest>,
) -> Result<(StatusCode, Json<PaymentOrderResult>), AppError> {
    tracing::info!(
        user_id = %user_id,
        booking_id = %payload.booking_id,
        amount = %payload.amount,
        "Creating booking payment order"
    );

    let order = state
        .payments
        .create_booking_payment(payload.into_request(user_id))
        .await?;

    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_status(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(order_id): Path<String>,
) -> Result<Json<StatusSnapshot>, AppError> {
    tracing::debug!(user_id = %user_id, order_id = %order_id, "Fetching payment status");
    state.payments.authorize_order(&order_id, user_id).await?;
    Ok(Json(state.payments.get_payment_status(&order_id).await?))
}

pub async fn history(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<PaymentHistoryQuery>,
) -> Result<Json<PaymentHistoryPage>, AppError> {
    let page = state
        .payments
        .get_user_payment_history(user_id, query.page, query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn create_link(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<CreatePaymentLinkRequest>,
) -> Result<(StatusCode, Json<PaymentLinkResult>), AppError> {
    let link = state
        .payments
        .create_payment_link(payload.into_request(user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn create_refund(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<CreateRefundRequest>,
) -> Result<(StatusCode, Json<RefundResult>), AppError> {
    tracing::info!(
        user_id = %user_id,
        order_id = %payload.order_id,
        amount = %payload.refund_amount,
        "Creating refund"
    );

    state
        .payments
        .authorize_order(&payload.order_id, user_id)
        .await?;
    let refund = state.payments.create_refund(payload.into()).await?;
    Ok((StatusCode::CREATED, Json(refund)))
}
