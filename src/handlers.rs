use crate::auth;
use crate::booking;
use crate::changes::Table;
use crate::conversations;
use crate::db::Database;
use crate::error::AppResult;
use crate::models::*;
use crate::notifications;
use crate::profiles;
use crate::rides;
use axum::{
    extract::{Extension, Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

pub async fn health_check() -> &'static str {
    "OK"
}

// -- Accounts --

pub async fn create_account(
    State(db): State<Database>,
    Json(payload): Json<CreateAccountRequest>,
) -> AppResult<Json<AuthResponse>> {
    Ok(Json(auth::create_account(&db, &payload).await?))
}

pub async fn login(
    State(db): State<Database>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    Ok(Json(auth::login(&db, &payload).await?))
}

// -- Profiles --

pub async fn get_own_profile(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
) -> AppResult<Json<Profile>> {
    Ok(Json(profiles::get_profile(&db, user_id).await?))
}

pub async fn update_own_profile(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Json(patch): Json<ProfilePatch>,
) -> AppResult<Json<Profile>> {
    Ok(Json(profiles::update_profile(&db, user_id, &patch).await?))
}

pub async fn get_profile(
    State(db): State<Database>,
    Path(profile_user_id): Path<i64>,
) -> AppResult<Json<Profile>> {
    Ok(Json(profiles::get_profile(&db, profile_user_id).await?))
}

// -- Rides --

pub async fn list_rides(
    State(db): State<Database>,
    Query(filter): Query<RideFilter>,
) -> AppResult<Json<Vec<RideWithDriver>>> {
    Ok(Json(rides::list_active_rides(&db, &filter).await?))
}

pub async fn create_ride(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Json(payload): Json<NewRide>,
) -> AppResult<Json<Ride>> {
    Ok(Json(rides::create_ride(&db, user_id, &payload).await?))
}

pub async fn get_ride(
    State(db): State<Database>,
    Path(ride_id): Path<i64>,
) -> AppResult<Json<RideWithDriver>> {
    Ok(Json(rides::get_ride(&db, ride_id).await?))
}

pub async fn update_ride(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Path(ride_id): Path<i64>,
    Json(patch): Json<RidePatch>,
) -> AppResult<Json<RideWithDriver>> {
    Ok(Json(rides::update_ride(&db, user_id, ride_id, &patch).await?))
}

pub async fn list_ride_bookings(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Path(ride_id): Path<i64>,
) -> AppResult<Json<Vec<Booking>>> {
    Ok(Json(booking::ride_bookings(&db, user_id, ride_id).await?))
}

// -- Bookings --

pub async fn create_booking(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Json(payload): Json<CreateBookingRequest>,
) -> AppResult<Json<Booking>> {
    let request = BookingRequest {
        ride_id: payload.ride_id,
        user_id,
        seats: payload.seats,
    };
    Ok(Json(booking::record_booking(&db, request).await?))
}

pub async fn list_bookings(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
) -> AppResult<Json<Vec<BookingWithRide>>> {
    Ok(Json(booking::user_bookings(&db, user_id).await?))
}

pub async fn cancel_booking(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Path(booking_id): Path<i64>,
) -> AppResult<Json<Booking>> {
    Ok(Json(booking::cancel_booking(&db, user_id, booking_id).await?))
}

pub async fn confirm_booking(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Path(booking_id): Path<i64>,
) -> AppResult<Json<Booking>> {
    Ok(Json(booking::confirm_booking(&db, user_id, booking_id).await?))
}

// -- Messages --

pub async fn send_message(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Json(payload): Json<SendMessageRequest>,
) -> AppResult<Json<Message>> {
    Ok(Json(conversations::send_message(&db, user_id, &payload).await?))
}

pub async fn get_conversations(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(conversations::list_conversations(&db, user_id).await?))
}

pub async fn open_conversation(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Path(other_id): Path<i64>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(conversations::open_conversation(&db, user_id, other_id).await?))
}

// -- Notifications --

pub async fn get_notifications(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
) -> AppResult<Json<Vec<Notification>>> {
    Ok(Json(notifications::list_notifications(&db, user_id).await?))
}

pub async fn mark_notification_read(
    State(db): State<Database>,
    Extension(user_id): Extension<i64>,
    Path(notification_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    notifications::mark_notification_read(&db, user_id, notification_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// -- Change feed --

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub table: Option<Table>,
}

/// Server-sent change notifications; clients re-fetch the named table.
pub async fn stream_changes(
    State(db): State<Database>,
    Query(query): Query<ChangesQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = db.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    if query.table.map_or(true, |table| table == change.table) {
                        let data = serde_json::to_string(&change).unwrap_or_default();
                        yield Ok::<_, Infallible>(Event::default().event(change.table.as_str()).data(data));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change feed subscriber lagged");
                    // Missed notifications collapse into one full re-fetch signal.
                    yield Ok(Event::default().event("resync").data(skipped.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
