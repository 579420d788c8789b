use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

// -- Accounts --

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    pub username: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: i64,
    pub username: String,
}

// -- Profiles --

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Profile {
    pub user_id: i64,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub phone: Option<String>,
    pub rating: Option<f64>,
    pub rides_completed: i64,
    pub rides_offered: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub phone: Option<String>,
}

// -- Rides --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RideStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Ride {
    pub id: i64,
    pub user_id: i64,
    pub start_location: String,
    pub end_location: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub price: f64,
    pub available_seats: i64,
    pub vehicle_type: String,
    pub vehicle_model: String,
    pub vehicle_color: String,
    pub license_plate: String,
    pub allow_pets: bool,
    pub allow_smoking: bool,
    pub allow_luggage: bool,
    pub description: Option<String>,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
}

/// A ride together with the driver's public profile fields.
#[derive(Debug, Serialize, FromRow, Clone)]
pub struct RideWithDriver {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub ride: Ride,
    pub driver_name: Option<String>,
    pub driver_avatar: Option<String>,
    pub driver_rating: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRide {
    pub start_location: String,
    pub end_location: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub price: f64,
    pub available_seats: i64,
    pub vehicle_type: String,
    pub vehicle_model: String,
    pub vehicle_color: String,
    pub license_plate: String,
    #[serde(default)]
    pub allow_pets: bool,
    #[serde(default)]
    pub allow_smoking: bool,
    #[serde(default)]
    pub allow_luggage: bool,
    pub description: Option<String>,
}

/// Partial ride update. Seats change by a signed delta so an edit never
/// overwrites decrements made by concurrent bookings.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RidePatch {
    pub start_location: Option<String>,
    pub end_location: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub price: Option<f64>,
    pub seats_delta: Option<i64>,
    /// Absent leaves the description alone; `null` clears it.
    #[serde(default, deserialize_with = "deserialize_present")]
    pub description: Option<Option<String>>,
    pub status: Option<RideStatus>,
}

/// Wraps any present value, `null` included, in `Some`.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RideFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub date: Option<NaiveDate>,
    pub min_seats: Option<i64>,
}

// -- Bookings --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Booking {
    pub id: i64,
    pub ride_id: i64,
    pub user_id: i64,
    pub seats: i64,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow, Clone)]
pub struct BookingWithRide {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub booking: Booking,
    pub start_location: String,
    pub end_location: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub price: f64,
    pub ride_status: RideStatus,
}

/// A passenger's request to occupy seats on a ride.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookingRequest {
    pub ride_id: i64,
    pub user_id: i64,
    pub seats: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub ride_id: i64,
    pub seats: i64,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub text: String,
    pub is_read: bool,
    pub ride_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A message as seen from one participant's inbox, with the other side's profile.
#[derive(Debug, FromRow, Clone)]
pub struct InboxRow {
    #[sqlx(flatten)]
    pub message: Message,
    pub counterparty_name: Option<String>,
    pub counterparty_avatar: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: i64,
    pub text: String,
    pub ride_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationSummary {
    pub counterparty_id: i64,
    pub name: String,
    pub avatar: Option<String>,
    pub last_message: String,
    pub last_message_id: i64,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: i64,
}

// -- Notifications --

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub data: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: i64,
    pub kind: &'static str,
    pub title: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
