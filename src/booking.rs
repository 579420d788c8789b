//! Seat bookings.
//!
//! A booking and its seat decrement are written in one transaction. The
//! decrement is a conditional write (`available_seats >= seats`), so two
//! requests racing for the last seats can never both succeed and a ride's
//! available seats never go negative.

use serde_json::json;

use crate::changes::{ChangeKind, Table};
use crate::db::{now, Database};
use crate::error::{AppError, AppResult};
use crate::models::{
    Booking, BookingRequest, BookingStatus, BookingWithRide, NewNotification, PaymentStatus,
    RideStatus,
};
use crate::notifications::insert_notification;
use crate::rides::get_ride;

const BOOKING_COLUMNS: &str = "id, ride_id, user_id, seats, status, payment_status, created_at";

/// Reserve seats on a ride for a passenger.
///
/// Fails with [`AppError::SeatsUnavailable`] when the ride has fewer seats
/// left than requested; nothing is written in that case.
pub async fn record_booking(db: &Database, request: BookingRequest) -> AppResult<Booking> {
    if request.seats < 1 {
        return Err(AppError::validation("At least one seat must be booked"));
    }

    let writer = &db.writer;
    let booking = db
        .with_write("record_booking", move || async move {
            let mut tx = writer.begin().await?;

            let claimed = sqlx::query(
                "UPDATE rides SET available_seats = available_seats - ?
                 WHERE id = ? AND status = 'active' AND user_id != ? AND available_seats >= ?",
            )
            .bind(request.seats)
            .bind(request.ride_id)
            .bind(request.user_id)
            .bind(request.seats)
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 0 {
                let ride: Option<(i64, i64, RideStatus)> =
                    sqlx::query_as("SELECT user_id, available_seats, status FROM rides WHERE id = ?")
                        .bind(request.ride_id)
                        .fetch_optional(&mut *tx)
                        .await?;

                return Err(match ride {
                    None => AppError::NotFound("ride"),
                    Some((_, _, status)) if status != RideStatus::Active => {
                        AppError::validation("Ride is not accepting bookings")
                    }
                    Some((owner, _, _)) if owner == request.user_id => {
                        AppError::validation("Drivers cannot book their own ride")
                    }
                    Some((_, available, _)) => AppError::SeatsUnavailable {
                        requested: request.seats,
                        available,
                    },
                });
            }

            let booking = sqlx::query_as::<_, Booking>(&format!(
                "INSERT INTO bookings (ride_id, user_id, seats, status, payment_status, created_at)
                 VALUES (?, ?, ?, 'pending', 'pending', ?) RETURNING {BOOKING_COLUMNS}"
            ))
            .bind(request.ride_id)
            .bind(request.user_id)
            .bind(request.seats)
            .bind(now())
            .fetch_one(&mut *tx)
            .await?;

            let (driver_id,): (i64,) = sqlx::query_as("SELECT user_id FROM rides WHERE id = ?")
                .bind(request.ride_id)
                .fetch_one(&mut *tx)
                .await?;

            insert_notification(
                &mut tx,
                &NewNotification {
                    user_id: driver_id,
                    kind: "booking",
                    title: "New booking".to_string(),
                    message: format!("{} seat(s) requested on your ride", request.seats),
                    data: Some(json!({ "ride_id": request.ride_id, "booking_id": booking.id })),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(booking)
        })
        .await?;

    tracing::info!(
        booking_id = booking.id,
        ride_id = booking.ride_id,
        seats = booking.seats,
        "booking recorded"
    );
    db.publish(Table::Bookings, ChangeKind::Insert);
    db.publish(Table::Rides, ChangeKind::Update);
    db.publish(Table::Notifications, ChangeKind::Insert);
    Ok(booking)
}

/// Passenger cancels their own booking; the seats go back to the ride.
pub async fn cancel_booking(db: &Database, user_id: i64, booking_id: i64) -> AppResult<Booking> {
    let writer = &db.writer;
    let booking = db
        .with_write("cancel_booking", move || async move {
            let mut tx = writer.begin().await?;

            let current = sqlx::query_as::<_, Booking>(&format!(
                "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ? AND user_id = ?"
            ))
            .bind(booking_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound("booking"))?;

            if matches!(current.status, BookingStatus::Cancelled | BookingStatus::Completed) {
                return Err(AppError::validation("Booking can no longer be cancelled"));
            }

            let payment_status = match current.payment_status {
                PaymentStatus::Completed => PaymentStatus::Refunded,
                other => other,
            };

            let cancelled = sqlx::query_as::<_, Booking>(&format!(
                "UPDATE bookings SET status = 'cancelled', payment_status = ?
                 WHERE id = ? AND status IN ('pending', 'confirmed') RETURNING {BOOKING_COLUMNS}"
            ))
            .bind(payment_status)
            .bind(booking_id)
            .fetch_one(&mut *tx)
            .await?;

            // A cancelled or completed ride keeps its seat count.
            sqlx::query(
                "UPDATE rides SET available_seats = available_seats + ?
                 WHERE id = ? AND status = 'active'",
            )
            .bind(cancelled.seats)
            .bind(cancelled.ride_id)
            .execute(&mut *tx)
            .await?;

            let (driver_id,): (i64,) = sqlx::query_as("SELECT user_id FROM rides WHERE id = ?")
                .bind(cancelled.ride_id)
                .fetch_one(&mut *tx)
                .await?;

            insert_notification(
                &mut tx,
                &NewNotification {
                    user_id: driver_id,
                    kind: "booking_cancelled",
                    title: "Booking cancelled".to_string(),
                    message: format!("{} seat(s) were released on your ride", cancelled.seats),
                    data: Some(json!({ "ride_id": cancelled.ride_id, "booking_id": cancelled.id })),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(cancelled)
        })
        .await?;

    tracing::info!(booking_id, ride_id = booking.ride_id, "booking cancelled");
    db.publish(Table::Bookings, ChangeKind::Update);
    db.publish(Table::Rides, ChangeKind::Update);
    db.publish(Table::Notifications, ChangeKind::Insert);
    Ok(booking)
}

/// Driver accepts a pending booking on one of their rides.
pub async fn confirm_booking(db: &Database, driver_id: i64, booking_id: i64) -> AppResult<Booking> {
    let writer = &db.writer;
    let booking = db
        .with_write("confirm_booking", move || async move {
            let mut tx = writer.begin().await?;

            let found: Option<(i64, RideStatus, BookingStatus)> = sqlx::query_as(
                "SELECT r.user_id, r.status, b.status FROM bookings b JOIN rides r ON r.id = b.ride_id
                 WHERE b.id = ?",
            )
            .bind(booking_id)
            .fetch_optional(&mut *tx)
            .await?;

            match found {
                None => return Err(AppError::NotFound("booking")),
                Some((owner, _, _)) if owner != driver_id => {
                    return Err(AppError::Forbidden(
                        "Only the driver can confirm this booking".to_string(),
                    ))
                }
                Some((_, ride_status, _)) if ride_status != RideStatus::Active => {
                    return Err(AppError::validation("Ride is no longer active"))
                }
                Some((_, _, status)) if status != BookingStatus::Pending => {
                    return Err(AppError::validation("Only pending bookings can be confirmed"))
                }
                Some(_) => {}
            }

            let confirmed = sqlx::query_as::<_, Booking>(&format!(
                "UPDATE bookings SET status = 'confirmed' WHERE id = ? RETURNING {BOOKING_COLUMNS}"
            ))
            .bind(booking_id)
            .fetch_one(&mut *tx)
            .await?;

            insert_notification(
                &mut tx,
                &NewNotification {
                    user_id: confirmed.user_id,
                    kind: "booking_confirmed",
                    title: "Booking confirmed".to_string(),
                    message: "Your driver confirmed your seat(s)".to_string(),
                    data: Some(json!({ "ride_id": confirmed.ride_id, "booking_id": confirmed.id })),
                },
            )
            .await?;

            tx.commit().await?;
            Ok(confirmed)
        })
        .await?;

    tracing::info!(booking_id, driver_id, "booking confirmed");
    db.publish(Table::Bookings, ChangeKind::Update);
    db.publish(Table::Notifications, ChangeKind::Insert);
    Ok(booking)
}

/// A passenger's bookings with ride details, newest first.
pub async fn user_bookings(db: &Database, user_id: i64) -> AppResult<Vec<BookingWithRide>> {
    let reader = &db.reader;
    db.with_retry("user_bookings", move || async move {
        let bookings = sqlx::query_as::<_, BookingWithRide>(
            "SELECT b.id, b.ride_id, b.user_id, b.seats, b.status, b.payment_status, b.created_at,
                    r.start_location, r.end_location, r.date, r.time, r.price,
                    r.status AS ride_status
             FROM bookings b JOIN rides r ON r.id = b.ride_id
             WHERE b.user_id = ?
             ORDER BY b.created_at DESC, b.id DESC",
        )
        .bind(user_id)
        .fetch_all(reader)
        .await?;
        Ok(bookings)
    })
    .await
}

/// Bookings on a ride, visible to its driver only.
pub async fn ride_bookings(db: &Database, driver_id: i64, ride_id: i64) -> AppResult<Vec<Booking>> {
    let ride = get_ride(db, ride_id).await?;
    if ride.ride.user_id != driver_id {
        return Err(AppError::Forbidden(
            "Only the driver can view bookings for this ride".to_string(),
        ));
    }

    let reader = &db.reader;
    let sql = format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings WHERE ride_id = ? ORDER BY created_at, id"
    );
    let query = sql.as_str();
    db.with_retry("ride_bookings", move || async move {
        let bookings = sqlx::query_as::<_, Booking>(query)
            .bind(ride_id)
            .fetch_all(reader)
            .await?;
        Ok(bookings)
    })
    .await
}
