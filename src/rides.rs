use sqlx::{QueryBuilder, Sqlite};

use crate::changes::{ChangeKind, Table};
use crate::db::{now, Database};
use crate::error::{AppError, AppResult};
use crate::models::{NewRide, Ride, RideFilter, RidePatch, RideWithDriver};

const RIDE_COLUMNS: &str = "r.id, r.user_id, r.start_location, r.end_location, r.date, r.time, \
     r.price, r.available_seats, r.vehicle_type, r.vehicle_model, r.vehicle_color, \
     r.license_plate, r.allow_pets, r.allow_smoking, r.allow_luggage, r.description, \
     r.status, r.created_at";

fn select_with_driver() -> String {
    format!(
        "SELECT {RIDE_COLUMNS}, p.full_name AS driver_name, p.avatar_url AS driver_avatar, \
         p.rating AS driver_rating FROM rides r LEFT JOIN profiles p ON p.user_id = r.user_id"
    )
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Active rides, newest first.
pub async fn list_active_rides(db: &Database, filter: &RideFilter) -> AppResult<Vec<RideWithDriver>> {
    let reader = &db.reader;
    db.with_retry("list_active_rides", move || async move {
        let mut qb = QueryBuilder::<Sqlite>::new(select_with_driver());
        qb.push(" WHERE r.status = 'active'");
        if let Some(from) = filter.from.as_deref().filter(|s| !s.trim().is_empty()) {
            qb.push(" AND r.start_location LIKE ")
                .push_bind(like_pattern(from))
                .push(" ESCAPE '\\'");
        }
        if let Some(to) = filter.to.as_deref().filter(|s| !s.trim().is_empty()) {
            qb.push(" AND r.end_location LIKE ")
                .push_bind(like_pattern(to))
                .push(" ESCAPE '\\'");
        }
        if let Some(date) = filter.date {
            qb.push(" AND r.date = ").push_bind(date);
        }
        if let Some(min_seats) = filter.min_seats {
            qb.push(" AND r.available_seats >= ").push_bind(min_seats);
        }
        qb.push(" ORDER BY r.created_at DESC, r.id DESC");

        let rides = qb
            .build_query_as::<RideWithDriver>()
            .fetch_all(reader)
            .await?;
        Ok(rides)
    })
    .await
}

pub async fn get_ride(db: &Database, ride_id: i64) -> AppResult<RideWithDriver> {
    let reader = &db.reader;
    let sql = format!("{} WHERE r.id = ?", select_with_driver());
    let query = sql.as_str();
    db.with_retry("get_ride", move || async move {
        let ride = sqlx::query_as::<_, RideWithDriver>(query)
            .bind(ride_id)
            .fetch_optional(reader)
            .await?;
        ride.ok_or(AppError::NotFound("ride"))
    })
    .await
}

fn validate_new_ride(ride: &NewRide) -> AppResult<()> {
    if ride.start_location.trim().is_empty() || ride.end_location.trim().is_empty() {
        return Err(AppError::validation("Start and end location are required"));
    }
    if !ride.price.is_finite() || ride.price < 0.0 {
        return Err(AppError::validation("Price cannot be negative"));
    }
    if ride.available_seats < 1 {
        return Err(AppError::validation("A ride must offer at least one seat"));
    }
    Ok(())
}

/// Publish a ride and count it towards the driver's offered rides.
pub async fn create_ride(db: &Database, owner_id: i64, new_ride: &NewRide) -> AppResult<Ride> {
    validate_new_ride(new_ride)?;

    let writer = &db.writer;
    let ride = db
        .with_write("create_ride", move || async move {
            let mut tx = writer.begin().await?;

            let ride = sqlx::query_as::<_, Ride>(
                r#"INSERT INTO rides
                   (user_id, start_location, end_location, date, time, price, available_seats,
                    vehicle_type, vehicle_model, vehicle_color, license_plate,
                    allow_pets, allow_smoking, allow_luggage, description, status, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)
                   RETURNING id, user_id, start_location, end_location, date, time, price,
                    available_seats, vehicle_type, vehicle_model, vehicle_color, license_plate,
                    allow_pets, allow_smoking, allow_luggage, description, status, created_at"#,
            )
            .bind(owner_id)
            .bind(new_ride.start_location.trim())
            .bind(new_ride.end_location.trim())
            .bind(new_ride.date)
            .bind(new_ride.time)
            .bind(new_ride.price)
            .bind(new_ride.available_seats)
            .bind(&new_ride.vehicle_type)
            .bind(&new_ride.vehicle_model)
            .bind(&new_ride.vehicle_color)
            .bind(&new_ride.license_plate)
            .bind(new_ride.allow_pets)
            .bind(new_ride.allow_smoking)
            .bind(new_ride.allow_luggage)
            .bind(&new_ride.description)
            .bind(now())
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("UPDATE profiles SET rides_offered = rides_offered + 1 WHERE user_id = ?")
                .bind(owner_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(ride)
        })
        .await?;

    tracing::info!(ride_id = ride.id, owner_id, "ride created");
    db.publish(Table::Rides, ChangeKind::Insert);
    db.publish(Table::Profiles, ChangeKind::Update);
    Ok(ride)
}

fn validate_patch(patch: &RidePatch) -> AppResult<()> {
    if let Some(price) = patch.price {
        if !price.is_finite() || price < 0.0 {
            return Err(AppError::validation("Price cannot be negative"));
        }
    }
    let blank = |s: &Option<String>| s.as_deref().is_some_and(|s| s.trim().is_empty());
    if blank(&patch.start_location) || blank(&patch.end_location) {
        return Err(AppError::validation("Locations cannot be empty"));
    }
    Ok(())
}

/// Apply a partial update to a ride the caller owns.
pub async fn update_ride(
    db: &Database,
    owner_id: i64,
    ride_id: i64,
    patch: &RidePatch,
) -> AppResult<RideWithDriver> {
    validate_patch(patch)?;

    let current = get_ride(db, ride_id).await?;
    if current.ride.user_id != owner_id {
        return Err(AppError::Forbidden("Only the driver can update this ride".to_string()));
    }

    let has_changes = patch.start_location.is_some()
        || patch.end_location.is_some()
        || patch.date.is_some()
        || patch.time.is_some()
        || patch.price.is_some()
        || patch.seats_delta.is_some()
        || patch.description.is_some()
        || patch.status.is_some();
    if !has_changes {
        return Ok(current);
    }

    let writer = &db.writer;
    db.with_write("update_ride", move || async move {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE rides SET ");
        let mut set = qb.separated(", ");
        if let Some(start) = &patch.start_location {
            set.push("start_location = ").push_bind_unseparated(start.trim());
        }
        if let Some(end) = &patch.end_location {
            set.push("end_location = ").push_bind_unseparated(end.trim());
        }
        if let Some(date) = patch.date {
            set.push("date = ").push_bind_unseparated(date);
        }
        if let Some(time) = patch.time {
            set.push("time = ").push_bind_unseparated(time);
        }
        if let Some(price) = patch.price {
            set.push("price = ").push_bind_unseparated(price);
        }
        if let Some(delta) = patch.seats_delta {
            set.push("available_seats = available_seats + ")
                .push_bind_unseparated(delta);
        }
        if let Some(description) = &patch.description {
            set.push("description = ")
                .push_bind_unseparated(description.as_deref());
        }
        if let Some(status) = patch.status {
            set.push("status = ").push_bind_unseparated(status);
        }
        qb.push(" WHERE id = ")
            .push_bind(ride_id)
            .push(" AND user_id = ")
            .push_bind(owner_id);
        if let Some(delta) = patch.seats_delta {
            // Seats already sold cannot be taken away.
            qb.push(" AND available_seats + ")
                .push_bind(delta)
                .push(" >= 0");
        }

        if qb.build().execute(writer).await?.rows_affected() == 0 {
            let Some(delta) = patch.seats_delta else {
                return Err(AppError::NotFound("ride"));
            };
            let (available,): (i64,) =
                sqlx::query_as("SELECT available_seats FROM rides WHERE id = ?")
                    .bind(ride_id)
                    .fetch_one(writer)
                    .await?;
            return Err(AppError::SeatsUnavailable {
                requested: -delta,
                available,
            });
        }
        Ok(())
    })
    .await?;

    tracing::info!(ride_id, owner_id, "ride updated");
    db.publish(Table::Rides, ChangeKind::Update);
    get_ride(db, ride_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::record_booking;
    use crate::db::testing::{seed_user, test_db};
    use crate::models::{BookingRequest, RideStatus};
    use chrono::{NaiveDate, NaiveTime};

    fn sample_ride(from: &str, to: &str, seats: i64) -> NewRide {
        NewRide {
            start_location: from.to_string(),
            end_location: to.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 11, 1).unwrap(),
            time: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            price: 25.0,
            available_seats: seats,
            vehicle_type: "sedan".to_string(),
            vehicle_model: "Golf".to_string(),
            vehicle_color: "blue".to_string(),
            license_plate: "B-RS-1".to_string(),
            allow_pets: true,
            allow_smoking: false,
            allow_luggage: true,
            description: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_ride_with_driver() {
        let db = test_db().await;
        let driver = seed_user(&db, "dana").await;

        let ride = create_ride(&db, driver, &sample_ride("Berlin", "Hamburg", 3))
            .await
            .unwrap();
        assert_eq!(ride.status, RideStatus::Active);
        assert_eq!(ride.available_seats, 3);

        let found = get_ride(&db, ride.id).await.unwrap();
        assert_eq!(found.ride.start_location, "Berlin");
        assert_eq!(found.driver_name.as_deref(), Some("dana Full"));

        let (offered,): (i64,) =
            sqlx::query_as("SELECT rides_offered FROM profiles WHERE user_id = ?")
                .bind(driver)
                .fetch_one(&db.reader)
                .await
                .unwrap();
        assert_eq!(offered, 1);
    }

    #[tokio::test]
    async fn create_rejects_invalid_rides() {
        let db = test_db().await;
        let driver = seed_user(&db, "dana").await;

        let mut no_seats = sample_ride("Berlin", "Hamburg", 0);
        assert!(matches!(
            create_ride(&db, driver, &no_seats).await,
            Err(AppError::Validation(_))
        ));

        no_seats.available_seats = 2;
        no_seats.price = -1.0;
        assert!(matches!(
            create_ride(&db, driver, &no_seats).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_and_hides_inactive() {
        let db = test_db().await;
        let driver = seed_user(&db, "dana").await;

        create_ride(&db, driver, &sample_ride("Berlin", "Hamburg", 3)).await.unwrap();
        create_ride(&db, driver, &sample_ride("Munich", "Hamburg", 1)).await.unwrap();
        let cancelled = create_ride(&db, driver, &sample_ride("Berlin Mitte", "Bremen", 4))
            .await
            .unwrap();
        update_ride(
            &db,
            driver,
            cancelled.id,
            &RidePatch {
                status: Some(RideStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let all = list_active_rides(&db, &RideFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].ride.start_location, "Munich");

        let from_berlin = list_active_rides(
            &db,
            &RideFilter {
                from: Some("berlin".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(from_berlin.len(), 1);

        let roomy = list_active_rides(
            &db,
            &RideFilter {
                min_seats: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(roomy.len(), 1);
        assert_eq!(roomy[0].ride.available_seats, 3);
    }

    #[tokio::test]
    async fn only_owner_can_update() {
        let db = test_db().await;
        let driver = seed_user(&db, "dana").await;
        let other = seed_user(&db, "omar").await;
        let ride = create_ride(&db, driver, &sample_ride("Berlin", "Hamburg", 3))
            .await
            .unwrap();

        let patch = RidePatch {
            price: Some(30.0),
            ..Default::default()
        };
        assert!(matches!(
            update_ride(&db, other, ride.id, &patch).await,
            Err(AppError::Forbidden(_))
        ));

        let updated = update_ride(&db, driver, ride.id, &patch).await.unwrap();
        assert_eq!(updated.ride.price, 30.0);
    }

    #[tokio::test]
    async fn seat_edits_keep_concurrent_bookings() {
        let db = test_db().await;
        let driver = seed_user(&db, "dana").await;
        let passenger = seed_user(&db, "pat").await;
        let ride = create_ride(&db, driver, &sample_ride("Berlin", "Hamburg", 3))
            .await
            .unwrap();

        // The driver read 3 seats; a passenger books one before the edit lands.
        record_booking(
            &db,
            BookingRequest {
                ride_id: ride.id,
                user_id: passenger,
                seats: 1,
            },
        )
        .await
        .unwrap();

        let add_one = RidePatch {
            seats_delta: Some(1),
            ..Default::default()
        };
        let updated = update_ride(&db, driver, ride.id, &add_one).await.unwrap();
        assert_eq!(updated.ride.available_seats, 3);

        let remove_too_many = RidePatch {
            seats_delta: Some(-4),
            ..Default::default()
        };
        assert!(matches!(
            update_ride(&db, driver, ride.id, &remove_too_many).await,
            Err(AppError::SeatsUnavailable {
                requested: 4,
                available: 3
            })
        ));
        assert_eq!(get_ride(&db, ride.id).await.unwrap().ride.available_seats, 3);
    }

    #[tokio::test]
    async fn null_description_clears_it() {
        let db = test_db().await;
        let driver = seed_user(&db, "dana").await;
        let ride = create_ride(&db, driver, &sample_ride("Berlin", "Hamburg", 3))
            .await
            .unwrap();

        let set: RidePatch = serde_json::from_str(r#"{"description": "quiet ride"}"#).unwrap();
        let updated = update_ride(&db, driver, ride.id, &set).await.unwrap();
        assert_eq!(updated.ride.description.as_deref(), Some("quiet ride"));

        let untouched: RidePatch = serde_json::from_str(r#"{"price": 20.0}"#).unwrap();
        assert!(untouched.description.is_none());
        let updated = update_ride(&db, driver, ride.id, &untouched).await.unwrap();
        assert_eq!(updated.ride.description.as_deref(), Some("quiet ride"));

        let clear: RidePatch = serde_json::from_str(r#"{"description": null}"#).unwrap();
        assert_eq!(clear.description, Some(None));
        let updated = update_ride(&db, driver, ride.id, &clear).await.unwrap();
        assert_eq!(updated.ride.description, None);
    }

    #[tokio::test]
    async fn missing_ride_is_not_found() {
        let db = test_db().await;
        assert!(matches!(get_ride(&db, 42).await, Err(AppError::NotFound("ride"))));
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" 50%_off "), "%50\\%\\_off%");
    }
}
