//! Persistence layer over SQLite.
//!
//! Writes go through a single-connection writer pool, reads through a
//! read-only pool; both use WAL mode. Reads are wrapped by
//! [`Database::with_retry`] and writes by [`Database::with_write`]; both apply
//! the per-attempt timeout and the bounded retry policy from [`StoreConfig`].

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::broadcast;

use crate::changes::{ChangeFeed, ChangeKind, Table, TableChange};
use crate::config::{Config, StoreConfig};
use crate::error::{AppError, AppResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        token TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        user_id INTEGER PRIMARY KEY,
        full_name TEXT NOT NULL,
        avatar_url TEXT,
        bio TEXT,
        phone TEXT,
        rating REAL,
        rides_completed INTEGER NOT NULL DEFAULT 0,
        rides_offered INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rides (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        start_location TEXT NOT NULL,
        end_location TEXT NOT NULL,
        date TEXT NOT NULL,
        time TEXT NOT NULL,
        price REAL NOT NULL CHECK (price >= 0),
        available_seats INTEGER NOT NULL CHECK (available_seats >= 0),
        vehicle_type TEXT NOT NULL,
        vehicle_model TEXT NOT NULL,
        vehicle_color TEXT NOT NULL,
        license_plate TEXT NOT NULL,
        allow_pets BOOLEAN NOT NULL DEFAULT FALSE,
        allow_smoking BOOLEAN NOT NULL DEFAULT FALSE,
        allow_luggage BOOLEAN NOT NULL DEFAULT FALSE,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'completed', 'cancelled')),
        created_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bookings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ride_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        seats INTEGER NOT NULL CHECK (seats >= 1),
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'confirmed', 'cancelled', 'completed')),
        payment_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (payment_status IN ('pending', 'completed', 'refunded')),
        created_at TEXT NOT NULL,
        FOREIGN KEY (ride_id) REFERENCES rides(id),
        FOREIGN KEY (user_id) REFERENCES users(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_id INTEGER NOT NULL,
        receiver_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        ride_id INTEGER,
        created_at TEXT NOT NULL,
        FOREIGN KEY (sender_id) REFERENCES users(id),
        FOREIGN KEY (receiver_id) REFERENCES users(id),
        FOREIGN KEY (ride_id) REFERENCES rides(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        data TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token)",
    "CREATE INDEX IF NOT EXISTS idx_rides_status_created ON rides(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_user ON bookings(user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_ride ON bookings(ride_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender_receiver ON messages(sender_id, receiver_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_receiver_sender ON messages(receiver_id, sender_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, created_at)",
];

/// Timestamps are stored as fixed-width RFC 3339 text so that string order is time order.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now() -> String {
    format_datetime(&Utc::now())
}

#[derive(Clone)]
pub struct Database {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
    feed: ChangeFeed,
    store: StoreConfig,
}

impl Database {
    pub async fn connect(config: &Config) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(&config.database.url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))
            .create_if_missing(true);

        if let Some(parent) = base_opts.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tracing::info!("Connecting to database: {}", config.database.url);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&writer).await?;
        }

        // Opened after the schema exists so read-only connections never see an empty file.
        let reader = SqlitePoolOptions::new()
            .max_connections(config.database.max_read_connections.max(1))
            .connect_with(base_opts.read_only(true))
            .await?;

        Ok(Self {
            reader,
            writer,
            feed: ChangeFeed::new(config.changes.capacity),
            store: config.store.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.feed.subscribe()
    }

    pub fn publish(&self, table: Table, kind: ChangeKind) {
        tracing::trace!(table = table.as_str(), ?kind, "table changed");
        self.feed.publish(table, kind);
    }

    /// Run a read under the request timeout, retrying transient failures
    /// with exponential backoff.
    pub async fn with_retry<T, F, Fut>(&self, op: &'static str, f: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.run(op, AppError::is_transient, f).await
    }

    /// Run a write under the request timeout.
    ///
    /// Only failures that guarantee nothing was committed are retried: lock
    /// contention and pool exhaustion. A timed-out attempt may already have
    /// handed its commit to SQLite, so it surfaces as [`AppError::StoreTimeout`]
    /// instead of being replayed.
    pub async fn with_write<T, F, Fut>(&self, op: &'static str, f: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.run(op, AppError::is_safe_to_replay, f).await
    }

    async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        retryable: fn(&AppError) -> bool,
        mut f: F,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.store.request_timeout(), f()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::StoreTimeout),
            };

            match result {
                Err(err) if retryable(&err) && attempt < self.store.max_retries => {
                    let delay = self.store.retry_backoff() * 2u32.saturating_pow(attempt);
                    tracing::warn!(op, attempt, error = %err, ?delay, "transient store failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::debug!(op, error = %err, "store operation failed");
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    pub async fn test_db() -> Database {
        test_db_with(Config::default()).await
    }

    pub async fn test_db_with(mut config: Config) -> Database {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        config.database.url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak the tempdir so it outlives the pools.
        std::mem::forget(dir);
        Database::connect(&config).await.unwrap()
    }

    pub async fn seed_user(db: &Database, username: &str) -> i64 {
        let now = now();
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?, 'x', ?)",
        )
        .bind(username)
        .bind(&now)
        .execute(&db.writer)
        .await
        .unwrap();
        let user_id = result.last_insert_rowid();

        sqlx::query("INSERT INTO profiles (user_id, full_name, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(format!("{username} Full"))
            .bind(&now)
            .execute(&db.writer)
            .await
            .unwrap();

        user_id
    }

    pub async fn seed_ride(db: &Database, owner: i64, seats: i64) -> i64 {
        sqlx::query(
            r#"INSERT INTO rides
               (user_id, start_location, end_location, date, time, price, available_seats,
                vehicle_type, vehicle_model, vehicle_color, license_plate, created_at)
               VALUES (?, 'Berlin', 'Hamburg', '2026-11-01', '08:30:00', 25.0, ?,
                'sedan', 'Golf', 'blue', 'B-RS-1', ?)"#,
        )
        .bind(owner)
        .bind(seats)
        .bind(now())
        .execute(&db.writer)
        .await
        .unwrap()
        .last_insert_rowid()
    }
}
