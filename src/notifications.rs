use sqlx::types::Json;
use sqlx::SqliteConnection;

use crate::changes::{ChangeKind, Table};
use crate::db::{now, Database};
use crate::error::{AppError, AppResult};
use crate::models::{NewNotification, Notification};

/// Insert on an existing connection so callers can notify inside their own transaction.
pub async fn insert_notification(
    conn: &mut SqliteConnection,
    notification: &NewNotification,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO notifications (user_id, type, title, message, is_read, data, created_at)
         VALUES (?, ?, ?, ?, FALSE, ?, ?)",
    )
    .bind(notification.user_id)
    .bind(notification.kind)
    .bind(&notification.title)
    .bind(&notification.message)
    .bind(notification.data.as_ref().map(Json))
    .bind(now())
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn list_notifications(db: &Database, user_id: i64) -> AppResult<Vec<Notification>> {
    let reader = &db.reader;
    db.with_retry("list_notifications", move || async move {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT id, user_id, type, title, message, is_read, data, created_at
             FROM notifications WHERE user_id = ?
             ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(reader)
        .await?;
        Ok(notifications)
    })
    .await
}

pub async fn mark_notification_read(db: &Database, user_id: i64, notification_id: i64) -> AppResult<()> {
    let writer = &db.writer;
    let affected = db
        .with_write("mark_notification_read", move || async move {
            let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = ? AND user_id = ?")
                .bind(notification_id)
                .bind(user_id)
                .execute(writer)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

    if affected == 0 {
        return Err(AppError::NotFound("notification"));
    }

    db.publish(Table::Notifications, ChangeKind::Update);
    Ok(())
}
