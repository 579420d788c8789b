//! Inbox view over the flat message log.
//!
//! Conversations are not stored. They are derived on every read by grouping a
//! user's messages by the other participant.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use sqlx::{QueryBuilder, Sqlite};

use crate::changes::{ChangeKind, Table};
use crate::db::{now, Database};
use crate::error::{AppError, AppResult};
use crate::models::{ConversationSummary, InboxRow, Message, SendMessageRequest};

const FALLBACK_NAME: &str = "User";

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, text, is_read, ride_id, created_at";

/// Group a user's messages into one summary per counterparty.
///
/// The representative message is the one with the greatest
/// `(created_at, id)`, so equal timestamps resolve to the highest id.
/// Summaries are ordered most recent first.
pub fn aggregate(user_id: i64, rows: impl IntoIterator<Item = InboxRow>) -> Vec<ConversationSummary> {
    let mut threads: HashMap<i64, ConversationSummary> = HashMap::new();

    for row in rows {
        let InboxRow {
            message,
            counterparty_name,
            counterparty_avatar,
        } = row;

        let counterparty_id = if message.sender_id == user_id {
            message.receiver_id
        } else {
            message.sender_id
        };
        let unread = i64::from(message.receiver_id == user_id && !message.is_read);

        match threads.entry(counterparty_id) {
            Entry::Vacant(slot) => {
                slot.insert(ConversationSummary {
                    counterparty_id,
                    name: counterparty_name.unwrap_or_else(|| FALLBACK_NAME.to_string()),
                    avatar: counterparty_avatar,
                    last_message: message.text,
                    last_message_id: message.id,
                    last_message_time: message.created_at,
                    unread_count: unread,
                });
            }
            Entry::Occupied(mut slot) => {
                let summary = slot.get_mut();
                summary.unread_count += unread;
                if (message.created_at, message.id) > (summary.last_message_time, summary.last_message_id) {
                    summary.last_message = message.text;
                    summary.last_message_id = message.id;
                    summary.last_message_time = message.created_at;
                }
                if let Some(name) = counterparty_name {
                    summary.name = name;
                }
                if counterparty_avatar.is_some() {
                    summary.avatar = counterparty_avatar;
                }
            }
        }
    }

    let mut summaries: Vec<ConversationSummary> = threads.into_values().collect();
    summaries.sort_by(|a, b| {
        (b.last_message_time, b.last_message_id).cmp(&(a.last_message_time, a.last_message_id))
    });
    summaries
}

pub async fn list_conversations(db: &Database, user_id: i64) -> AppResult<Vec<ConversationSummary>> {
    let reader = &db.reader;
    let rows = db
        .with_retry("list_conversations", move || async move {
            // Sent and received halves each use their own index; self-addressed
            // messages only come through the first half.
            let rows = sqlx::query_as::<_, InboxRow>(
                r#"
                SELECT m.id, m.sender_id, m.receiver_id, m.text, m.is_read, m.ride_id, m.created_at,
                       p.full_name AS counterparty_name, p.avatar_url AS counterparty_avatar
                FROM messages m
                LEFT JOIN profiles p ON p.user_id = m.receiver_id
                WHERE m.sender_id = ?
                UNION ALL
                SELECT m.id, m.sender_id, m.receiver_id, m.text, m.is_read, m.ride_id, m.created_at,
                       p.full_name AS counterparty_name, p.avatar_url AS counterparty_avatar
                FROM messages m
                LEFT JOIN profiles p ON p.user_id = m.sender_id
                WHERE m.receiver_id = ? AND m.sender_id != ?
                "#,
            )
            .bind(user_id)
            .bind(user_id)
            .bind(user_id)
            .fetch_all(reader)
            .await?;
            Ok(rows)
        })
        .await?;

    let summaries = aggregate(user_id, rows);
    tracing::debug!(user_id, conversations = summaries.len(), "listed conversations");
    Ok(summaries)
}

/// Load the thread between two users, oldest first, and mark what `user_id`
/// received as read. Calling it again is a no-op on the store.
pub async fn open_conversation(db: &Database, user_id: i64, other_id: i64) -> AppResult<Vec<Message>> {
    if user_id == other_id {
        return Err(AppError::validation("Cannot open a conversation with yourself"));
    }

    let reader = &db.reader;
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
         ORDER BY created_at, id"
    );
    let query = sql.as_str();
    let mut messages = db
        .with_retry("open_conversation", move || async move {
            let messages = sqlx::query_as::<_, Message>(query)
                .bind(user_id)
                .bind(other_id)
                .bind(other_id)
                .bind(user_id)
                .fetch_all(reader)
                .await?;
            Ok(messages)
        })
        .await?;

    let unread: Vec<i64> = messages
        .iter()
        .filter(|m| m.receiver_id == user_id && !m.is_read)
        .map(|m| m.id)
        .collect();

    if unread.is_empty() {
        return Ok(messages);
    }

    let writer = &db.writer;
    let ids = unread.as_slice();
    db.with_write("mark_messages_read", move || async move {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE messages SET is_read = TRUE WHERE receiver_id = ");
        qb.push_bind(user_id).push(" AND is_read = FALSE AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        qb.build().execute(writer).await?;
        Ok(())
    })
    .await?;

    for message in messages.iter_mut().filter(|m| unread.contains(&m.id)) {
        message.is_read = true;
    }

    tracing::debug!(user_id, other_id, marked = unread.len(), "conversation marked read");
    db.publish(Table::Messages, ChangeKind::Update);
    Ok(messages)
}

pub async fn send_message(db: &Database, sender_id: i64, request: &SendMessageRequest) -> AppResult<Message> {
    let text = request.text.trim();
    if text.is_empty() {
        return Err(AppError::validation("Message text cannot be empty"));
    }
    if request.receiver_id == sender_id {
        return Err(AppError::validation("Cannot send a message to yourself"));
    }

    let reader = &db.reader;
    let receiver_id = request.receiver_id;
    let ride_id = request.ride_id;
    db.with_retry("check_message_targets", move || async move {
        let receiver: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE id = ?")
            .bind(receiver_id)
            .fetch_optional(reader)
            .await?;
        if receiver.is_none() {
            return Err(AppError::NotFound("user"));
        }

        if let Some(ride_id) = ride_id {
            let ride: Option<(i64,)> = sqlx::query_as("SELECT id FROM rides WHERE id = ?")
                .bind(ride_id)
                .fetch_optional(reader)
                .await?;
            if ride.is_none() {
                return Err(AppError::NotFound("ride"));
            }
        }
        Ok(())
    })
    .await?;

    let writer = &db.writer;
    let sql = format!(
        "INSERT INTO messages (sender_id, receiver_id, text, is_read, ride_id, created_at)
         VALUES (?, ?, ?, FALSE, ?, ?) RETURNING {MESSAGE_COLUMNS}"
    );
    let query = sql.as_str();
    let message = db
        .with_write("send_message", move || async move {
            let message = sqlx::query_as::<_, Message>(query)
                .bind(sender_id)
                .bind(receiver_id)
                .bind(text)
                .bind(ride_id)
                .bind(now())
                .fetch_one(writer)
                .await?;
            Ok(message)
        })
        .await?;

    tracing::info!(message_id = message.id, sender_id, receiver_id, "message sent");
    db.publish(Table::Messages, ChangeKind::Insert);
    Ok(message)
}
