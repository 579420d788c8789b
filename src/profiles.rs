use sqlx::{QueryBuilder, Sqlite};

use crate::changes::{ChangeKind, Table};
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{Profile, ProfilePatch};

pub async fn get_profile(db: &Database, user_id: i64) -> AppResult<Profile> {
    let reader = &db.reader;
    db.with_retry("get_profile", move || async move {
        sqlx::query_as::<_, Profile>(
            "SELECT user_id, full_name, avatar_url, bio, phone, rating, rides_completed,
                    rides_offered, created_at
             FROM profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(reader)
        .await?
        .ok_or(AppError::NotFound("profile"))
    })
    .await
}

pub async fn update_profile(db: &Database, user_id: i64, patch: &ProfilePatch) -> AppResult<Profile> {
    if patch.full_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(AppError::validation("Full name cannot be empty"));
    }

    let changed = patch.full_name.is_some()
        || patch.avatar_url.is_some()
        || patch.bio.is_some()
        || patch.phone.is_some();

    if changed {
        let writer = &db.writer;
        let affected = db
            .with_write("update_profile", move || async move {
                let mut qb = QueryBuilder::<Sqlite>::new("UPDATE profiles SET ");
                let mut set = qb.separated(", ");
                if let Some(full_name) = &patch.full_name {
                    set.push("full_name = ").push_bind_unseparated(full_name.trim());
                }
                if let Some(avatar_url) = &patch.avatar_url {
                    set.push("avatar_url = ").push_bind_unseparated(avatar_url);
                }
                if let Some(bio) = &patch.bio {
                    set.push("bio = ").push_bind_unseparated(bio);
                }
                if let Some(phone) = &patch.phone {
                    set.push("phone = ").push_bind_unseparated(phone);
                }
                qb.push(" WHERE user_id = ").push_bind(user_id);

                Ok(qb.build().execute(writer).await?.rows_affected())
            })
            .await?;

        if affected == 0 {
            return Err(AppError::NotFound("profile"));
        }
        db.publish(Table::Profiles, ChangeKind::Update);
    }

    get_profile(db, user_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{seed_user, test_db};

    #[tokio::test]
    async fn update_changes_only_given_fields() {
        let db = test_db().await;
        let user = seed_user(&db, "pat").await;

        let updated = update_profile(
            &db,
            user,
            &ProfilePatch {
                bio: Some("Commutes to Hamburg on weekdays".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.full_name, "pat Full");
        assert_eq!(updated.bio.as_deref(), Some("Commutes to Hamburg on weekdays"));
        assert_eq!(updated.rides_offered, 0);
    }

    #[tokio::test]
    async fn blank_name_rejected() {
        let db = test_db().await;
        let user = seed_user(&db, "pat").await;

        let result = update_profile(
            &db,
            user,
            &ProfilePatch {
                full_name: Some(" ".to_string()),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_profile_is_not_found() {
        let db = test_db().await;
        assert!(matches!(get_profile(&db, 7).await, Err(AppError::NotFound("profile"))));
        assert!(matches!(
            update_profile(&db, 7, &ProfilePatch { phone: Some("123".into()), ..Default::default() }).await,
            Err(AppError::NotFound("profile"))
        ));
    }
}
