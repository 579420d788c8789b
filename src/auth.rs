use crate::db::{now, Database};
use crate::error::{AppError, AppResult};
use crate::models::{AuthResponse, CreateAccountRequest, LoginRequest, User};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use rand::Rng;

const TOKEN_LENGTH: usize = 32;
const MIN_PASSWORD_LENGTH: usize = 8;

pub fn generate_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    (0..TOKEN_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, bcrypt::BcryptError> {
    bcrypt::verify(password, hash)
}

/// Register a user, create their profile and open a first session.
pub async fn create_account(db: &Database, request: &CreateAccountRequest) -> AppResult<AuthResponse> {
    let username = request.username.trim();
    let full_name = request.full_name.trim();
    if username.is_empty() {
        return Err(AppError::validation("Username cannot be empty"));
    }
    if full_name.is_empty() {
        return Err(AppError::validation("Full name cannot be empty"));
    }
    if request.password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    let password_hash = hash_password(&request.password)?;
    let password_hash = password_hash.as_str();
    let token = generate_token();
    let token_ref = token.as_str();

    let writer = &db.writer;
    let user_id = db
        .with_write("create_account", move || async move {
            let mut tx = writer.begin().await?;
            let created_at = now();

            let result = sqlx::query(
                "INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)",
            )
            .bind(username)
            .bind(password_hash)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict("Username already exists".to_string())
                }
                other => AppError::Persistence(other),
            })?;
            let user_id = result.last_insert_rowid();

            sqlx::query("INSERT INTO profiles (user_id, full_name, created_at) VALUES (?, ?, ?)")
                .bind(user_id)
                .bind(full_name)
                .bind(&created_at)
                .execute(&mut *tx)
                .await?;

            sqlx::query("INSERT INTO sessions (user_id, token, created_at) VALUES (?, ?, ?)")
                .bind(user_id)
                .bind(token_ref)
                .bind(&created_at)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(user_id)
        })
        .await?;

    tracing::info!(user_id, "account created");
    Ok(AuthResponse {
        token,
        user_id,
        username: username.to_string(),
    })
}

pub async fn login(db: &Database, request: &LoginRequest) -> AppResult<AuthResponse> {
    let reader = &db.reader;
    let username = request.username.trim();
    let user = db
        .with_retry("find_user", move || async move {
            let user = sqlx::query_as::<_, User>(
                "SELECT id, username, password_hash, created_at FROM users WHERE username = ?",
            )
            .bind(username)
            .fetch_optional(reader)
            .await?;
            Ok(user)
        })
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !verify_password(&request.password, &user.password_hash)? {
        tracing::debug!(user_id = user.id, "login rejected");
        return Err(AppError::Unauthorized);
    }

    let token = generate_token();
    let token_ref = token.as_str();
    let writer = &db.writer;
    let user_id = user.id;
    db.with_write("create_session", move || async move {
        sqlx::query("INSERT INTO sessions (user_id, token, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(token_ref)
            .bind(now())
            .execute(writer)
            .await?;
        Ok(())
    })
    .await?;

    Ok(AuthResponse {
        token,
        user_id,
        username: user.username,
    })
}

pub async fn get_user_id_from_token(db: &Database, token: &str) -> AppResult<Option<i64>> {
    let reader = &db.reader;
    db.with_retry("resolve_session", move || async move {
        let row: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(reader)
            .await?;
        Ok(row.map(|(user_id,)| user_id))
    })
    .await
}

// Middleware to validate authentication token
pub async fn auth_middleware(
    State(db): State<Database>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?
        .to_string();

    match get_user_id_from_token(&db, &token).await? {
        Some(user_id) => {
            request.extensions_mut().insert(user_id);
            Ok(next.run(request).await)
        }
        None => Err(AppError::Unauthorized),
    }
}
