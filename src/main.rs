mod auth;
mod booking;
mod changes;
mod config;
mod conversations;
mod db;
mod error;
mod handlers;
mod models;
mod notifications;
mod profiles;
mod rides;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;

fn router(db: Database) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route(
            "/api/profile",
            get(handlers::get_own_profile).patch(handlers::update_own_profile),
        )
        .route("/api/profiles/:user_id", get(handlers::get_profile))
        .route("/api/rides", get(handlers::list_rides).post(handlers::create_ride))
        .route("/api/rides/:id", get(handlers::get_ride).patch(handlers::update_ride))
        .route("/api/rides/:id/bookings", get(handlers::list_ride_bookings))
        .route(
            "/api/bookings",
            get(handlers::list_bookings).post(handlers::create_booking),
        )
        .route("/api/bookings/:id/cancel", post(handlers::cancel_booking))
        .route("/api/bookings/:id/confirm", post(handlers::confirm_booking))
        .route("/api/conversations", get(handlers::get_conversations))
        .route("/api/conversations/:other_id", get(handlers::open_conversation))
        .route("/api/messages/send", post(handlers::send_message))
        .route("/api/notifications", get(handlers::get_notifications))
        .route(
            "/api/notifications/:id/read",
            post(handlers::mark_notification_read),
        )
        .route("/api/changes", get(handlers::stream_changes))
        .route_layer(middleware::from_fn_with_state(
            db.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/account/create", post(handlers::create_account))
        .route("/api/account/login", post(handlers::login))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(db)
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rideshare_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().await;

    let db = Database::connect(&config)
        .await
        .expect("Failed to initialize database");
    tracing::info!("Database initialized successfully");

    let app = router(db);

    let addr = SocketAddr::from((config.server.host, config.server.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
