use std::{sync::Arc, time::Duration};

mod app;
mod auth;
mod config;
mod db;
mod error;
mod response;
mod state;

use crate::{auth::session::spawn_sweeper, config::AppConfig, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "userauth=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = Arc::new(AppConfig::from_env()?);
    let db = db::connect(&config.database_url).await?;
    db::run_migrations(&db).await?;

    let state = AppState::postgres(config.clone(), db)?;

    if config.session_sweep_interval_secs > 0 {
        spawn_sweeper(
            state.sessions.clone(),
            state.oauth.clone(),
            Duration::from_secs(config.session_sweep_interval_secs),
        );
    }

    app::serve(app::build_app(state)).await
}
