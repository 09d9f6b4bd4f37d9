//! Moshimoshi Server Library
//!
//! Signaling and room orchestration for meetings routed through an SFU.
//! Exposed as a library for the binary and for integration tests.

pub mod api;
pub mod auth;
pub mod db;
pub mod directory;
pub mod error;
pub mod media;
pub mod models;
pub mod rooms;
pub mod state;
pub mod ws;

use anyhow::Result;
use directory::{MemoryDirectory, ParticipantDirectory};
use media::LocalEngine;
use std::sync::Arc;

/// Build the router and shared state from `config`, picking the directory
/// backend it asks for
pub async fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let directory: Arc<dyn ParticipantDirectory> = match &config.database_url {
        Some(url) if !config.use_memory_directory => Arc::new(db::connect_directory(url).await?),
        _ => {
            tracing::warn!("Using the in-memory directory; meetings are lost on restart");
            Arc::new(MemoryDirectory::new())
        }
    };
    let engine = Arc::new(LocalEngine::new(config.announced_ip.clone()));

    let app_state = state::AppState::new(config, directory, engine);
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
