use crate::directory::ParticipantDirectory;
use crate::media::MediaEngine;
use crate::rooms::RoomCoordinator;
use serde::Deserialize;
use std::sync::Arc;

const DEV_JWT_SECRET: &str = "dev-secret-change-in-production";

/// Server settings. Not `Debug`, so the secret never ends up in a log line.
#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    /// `None` only when the in-memory directory is in use
    pub database_url: Option<String>,
    pub jwt_secret: String,
    /// Allowed CORS origin; any origin when unset
    pub cors_origin: Option<String>,
    /// Address put into ICE candidates handed to clients
    pub announced_ip: String,
    pub use_memory_directory: bool,
}

#[derive(Deserialize)]
struct RawConfig {
    bind_address: String,
    database_url: Option<String>,
    jwt_secret: Option<String>,
    cors_origin: Option<String>,
    announced_ip: String,
    use_memory_directory: bool,
}

impl Config {
    /// Defaults, then `moshimoshi.toml` if present, then the environment
    pub fn load() -> anyhow::Result<Self> {
        let raw: RawConfig = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("announced_ip", "127.0.0.1")?
            .set_default("use_memory_directory", false)?
            .add_source(config::File::with_name("moshimoshi").required(false))
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        let jwt_secret = raw.jwt_secret.filter(|s| !s.is_empty()).unwrap_or_else(|| {
            tracing::warn!("JWT_SECRET not set, using default (insecure for production!)");
            DEV_JWT_SECRET.to_string()
        });

        let database_url = raw.database_url.filter(|s| !s.is_empty());
        if database_url.is_none() && !raw.use_memory_directory {
            anyhow::bail!("DATABASE_URL must be set unless USE_MEMORY_DIRECTORY=true");
        }

        Ok(Config {
            bind_address: raw.bind_address,
            database_url,
            jwt_secret,
            cors_origin: raw.cors_origin.filter(|s| !s.is_empty()),
            announced_ip: raw.announced_ip,
            use_memory_directory: raw.use_memory_directory,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn ParticipantDirectory>,
    pub rooms: Arc<RoomCoordinator>,
}

impl AppState {
    pub fn new(
        config: Config,
        directory: Arc<dyn ParticipantDirectory>,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        let rooms = Arc::new(RoomCoordinator::new(directory.clone(), engine));

        Self {
            config: Arc::new(config),
            directory,
            rooms,
        }
    }
}
