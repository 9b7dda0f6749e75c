use std::env;

pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/live_reaction.db?mode=rwc";

/// Environment-derived server configuration, read once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on (`PORT`).
    pub port: u16,
    /// Connection string for the reaction database (`DATABASE_URL`).
    /// SQLite file by default; a `postgresql://` URL selects PostgreSQL.
    pub database_url: String,
    /// Origin allowed by CORS (`FRONTEND_URL`). `*` when unset.
    pub frontend_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| format!("PORT must be a TCP port number, got \"{raw}\""))?,
            Err(_) => DEFAULT_PORT,
        };

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let frontend_url = env::var("FRONTEND_URL").unwrap_or_else(|_| "*".to_string());

        Ok(Self {
            port,
            database_url,
            frontend_url,
        })
    }
}
