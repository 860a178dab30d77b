//! Environment-based configuration
//!
//! Backend selection is a boundary concern: `PAIGEANT_TRANSPORT` picks the
//! transport, `PAIGEANT_DATABASE_URL` (falling back to `DATABASE_URL`) picks
//! the repository, and the rest tunes the monitor API and edit budget.

use std::env;

use crate::contracts::DEFAULT_ITINERARY_EDIT_LIMIT;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `inmemory` or `redis`.
    pub transport_backend: String,

    /// `sqlite://…` or `postgres://…`; unset selects the in-memory store.
    pub database_url: Option<String>,

    /// Redis REST bridge endpoint and credential.
    pub redis_rest_url: String,
    pub redis_rest_token: String,

    /// Monitor API bind address.
    pub host: String,
    pub port: u16,

    /// Per-workflow budget for mid-flight itinerary insertions.
    pub itinerary_edit_limit: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            transport_backend: env::var("PAIGEANT_TRANSPORT")
                .unwrap_or_else(|_| "inmemory".to_string())
                .to_lowercase(),
            database_url: env::var("PAIGEANT_DATABASE_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .ok(),
            redis_rest_url: env::var("PAIGEANT_REDIS_REST_URL")
                .or_else(|_| env::var("UPSTASH_REDIS_REST_URL"))
                .unwrap_or_default(),
            redis_rest_token: env::var("PAIGEANT_REDIS_REST_TOKEN")
                .or_else(|_| env::var("UPSTASH_REDIS_REST_TOKEN"))
                .unwrap_or_default(),
            host: env::var("PAIGEANT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PAIGEANT_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            itinerary_edit_limit: env::var("PAIGEANT_ITINERARY_EDIT_LIMIT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_ITINERARY_EDIT_LIMIT),
        }
    }

    /// Monitor API bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
