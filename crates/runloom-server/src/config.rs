// Server configuration from environment variables
//
// Decision: a single opaque API token; the engine never interprets it

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Bearer token required on every API request
    pub api_token: String,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            bind_addr: std::env::var("RUNLOOM_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            api_token: std::env::var("RUNLOOM_API_TOKEN")
                .context("RUNLOOM_API_TOKEN must be set")?,
        })
    }
}
