//! Server configuration

use anyhow::Context;
use wellness_billing::BillingConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Unpooled connection for migrations, when the main URL goes through PgBouncer
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub billing: BillingConfig,
}

impl Config {
    /// Load from the environment. Missing required keys fail startup.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_direct_url = std::env::var("DATABASE_DIRECT_URL")
            .ok()
            .filter(|url| !url.is_empty());
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let billing = BillingConfig::from_env().context("Invalid billing configuration")?;

        Ok(Self {
            database_url,
            database_direct_url,
            bind_address,
            billing,
        })
    }
}
