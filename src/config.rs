use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub admin_key: String,
    /// Upper bound in milliseconds for each store/cache call the broker
    /// makes. Set via ERPLINK_OP_TIMEOUT_MS. Default: 300.
    pub op_timeout_ms: u64,
}

const PLACEHOLDER_ADMIN_KEY: &str = "CHANGE_ME_ADMIN_KEY";

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let admin_key =
        std::env::var("ERPLINK_ADMIN_KEY").unwrap_or_else(|_| PLACEHOLDER_ADMIN_KEY.into());

    if admin_key == PLACEHOLDER_ADMIN_KEY {
        let env_mode = std::env::var("ERPLINK_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "ERPLINK_ADMIN_KEY is still the insecure placeholder. \
                 Set a proper key before running in production."
            );
        }
        eprintln!("⚠️  ERPLINK_ADMIN_KEY is not set — using insecure placeholder. Set a real key for production.");
    }

    Ok(Config {
        port: std::env::var("ERPLINK_PORT")
            .unwrap_or_else(|_| "8088".into())
            .parse()
            .unwrap_or(8088),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/erplink".into()),
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        admin_key,
        op_timeout_ms: std::env::var("ERPLINK_OP_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300),
    })
}
