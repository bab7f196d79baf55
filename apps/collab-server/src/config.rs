use std::env;
use std::path::PathBuf;

/// Server configuration from environment variables, with development
/// defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub token_ttl_secs: i64,
}

impl Config {
    pub fn load() -> Self {
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("collab_data"));
        let token_ttl_secs = env::var("TOKEN_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(86_400);

        Self {
            bind_addr,
            data_dir,
            token_ttl_secs,
        }
    }
}
