use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

pub const DEFAULT_HOSTED_API_BASE: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub hosted_api_base: String,
    pub connect_timeout: Duration,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub extraction_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            extraction_timeout: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(300),
            channel_capacity: 32,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr = env::var("NOVEL_ASSISTANT_BIND")
            .ok()
            .and_then(|value| value.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 5000)));
        let data_dir = env::var("NOVEL_ASSISTANT_DATA_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));
        let hosted_api_base = env::var("HOSTED_API_BASE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOSTED_API_BASE.to_owned());

        let defaults = RelayConfig::default();
        let relay = RelayConfig {
            extraction_timeout: Duration::from_secs(read_u64(
                "EXTRACTION_TIMEOUT_SECS",
                defaults.extraction_timeout.as_secs(),
            )),
            stream_idle_timeout: Duration::from_secs(read_u64(
                "STREAM_IDLE_TIMEOUT_SECS",
                defaults.stream_idle_timeout.as_secs(),
            )),
            channel_capacity: read_u64("STREAM_CHANNEL_CAPACITY", defaults.channel_capacity as u64)
                .max(1) as usize,
        };

        Self {
            bind_addr,
            data_dir,
            hosted_api_base,
            connect_timeout: Duration::from_secs(read_u64("UPSTREAM_CONNECT_TIMEOUT_SECS", 10)),
            relay,
        }
    }
}

fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}
