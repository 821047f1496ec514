use std::str::FromStr;
use tracing::warn;

/// Storage backend selected for a served or embedded cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Moka,
    Foyer,
    Sled,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "moka" => Ok(BackendKind::Moka),
            "foyer" => Ok(BackendKind::Foyer),
            "sled" => Ok(BackendKind::Sled),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub tcp_port: u16,
    pub backend: BackendKind,
    pub data_dir: String,
    pub mem_bytes: usize,
    pub max_entries: Option<u64>,
    pub merge_attempts: u32,
    pub lock_timeout_secs: u64,
    pub bind_lock_expiry: bool,
    // 0 means wait forever
    pub lock_wait_secs: u64,
}

impl Config {
    const DEFAULT_HOST: &str = "127.0.0.1";
    const DEFAULT_TCP_PORT: u16 = 5500;
    const DEFAULT_DATA_DIR: &str = "./data";
    const DEFAULT_MEM_BYTES: usize = 64 * 1024 * 1024;
    const DEFAULT_MERGE_ATTEMPTS: u32 = 10;
    const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;
    const DEFAULT_LOCK_WAIT_SECS: u64 = 60;

    pub fn from_env() -> Self {
        let bind_lock_expiry = match std::env::var("HOARD_LOCK_EXPIRY") {
            Ok(v) if v.eq_ignore_ascii_case("unbounded") => false,
            Ok(v) if v.eq_ignore_ascii_case("bound") => true,
            Ok(v) => {
                warn!("HOARD_LOCK_EXPIRY='{}' not recognised, using 'bound'", v);
                true
            }
            Err(_) => true,
        };

        Self {
            host: std::env::var("HOARD_HOST").unwrap_or_else(|_| Self::DEFAULT_HOST.to_string()),
            tcp_port: parse_env("HOARD_TCP_PORT", Self::DEFAULT_TCP_PORT),
            backend: parse_env("HOARD_BACKEND", BackendKind::Moka),
            data_dir: std::env::var("HOARD_DATA_DIR")
                .unwrap_or_else(|_| Self::DEFAULT_DATA_DIR.to_string()),
            mem_bytes: parse_env("HOARD_MEM_BYTES", Self::DEFAULT_MEM_BYTES),
            max_entries: std::env::var("HOARD_MAX_ENTRIES")
                .ok()
                .and_then(|v| match v.parse::<u64>() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        warn!("HOARD_MAX_ENTRIES='{}' is not a number, leaving unbounded", v);
                        None
                    }
                }),
            merge_attempts: parse_env("HOARD_MERGE_ATTEMPTS", Self::DEFAULT_MERGE_ATTEMPTS),
            lock_timeout_secs: parse_env("HOARD_LOCK_TIMEOUT", Self::DEFAULT_LOCK_TIMEOUT_SECS),
            bind_lock_expiry,
            lock_wait_secs: parse_env("HOARD_LOCK_WAIT_SECS", Self::DEFAULT_LOCK_WAIT_SECS),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Self::DEFAULT_HOST.to_string(),
            tcp_port: Self::DEFAULT_TCP_PORT,
            backend: BackendKind::Moka,
            data_dir: Self::DEFAULT_DATA_DIR.to_string(),
            mem_bytes: Self::DEFAULT_MEM_BYTES,
            max_entries: None,
            merge_attempts: Self::DEFAULT_MERGE_ATTEMPTS,
            lock_timeout_secs: Self::DEFAULT_LOCK_TIMEOUT_SECS,
            bind_lock_expiry: true,
            lock_wait_secs: Self::DEFAULT_LOCK_WAIT_SECS,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            warn!("{}='{}' could not be parsed, using default {:?}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
