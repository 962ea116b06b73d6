use crate::services::network::{DEFAULT_FALLBACK_DNS, WatchdogConfig};
use anyhow::{Context, Result};
use std::{env, net::Ipv4Addr, path::PathBuf, str::FromStr, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// UI server configuration
    pub ui: UiConfig,

    /// Bridge executable and device discovery
    pub bridge: BridgeExecConfig,

    /// Boot-time network watchdog
    pub watchdog: WatchdogConfig,

    /// Path configuration
    pub paths: PathConfig,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct BridgeExecConfig {
    pub executable: PathBuf,
    pub device_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub state_file: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables. Subsequent
    /// calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        Ok(Self {
            ui: UiConfig::load()?,
            bridge: BridgeExecConfig::load()?,
            watchdog: load_watchdog()?,
            paths: PathConfig::load()?,
        })
    }
}

/// Parse an optional environment variable, using `default` if unset
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .context(format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}

impl UiConfig {
    fn load() -> Result<Self> {
        let port = env_or("UI_PORT", 8080u16)?;

        Ok(Self { port })
    }
}

impl BridgeExecConfig {
    fn load() -> Result<Self> {
        let executable = env::var("BRIDGE_EXECUTABLE")
            .unwrap_or_else(|_| "socat".to_string())
            .into();

        let device_dir = env::var("SERIAL_DEVICE_DIR")
            .unwrap_or_else(|_| "/dev".to_string())
            .into();

        Ok(Self {
            executable,
            device_dir,
        })
    }
}

fn load_watchdog() -> Result<WatchdogConfig> {
    let dhcp_timeout = env_or("DHCP_WAIT_TIMEOUT_SECS", 60u64)?;
    let poll_interval = env_or("DHCP_POLL_INTERVAL_SECS", 2u64)?;
    let fallback_dns = env_or::<Ipv4Addr>("FALLBACK_DNS", DEFAULT_FALLBACK_DNS)?;

    anyhow::ensure!(poll_interval > 0, "DHCP_POLL_INTERVAL_SECS must be positive");

    Ok(WatchdogConfig {
        dhcp_timeout: Duration::from_secs(dhcp_timeout),
        poll_interval: Duration::from_secs(poll_interval),
        fallback_dns,
    })
}

impl PathConfig {
    fn load() -> Result<Self> {
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::data_dir());

        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        let state_file = env::var("STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("serial_config.json"));

        Ok(Self { state_file })
    }

    #[cfg(not(any(test, feature = "mock")))]
    fn data_dir() -> PathBuf {
        PathBuf::from("/data/")
    }

    // In test mode, use temp directory as default to avoid /data requirement
    #[cfg(any(test, feature = "mock"))]
    fn data_dir() -> PathBuf {
        std::env::temp_dir().join("serial-gateway-test")
    }
}
