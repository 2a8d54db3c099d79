use crate::services::{
    connectivity::ConnectivityConfig, provisioning::ProvisioningConfig, sync::SyncConfig,
};
use anyhow::{Context, Result, ensure};
use std::{env, path::PathBuf, str::FromStr, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Device access point configuration
    pub device: DeviceConfig,

    /// Plant backend configuration
    pub backend: BackendConfig,

    /// Timing policy for device and backend traffic
    pub timing: TimingConfig,

    /// Path configuration
    pub paths: PathConfig,

    /// Credentials for the `provision` command
    pub wifi: WifiConfig,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Address the device answers on while it runs its own access point
    pub address: String,
    pub id: String,
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct TimingConfig {
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub sync_settle_delay: Duration,
    pub connectivity_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables. Subsequent
    /// calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. The binary cannot do anything
    /// useful without a valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| Self::load().expect("failed to load application configuration"))
    }

    /// Load all configuration from environment variables
    pub fn load() -> Result<Self> {
        Ok(Self {
            device: DeviceConfig::load()?,
            backend: BackendConfig::load()?,
            timing: TimingConfig::load()?,
            paths: PathConfig::load()?,
            wifi: WifiConfig::load(),
        })
    }

    pub fn provisioning(&self) -> ProvisioningConfig {
        ProvisioningConfig {
            device_address: self.device.address.clone(),
            device_id: self.device.id.clone(),
            request_timeout: self.timing.request_timeout,
            poll_interval: self.timing.poll_interval,
            poll_attempts: self.timing.poll_attempts,
        }
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            settle_delay: self.timing.sync_settle_delay,
        }
    }

    pub fn connectivity(&self) -> ConnectivityConfig {
        ConnectivityConfig {
            interval: self.timing.connectivity_interval,
        }
    }
}

impl DeviceConfig {
    fn load() -> Result<Self> {
        let address = env::var("DEVICE_ADDRESS")
            .unwrap_or_else(|_| ProvisioningConfig::DEFAULT_DEVICE_ADDRESS.to_string());
        let id = env::var("DEVICE_ID")
            .unwrap_or_else(|_| ProvisioningConfig::DEFAULT_DEVICE_ID.to_string());

        ensure!(!address.is_empty(), "failed to load DEVICE_ADDRESS: empty value");

        Ok(Self { address, id })
    }
}

impl BackendConfig {
    fn load() -> Result<Self> {
        let url = env::var("BACKEND_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".to_string());

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

impl TimingConfig {
    const MAX_DURATION: Duration = Duration::from_secs(60 * 60);
    const MAX_POLL_ATTEMPTS: u32 = 3600;

    fn load() -> Result<Self> {
        let timing = Self {
            request_timeout: secs_var("REQUEST_TIMEOUT_SECS", 5)?,
            poll_interval: secs_var("POLL_INTERVAL_SECS", 1)?,
            poll_attempts: parse_var("POLL_ATTEMPTS", 30)?,
            sync_settle_delay: secs_var("SYNC_SETTLE_DELAY_SECS", 2)?,
            connectivity_interval: secs_var("CONNECTIVITY_INTERVAL_SECS", 5)?,
        };
        timing.validate()?;
        Ok(timing)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("REQUEST_TIMEOUT_SECS", self.request_timeout),
            ("POLL_INTERVAL_SECS", self.poll_interval),
            ("SYNC_SETTLE_DELAY_SECS", self.sync_settle_delay),
            ("CONNECTIVITY_INTERVAL_SECS", self.connectivity_interval),
        ] {
            ensure!(
                value <= Self::MAX_DURATION,
                "failed to load {name}: must not exceed {}s",
                Self::MAX_DURATION.as_secs()
            );
        }

        ensure!(
            !self.request_timeout.is_zero(),
            "failed to load REQUEST_TIMEOUT_SECS: must be positive"
        );
        ensure!(
            (1..=Self::MAX_POLL_ATTEMPTS).contains(&self.poll_attempts),
            "failed to load POLL_ATTEMPTS: must be between 1 and {}",
            Self::MAX_POLL_ATTEMPTS
        );

        Ok(())
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join(env!("CARGO_PKG_NAME")));

        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        Ok(Self { data_dir })
    }
}

impl WifiConfig {
    fn load() -> Self {
        Self {
            ssid: env::var("WIFI_SSID").unwrap_or_default(),
            password: env::var("WIFI_PASSWORD").unwrap_or_default(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .context(format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    parse_var(name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default_when_unset() {
        let value: u32 = parse_var("PLANT_LINK_TEST_UNSET_VARIABLE", 30).unwrap();
        assert_eq!(value, 30);
    }

    #[test]
    fn secs_var_converts_to_duration() {
        let value = secs_var("PLANT_LINK_TEST_UNSET_SECONDS", 2).unwrap();
        assert_eq!(value, Duration::from_secs(2));
    }

    fn timing() -> TimingConfig {
        TimingConfig {
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            poll_attempts: 30,
            sync_settle_delay: Duration::from_secs(2),
            connectivity_interval: Duration::from_secs(5),
        }
    }

    mod timing {
        use super::*;

        #[test]
        fn defaults_are_valid() {
            assert!(timing().validate().is_ok());
        }

        #[test]
        fn huge_poll_interval_is_rejected() {
            let config = TimingConfig {
                poll_interval: Duration::from_secs(u64::MAX),
                ..timing()
            };

            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("POLL_INTERVAL_SECS"));
        }

        #[test]
        fn poll_attempts_are_bounded() {
            for poll_attempts in [0, u32::MAX] {
                let config = TimingConfig {
                    poll_attempts,
                    ..timing()
                };
                assert!(config.validate().is_err(), "{poll_attempts} accepted");
            }
        }

        #[test]
        fn zero_request_timeout_is_rejected() {
            let config = TimingConfig {
                request_timeout: Duration::ZERO,
                ..timing()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn provisioning_config_carries_timing() {
        let config = AppConfig {
            device: DeviceConfig {
                address: "10.0.0.2".to_string(),
                id: "plant-01".to_string(),
            },
            backend: BackendConfig {
                url: "http://backend".to_string(),
            },
            timing: timing(),
            paths: PathConfig {
                data_dir: PathBuf::from("/tmp"),
            },
            wifi: WifiConfig::default(),
        };

        let provisioning = config.provisioning();
        assert_eq!(provisioning.device_address, "10.0.0.2");
        assert_eq!(provisioning.device_id, "plant-01");
        assert_eq!(provisioning.poll_attempts, 30);
        assert_eq!(config.sync().settle_delay, Duration::from_secs(2));
    }
}
