//! Device selection configuration
//!
//! The defaults can be overridden through environment variables:
//! - `NN_OPENCL_DEVICES`: comma-separated device indices, e.g. `0,2`
//!   (empty or unset selects every device)
//! - `NN_OPENCL_PROFILE`: `1` or `true` to create profiling queues

use std::str::FromStr;

use crate::error::NnClError;

pub const DEVICES_ENV: &str = "NN_OPENCL_DEVICES";
pub const PROFILE_ENV: &str = "NN_OPENCL_PROFILE";

/// Error type for device list parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDeviceListError {
    pub token: String,
}

impl std::fmt::Display for ParseDeviceListError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid device index '{}'", self.token)
    }
}

impl std::error::Error for ParseDeviceListError {}

/// Parse a comma-separated list of device indices
pub fn parse_device_list(s: &str) -> Result<Vec<usize>, ParseDeviceListError> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<usize>().map_err(|_| ParseDeviceListError {
                token: t.to_string(),
            })
        })
        .collect()
}

/// Which devices to open and how to configure their queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// System device indices to use; empty selects all devices
    pub gpu_idxs: Vec<usize>,
    /// Create queues with profiling enabled
    pub enable_profiling: bool,
}

impl Default for DeviceConfig {
    /// Read the environment, warning and selecting every device if
    /// `NN_OPENCL_DEVICES` does not parse; use [`DeviceConfig::from_env`]
    /// to get the error instead
    fn default() -> Self {
        Self::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring {}", DEVICES_ENV);
            Self::with_devices(Vec::new()).profiling(profiling_from(env_var(PROFILE_ENV)))
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn profiling_from(value: Option<String>) -> bool {
    value
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

impl FromStr for DeviceConfig {
    type Err = ParseDeviceListError;

    /// Parse a device list; profiling is left off
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            gpu_idxs: parse_device_list(s)?,
            enable_profiling: false,
        })
    }
}

impl DeviceConfig {
    /// Use exactly these devices
    pub fn with_devices(gpu_idxs: Vec<usize>) -> Self {
        Self {
            gpu_idxs,
            enable_profiling: false,
        }
    }

    /// Use every available device
    pub fn all_devices() -> Self {
        Self::with_devices(Vec::new())
    }

    /// Read `NN_OPENCL_DEVICES` and `NN_OPENCL_PROFILE`
    ///
    /// An unparseable device list is a configuration error.
    pub fn from_env() -> crate::error::Result<Self> {
        Self::from_values(env_var(DEVICES_ENV), env_var(PROFILE_ENV))
    }

    fn from_values(
        devices: Option<String>,
        profile: Option<String>,
    ) -> crate::error::Result<Self> {
        let gpu_idxs = match devices {
            Some(list) => parse_device_list(&list).map_err(|e| {
                NnClError::Configuration(format!("{}={:?}: {}", DEVICES_ENV, list, e))
            })?,
            None => Vec::new(),
        };
        Ok(Self::with_devices(gpu_idxs).profiling(profiling_from(profile)))
    }

    pub fn profiling(mut self, enable: bool) -> Self {
        self.enable_profiling = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        assert_eq!(parse_device_list("0,2"), Ok(vec![0, 2]));
        assert_eq!(parse_device_list(" 3 , 1 "), Ok(vec![3, 1]));
        assert_eq!(parse_device_list(""), Ok(vec![]));
        assert_eq!(parse_device_list("1,,2,"), Ok(vec![1, 2]));
    }

    #[test]
    fn test_parse_device_list_rejects_garbage() {
        assert_eq!(
            parse_device_list("0,gpu"),
            Err(ParseDeviceListError {
                token: "gpu".to_string()
            })
        );
        assert!(parse_device_list("-1").is_err());
    }

    #[test]
    fn test_config_from_str() {
        let config: DeviceConfig = "1,0".parse().unwrap();
        assert_eq!(config.gpu_idxs, vec![1, 0]);
        assert!(!config.enable_profiling);
    }

    #[test]
    fn test_builders() {
        let config = DeviceConfig::with_devices(vec![2]).profiling(true);
        assert_eq!(config.gpu_idxs, vec![2]);
        assert!(config.enable_profiling);
        assert!(DeviceConfig::all_devices().gpu_idxs.is_empty());
    }

    #[test]
    fn test_from_values() {
        let config =
            DeviceConfig::from_values(Some("2, 0".to_string()), Some("TRUE".to_string())).unwrap();
        assert_eq!(config, DeviceConfig::with_devices(vec![2, 0]).profiling(true));

        let config = DeviceConfig::from_values(None, Some("0".to_string())).unwrap();
        assert_eq!(config, DeviceConfig::all_devices());
    }

    #[test]
    fn test_bad_device_list_is_configuration_error() {
        let err = DeviceConfig::from_values(Some("0,gpu1".to_string()), None).unwrap_err();
        assert!(matches!(err, NnClError::Configuration(_)), "{}", err);
        assert!(err.to_string().contains("gpu1"), "{}", err);
    }

    #[test]
    fn test_from_env_reports_bad_device_list() {
        std::env::set_var(DEVICES_ENV, "0,gpu1");
        let result = DeviceConfig::from_env();
        std::env::remove_var(DEVICES_ENV);
        assert!(matches!(result, Err(NnClError::Configuration(_))));
    }
}
