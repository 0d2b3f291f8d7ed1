//! Host device capabilities

use std::sync::Arc;

/// Lowest host OS major version that can talk to accessory keys
pub const MIN_SYSTEM_MAJOR_VERSION: u32 = 10;

/// Host models whose accessory port cannot power or enumerate a key
const UNSUPPORTED_MODELS: &[&str] = &["iPhone4", "iPhone4S", "iPad2", "iPad3", "iPadMini1"];

/// Read-only snapshot of the host device
pub trait DeviceCapabilities: Send + Sync {
    fn system_version(&self) -> &str;
    fn device_model(&self) -> &str;

    /// Whether this host can use keys over the accessory transport
    fn supports_accessory_transport(&self) -> bool {
        let major = self
            .system_version()
            .split('.')
            .next()
            .and_then(|m| m.trim().parse::<u32>().ok());

        match major {
            Some(major) if major >= MIN_SYSTEM_MAJOR_VERSION => {
                !UNSUPPORTED_MODELS.contains(&self.device_model())
            }
            _ => false,
        }
    }
}

pub type SharedCapabilities = Arc<dyn DeviceCapabilities>;

/// Fixed capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCapabilities {
    pub system_version: String,
    pub device_model: String,
}

impl StaticCapabilities {
    pub fn new(system_version: impl Into<String>, device_model: impl Into<String>) -> Self {
        Self {
            system_version: system_version.into(),
            device_model: device_model.into(),
        }
    }

    /// Capabilities reported alongside the simulated accessory provider
    pub fn simulated() -> Self {
        Self::new("17.0", "Simulator")
    }
}

impl DeviceCapabilities for StaticCapabilities {
    fn system_version(&self) -> &str {
        &self.system_version
    }

    fn device_model(&self) -> &str {
        &self.device_model
    }
}
