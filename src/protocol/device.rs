//! Device type classification
//!
//! Every device type token maps to exactly one capability variant. Simple
//! devices only take commands and status; smart devices report a content hash
//! and a structured `datahold` payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status/command devices without an on-device hashing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimpleDevice {
    Power,
    Light,
    Scale,
}

/// Devices that carry a content hash and a structured payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmartDevice {
    Lock,
    Terminal,
}

/// Capability variant of a device type token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Simple(SimpleDevice),
    Smart(SmartDevice),
    /// Token not known to the server yet; handled like a simple device
    Unknown,
}

impl SimpleDevice {
    pub const ALL: [SimpleDevice; 3] = [SimpleDevice::Power, SimpleDevice::Light, SimpleDevice::Scale];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Light => "light",
            Self::Scale => "scale",
        }
    }
}

impl SmartDevice {
    pub const ALL: [SmartDevice; 2] = [SmartDevice::Lock, SmartDevice::Terminal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Terminal => "terminal",
        }
    }
}

impl DeviceKind {
    pub fn is_smart(&self) -> bool {
        matches!(self, Self::Smart(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl fmt::Display for SimpleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SmartDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a device type token
pub fn classify(device_type: &str) -> DeviceKind {
    match device_type {
        "power" => DeviceKind::Simple(SimpleDevice::Power),
        "light" => DeviceKind::Simple(SimpleDevice::Light),
        "scale" => DeviceKind::Simple(SimpleDevice::Scale),
        "lock" => DeviceKind::Smart(SmartDevice::Lock),
        "terminal" => DeviceKind::Smart(SmartDevice::Terminal),
        _ => DeviceKind::Unknown,
    }
}

/// All device type tokens the server knows about
pub fn known_device_types() -> Vec<&'static str> {
    SimpleDevice::ALL
        .iter()
        .map(SimpleDevice::as_str)
        .chain(SmartDevice::ALL.iter().map(SmartDevice::as_str))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_simple_devices() {
        assert_eq!(classify("power"), DeviceKind::Simple(SimpleDevice::Power));
        assert_eq!(classify("light"), DeviceKind::Simple(SimpleDevice::Light));
        assert_eq!(classify("scale"), DeviceKind::Simple(SimpleDevice::Scale));
    }

    #[test]
    fn test_classify_smart_devices() {
        assert_eq!(classify("lock"), DeviceKind::Smart(SmartDevice::Lock));
        assert_eq!(classify("terminal"), DeviceKind::Smart(SmartDevice::Terminal));
        assert!(classify("lock").is_smart());
    }

    #[test]
    fn test_classify_unknown() {
        assert!(classify("toaster").is_unknown());
        assert!(classify("").is_unknown());
        // tokens are case sensitive
        assert!(classify("LOCK").is_unknown());
    }

    #[test]
    fn test_round_trip_through_as_str() {
        for token in known_device_types() {
            let kind = classify(token);
            let back = match kind {
                DeviceKind::Simple(d) => d.as_str(),
                DeviceKind::Smart(d) => d.as_str(),
                DeviceKind::Unknown => panic!("{token} should be known"),
            };
            assert_eq!(back, token);
        }
        assert_eq!(known_device_types().len(), 5);
    }
}
