//! On-device applications reachable through SELECT

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PIV application identifier
pub const PIV_AID: &[u8] = &[0xA0, 0x00, 0x00, 0x03, 0x08];

/// OATH application identifier
pub const OATH_AID: &[u8] = &[0xA0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01];

/// Management application identifier
pub const MANAGEMENT_AID: &[u8] = &[0xA0, 0x00, 0x00, 0x05, 0x27, 0x47, 0x11, 0x17];

/// OTP application identifier
pub const OTP_AID: &[u8] = &[0xA0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01];

/// Applications a session can be opened against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationKind {
    Piv,
    Oath,
    Management,
    Otp,
}

impl ApplicationKind {
    pub const ALL: [ApplicationKind; 4] = [
        ApplicationKind::Piv,
        ApplicationKind::Oath,
        ApplicationKind::Management,
        ApplicationKind::Otp,
    ];

    /// AID used to SELECT this application
    pub fn aid(self) -> &'static [u8] {
        match self {
            ApplicationKind::Piv => PIV_AID,
            ApplicationKind::Oath => OATH_AID,
            ApplicationKind::Management => MANAGEMENT_AID,
            ApplicationKind::Otp => OTP_AID,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ApplicationKind::Piv => "piv",
            ApplicationKind::Oath => "oath",
            ApplicationKind::Management => "management",
            ApplicationKind::Otp => "otp",
        }
    }
}

impl fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ApplicationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApplicationKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown application: {}", s))
    }
}
