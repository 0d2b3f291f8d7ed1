//! ykacc Client Library
//!
//! Application sessions to a YubiKey attached over an accessory transport.

pub mod application;
pub mod capabilities;
pub mod config;
pub mod connection;
pub mod error;

pub use application::ApplicationSession;
pub use capabilities::{DeviceCapabilities, SharedCapabilities, StaticCapabilities};
pub use config::ClientConfig;
pub use connection::{
    ConnectionFacade, ConnectionState, InvalidationReason, PendingSession, SessionEvent,
    SessionSwitchPolicy,
};
pub use error::ConnectionError;
