//! ykacc Transport - accessory sessions and APDU exchange
//!
//! This crate provides:
//! - Accessory descriptors and the provider seam to the OS accessory subsystem
//! - Accessory registry (attach/detach tracking, picker)
//! - Stream sessions (one protocol on one accessory)
//! - Smart-card interface (framed, serialized command/response exchange)
//! - An in-process simulated provider

mod accessory;
mod error;
mod provider;
mod registry;
mod smart_card;
mod stream_session;
pub mod simulator;

pub use accessory::*;
pub use error::*;
pub use provider::*;
pub use registry::*;
pub use smart_card::*;
pub use stream_session::*;
