//! ykacc Protocol - APDU and stream frame definitions
//!
//! This crate defines the wire-level data structures used to talk to a
//! YubiKey over an accessory byte stream:
//! - `Apdu` / `ApduResponse`: ISO 7816-4 command and response units
//! - `ApplicationKind`: on-device applications and their AIDs
//! - `FrameDecoder` / `encode_command`: message framing on the raw streams
//!
//! Nothing here performs I/O.

mod aid;
mod apdu;
mod frame;

pub use aid::*;
pub use apdu::*;
pub use frame::*;
