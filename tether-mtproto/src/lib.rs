//! MTProto 2.0 session layer: message framing, sequencing, encryption state
//! and service-message parsing.
//!
//! This crate is synchronous and transport-agnostic. The async engine in
//! `tether-sender` drives an [`MtpState`] from its loops; everything here can
//! be exercised with plain byte buffers.

#![deny(unsafe_code)]

pub mod control;
pub mod state;
pub mod tl;

pub use control::ControlMessage;
pub use state::{MtpState, RawMessage, SecurityError, UnpackError};
