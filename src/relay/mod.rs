//! # Relay Module
//!
//! Everything that happens to a connection after the listener accepts it.
//!
//! ## Module Structure:
//! - **lifecycle**: The connection state machine and its invariants
//! - **setup**: Instruction resolution and the bounded upstream connect
//! - **socket**: The actor that ties the browser socket to the upstream session

pub mod lifecycle;
pub mod setup;
pub mod socket;

pub use socket::RelaySocket;
