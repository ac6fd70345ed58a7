//! PIR link library.
//!
//! Streams a PIR motion sensor from one node to any number of consumers
//! over TCP. The [`server`] side polls the sensor and broadcasts its state
//! every tick; the [`link`] side decodes that stream into debounced
//! "motion started" edges.

pub mod config;
pub mod decoder;
pub mod discovery;
pub mod error;
pub mod link;
pub mod protocol;
pub mod sensors;
pub mod server;

pub use error::{PirError, Result};
pub use link::SensorLink;
pub use protocol::PirState;
pub use server::BroadcastServer;
