//! Home presence tracking.
//!
//! Turns per-location radio confidence readings into per-user Home / Not Home
//! states and household occupancy flags, and coordinates the shared scanning
//! resource so arrive and depart scan requests never overlap.
//!
//! The message transport and the host platform's entity storage stay outside
//! the crate, behind [`host::Publisher`] and [`host::EntityStore`].

pub mod beacons;
pub mod classifier;
pub mod confidence;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod host;
pub mod monitor;
pub mod occupancy;
pub mod persistence;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod types;
pub mod util;

pub use coordinator::Coordinator;
pub use error::PresenceError;
pub use service::{run, Inbound};
pub use types::{Config, HomeState, MonitorStatus, ScanKind};
