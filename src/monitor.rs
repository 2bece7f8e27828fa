//! Scan orchestration for the shared scanning resource.
//!
//! The resource is busy while at least one location has an unfinished scan.
//! Busy/idle is derived from the set of active locations, never from a
//! start/end counter, so duplicate or late `end` messages cannot drive it
//! negative.
//!
//! Arrive requests go out immediately when the resource is idle, otherwise a
//! single listener waits for the next Scanning → Idle transition. Depart
//! requests are always delayed; the owner schedules them with
//! [`TimerKey::DepartScan`](crate::scheduler::TimerKey::DepartScan) and asks
//! [`ScanOrchestrator::depart_ready`] when the delay elapses.

use std::collections::BTreeSet;

use crate::scheduler::IdleListeners;
use crate::types::{MonitorStatus, ScanKind};

/// Result of an Arrive scan request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArriveRequest {
    /// Resource is idle: publish the request now.
    PublishNow,
    /// Resource is busy: a listener now waits for it to go idle.
    Queued,
    /// A listener was already waiting; nothing new was queued.
    AlreadyPending,
}

/// Which scans a gateway transition calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayPlan {
    pub arrive: bool,
    pub depart: bool,
}

impl GatewayPlan {
    /// Decide from the household flags.
    ///
    /// Nobody home: someone may be arriving. Everyone home: someone may be
    /// leaving. Anything else is ambiguous and asks for both.
    pub fn for_occupancy(everyone_home: Option<bool>, everyone_not_home: Option<bool>) -> Self {
        if everyone_not_home == Some(true) {
            Self {
                arrive: true,
                depart: false,
            }
        } else if everyone_home == Some(true) {
            Self {
                arrive: false,
                depart: true,
            }
        } else {
            Self {
                arrive: true,
                depart: true,
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanOrchestrator {
    active_locations: BTreeSet<String>,
    listeners: IdleListeners,
}

impl ScanOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> MonitorStatus {
        if self.active_locations.is_empty() {
            MonitorStatus::Idle
        } else {
            MonitorStatus::Scanning
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status() == MonitorStatus::Idle
    }

    pub fn active_locations(&self) -> impl Iterator<Item = &str> {
        self.active_locations.iter().map(String::as_str)
    }

    /// Whether an Arrive listener is waiting for the resource.
    pub fn arrive_pending(&self) -> bool {
        self.listeners.is_registered(ScanKind::Arrive)
    }

    /// A scan started at `location`. Returns true if the resource just became busy.
    pub fn start(&mut self, location: &str) -> bool {
        let was_idle = self.is_idle();
        self.active_locations.insert(location.to_string());
        was_idle
    }

    /// A scan ended at `location`.
    ///
    /// Returns the scan requests released by the resource going idle; empty
    /// unless this call moved it from Scanning to Idle.
    pub fn end(&mut self, location: &str) -> Vec<ScanKind> {
        if !self.active_locations.remove(location) {
            log::debug!("Scan end for {} without a matching start", location);
            return Vec::new();
        }
        if self.is_idle() {
            self.listeners.drain()
        } else {
            Vec::new()
        }
    }

    /// Request an Arrive scan.
    pub fn request_arrive(&mut self) -> ArriveRequest {
        if self.is_idle() {
            ArriveRequest::PublishNow
        } else if self.listeners.register(ScanKind::Arrive) {
            ArriveRequest::Queued
        } else {
            ArriveRequest::AlreadyPending
        }
    }

    /// Whether a delayed Depart request may be published now. When false the
    /// owner reschedules it with the same delay.
    pub fn depart_ready(&self) -> bool {
        self.is_idle()
    }
}
