//! Event loop driving the coordinator.
//!
//! A single task owns the [`Coordinator`] and processes one input at a time:
//! either the next inbound event from the host, or the earliest pending timer.
//! Due timers are also run after every inbound event, so a deferred callback
//! always sees the state left by the events that arrived before it.

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::coordinator::Coordinator;
use crate::error::PresenceError;

/// Input delivered by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A message published under the presence topic.
    Message { topic: String, payload: String },
    /// A gateway sensor changed state.
    Gateway { entity_id: String, opened: bool },
}

/// Run until the inbound channel closes or a fatal error occurs.
///
/// Recoverable errors (e.g. a failed durable write) are logged and the event
/// is skipped. Returns the coordinator once the channel is closed.
pub async fn run(
    mut coordinator: Coordinator,
    mut inbound: mpsc::Receiver<Inbound>,
) -> Result<Coordinator, PresenceError> {
    log::info!("Presence service started");

    loop {
        // Snapshot only; timers scheduled by the event handled below are run by
        // fire_due at the end of this iteration.
        let deadline = coordinator.next_deadline();
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    let result = dispatch(&mut coordinator, message);
                    check(result)?;
                }
                None => {
                    log::info!("Inbound channel closed, presence service stopping");
                    return Ok(coordinator);
                }
            },
            _ = timer => {}
        }

        check(coordinator.fire_due(Instant::now()))?;
    }
}

fn dispatch(coordinator: &mut Coordinator, message: Inbound) -> Result<(), PresenceError> {
    let now = Instant::now();
    match message {
        Inbound::Message { topic, payload } => coordinator.handle_message(&topic, &payload, now),
        Inbound::Gateway { entity_id, opened } => {
            coordinator.handle_gateway(&entity_id, opened, now)
        }
    }
}

/// Stop on fatal errors, log the rest.
fn check(result: Result<(), PresenceError>) -> Result<(), PresenceError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            log::error!("Presence service stopping: {}", e);
            Err(e)
        }
        Err(e) => {
            log::warn!("Presence event failed: {}", e);
            Ok(())
        }
    }
}
