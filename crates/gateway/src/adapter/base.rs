// BSD-2-Clause

//! Shared machinery composed into adapter implementations: handle
//! allocation and the outbound event bus. Adapters embed [`AdapterBase`]
//! as a field rather than deriving from a common base type.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::adapter::AdapterEvent;
use crate::model::ConnectionHandle;

const EVENT_BUS_CAPACITY: usize = 256;

pub struct AdapterBase {
    next_handle: AtomicU64,
    events: broadcast::Sender<AdapterEvent>,
}

impl Default for AdapterBase {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterBase {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { next_handle: AtomicU64::new(1), events }
    }

    /// Allocate a fresh, process-unique connection handle.
    pub fn allocate_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Publish an event to every current subscriber. Silently dropped if
    /// nobody is listening, matching `broadcast`'s send semantics.
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    /// A clonable handle to the outbound bus, for forwarding tasks that
    /// outlive the borrow of `&self` (e.g. a spawned fan-in loop).
    pub fn event_sender(&self) -> broadcast::Sender<AdapterEvent> {
        self.events.clone()
    }
}

#[cfg(test)]
#[path = "base_tests.rs"]
mod tests;
