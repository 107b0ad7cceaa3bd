// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Target endpoint of the hosted dispatcher.
//!
//! An [`Endpoint`] plays the part of the listening socket in the kernel
//! sockmap: connections assigned to it are queued on a bounded backlog and
//! picked up by the service through its [`EndpointListener`]. Dropping the
//! listener closes the endpoint, after which every assignment is rejected.
//!
//! [`EndpointSlot`] is the single slot the dispatcher reads the endpoint
//! from. Acquiring clones the `Arc`, releasing drops it.
use std::fmt;
use std::sync::{Arc, RwLock};

use skdispatch_probes::dispatch::{AssignError, SocketSlot};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Connections waiting to be accepted by the service, per endpoint.
pub const DEFAULT_BACKLOG: usize = 128;

pub struct Endpoint<C> {
    name: String,
    backlog: mpsc::Sender<C>,
}

pub struct EndpointListener<C> {
    name: String,
    queue: mpsc::Receiver<C>,
}

impl<C> Endpoint<C> {
    /// Creates an endpoint able to hold `backlog` pending connections.
    pub fn new(name: &str, backlog: usize) -> (Arc<Endpoint<C>>, EndpointListener<C>) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let endpoint = Endpoint {
            name: name.to_string(),
            backlog: tx,
        };
        let listener = EndpointListener {
            name: name.to_string(),
            queue: rx,
        };

        (Arc::new(endpoint), listener)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the service side is still accepting.
    pub fn is_listening(&self) -> bool {
        !self.backlog.is_closed()
    }

    /// Queues `conn` for the service without waiting.
    ///
    /// On failure the connection is handed back together with the reason.
    pub fn assign(&self, conn: C) -> Result<(), (C, AssignError)> {
        self.backlog.try_send(conn).map_err(|e| match e {
            TrySendError::Full(conn) => (conn, AssignError::Busy),
            TrySendError::Closed(conn) => (conn, AssignError::Closed),
        })
    }
}

impl<C> fmt::Debug for Endpoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl<C> EndpointListener<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next steered connection.
    ///
    /// Returns `None` once every `Endpoint` handle is gone.
    pub async fn accept(&mut self) -> Option<C> {
        self.queue.recv().await
    }

    /// Returns a queued connection if there is one.
    pub fn try_accept(&mut self) -> Option<C> {
        self.queue.try_recv().ok()
    }

    /// Stops accepting. Queued connections can still be drained.
    pub fn close(&mut self) {
        self.queue.close()
    }
}

/// Single, last-write-wins slot holding the target endpoint.
pub struct EndpointSlot<E> {
    slot: RwLock<Option<Arc<E>>>,
}

impl<E> EndpointSlot<E> {
    pub fn new() -> EndpointSlot<E> {
        EndpointSlot {
            slot: RwLock::new(None),
        }
    }

    /// Registers `endpoint`, replacing any previous one.
    pub fn set(&self, endpoint: Arc<E>) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(endpoint);
    }

    /// Empties the slot.
    pub fn clear(&self) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    pub fn is_set(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl<E> Default for EndpointSlot<E> {
    fn default() -> Self {
        EndpointSlot::new()
    }
}

impl<E> SocketSlot for EndpointSlot<E> {
    type Socket = Arc<E>;

    #[inline]
    fn acquire(&self) -> Option<Arc<E>> {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slot_is_last_write_wins() {
        let slot = EndpointSlot::new();
        assert!(slot.acquire().is_none());

        slot.set(Arc::new(1u32));
        slot.set(Arc::new(2u32));
        assert_eq!(slot.acquire().as_deref(), Some(&2));

        slot.clear();
        assert!(!slot.is_set());
        assert!(slot.acquire().is_none());
    }

    #[test]
    fn test_acquire_takes_a_reference() {
        let slot = EndpointSlot::new();
        let endpoint = Arc::new("svc");
        slot.set(endpoint.clone());
        assert_eq!(Arc::strong_count(&endpoint), 2);

        let handle = slot.acquire().unwrap();
        assert_eq!(Arc::strong_count(&endpoint), 3);
        drop(handle);
        assert_eq!(Arc::strong_count(&endpoint), 2);

        slot.clear();
        assert_eq!(Arc::strong_count(&endpoint), 1);
    }

    #[test]
    fn test_assign_queues_connection() {
        let (endpoint, mut listener) = Endpoint::new("echo", 2);
        endpoint.assign(1u32).unwrap();
        endpoint.assign(2u32).unwrap();

        assert_eq!(listener.try_accept(), Some(1));
        assert_eq!(listener.try_accept(), Some(2));
        assert_eq!(listener.try_accept(), None);
    }

    #[test]
    fn test_full_backlog_is_busy() {
        let (endpoint, _listener) = Endpoint::new("echo", 1);
        endpoint.assign(1u32).unwrap();

        assert_eq!(endpoint.assign(2u32), Err((2, AssignError::Busy)));
    }

    #[test]
    fn test_closed_endpoint_rejects() {
        let (endpoint, listener) = Endpoint::new("echo", 4);
        assert!(endpoint.is_listening());

        drop(listener);
        assert!(!endpoint.is_listening());
        assert_eq!(endpoint.assign(1u32), Err((1, AssignError::Closed)));
    }

    #[tokio::test]
    async fn test_accept_after_assign() {
        let (endpoint, mut listener) = Endpoint::new("echo", 4);
        endpoint.assign("conn").unwrap();
        drop(endpoint);

        assert_eq!(listener.accept().await, Some("conn"));
        assert_eq!(listener.accept().await, None);
    }
}
