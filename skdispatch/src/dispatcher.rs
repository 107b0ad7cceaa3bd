// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hosted dispatch.
//!
//! [`Dispatcher`] runs the same decision as the kernel program, but is
//! called by an accept loop for every accepted connection. The connection
//! travels inside a [`Lookup`]; a successful assignment moves it into the
//! endpoint backlog, otherwise it stays with the caller to be delivered or
//! closed according to the verdict.
use std::sync::Arc;

use skdispatch_probes::dispatch::{dispatch, AssignError, LookupContext, PortSet, Verdict};

use crate::endpoint::{Endpoint, EndpointSlot};
use crate::ports::{OpenPorts, PortControl};

/// Lookup context of an accepted connection.
pub struct Lookup<C> {
    local_port: u16,
    conn: Option<C>,
}

impl<C> Lookup<C> {
    /// `local_port` is the destination port in host byte order.
    pub fn new(local_port: u16, conn: C) -> Lookup<C> {
        Lookup {
            local_port,
            conn: Some(conn),
        }
    }

    /// Takes back the connection unless it was assigned to the endpoint.
    pub fn into_inner(self) -> Option<C> {
        self.conn
    }

    pub fn is_assigned(&self) -> bool {
        self.conn.is_none()
    }
}

impl<C> LookupContext for Lookup<C> {
    type Socket = Arc<Endpoint<C>>;

    #[inline]
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn assign(&mut self, sk: &Arc<Endpoint<C>>) -> Result<(), AssignError> {
        let conn = self.conn.take().ok_or(AssignError::Busy)?;
        sk.assign(conn).map_err(|(conn, err)| {
            self.conn = Some(conn);
            err
        })
    }
}

/// Open-port table and endpoint slot of one service.
pub struct Dispatcher<C> {
    ports: OpenPorts,
    endpoint: EndpointSlot<Endpoint<C>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Dispatcher<C> {
        Dispatcher {
            ports: OpenPorts::new(),
            endpoint: EndpointSlot::new(),
        }
    }

    /// The open-port table, for the control plane to maintain.
    pub fn ports(&self) -> &OpenPorts {
        &self.ports
    }

    /// The target endpoint slot, for the control plane to maintain.
    pub fn endpoint(&self) -> &EndpointSlot<Endpoint<C>> {
        &self.endpoint
    }

    /// Decides the fate of one accepted connection.
    #[inline]
    pub fn decide(&self, ctx: &mut Lookup<C>) -> Verdict {
        dispatch(ctx, &self.ports, &self.endpoint)
    }

    pub fn is_open(&self, port: u16) -> bool {
        self.ports.is_open(port)
    }

    /// Open ports in ascending order.
    pub fn open_ports(&self) -> crate::Result<Vec<u16>> {
        self.ports.ports()
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decide(dispatcher: &Dispatcher<u32>, port: u16) -> (Verdict, Option<u32>) {
        let mut ctx = Lookup::new(port, u32::from(port));
        let verdict = dispatcher.decide(&mut ctx);
        (verdict, ctx.into_inner())
    }

    #[test]
    fn test_empty_table_passes() {
        let dispatcher = Dispatcher::new();
        assert_eq!(decide(&dispatcher, 7), (Verdict::Pass, Some(7)));
    }

    #[test]
    fn test_open_port_without_endpoint_drops() {
        let dispatcher = Dispatcher::new();
        dispatcher.ports().insert(7).unwrap();
        assert_eq!(decide(&dispatcher, 7), (Verdict::Drop, Some(7)));
    }

    #[test]
    fn test_open_port_is_steered() {
        let dispatcher = Dispatcher::new();
        let (endpoint, mut listener) = Endpoint::new("echo", 4);
        dispatcher.ports().insert(7).unwrap();
        dispatcher.endpoint().set(endpoint.clone());

        assert_eq!(decide(&dispatcher, 7), (Verdict::Pass, None));
        assert_eq!(listener.try_accept(), Some(7));
        // the dispatcher released its reference
        assert_eq!(Arc::strong_count(&endpoint), 2);
    }

    #[test]
    fn test_closed_endpoint_drops() {
        let dispatcher = Dispatcher::new();
        let (endpoint, listener) = Endpoint::new("echo", 4);
        dispatcher.ports().insert(7).unwrap();
        dispatcher.endpoint().set(endpoint);
        drop(listener);

        assert_eq!(decide(&dispatcher, 7), (Verdict::Drop, Some(7)));
    }

    #[test]
    fn test_full_endpoint_drops() {
        let dispatcher = Dispatcher::new();
        let (endpoint, mut listener) = Endpoint::new("echo", 1);
        dispatcher.ports().insert(7).unwrap();
        dispatcher.endpoint().set(endpoint);

        assert_eq!(decide(&dispatcher, 7), (Verdict::Pass, None));
        assert_eq!(decide(&dispatcher, 7), (Verdict::Drop, Some(7)));
        assert_eq!(listener.try_accept(), Some(7));
        assert_eq!(decide(&dispatcher, 7), (Verdict::Pass, None));
    }

    #[test]
    fn test_unmatched_port_passes() {
        let dispatcher = Dispatcher::new();
        let (endpoint, mut listener) = Endpoint::new("echo", 4);
        dispatcher.ports().insert(7).unwrap();
        dispatcher.endpoint().set(endpoint);

        assert_eq!(decide(&dispatcher, 8), (Verdict::Pass, Some(8)));
        assert_eq!(listener.try_accept(), None);
    }

    #[test]
    fn test_removed_port_passes() {
        let dispatcher = Dispatcher::new();
        let (endpoint, _listener) = Endpoint::new("echo", 4);
        dispatcher.ports().insert(7).unwrap();
        dispatcher.endpoint().set(endpoint);
        dispatcher.ports().remove(7).unwrap();

        assert_eq!(decide(&dispatcher, 7), (Verdict::Pass, Some(7)));
        assert!(!dispatcher.is_open(7));
    }

    #[test]
    fn test_open_ports_are_sorted() {
        let dispatcher = Dispatcher::<u32>::new();
        assert!(dispatcher.open_ports().unwrap().is_empty());

        for port in [8080, 7, 443] {
            dispatcher.ports().insert(port).unwrap();
        }
        assert_eq!(dispatcher.open_ports().unwrap(), vec![7, 443, 8080]);
    }
}
