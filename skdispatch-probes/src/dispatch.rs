// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
The dispatch decision.

[`dispatch`] is invoked once per incoming connection lookup. It consults a
[`PortSet`] with the destination port and, on a match, takes the endpoint
out of a [`SocketSlot`] and asks the [`LookupContext`] to assign the
connection to it:

```text
START -> port open? --no--> PASS
              |
             yes -> endpoint set? --no--> DROP
                          |
                         yes -> assign --ok--> PASS (steered)
                                   |
                                  err --> DROP
```

Every branch ends in a [`Verdict`]; nothing is retried, logged or returned
as an error. Once a port is claimed the decision fails closed: a missing
endpoint or a rejected assignment drops the connection attempt rather than
leaking it to default delivery.

The endpoint returned by [`SocketSlot::acquire`] is a reference that must
be released. The decision owns it for the duration of the call and drops it
on every exit path, so implementations put the release in `Drop`.
*/
use crate::bindings::{SK_DROP, SK_PASS};

/// Maximum number of ports a dispatch table holds.
pub const MAX_PORTS: u32 = 1024;

/// Index of the target endpoint in its slot.
pub const ENDPOINT_KEY: u32 = 0;

/// Outcome of a dispatch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Let delivery proceed. If the connection was assigned it now goes to
    /// the endpoint, otherwise normal socket lookup continues.
    Pass,
    /// Refuse this connection attempt.
    Drop,
}

impl From<Verdict> for u32 {
    #[inline]
    fn from(verdict: Verdict) -> u32 {
        match verdict {
            Verdict::Pass => SK_PASS,
            Verdict::Drop => SK_DROP,
        }
    }
}

/// Reasons an assignment is rejected by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    /// The endpoint is no longer listening.
    Closed,
    /// The endpoint cannot take another connection right now.
    Busy,
    /// The kernel refused the assignment with the given error code.
    Errno(i64),
}

/// Membership set of ports open for dispatch.
pub trait PortSet {
    /// Returns `true` iff an entry for `port` is present. Absence is the
    /// expected outcome for unmanaged ports, not an error.
    fn is_open(&self, port: u16) -> bool;
}

/// Single slot holding the target endpoint.
pub trait SocketSlot {
    /// Reference to a live endpoint. Dropping it releases the reference.
    type Socket;

    /// Takes a reference to the registered endpoint, or `None` when the slot
    /// is empty.
    fn acquire(&self) -> Option<Self::Socket>;
}

/// Per-invocation view of a connection being looked up.
pub trait LookupContext {
    type Socket;

    /// Destination port in host byte order.
    fn local_port(&self) -> u16;

    /// Steers the in-flight connection to `sk`.
    fn assign(&mut self, sk: &Self::Socket) -> Result<(), AssignError>;
}

/// Decides the fate of one connection lookup.
#[inline(always)]
pub fn dispatch<C, P, S>(ctx: &mut C, ports: &P, slot: &S) -> Verdict
where
    C: LookupContext,
    P: PortSet + ?Sized,
    S: SocketSlot<Socket = C::Socket> + ?Sized,
{
    if !ports.is_open(ctx.local_port()) {
        return Verdict::Pass;
    }

    let sk = match slot.acquire() {
        Some(sk) => sk,
        None => return Verdict::Drop,
    };

    let verdict = match ctx.assign(&sk) {
        Ok(()) => Verdict::Pass,
        Err(_) => Verdict::Drop,
    };
    drop(sk);

    verdict
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::vec;
    use std::vec::Vec;

    struct Ports(Vec<u16>);

    impl PortSet for Ports {
        fn is_open(&self, port: u16) -> bool {
            self.0.contains(&port)
        }
    }

    #[derive(Default)]
    struct Counters {
        acquired: Cell<usize>,
        released: Cell<usize>,
    }

    struct Handle {
        id: u32,
        counters: Rc<Counters>,
    }

    impl Drop for Handle {
        fn drop(&mut self) {
            let released = &self.counters.released;
            released.set(released.get() + 1);
        }
    }

    struct Slot {
        endpoint: Option<u32>,
        counters: Rc<Counters>,
    }

    impl Slot {
        fn new(endpoint: Option<u32>) -> Slot {
            Slot {
                endpoint,
                counters: Rc::new(Counters::default()),
            }
        }

        fn acquired(&self) -> usize {
            self.counters.acquired.get()
        }

        fn released(&self) -> usize {
            self.counters.released.get()
        }
    }

    impl SocketSlot for Slot {
        type Socket = Handle;

        fn acquire(&self) -> Option<Handle> {
            let id = self.endpoint?;
            let acquired = &self.counters.acquired;
            acquired.set(acquired.get() + 1);
            Some(Handle {
                id,
                counters: self.counters.clone(),
            })
        }
    }

    struct Lookup {
        port: u16,
        outcome: Result<(), AssignError>,
        steered_to: Option<u32>,
    }

    impl Lookup {
        fn new(port: u16) -> Lookup {
            Lookup {
                port,
                outcome: Ok(()),
                steered_to: None,
            }
        }

        fn failing(port: u16, err: AssignError) -> Lookup {
            Lookup {
                outcome: Err(err),
                ..Lookup::new(port)
            }
        }
    }

    impl LookupContext for Lookup {
        type Socket = Handle;

        fn local_port(&self) -> u16 {
            self.port
        }

        fn assign(&mut self, sk: &Handle) -> Result<(), AssignError> {
            self.outcome?;
            self.steered_to = Some(sk.id);
            Ok(())
        }
    }

    #[test]
    fn test_unmatched_port_passes_without_endpoint() {
        let ports = Ports(Vec::new());
        let slot = Slot::new(None);
        let mut ctx = Lookup::new(7);

        assert_eq!(dispatch(&mut ctx, &ports, &slot), Verdict::Pass);
        assert_eq!(ctx.steered_to, None);
        assert_eq!(slot.acquired(), 0);
    }

    #[test]
    fn test_matched_port_without_endpoint_drops() {
        let ports = Ports(vec![7]);
        let slot = Slot::new(None);
        let mut ctx = Lookup::new(7);

        assert_eq!(dispatch(&mut ctx, &ports, &slot), Verdict::Drop);
        assert_eq!(ctx.steered_to, None);
    }

    #[test]
    fn test_matched_port_is_steered() {
        let ports = Ports(vec![7]);
        let slot = Slot::new(Some(42));
        let mut ctx = Lookup::new(7);

        assert_eq!(dispatch(&mut ctx, &ports, &slot), Verdict::Pass);
        assert_eq!(ctx.steered_to, Some(42));
        assert_eq!(slot.acquired(), 1);
        assert_eq!(slot.released(), 1);
    }

    #[test]
    fn test_rejected_assignment_drops() {
        let ports = Ports(vec![7]);
        let slot = Slot::new(Some(42));

        for err in [AssignError::Closed, AssignError::Busy, AssignError::Errno(-22)] {
            let mut ctx = Lookup::failing(7, err);
            assert_eq!(dispatch(&mut ctx, &ports, &slot), Verdict::Drop);
            assert_eq!(ctx.steered_to, None);
        }
        assert_eq!(slot.acquired(), 3);
        assert_eq!(slot.released(), 3);
    }

    #[test]
    fn test_other_port_passes() {
        let ports = Ports(vec![7]);
        let slot = Slot::new(Some(42));
        let mut ctx = Lookup::new(8);

        assert_eq!(dispatch(&mut ctx, &ports, &slot), Verdict::Pass);
        assert_eq!(ctx.steered_to, None);
        assert_eq!(slot.acquired(), 0);
    }

    #[test]
    fn test_unmatched_ports_always_pass() {
        let ports = Ports(vec![7, 77, 777]);
        let with_endpoint = Slot::new(Some(1));
        let without_endpoint = Slot::new(None);

        for port in (0..=u16::MAX).filter(|p| !ports.is_open(*p)) {
            assert_eq!(
                dispatch(&mut Lookup::new(port), &ports, &with_endpoint),
                Verdict::Pass
            );
            assert_eq!(
                dispatch(&mut Lookup::new(port), &ports, &without_endpoint),
                Verdict::Pass
            );
        }
        assert_eq!(with_endpoint.acquired(), 0);
    }

    #[test]
    fn test_repeated_lookups_agree() {
        let ports = Ports(vec![7]);
        let cases = [
            (Slot::new(None), Lookup::new(7)),
            (Slot::new(Some(1)), Lookup::new(7)),
            (Slot::new(Some(1)), Lookup::failing(7, AssignError::Busy)),
            (Slot::new(Some(1)), Lookup::new(8)),
        ];

        for (slot, mut ctx) in cases {
            let first = dispatch(&mut ctx, &ports, &slot);
            for _ in 0..16 {
                assert_eq!(dispatch(&mut ctx, &ports, &slot), first);
            }
        }
    }

    #[test]
    fn test_every_acquire_is_released_once() {
        let ports = Ports(vec![7, 8]);
        let slot = Slot::new(Some(3));
        let mut lookups = vec![
            Lookup::new(7),
            Lookup::failing(8, AssignError::Closed),
            Lookup::new(9),
            Lookup::failing(7, AssignError::Errno(-1)),
            Lookup::new(8),
        ];

        for ctx in lookups.iter_mut() {
            let before = (slot.acquired(), slot.released());
            dispatch(ctx, &ports, &slot);
            let acquired = slot.acquired() - before.0;
            let released = slot.released() - before.1;
            assert_eq!(acquired, released);
        }
        assert_eq!(slot.acquired(), 4);
        assert_eq!(slot.released(), 4);
    }

    #[test]
    fn test_verdict_codes() {
        assert_eq!(u32::from(Verdict::Pass), SK_PASS);
        assert_eq!(u32::from(Verdict::Drop), SK_DROP);
    }
}
