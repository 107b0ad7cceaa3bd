// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Open-port tables.
//!
//! [`OpenPorts`] is the in-process table read by the hosted dispatcher. The
//! kernel table is `load::PortMap`. Both are maintained through
//! [`PortControl`], typically with [`sync_ports`].
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use skdispatch_probes::dispatch::{PortSet, MAX_PORTS};
use tracing::debug;

use crate::error::{Error, Result};

const WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Writer side of an open-port table.
pub trait PortControl {
    /// Marks `port` open. Inserting a present port is a no-op; inserting
    /// past capacity fails.
    fn insert(&self, port: u16) -> Result<()>;

    /// Removes `port`. Removing an absent port is a no-op.
    fn remove(&self, port: u16) -> Result<()>;

    /// Returns the open ports in ascending order.
    fn ports(&self) -> Result<Vec<u16>>;
}

/// Set of open ports backed by a 65536 bit map.
///
/// Lookups are a single atomic load, so readers never block on writers and
/// never allocate.
pub struct OpenPorts {
    bits: Box<[AtomicU64]>,
    len: AtomicUsize,
    capacity: usize,
}

impl OpenPorts {
    pub fn new() -> OpenPorts {
        OpenPorts::with_capacity(MAX_PORTS as usize)
    }

    pub fn with_capacity(capacity: usize) -> OpenPorts {
        OpenPorts {
            bits: (0..WORDS).map(|_| AtomicU64::new(0)).collect(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    #[inline]
    fn slot(port: u16) -> (usize, u64) {
        (port as usize / 64, 1u64 << (port % 64))
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OpenPorts {
    fn default() -> Self {
        OpenPorts::new()
    }
}

impl PortSet for OpenPorts {
    #[inline]
    fn is_open(&self, port: u16) -> bool {
        let (word, bit) = OpenPorts::slot(port);
        self.bits[word].load(Ordering::Acquire) & bit != 0
    }
}

impl PortControl for OpenPorts {
    fn insert(&self, port: u16) -> Result<()> {
        if self.is_open(port) {
            return Ok(());
        }

        // reserve room first so concurrent inserts can't overshoot capacity
        let capacity = self.capacity;
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                if len < capacity {
                    Some(len + 1)
                } else {
                    None
                }
            })
            .map_err(|_| Error::Capacity(capacity))?;

        let (word, bit) = OpenPorts::slot(port);
        if self.bits[word].fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            // lost a race with another insert of the same port
            self.len.fetch_sub(1, Ordering::AcqRel);
        }

        Ok(())
    }

    fn remove(&self, port: u16) -> Result<()> {
        let (word, bit) = OpenPorts::slot(port);
        if self.bits[word].fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }

        Ok(())
    }

    fn ports(&self) -> Result<Vec<u16>> {
        let mut ports = Vec::with_capacity(self.len());
        for (i, word) in self.bits.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let offset = bits.trailing_zeros() as usize;
                ports.push((i * 64 + offset) as u16);
                bits &= bits - 1;
            }
        }

        Ok(ports)
    }
}

/// Brings `table` in line with `desired`.
///
/// Stale ports are removed before new ones are inserted so that swapping
/// ports on a full table does not hit the capacity limit.
pub fn sync_ports<T>(table: &T, desired: &[u16]) -> Result<()>
where
    T: PortControl + ?Sized,
{
    let desired: BTreeSet<u16> = desired.iter().copied().collect();
    let current: BTreeSet<u16> = table.ports()?.into_iter().collect();

    for port in current.difference(&desired) {
        debug!("closing port {}", port);
        table.remove(*port)?;
    }
    for port in desired.difference(&current) {
        debug!("opening port {}", port);
        table.insert(*port)?;
    }

    Ok(())
}
