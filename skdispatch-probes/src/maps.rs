// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
eBPF maps.

Maps are defined as `static mut` items annotated with `#[map]` so they land
in a `maps/<name>` section. The user space loader creates the real maps
from these definitions and patches the program to use them.

The counterparts used by user space to fill the maps live in
`skdispatch::load`.

# Example
```ignore
use skdispatch_probes::sk_lookup::prelude::*;

#[map]
static mut echo_ports: HashMap<u16, u8> = HashMap::with_max_entries(1024);
```
*/
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

use crate::bindings::*;
use crate::dispatch::{PortSet, SocketSlot, ENDPOINT_KEY};
use crate::helpers::*;

/// Hash table map.
///
/// Used as a set of ports: the value is only a marker and presence of the
/// key is what counts.
#[repr(transparent)]
pub struct HashMap<K, V> {
    def: bpf_map_def,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<K, V> HashMap<K, V> {
    /// Creates a map with the specified maximum number of elements.
    pub const fn with_max_entries(max_entries: u32) -> Self {
        Self {
            def: bpf_map_def {
                type_: bpf_map_type_BPF_MAP_TYPE_HASH,
                key_size: mem::size_of::<K>() as u32,
                value_size: mem::size_of::<V>() as u32,
                max_entries,
                map_flags: 0,
            },
            _k: PhantomData,
            _v: PhantomData,
        }
    }

    /// Returns a reference to the value corresponding to the key.
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        unsafe {
            let value = bpf_map_lookup_elem(
                &self.def as *const _ as *mut _,
                key as *const _ as *const _,
            );
            if value.is_null() {
                None
            } else {
                Some(&*(value as *const V))
            }
        }
    }
}

impl<V> PortSet for HashMap<u16, V> {
    #[inline]
    fn is_open(&self, port: u16) -> bool {
        self.get(&port).is_some()
    }
}

/// Socket map.
///
/// Holds references to sockets; user space stores a listening socket by
/// its file descriptor and programs look it up to steer connections to it.
/// This is a wrapper for `BPF_MAP_TYPE_SOCKMAP`.
#[repr(transparent)]
pub struct SockMap {
    def: bpf_map_def,
}

impl SockMap {
    /// Creates a socket map with the specified maximum number of elements.
    pub const fn with_max_entries(max_entries: u32) -> Self {
        Self {
            def: bpf_map_def {
                type_: bpf_map_type_BPF_MAP_TYPE_SOCKMAP,
                key_size: mem::size_of::<u32>() as u32,
                value_size: mem::size_of::<u64>() as u32,
                max_entries,
                map_flags: 0,
            },
        }
    }

    /// Looks up the socket stored at `key`.
    ///
    /// The kernel takes a reference on the socket; it is released when the
    /// returned [`SockRef`] is dropped.
    #[inline]
    pub fn get(&self, key: u32) -> Option<SockRef> {
        let sk = unsafe {
            bpf_map_lookup_elem(
                &self.def as *const _ as *mut _,
                &key as *const _ as *const _,
            )
        };
        NonNull::new(sk as *mut bpf_sock).map(|sk| SockRef { sk })
    }
}

impl SocketSlot for SockMap {
    type Socket = SockRef;

    #[inline]
    fn acquire(&self) -> Option<SockRef> {
        self.get(ENDPOINT_KEY)
    }
}

/// Counted reference to a socket obtained from a [`SockMap`].
pub struct SockRef {
    sk: NonNull<bpf_sock>,
}

impl SockRef {
    #[inline]
    pub fn as_ptr(&self) -> *mut bpf_sock {
        self.sk.as_ptr()
    }
}

impl Drop for SockRef {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            bpf_sk_release(self.sk.as_ptr());
        }
    }
}
