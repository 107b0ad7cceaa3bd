// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
Socket lookup programs.

`BPF_PROG_TYPE_SK_LOOKUP` programs run when the kernel looks for a socket
to deliver a new connection (or an unconnected UDP packet) to. A program
may pick a socket with `bpf_sk_assign` and return `SK_PASS`, return
`SK_PASS` without assigning to fall back to the regular lookup, or return
`SK_DROP`.
*/
pub mod prelude;

use crate::bindings::*;
use crate::dispatch::{AssignError, LookupContext};
use crate::helpers::bpf_sk_assign;
use crate::maps::SockRef;

const ESOCKTNOSUPPORT: i64 = 94;
const EPROTOTYPE: i64 = 91;
const EAFNOSUPPORT: i64 = 97;
const EEXIST: i64 = 17;

#[derive(Clone)]
pub struct SkLookupContext {
    pub ctx: *mut bpf_sk_lookup,
}

impl SkLookupContext {
    #[inline]
    pub fn new(ctx: *mut bpf_sk_lookup) -> Self {
        SkLookupContext { ctx }
    }

    /// Returns the raw `bpf_sk_lookup` context passed by the kernel.
    #[inline]
    pub fn inner(&self) -> *mut bpf_sk_lookup {
        self.ctx
    }

    pub fn family(&self) -> u32 {
        unsafe { (*self.ctx).family }
    }

    pub fn protocol(&self) -> u32 {
        unsafe { (*self.ctx).protocol }
    }

    pub fn remote_ip4(&self) -> u32 {
        unsafe { (*self.ctx).remote_ip4 }
    }

    pub fn remote_ip6(&self) -> [u32; 4] {
        unsafe { (*self.ctx).remote_ip6 }
    }

    /// Remote port, converted to host byte order.
    pub fn remote_port(&self) -> u16 {
        unsafe { u16::from_be((*self.ctx).remote_port) }
    }

    pub fn local_ip4(&self) -> u32 {
        unsafe { (*self.ctx).local_ip4 }
    }

    pub fn local_ip6(&self) -> [u32; 4] {
        unsafe { (*self.ctx).local_ip6 }
    }

    pub fn local_port(&self) -> u16 {
        // ctx.local_port is u32 in host byte order, however highest port
        // number is 2^16 - 1 which keeps port map keys small
        unsafe { (*self.ctx).local_port as u16 }
    }

    /// Selects `sk` as the socket the connection is delivered to.
    #[inline]
    pub fn assign(&mut self, sk: &SockRef) -> Result<(), AssignError> {
        let ret = unsafe { bpf_sk_assign(self.ctx as *mut _, sk.as_ptr(), 0) };
        match -(ret as i64) {
            0 => Ok(()),
            ESOCKTNOSUPPORT | EPROTOTYPE | EAFNOSUPPORT => Err(AssignError::Closed),
            EEXIST => Err(AssignError::Busy),
            errno => Err(AssignError::Errno(errno)),
        }
    }
}

impl LookupContext for SkLookupContext {
    type Socket = SockRef;

    #[inline]
    fn local_port(&self) -> u16 {
        SkLookupContext::local_port(self)
    }

    #[inline]
    fn assign(&mut self, sk: &SockRef) -> Result<(), AssignError> {
        SkLookupContext::assign(self, sk)
    }
}
