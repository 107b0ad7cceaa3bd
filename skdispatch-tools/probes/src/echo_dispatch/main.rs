// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Socket lookup program that dispatches connections destined to a
//! configured set of open ports to the service socket.
//!
//! The service socket is expected at key 0 of `echo_socket`. A port is open
//! when `echo_ports` has an entry for it.
#![no_std]
#![no_main]
use skdispatch_probes::sk_lookup::prelude::*;

program!(0xFFFFFFFE, "Dual BSD/GPL");

#[map]
static mut echo_ports: HashMap<u16, u8> = HashMap::with_max_entries(MAX_PORTS);

#[map]
static mut echo_socket: SockMap = SockMap::with_max_entries(1);

#[sk_lookup]
pub fn echo_dispatch(mut ctx: SkLookupContext) -> Verdict {
    unsafe { dispatch(&mut ctx, &*addr_of!(echo_ports), &*addr_of!(echo_socket)) }
}
