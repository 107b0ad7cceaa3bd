// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
Connection dispatch decision engine.

# Overview

`skdispatch-probes` holds the fast path of a port-multiplexing service: the
function that decides, once per incoming connection lookup, whether the
connection is steered into the one registered service endpoint or passed
through to normal socket delivery.

The decision is written against three small traits so the same code runs
in two hosts:

 * inside the kernel, as a BPF `sk_lookup` program consulting a hash map of
   open ports and a one-entry sockmap (see the [`maps`] and [`sk_lookup`]
   modules)
 * in user space, driven by an accept loop over in-memory tables (see the
   `skdispatch` crate)

The crate is `no_std` and the decision path never allocates.

# Example

```ignore
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
```
*/
#![deny(clippy::all)]
#![no_std]

#[cfg(test)]
extern crate std;

pub mod bindings;
pub mod dispatch;
pub mod helpers;
pub mod maps;
pub mod sk_lookup;
