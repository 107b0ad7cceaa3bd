// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # skdispatch
//!
//! User space side of a port-multiplexing connection dispatcher.
//!
//! A service listening on a single socket can be made reachable on any
//! number of ports: every incoming connection whose destination port is in
//! the service's open-port table is steered to the service's endpoint, and
//! connections to ports that are open but have no endpoint are refused.
//! Connections to ports outside the table are left alone.
//!
//! The decision itself lives in `skdispatch_probes::dispatch` and runs in
//! two places:
//!
//!  * in the kernel, as an `sk_lookup` program. The `load` cargo feature
//!    enables the [`load`] module, which loads the program, fills its maps
//!    and attaches it to a network namespace.
//!  * in process, through the [`dispatcher::Dispatcher`], called by the
//!    accept loops of every port.
//!
//! The [`proxy`] module runs a TCP proxy on top of either, configured by a
//! JSON file read by [`config::ConfigStore`].
//!
//! ```toml
//! [dependencies]
//! skdispatch = { version = "0.1", features = ["load"] }
//! ```
#![deny(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod endpoint;
mod error;
#[cfg(feature = "load")]
pub mod load;
pub mod ports;
pub mod proxy;
pub mod relay;

pub use crate::error::{Error, Result};
pub use skdispatch_probes::dispatch::{Verdict, MAX_PORTS};
