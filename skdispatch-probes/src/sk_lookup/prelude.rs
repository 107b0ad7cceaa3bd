// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sk_lookup Prelude
//!
//! The purpose of this module is to alleviate imports of the sk_lookup programs
//! by adding a glob import to the top of sk_lookup programs:
//!
//! ```
//! use skdispatch_probes::sk_lookup::prelude::*;
//! ```
pub use crate::bindings::*;
pub use crate::dispatch::*;
pub use crate::helpers::*;
pub use crate::maps::*;
pub use crate::sk_lookup::*;
pub use core::ptr::addr_of;
pub use cty::*;
pub use skdispatch_macros::{map, program, sk_lookup};
