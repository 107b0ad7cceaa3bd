// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! BPF helper calls.
//!
//! Helpers are called through their function id; the verifier patches the
//! call to the in-kernel implementation. Calling them outside a loaded
//! program is undefined behaviour.
#![allow(clippy::missing_safety_doc)]
use crate::bindings::*;
use cty::*;

#[inline]
pub unsafe fn bpf_map_lookup_elem(map: *mut c_void, key: *const c_void) -> *mut c_void {
    let f: unsafe extern "C" fn(map: *mut c_void, key: *const c_void) -> *mut c_void =
        ::core::mem::transmute(bpf_func_id_BPF_FUNC_map_lookup_elem as usize);
    f(map, key)
}

#[inline]
pub unsafe fn bpf_sk_release(sk: *mut bpf_sock) -> c_long {
    let f: unsafe extern "C" fn(sk: *mut bpf_sock) -> c_long =
        ::core::mem::transmute(bpf_func_id_BPF_FUNC_sk_release as usize);
    f(sk)
}

#[inline]
pub unsafe fn bpf_sk_assign(ctx: *mut c_void, sk: *mut bpf_sock, flags: u64) -> c_long {
    let f: unsafe extern "C" fn(ctx: *mut c_void, sk: *mut bpf_sock, flags: u64) -> c_long =
        ::core::mem::transmute(bpf_func_id_BPF_FUNC_sk_assign as usize);
    f(ctx, sk, flags)
}
