// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
Low level bindings to the kernel types and constants used by `sk_lookup`
programs.

The layouts mirror `include/uapi/linux/bpf.h`. Only what the dispatcher
touches is declared; prefer the higher level types of the `maps` and
`sk_lookup` modules.
*/
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

pub type bpf_map_type = u32;

pub const bpf_map_type_BPF_MAP_TYPE_HASH: bpf_map_type = 1;
pub const bpf_map_type_BPF_MAP_TYPE_SOCKMAP: bpf_map_type = 15;

pub const BPF_ANY: u64 = 0;
pub const BPF_NOEXIST: u64 = 1;

/// Verdicts understood by the `sk_lookup` hook.
pub const SK_DROP: u32 = 0;
pub const SK_PASS: u32 = 1;

pub const bpf_func_id_BPF_FUNC_map_lookup_elem: u64 = 1;
pub const bpf_func_id_BPF_FUNC_sk_release: u64 = 86;
pub const bpf_func_id_BPF_FUNC_sk_assign: u64 = 124;

/// Legacy map definition placed in `maps/<name>` sections.
///
/// The user space loader reads the same layout back from the ELF object.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct bpf_map_def {
    pub type_: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

/// Socket reference handed out by sockmap lookups. Opaque to programs.
#[repr(C)]
pub struct bpf_sock {
    _private: [u8; 0],
}

/// Context of the `BPF_PROG_TYPE_SK_LOOKUP` hook.
///
/// `local_port` is in host byte order, `remote_port` in network byte order.
#[repr(C)]
pub struct bpf_sk_lookup {
    pub sk: u64,
    pub family: u32,
    pub protocol: u32,
    pub remote_ip4: u32,
    pub remote_ip6: [u32; 4],
    pub remote_port: u16,
    _pad: u16,
    pub local_ip4: u32,
    pub local_ip6: [u32; 4],
    pub local_port: u32,
    pub ingress_ifindex: u32,
}
