// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! User space handles on the dispatcher maps.
//!
//! The handles duplicate the map file descriptor, so they stay valid for as
//! long as they live, independently of the [`Map`] they were created from.
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use libbpf_sys::BPF_ANY;
use skdispatch_probes::bindings::{
    bpf_map_type_BPF_MAP_TYPE_HASH, bpf_map_type_BPF_MAP_TYPE_SOCKMAP,
};
use skdispatch_probes::dispatch::ENDPOINT_KEY;
use tracing::error;

use crate::error::{Error, Result};
use crate::load::Map;
use crate::ports::PortControl;

struct MapFd {
    fd: RawFd,
    name: String,
}

impl MapFd {
    fn dup(map: &Map, kind: u32, key_size: usize, value_sizes: &[usize]) -> Result<MapFd> {
        let def = &map.def;
        if def.type_ != kind
            || def.key_size as usize != key_size
            || !value_sizes.contains(&(def.value_size as usize))
        {
            error!(
                "map definition of {} does not match: type={} key_size={} value_size={}",
                map.name, def.type_, def.key_size, def.value_size
            );
            return Err(Error::Map(format!("unexpected layout of map {}", map.name)));
        }

        let fd = map
            .fd()
            .ok_or_else(|| Error::Map(format!("map {} was not created", map.name)))?;
        let fd = unsafe { libc::dup(fd) };
        if fd < 0 {
            return Err(Error::IO(io::Error::last_os_error()));
        }

        Ok(MapFd {
            fd,
            name: map.name.clone(),
        })
    }

    fn error(&self, op: &str) -> Error {
        Error::Map(format!(
            "{} on {}: {}",
            op,
            self.name,
            io::Error::last_os_error()
        ))
    }
}

impl Drop for MapFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// The kernel open-port table, `HashMap<u16, u8>`.
pub struct PortMap {
    map: MapFd,
    max_entries: usize,
}

impl PortMap {
    pub fn new(map: &Map) -> Result<PortMap> {
        Ok(PortMap {
            map: MapFd::dup(
                map,
                bpf_map_type_BPF_MAP_TYPE_HASH,
                mem::size_of::<u16>(),
                &[mem::size_of::<u8>()],
            )?,
            max_entries: map.def.max_entries as usize,
        })
    }
}

impl PortControl for PortMap {
    fn insert(&self, mut port: u16) -> Result<()> {
        let mut marker = 0u8;
        let ret = unsafe {
            libbpf_sys::bpf_map_update_elem(
                self.map.fd,
                &mut port as *mut _ as *mut _,
                &mut marker as *mut _ as *mut _,
                BPF_ANY.into(),
            )
        };
        if ret < 0 {
            if last_errno() == libc::E2BIG {
                return Err(Error::Capacity(self.max_entries));
            }
            return Err(self.map.error("insert"));
        }

        Ok(())
    }

    fn remove(&self, mut port: u16) -> Result<()> {
        let ret = unsafe {
            libbpf_sys::bpf_map_delete_elem(self.map.fd, &mut port as *mut _ as *mut _)
        };
        if ret < 0 && last_errno() != libc::ENOENT {
            return Err(self.map.error("remove"));
        }

        Ok(())
    }

    fn ports(&self) -> Result<Vec<u16>> {
        let mut ports = Vec::new();
        let mut key: Option<u16> = None;
        loop {
            let mut next = 0u16;
            let ret = unsafe {
                libbpf_sys::bpf_map_get_next_key(
                    self.map.fd,
                    match key.as_ref() {
                        Some(k) => k as *const _ as *const _,
                        None => ptr::null(),
                    },
                    &mut next as *mut _ as *mut _,
                )
            };
            if ret < 0 {
                if last_errno() == libc::ENOENT {
                    break;
                }
                return Err(self.map.error("iterate"));
            }
            ports.push(next);
            key = Some(next);
        }

        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }
}

/// The kernel endpoint slot, a one entry `SockMap`.
pub struct SockMap {
    map: MapFd,
    value_size: usize,
}

impl SockMap {
    pub fn new(map: &Map) -> Result<SockMap> {
        Ok(SockMap {
            map: MapFd::dup(
                map,
                bpf_map_type_BPF_MAP_TYPE_SOCKMAP,
                mem::size_of::<u32>(),
                &[mem::size_of::<u32>(), mem::size_of::<u64>()],
            )?,
            value_size: map.def.value_size as usize,
        })
    }

    /// Registers the listening socket `fd` as the target endpoint,
    /// replacing the previous one.
    pub fn set(&self, fd: RawFd) -> Result<()> {
        let mut key = ENDPOINT_KEY;
        let mut value = fd as u64;
        let mut value32 = fd as u32;
        let value_ptr = if self.value_size == mem::size_of::<u64>() {
            &mut value as *mut u64 as *mut libc::c_void
        } else {
            &mut value32 as *mut u32 as *mut libc::c_void
        };

        let ret = unsafe {
            libbpf_sys::bpf_map_update_elem(
                self.map.fd,
                &mut key as *mut _ as *mut _,
                value_ptr as *mut _,
                BPF_ANY.into(),
            )
        };
        if ret < 0 {
            return Err(self.map.error("set endpoint"));
        }

        Ok(())
    }

    /// Empties the slot.
    pub fn clear(&self) -> Result<()> {
        let mut key = ENDPOINT_KEY;
        let ret =
            unsafe { libbpf_sys::bpf_map_delete_elem(self.map.fd, &mut key as *mut _ as *mut _) };
        if ret < 0 && last_errno() != libc::ENOENT {
            return Err(self.map.error("clear endpoint"));
        }

        Ok(())
    }
}
