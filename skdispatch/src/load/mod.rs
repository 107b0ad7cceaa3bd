// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Loading `sk_lookup` programs into the kernel.
//!
//! ## ELF object expectations
//!
//! The sections of the object are interpreted as follows:
//!  * `maps/name` holds the `bpf_map_def` of map `name`
//!  * `sk_lookup/name` holds the code of program `name`
//!  * `license` holds the nul terminated license string
//!
//! Relocations against map symbols are rewritten to load the file
//! descriptor of the created map.
//!
//! Objects built from `skdispatch-probes` follow these conventions.
mod loader;
mod maps;

pub use loader::{Loaded, Loader, BPF_FS};
pub use maps::{PortMap, SockMap};

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;

use goblin::elf::{section_header as hdr, Elf, SectionHeader};
use libbpf_sys::{bpf_insn, BPF_PROG_TYPE_SK_LOOKUP, BPF_PSEUDO_MAP_FD, BPF_SK_LOOKUP};
use skdispatch_probes::bindings::bpf_map_def;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const BPF_OBJ_NAME_LEN: usize = 16;
const LOG_BUF_SIZE: usize = 64 * 1024;

pub struct Module {
    pub programs: Vec<Program>,
    pub maps: Vec<Map>,
    pub license: String,
    rels: Vec<Rel>,
}

pub struct Program {
    pub name: String,
    shndx: usize,
    code: Vec<bpf_insn>,
    fd: Option<RawFd>,
    link: Option<RawFd>,
    pins: Vec<PathBuf>,
}

pub struct Map {
    pub name: String,
    pub def: bpf_map_def,
    shndx: usize,
    fd: Option<RawFd>,
    pin: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rel {
    target: usize,
    offset: u64,
    map_shndx: usize,
}

impl Module {
    /// Parses an ELF object. Nothing is created in the kernel yet.
    pub fn parse(bytes: &[u8]) -> Result<Module> {
        let object = Elf::parse(bytes)?;

        let mut programs = Vec::new();
        let mut maps = Vec::new();
        let mut license = String::new();

        for (shndx, shdr) in object.section_headers.iter().enumerate() {
            if shdr.sh_type != hdr::SHT_PROGBITS {
                continue;
            }
            let (kind, name) = split_section_name(&object, shdr, shndx)?;
            let content = data(bytes, shdr)?;

            match (kind, name) {
                ("license", _) => license = read_str(content)?,
                ("maps", Some(name)) => maps.push(Map::parse(name, shndx, content)?),
                ("sk_lookup", Some(name)) => programs.push(Program::parse(name, shndx, content)?),
                _ => {}
            }
        }

        let mut rels = Vec::new();
        for (shndx, section) in object.shdr_relocs.iter() {
            let target = object
                .section_headers
                .get(*shndx)
                .ok_or(Error::Reloc)?
                .sh_info as usize;
            if !programs.iter().any(|p| p.shndx == target) {
                continue;
            }
            for reloc in section.iter() {
                let sym = object.syms.get(reloc.r_sym).ok_or(Error::Reloc)?;
                rels.push(Rel {
                    target,
                    offset: reloc.r_offset,
                    map_shndx: sym.st_shndx,
                });
            }
        }

        Ok(Module {
            programs,
            maps,
            license,
            rels,
        })
    }

    /// Creates the maps, points the programs at them and loads the programs.
    pub fn load(&mut self) -> Result<()> {
        for map in self.maps.iter_mut() {
            map.create()?;
        }

        let fds: HashMap<usize, RawFd> = self
            .maps
            .iter()
            .filter_map(|m| m.fd.map(|fd| (m.shndx, fd)))
            .collect();
        for rel in self.rels.iter() {
            let fd = fds.get(&rel.map_shndx).ok_or(Error::Reloc)?;
            let prog = self
                .programs
                .iter_mut()
                .find(|p| p.shndx == rel.target)
                .ok_or(Error::Reloc)?;
            rel.apply(prog, *fd)?;
        }

        for prog in self.programs.iter_mut() {
            prog.load(&self.license)?;
        }

        Ok(())
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.name == name)
    }

    pub fn program_mut(&mut self, name: &str) -> Option<&mut Program> {
        self.programs.iter_mut().find(|p| p.name == name)
    }

    pub fn map(&self, name: &str) -> Option<&Map> {
        self.maps.iter().find(|m| m.name == name)
    }

    pub fn map_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.maps.iter_mut().find(|m| m.name == name)
    }
}

impl Program {
    fn parse(name: &str, shndx: usize, code: &[u8]) -> Result<Program> {
        let size = mem::size_of::<bpf_insn>();
        if code.len() % size != 0 {
            return Err(Error::Section(format!("truncated program {}", name)));
        }
        let code = code
            .chunks_exact(size)
            .map(|insn| unsafe { ptr::read_unaligned(insn.as_ptr() as *const bpf_insn) })
            .collect();

        Ok(Program {
            name: name.to_string(),
            shndx,
            code,
            fd: None,
            link: None,
            pins: Vec::new(),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.fd.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    fn load(&mut self, license: &str) -> Result<RawFd> {
        let clicense = CString::new(license)?;
        let cname = CString::new(obj_name(&self.name))?;
        let mut log_buf = vec![0u8; LOG_BUF_SIZE];

        let mut opts: libbpf_sys::bpf_prog_load_opts = unsafe { mem::zeroed() };
        opts.sz = mem::size_of::<libbpf_sys::bpf_prog_load_opts>() as _;
        opts.expected_attach_type = BPF_SK_LOOKUP;
        opts.log_buf = log_buf.as_mut_ptr() as *mut _;
        opts.log_size = log_buf.len() as _;

        let fd = unsafe {
            libbpf_sys::bpf_prog_load(
                BPF_PROG_TYPE_SK_LOOKUP,
                cname.as_ptr(),
                clicense.as_ptr(),
                self.code.as_ptr(),
                self.code.len() as _,
                &mut opts,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if let Ok(log) = CStr::from_bytes_until_nul(&log_buf) {
                warn!("verifier log for {}:\n{}", self.name, log.to_string_lossy());
            }
            return Err(Error::BPF(format!("loading {}: {}", self.name, err)));
        }

        debug!("loaded program {} fd={}", self.name, fd);
        self.fd = Some(fd);
        Ok(fd)
    }

    /// Attaches the program to the network namespace at `netns`, such as
    /// `/proc/self/ns/net`.
    pub fn attach_sk_lookup<P: AsRef<Path>>(&mut self, netns: P) -> Result<RawFd> {
        let fd = self.fd.ok_or(Error::ProgramNotLoaded)?;
        if self.link.is_some() {
            return Err(Error::ProgramAlreadyLinked);
        }

        let ns = fs::File::open(netns.as_ref())?;
        let link = unsafe {
            libbpf_sys::bpf_link_create(fd, ns.as_raw_fd(), BPF_SK_LOOKUP, ptr::null())
        };
        if link < 0 {
            return Err(Error::BPF(format!(
                "attaching {} to {}: {}",
                self.name,
                netns.as_ref().display(),
                io::Error::last_os_error()
            )));
        }

        self.link = Some(link);
        Ok(link)
    }

    /// Pins the loaded program at `path`.
    pub fn pin<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let fd = self.fd.ok_or(Error::ProgramNotLoaded)?;
        pin(fd, path.as_ref())?;
        self.pins.push(path.as_ref().to_path_buf());
        Ok(())
    }

    /// Pins the link created by `attach_sk_lookup` at `path`.
    pub fn pin_link<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let fd = self.link.ok_or(Error::ProgramNotAttached)?;
        pin(fd, path.as_ref())?;
        self.pins.push(path.as_ref().to_path_buf());
        Ok(())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        for path in self.pins.drain(..) {
            unpin(&path);
        }
        if let Some(link) = self.link.take() {
            unsafe { libc::close(link) };
        }
        if let Some(fd) = self.fd.take() {
            unsafe { libc::close(fd) };
        }
    }
}

impl Map {
    fn parse(name: &str, shndx: usize, content: &[u8]) -> Result<Map> {
        if content.len() < mem::size_of::<bpf_map_def>() {
            return Err(Error::Map(format!("truncated definition of map {}", name)));
        }
        let def = unsafe { ptr::read_unaligned(content.as_ptr() as *const bpf_map_def) };

        Ok(Map {
            name: name.to_string(),
            def,
            shndx,
            fd: None,
            pin: None,
        })
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    fn create(&mut self) -> Result<RawFd> {
        let cname = CString::new(obj_name(&self.name))?;
        let fd = unsafe {
            libbpf_sys::bpf_map_create(
                self.def.type_,
                cname.as_ptr(),
                self.def.key_size,
                self.def.value_size,
                self.def.max_entries,
                ptr::null(),
            )
        };
        if fd < 0 {
            return Err(Error::Map(format!(
                "creating {}: {}",
                self.name,
                io::Error::last_os_error()
            )));
        }

        debug!("created map {} fd={}", self.name, fd);
        self.fd = Some(fd);
        Ok(fd)
    }

    /// Pins the map at `path`.
    pub fn pin<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let fd = self
            .fd
            .ok_or_else(|| Error::Map(format!("map {} was not created", self.name)))?;
        pin(fd, path.as_ref())?;
        self.pin = Some(path.as_ref().to_path_buf());
        Ok(())
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        if let Some(path) = self.pin.take() {
            unpin(&path);
        }
        if let Some(fd) = self.fd.take() {
            unsafe { libc::close(fd) };
        }
    }
}

impl Rel {
    #[inline]
    fn apply(&self, prog: &mut Program, map_fd: RawFd) -> Result<()> {
        let insn_idx = (self.offset / mem::size_of::<bpf_insn>() as u64) as usize;
        let insn = prog.code.get_mut(insn_idx).ok_or(Error::Reloc)?;

        insn.set_src_reg(BPF_PSEUDO_MAP_FD as u8);
        insn.imm = map_fd;

        Ok(())
    }
}

fn pin(fd: RawFd, path: &Path) -> Result<()> {
    let cpath = CString::new(path.as_os_str().to_string_lossy().as_bytes())?;
    if unsafe { libbpf_sys::bpf_obj_pin(fd, cpath.as_ptr()) } < 0 {
        return Err(Error::BPF(format!(
            "pinning {}: {}",
            path.display(),
            io::Error::last_os_error()
        )));
    }

    debug!("pinned {}", path.display());
    Ok(())
}

fn unpin(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("failed to unpin {}: {}", path.display(), e);
    }
}

/// Kernel object names are limited to 15 characters.
fn obj_name(name: &str) -> &str {
    let mut end = name.len().min(BPF_OBJ_NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[inline]
fn split_section_name<'o>(
    object: &'o Elf<'_>,
    shdr: &SectionHeader,
    shndx: usize,
) -> Result<(&'o str, Option<&'o str>)> {
    let name = object
        .shdr_strtab
        .get_at(shdr.sh_name)
        .ok_or_else(|| Error::Section(format!("section name not found: {}", shndx)))?;

    Ok(split_name(name))
}

#[inline]
fn split_name(name: &str) -> (&str, Option<&str>) {
    let mut names = name.splitn(2, '/');
    let kind = names.next().unwrap_or_default();
    (kind, names.next())
}

#[inline]
fn data<'d>(bytes: &'d [u8], shdr: &SectionHeader) -> Result<&'d [u8]> {
    let offset = shdr.sh_offset as usize;
    let end = offset
        .checked_add(shdr.sh_size as usize)
        .ok_or_else(|| Error::Section("section out of bounds".to_string()))?;

    bytes
        .get(offset..end)
        .ok_or_else(|| Error::Section("section out of bounds".to_string()))
}

fn read_str(bytes: &[u8]) -> Result<String> {
    let s = match CStr::from_bytes_until_nul(bytes) {
        Ok(s) => s.to_str().map_err(|_| Error::StringConversion)?,
        Err(_) => std::str::from_utf8(bytes).map_err(|_| Error::StringConversion)?,
    };

    Ok(s.to_string())
}
