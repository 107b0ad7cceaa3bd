// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("string contains an interior nul byte")]
    StringConversion,
    #[error("bpf syscall failed: {0}")]
    BPF(String),
    #[error("map error: {0}")]
    Map(String),
    #[error("port table is full ({0} entries)")]
    Capacity(usize),
    #[error("unknown section: {0}")]
    Section(String),
    #[cfg(feature = "load")]
    #[error("error parsing ELF object: {0}")]
    Parse(#[from] ::goblin::error::Error),
    #[error("invalid relocation")]
    Reloc,
    #[error("program not loaded")]
    ProgramNotLoaded,
    #[error("program already linked")]
    ProgramAlreadyLinked,
    #[error("program not attached")]
    ProgramNotAttached,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("error decoding config: {0}")]
    Json(#[from] ::serde_json::Error),
    #[error("error watching config file: {0}")]
    Watch(#[from] ::notify::Error),
    #[error("no healthy backend")]
    NoBackend,
    #[error(transparent)]
    IO(#[from] ::std::io::Error),
}

pub type Result<T> = ::std::result::Result<T, Error>;

impl From<::std::ffi::NulError> for Error {
    fn from(_e: ::std::ffi::NulError) -> Error {
        Error::StringConversion
    }
}
