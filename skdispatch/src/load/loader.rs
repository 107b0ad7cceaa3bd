// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::convert::AsRef;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::load::{Map, Module, Program};
use crate::{Error, Result};

/// Mount point of the BPF filesystem.
pub const BPF_FS: &str = "/sys/fs/bpf";

/// High level API to load bpf programs.
pub struct Loader {}

impl Loader {
    /// Loads the programs included in `data`.
    ///
    /// This will parse `data` with `Module::parse()`, create its maps and
    /// load all the programs present in the module.
    pub fn load(data: &[u8]) -> Result<Loaded> {
        let mut module = Module::parse(data)?;
        module.load()?;

        Ok(Loaded { module })
    }

    /// Loads the BPF programs included in `file`.
    ///
    /// See `load()`.
    pub fn load_file<P: AsRef<Path>>(file: P) -> Result<Loaded> {
        let data = fs::read(file.as_ref()).map_err(|e| {
            Error::BPF(format!("reading {}: {}", file.as_ref().display(), e))
        })?;
        Loader::load(&data)
    }
}

/// The `Loaded` object returned by `load()`.
///
/// Maps and programs are closed, and their pins removed, when it is dropped.
pub struct Loaded {
    pub module: Module,
}

impl Loaded {
    pub fn map(&self, name: &str) -> Option<&Map> {
        self.module.map(name)
    }

    pub fn map_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.module.map_mut(name)
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.module.program(name)
    }

    pub fn program_mut(&mut self, name: &str) -> Option<&mut Program> {
        self.module.program_mut(name)
    }

    /// Pins every map and program of the module under `dir`, tagged with
    /// `suffix` so several instances can coexist.
    ///
    /// Maps are pinned as `<map>-<suffix>` and programs as
    /// `<program>_prog-<suffix>`.
    pub fn pin_all<P: AsRef<Path>>(&mut self, dir: P, suffix: &str) -> Result<()> {
        let dir = dir.as_ref();
        for map in self.module.maps.iter_mut() {
            let path = pin_path(dir, &map.name, suffix);
            map.pin(&path)?;
        }
        for prog in self.module.programs.iter_mut() {
            let path = pin_path(dir, &format!("{}_prog", prog.name), suffix);
            prog.pin(&path)?;
        }

        Ok(())
    }

    /// Attaches `program` to the network namespace `netns` and pins the
    /// link as `<program>_link-<suffix>` under `dir`.
    pub fn attach_sk_lookup<P, N>(
        &mut self,
        program: &str,
        netns: N,
        dir: P,
        suffix: &str,
    ) -> Result<()>
    where
        P: AsRef<Path>,
        N: AsRef<Path>,
    {
        let prog = self
            .module
            .program_mut(program)
            .ok_or(Error::ProgramNotLoaded)?;
        prog.attach_sk_lookup(netns.as_ref())?;
        prog.pin_link(pin_path(dir.as_ref(), &format!("{}_link", program), suffix))?;

        info!("attached {} to {}", program, netns.as_ref().display());
        Ok(())
    }
}

pub(crate) fn pin_path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}-{}", name, suffix))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pin_path() {
        let dir = Path::new(BPF_FS);
        assert_eq!(
            pin_path(dir, "echo_socket", "echo"),
            PathBuf::from("/sys/fs/bpf/echo_socket-echo")
        );
        assert_eq!(
            pin_path(dir, "echo_dispatch_link", "web"),
            PathBuf::from("/sys/fs/bpf/echo_dispatch_link-web")
        );
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Loader::load_file("/nonexistent/echo_dispatch.elf"),
            Err(Error::BPF(_))
        ));
    }
}
