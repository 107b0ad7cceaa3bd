// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use clap::{crate_authors, crate_version, Arg, ArgAction, Command};
use std::env;
use std::path::PathBuf;
use std::process;
use tokio::runtime;
use tokio::signal;
use tracing::{error, info, subscriber, warn, Level};
use tracing_subscriber::FmtSubscriber;

use probes::echo_dispatch::{PORTS_MAP, PROGRAM, SOCKET_MAP};
use skdispatch::config::ConfigStore;
use skdispatch::proxy::{KernelProgram, Mode, Proxy};

const DEFAULT_OBJECT: &str = "echo_dispatch.elf";

struct Opts {
    config: PathBuf,
    mode: Mode,
}

fn main() {
    let matches = Command::new("skproxy")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .about("TCP proxy serving every app on any number of ports")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("config.json")
                .help("The JSON configuration file, reloaded when it changes"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .value_parser(["userspace", "kernel"])
                .default_value("userspace")
                .help("Steer connections in process or with an sk_lookup program"),
        )
        .arg(
            Arg::new("program")
                .short('p')
                .long("program")
                .value_name("FILE")
                .help("The BPF object used in kernel mode, defaults to echo_dispatch.elf next to the executable"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Increases logging verbosity, can be repeated"),
        )
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = subscriber::set_global_default(subscriber) {
        eprintln!("skproxy: failed to install logger: {}", e);
    }

    let config = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("kernel") => {
            if !cfg!(feature = "kernel") {
                error!("kernel mode is not available, rebuild with the `kernel` feature");
                process::exit(1);
            }
            if unsafe { libc::geteuid() } != 0 {
                error!("You must be root to use eBPF!");
                process::exit(1);
            }
            let path = match matches.get_one::<String>("program") {
                Some(path) => PathBuf::from(path),
                None => default_object(),
            };
            Mode::Kernel(KernelProgram {
                path,
                program: PROGRAM.to_string(),
                ports_map: PORTS_MAP.to_string(),
                socket_map: SOCKET_MAP.to_string(),
            })
        }
        _ => Mode::Userspace,
    };

    let rt = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(Opts { config, mode })) {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run(opts: Opts) -> skdispatch::Result<()> {
    let mut store = ConfigStore::new(&opts.config);
    let config = store.read()?;
    info!(
        "loaded {} apps from {}",
        config.apps.len(),
        store.path().display()
    );

    let mut proxy = Proxy::start(&config, opts.mode).await?;
    let mut updates = store.start_watcher()?;

    loop {
        tokio::select! {
            Some(config) = updates.recv() => {
                if let Err(e) = proxy.reload(&config).await {
                    warn!("failed to apply new configuration: {}", e);
                }
            }
            res = signal::ctrl_c() => {
                res?;
                info!("shutting down");
                break;
            }
        }
    }

    store.close();
    proxy.shutdown().await;
    Ok(())
}

fn default_object() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_OBJECT)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OBJECT))
}
