// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Backend selection and relaying.
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::copy_bidirectional;
use tokio::net::{lookup_host, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Time allowed to a backend to accept a connection.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Round robin balancer over a fixed list of backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    backends: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new(backends: Vec<String>) -> RoundRobin {
        RoundRobin {
            backends,
            next: AtomicUsize::new(0),
        }
    }

    /// Builds a balancer from the targets that pass [`health_check`].
    pub async fn healthy(targets: &[String]) -> RoundRobin {
        let checks = join_all(targets.iter().map(|target| health_check(target))).await;
        let backends = targets
            .iter()
            .zip(checks)
            .filter_map(|(target, check)| match check {
                Ok(()) => Some(target.clone()),
                Err(e) => {
                    warn!("skipping unhealthy backend {}: {}", target, e);
                    None
                }
            })
            .collect();

        RoundRobin::new(backends)
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Picks the next backend.
    pub fn select(&self) -> Option<&str> {
        if self.backends.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(&self.backends[n % self.backends.len()])
    }
}

/// Checks that `target` resolves and accepts a TCP connection.
pub async fn health_check(target: &str) -> Result<()> {
    let mut addrs = lookup_host(target).await?;
    let addr = addrs.next().ok_or_else(|| {
        Error::IO(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} did not resolve", target),
        ))
    })?;

    connect(addr, HEALTH_CHECK_TIMEOUT).await?;
    Ok(())
}

/// Connects to `addr`, giving up after `limit`.
async fn connect<A>(addr: A, limit: Duration) -> Result<TcpStream>
where
    A: ToSocketAddrs + fmt::Display,
{
    let target = addr.to_string();
    timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            Error::IO(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connecting to {} timed out", target),
            ))
        })?
        .map_err(Error::from)
}

/// Relays `client` to the next backend of `lb` until either side closes.
pub async fn relay(mut client: TcpStream, lb: &RoundRobin) -> Result<(u64, u64)> {
    let backend = lb.select().ok_or(Error::NoBackend)?;
    debug!("proxying {:?} to {}", client.peer_addr().ok(), backend);

    let mut upstream = connect(backend, HEALTH_CHECK_TIMEOUT).await?;
    let copied = copy_bidirectional(&mut client, &mut upstream).await?;

    Ok(copied)
}
