// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
Proxy orchestration.

A [`Proxy`] runs one [`AppService`] per configured app. Every app accepts
connections on all of its ports and relays them to its healthy targets.

How connections reach the app depends on the [`Mode`]:

* [`Mode::Userspace`] binds every port and lets a [`Dispatcher`] decide, for
  each accepted connection, whether it is steered to the app's endpoint.
* [`Mode::Kernel`] binds the first port only. An `sk_lookup` program attached
  to the network namespace steers connections for the remaining ports to that
  socket.
*/
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use skdispatch_probes::dispatch::Verdict;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{App, Config};
use crate::dispatcher::{Dispatcher, Lookup};
use crate::endpoint::{Endpoint, DEFAULT_BACKLOG};
use crate::error::{Error, Result};
use crate::ports::PortControl;
use crate::relay::{relay, RoundRobin};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The `sk_lookup` program used in kernel mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelProgram {
    /// Path of the ELF object.
    pub path: PathBuf,
    /// Name of the `sk_lookup` program in the object.
    pub program: String,
    /// Name of the open-port map.
    pub ports_map: String,
    /// Name of the endpoint sockmap.
    pub socket_map: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Userspace,
    Kernel(KernelProgram),
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Userspace => write!(f, "userspace"),
            Mode::Kernel(_) => write!(f, "kernel"),
        }
    }
}

pub struct Proxy {
    mode: Mode,
    addr: IpAddr,
    apps: HashMap<String, AppService>,
}

impl Proxy {
    /// Starts serving every app of `config` on all interfaces.
    pub async fn start(config: &Config, mode: Mode) -> Result<Proxy> {
        Proxy::start_on(config, mode, IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await
    }

    /// Starts serving every app of `config` on `addr`.
    pub async fn start_on(config: &Config, mode: Mode, addr: IpAddr) -> Result<Proxy> {
        config.validate()?;
        info!("starting proxy in {} mode", mode);

        let mut proxy = Proxy {
            mode,
            addr,
            apps: HashMap::new(),
        };
        for app in config.apps.iter() {
            let service = AppService::start(app, &proxy.mode, proxy.addr).await?;
            proxy.apps.insert(app.name.clone(), service);
        }

        Ok(proxy)
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Names of the running apps, sorted.
    pub fn apps(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.apps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn app(&self, name: &str) -> Option<&AppService> {
        self.apps.get(name)
    }

    /// The configuration the running apps were started with.
    pub fn config(&self) -> Config {
        let mut apps: Vec<App> = self.apps.values().map(|s| s.app.clone()).collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Config { apps }
    }

    /// Applies a new configuration.
    ///
    /// Apps no longer configured are stopped and new apps started. Running
    /// apps get their ports synchronised; an app whose targets changed, or
    /// whose listening port changed in kernel mode, is restarted.
    ///
    /// If the new configuration cannot be applied, for instance because a
    /// port is taken by another process, the previous one is restored and
    /// the error returned.
    pub async fn reload(&mut self, config: &Config) -> Result<()> {
        config.validate()?;

        let previous = self.config();
        if let Err(e) = self.apply(config).await {
            warn!("failed to apply configuration, restoring previous one: {}", e);
            if let Err(restore) = self.apply(&previous).await {
                error!("failed to restore previous configuration: {}", restore);
            }
            return Err(e);
        }

        info!("reloaded configuration, {} apps running", self.apps.len());
        Ok(())
    }

    async fn apply(&mut self, config: &Config) -> Result<()> {
        let mut stopped = Vec::new();
        for (name, service) in self.apps.iter() {
            match config.app(name) {
                Some(app) if service.can_update(app) => {}
                _ => stopped.push(name.clone()),
            }
        }
        for name in stopped {
            if let Some(service) = self.apps.remove(&name) {
                info!("stopping app {}", name);
                service.shutdown().await;
            }
        }

        // release ports before anyone else claims them
        for app in config.apps.iter() {
            if let Some(service) = self.apps.get_mut(&app.name) {
                service.close_stale_ports(&app.ports).await?;
            }
        }
        for app in config.apps.iter() {
            match self.apps.get_mut(&app.name) {
                Some(service) => service.open_ports(app).await?,
                None => {
                    let service = AppService::start(app, &self.mode, self.addr).await?;
                    self.apps.insert(app.name.clone(), service);
                }
            }
        }

        Ok(())
    }

    /// Stops every app.
    pub async fn shutdown(mut self) {
        for (name, service) in self.apps.drain() {
            info!("stopping app {}", name);
            service.shutdown().await;
        }
    }
}

/// A running app.
pub struct AppService {
    app: App,
    addr: IpAddr,
    lb: Arc<RoundRobin>,
    steering: Steering,
    tasks: Vec<JoinHandle<()>>,
}

enum Steering {
    Hosted {
        dispatcher: Arc<Dispatcher<TcpStream>>,
        listeners: HashMap<u16, JoinHandle<()>>,
    },
    #[cfg(feature = "load")]
    Kernel(kernel::KernelSteering),
}

impl AppService {
    pub async fn start(app: &App, mode: &Mode, addr: IpAddr) -> Result<AppService> {
        let lb = Arc::new(RoundRobin::healthy(&app.targets).await);
        if lb.is_empty() {
            warn!("app {} has no healthy backend", app.name);
        }

        let mut service = AppService {
            app: app.clone(),
            addr,
            lb,
            steering: Steering::Hosted {
                dispatcher: Arc::new(Dispatcher::new()),
                listeners: HashMap::new(),
            },
            tasks: Vec::new(),
        };

        let started = match mode {
            Mode::Userspace => service.start_hosted().await,
            #[cfg(feature = "load")]
            Mode::Kernel(program) => service.start_kernel(program).await,
            #[cfg(not(feature = "load"))]
            Mode::Kernel(_) => Err(Error::Config(
                "kernel mode requires the `load` feature".to_string(),
            )),
        };
        if let Err(e) = started {
            // free the ports bound so far before reporting
            service.shutdown().await;
            return Err(e);
        }

        info!(
            "started app {} on ports {:?} in {} mode",
            app.name, app.ports, mode
        );
        Ok(service)
    }

    pub fn name(&self) -> &str {
        &self.app.name
    }

    pub fn backends(&self) -> &[String] {
        self.lb.backends()
    }

    /// Ports the app currently answers on, sorted.
    pub fn ports(&self) -> Result<Vec<u16>> {
        match &self.steering {
            Steering::Hosted { dispatcher, .. } => dispatcher.open_ports(),
            #[cfg(feature = "load")]
            Steering::Kernel(kernel) => kernel.ports(),
        }
    }

    async fn start_hosted(&mut self) -> Result<()> {
        let dispatcher = match &self.steering {
            Steering::Hosted { dispatcher, .. } => dispatcher.clone(),
            #[cfg(feature = "load")]
            Steering::Kernel(_) => return Err(Error::Config("app is not hosted".to_string())),
        };

        let (endpoint, mut listener) = Endpoint::new(&self.app.name, DEFAULT_BACKLOG);
        dispatcher.endpoint().set(endpoint);

        let lb = self.lb.clone();
        let name = self.app.name.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(conn) = listener.accept().await {
                serve(&name, conn, lb.clone());
            }
            debug!("endpoint of app {} closed", name);
        }));

        let app = self.app.clone();
        self.open_ports(&app).await
    }

    #[cfg(feature = "load")]
    async fn start_kernel(&mut self, program: &KernelProgram) -> Result<()> {
        let first = *self
            .app
            .ports
            .first()
            .ok_or_else(|| Error::Config(format!("app {} has no ports", self.app.name)))?;
        let listener = TcpListener::bind((self.addr, first)).await?;

        let steering = kernel::KernelSteering::start(program, &self.app, first, &listener)?;
        self.steering = Steering::Kernel(steering);

        let lb = self.lb.clone();
        let name = self.app.name.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, _)) => serve(&name, conn, lb.clone()),
                    Err(e) => {
                        warn!("failed to accept connection for app {}: {}", name, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }));

        Ok(())
    }

    fn can_update(&self, app: &App) -> bool {
        if app.targets != self.app.targets {
            return false;
        }
        match &self.steering {
            Steering::Hosted { .. } => true,
            #[cfg(feature = "load")]
            Steering::Kernel(kernel) => app.ports.first() == Some(&kernel.listen_port()),
        }
    }

    /// Stops serving the ports missing from `desired`.
    async fn close_stale_ports(&mut self, desired: &[u16]) -> Result<()> {
        let desired: BTreeSet<u16> = desired.iter().copied().collect();
        match &mut self.steering {
            Steering::Hosted {
                dispatcher,
                listeners,
            } => {
                for port in dispatcher.open_ports()? {
                    if desired.contains(&port) {
                        continue;
                    }
                    debug!("closing port {} of app {}", port, self.app.name);
                    dispatcher.ports().remove(port)?;
                    if let Some(handle) = listeners.remove(&port) {
                        handle.abort();
                        let _ = handle.await;
                    }
                }
            }
            #[cfg(feature = "load")]
            Steering::Kernel(kernel) => kernel.close_stale_ports(&desired)?,
        }

        Ok(())
    }

    /// Starts serving the ports of `app` not served yet.
    async fn open_ports(&mut self, app: &App) -> Result<()> {
        match &mut self.steering {
            Steering::Hosted {
                dispatcher,
                listeners,
            } => {
                for port in app.ports.iter().copied() {
                    if listeners.contains_key(&port) {
                        continue;
                    }
                    let listener = TcpListener::bind((self.addr, port)).await?;
                    dispatcher.ports().insert(port)?;
                    listeners.insert(port, tokio::spawn(accept_loop(listener, dispatcher.clone())));
                    debug!("opened port {} of app {}", port, app.name);
                }
            }
            #[cfg(feature = "load")]
            Steering::Kernel(kernel) => kernel.open_ports(&app.ports)?,
        }

        self.app.ports = app.ports.clone();
        Ok(())
    }

    /// Stops accepting connections. Established connections are not
    /// interrupted.
    pub async fn shutdown(mut self) {
        if let Steering::Hosted {
            dispatcher,
            listeners,
        } = &mut self.steering
        {
            for (_, handle) in listeners.drain() {
                handle.abort();
                let _ = handle.await;
            }
            match dispatcher.open_ports() {
                Ok(ports) => {
                    for port in ports {
                        let _ = dispatcher.ports().remove(port);
                    }
                }
                Err(e) => warn!("app {}: failed to list open ports: {}", self.app.name, e),
            }
            dispatcher.endpoint().clear();
        }
        for handle in self.tasks.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for AppService {
    fn drop(&mut self) {
        if let Steering::Hosted { listeners, .. } = &mut self.steering {
            for (_, handle) in listeners.drain() {
                handle.abort();
            }
        }
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher<TcpStream>>) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let port = match conn.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!("dropping connection from {}: {}", peer, e);
                continue;
            }
        };

        let mut ctx = Lookup::new(port, conn);
        match dispatcher.decide(&mut ctx) {
            Verdict::Pass if ctx.is_assigned() => {}
            Verdict::Pass => debug!("port {} is not served, closing connection from {}", port, peer),
            Verdict::Drop => debug!("dropped connection from {} on port {}", peer, port),
        }
    }
}

fn serve(app: &str, conn: TcpStream, lb: Arc<RoundRobin>) {
    let app = app.to_string();
    tokio::spawn(async move {
        match relay(conn, &lb).await {
            Ok((sent, received)) => {
                debug!("app {}: relayed {} bytes up, {} bytes down", app, sent, received)
            }
            Err(Error::NoBackend) => {
                warn!("app {} has no available backend, closing connection", app)
            }
            Err(e) => warn!("app {}: relay failed: {}", app, e),
        }
    });
}

#[cfg(feature = "load")]
mod kernel {
    use std::collections::BTreeSet;
    use std::os::unix::io::AsRawFd;

    use tokio::net::TcpListener;
    use tracing::{debug, info};

    use super::KernelProgram;
    use crate::config::App;
    use crate::error::{Error, Result};
    use crate::load::{Loaded, Loader, PortMap, SockMap, BPF_FS};
    use crate::ports::{sync_ports, PortControl};

    const NETNS: &str = "/proc/self/ns/net";

    pub(super) struct KernelSteering {
        listen_port: u16,
        ports: PortMap,
        _socket: SockMap,
        _loaded: Loaded,
    }

    impl KernelSteering {
        /// Loads and pins the program for `app`, registers `listener` as its
        /// endpoint, opens the remaining ports and attaches the program.
        pub(super) fn start(
            program: &KernelProgram,
            app: &App,
            listen_port: u16,
            listener: &TcpListener,
        ) -> Result<KernelSteering> {
            let mut loaded = Loader::load_file(&program.path)?;
            loaded.pin_all(BPF_FS, &app.name)?;

            let socket = SockMap::new(loaded.map(&program.socket_map).ok_or_else(|| {
                Error::Map(format!("map {} not found", program.socket_map))
            })?)?;
            let ports = PortMap::new(loaded.map(&program.ports_map).ok_or_else(|| {
                Error::Map(format!("map {} not found", program.ports_map))
            })?)?;

            socket.set(listener.as_raw_fd())?;
            debug!(
                "app {}: listener fd {} registered",
                app.name,
                listener.as_raw_fd()
            );

            let steered: Vec<u16> = app.ports.iter().copied().skip(1).collect();
            sync_ports(&ports, &steered)?;

            loaded.attach_sk_lookup(&program.program, NETNS, BPF_FS, &app.name)?;
            info!("app {}: steering ports {:?} to port {}", app.name, steered, listen_port);

            Ok(KernelSteering {
                listen_port,
                ports,
                _socket: socket,
                _loaded: loaded,
            })
        }

        pub(super) fn listen_port(&self) -> u16 {
            self.listen_port
        }

        pub(super) fn ports(&self) -> Result<Vec<u16>> {
            let mut ports = self.ports.ports()?;
            ports.push(self.listen_port);
            ports.sort_unstable();
            Ok(ports)
        }

        pub(super) fn close_stale_ports(&self, desired: &BTreeSet<u16>) -> Result<()> {
            for port in self.ports.ports()? {
                if !desired.contains(&port) {
                    self.ports.remove(port)?;
                }
            }
            Ok(())
        }

        pub(super) fn open_ports(&self, ports: &[u16]) -> Result<()> {
            for port in ports.iter().copied().filter(|p| *p != self.listen_port) {
                self.ports.insert(port)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn echo_server() -> String {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = sock.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });

        addr.to_string()
    }

    async fn free_ports(n: usize) -> Vec<u16> {
        let mut listeners = Vec::new();
        for _ in 0..n {
            listeners.push(TcpListener::bind((LOCALHOST, 0)).await.unwrap());
        }
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    fn app(name: &str, ports: &[u16], targets: &[String]) -> App {
        App {
            name: name.to_string(),
            ports: ports.to_vec(),
            targets: targets.to_vec(),
        }
    }

    async fn ping(port: u16) -> bool {
        let mut conn = match TcpStream::connect((LOCALHOST, port)).await {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        if conn.write_all(b"ping").await.is_err() {
            return false;
        }
        let mut buf = [0u8; 4];
        matches!(
            tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf)).await,
            Ok(Ok(4))
        ) && &buf == b"ping"
    }

    #[tokio::test]
    async fn test_every_port_reaches_the_app() {
        let backend = echo_server().await;
        let ports = free_ports(3).await;
        let config = Config {
            apps: vec![app("echo", &ports, &[backend])],
        };

        let proxy = Proxy::start_on(&config, Mode::Userspace, LOCALHOST)
            .await
            .unwrap();
        assert_eq!(proxy.apps(), vec!["echo"]);

        let mut sorted = ports.clone();
        sorted.sort_unstable();
        assert_eq!(proxy.app("echo").unwrap().ports().unwrap(), sorted);
        for port in ports {
            assert!(ping(port).await, "port {}", port);
        }

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_backend_closes_connection() {
        let ports = free_ports(1).await;
        let config = Config {
            apps: vec![app("lonely", &ports, &[])],
        };
        let proxy = Proxy::start_on(&config, Mode::Userspace, LOCALHOST)
            .await
            .unwrap();
        assert!(proxy.app("lonely").unwrap().backends().is_empty());

        let mut conn = TcpStream::connect((LOCALHOST, ports[0])).await.unwrap();
        let mut buf = [0u8; 4];
        let read = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload() {
        let backend = echo_server().await;
        let ports = free_ports(4).await;
        let targets = vec![backend];

        let config = Config {
            apps: vec![app("a", &ports[..2], &targets)],
        };
        let mut proxy = Proxy::start_on(&config, Mode::Userspace, LOCALHOST)
            .await
            .unwrap();
        assert!(ping(ports[1]).await);

        // move a port from app a to a new app b
        let config = Config {
            apps: vec![
                app("a", &[ports[0], ports[2]], &targets),
                app("b", &[ports[1], ports[3]], &targets),
            ],
        };
        proxy.reload(&config).await.unwrap();
        assert_eq!(proxy.apps(), vec!["a", "b"]);
        for port in ports.iter() {
            assert!(ping(*port).await, "port {}", port);
        }

        let config = Config {
            apps: vec![app("b", &[ports[1]], &targets)],
        };
        proxy.reload(&config).await.unwrap();
        assert_eq!(proxy.apps(), vec!["b"]);
        assert!(ping(ports[1]).await);
        assert!(!ping(ports[0]).await);
        assert!(!ping(ports[3]).await);

        proxy.shutdown().await;
        assert!(!ping(ports[1]).await);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_running_apps() {
        let first = echo_server().await;
        let second = echo_server().await;
        let ports = free_ports(1).await;
        let busy = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let config = Config {
            apps: vec![app("a", &ports, &[first.clone()])],
        };
        let mut proxy = Proxy::start_on(&config, Mode::Userspace, LOCALHOST)
            .await
            .unwrap();
        assert!(ping(ports[0]).await);

        // new targets force a restart, which cannot bind the busy port
        let update = Config {
            apps: vec![app("a", &[ports[0], busy_port], &[first.clone(), second])],
        };
        assert!(matches!(proxy.reload(&update).await, Err(Error::IO(_))));

        assert_eq!(proxy.apps(), vec!["a"]);
        assert_eq!(proxy.config(), config);
        assert_eq!(proxy.app("a").unwrap().backends(), &[first]);
        assert!(ping(ports[0]).await);

        proxy.shutdown().await;
        drop(busy);
    }

    #[tokio::test]
    async fn test_reload_rejects_invalid_config() {
        let ports = free_ports(1).await;
        let config = Config {
            apps: vec![app("a", &ports, &[])],
        };
        let mut proxy = Proxy::start_on(&config, Mode::Userspace, LOCALHOST)
            .await
            .unwrap();

        let invalid = Config {
            apps: vec![app("a", &ports, &[]), app("b", &ports, &[])],
        };
        assert!(matches!(proxy.reload(&invalid).await, Err(Error::Config(_))));
        assert_eq!(proxy.apps(), vec!["a"]);

        proxy.shutdown().await;
    }

    #[cfg(not(feature = "load"))]
    #[tokio::test]
    async fn test_kernel_mode_needs_load_feature() {
        let ports = free_ports(1).await;
        let config = Config {
            apps: vec![app("a", &ports, &[])],
        };
        let mode = Mode::Kernel(KernelProgram {
            path: PathBuf::from("echo_dispatch.elf"),
            program: "echo_dispatch".to_string(),
            ports_map: "echo_ports".to_string(),
            socket_map: "echo_socket".to_string(),
        });
        assert_eq!(mode.to_string(), "kernel");
        assert!(Proxy::start_on(&config, mode, LOCALHOST).await.is_err());
    }
}
