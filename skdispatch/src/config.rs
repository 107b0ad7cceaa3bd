// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
Proxy configuration.

The configuration is a JSON document listing the apps to serve:

```json
{
  "Apps": [
    { "Name": "echo", "Ports": [7, 77, 777], "Targets": ["127.0.0.1:9000"] }
  ]
}
```

Every port belongs to at most one app. [`ConfigStore`] reads and validates
the file, and can watch it for changes.
*/
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use skdispatch_probes::dispatch::MAX_PORTS;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[serde(alias = "apps", default)]
    pub apps: Vec<App>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct App {
    /// Unique name, used in logs and in pinned object names.
    #[serde(alias = "name")]
    pub name: String,
    /// Ports the app answers on.
    #[serde(alias = "ports")]
    pub ports: Vec<u16>,
    /// Backends, as `host:port`.
    #[serde(alias = "targets", default)]
    pub targets: Vec<String>,
}

impl Config {
    /// Parses and validates a JSON document.
    pub fn from_json(data: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut ports = HashSet::new();

        for app in &self.apps {
            if app.name.is_empty() {
                return Err(Error::Config("app with an empty name".to_string()));
            }
            if !names.insert(app.name.as_str()) {
                return Err(Error::Config(format!("duplicate app {}", app.name)));
            }
            if app.ports.is_empty() {
                return Err(Error::Config(format!("app {} has no ports", app.name)));
            }
            if app.ports.len() > MAX_PORTS as usize {
                return Err(Error::Config(format!(
                    "app {} has {} ports, at most {} are supported",
                    app.name,
                    app.ports.len(),
                    MAX_PORTS
                )));
            }
            for port in &app.ports {
                if *port == 0 {
                    return Err(Error::Config(format!("app {} uses port 0", app.name)));
                }
                if !ports.insert(*port) {
                    return Err(Error::Config(format!("duplicate port {}", port)));
                }
            }
        }

        Ok(())
    }

    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.name == name)
    }
}

/// Reads the config file and watches it for changes.
pub struct ConfigStore {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl ConfigStore {
    pub fn new<P: AsRef<Path>>(path: P) -> ConfigStore {
        ConfigStore {
            path: path.as_ref().to_path_buf(),
            watcher: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and validates the config file.
    pub fn read(&self) -> Result<Config> {
        read_config(&self.path)
    }

    /// Starts watching the config file.
    ///
    /// Every time the file changes it is read again, and the new config is
    /// sent on the returned channel if it is valid. Invalid updates are
    /// logged and skipped. The channel is closed by [`ConfigStore::close`].
    pub fn start_watcher(&mut self) -> Result<mpsc::UnboundedReceiver<Config>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let file_name = path.file_name().map(|name| name.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("error watching config file: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            if !event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name)
            {
                return;
            }

            info!("config file {} modified", path.display());
            match read_config(&path) {
                Ok(config) => {
                    if tx.send(config).is_err() {
                        debug!("config update dropped, nobody is listening");
                    }
                }
                Err(e) => warn!("error loading config file {}: {}", path.display(), e),
            }
        })?;

        // editors replace the file on save, so watch the directory
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        self.watcher = Some(watcher);

        Ok(rx)
    }

    /// Stops watching for changes.
    pub fn close(&mut self) {
        self.watcher.take();
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)?;
    Config::from_json(&data)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const ECHO: &str = r#"{
        "Apps": [
            { "Name": "echo", "Ports": [7, 77, 777], "Targets": ["127.0.0.1:9000"] },
            { "Name": "web", "Ports": [8080], "Targets": [] }
        ]
    }"#;

    fn write_config(dir: &TempDir, data: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_parse_config() {
        let config = Config::from_json(ECHO).unwrap();
        assert_eq!(config.apps.len(), 2);

        let echo = config.app("echo").unwrap();
        assert_eq!(echo.ports, vec![7, 77, 777]);
        assert_eq!(echo.targets, vec!["127.0.0.1:9000".to_string()]);
        assert!(config.app("web").unwrap().targets.is_empty());
        assert!(config.app("ftp").is_none());
    }

    #[test]
    fn test_parse_lowercase_fields() {
        let config = Config::from_json(r#"{"apps":[{"name":"a","ports":[1]}]}"#).unwrap();
        assert_eq!(config.apps[0].name, "a");
        assert_eq!(config.apps[0].ports, vec![1]);
    }

    #[test]
    fn test_reject_duplicate_ports() {
        let data = r#"{"Apps":[{"Name":"a","Ports":[1,2]},{"Name":"b","Ports":[2]}]}"#;
        assert!(matches!(Config::from_json(data), Err(Error::Config(_))));
    }

    #[test]
    fn test_reject_invalid_apps() {
        for data in [
            r#"{"Apps":[{"Name":"a","Ports":[]}]}"#,
            r#"{"Apps":[{"Name":"a","Ports":[0]}]}"#,
            r#"{"Apps":[{"Name":"","Ports":[1]}]}"#,
            r#"{"Apps":[{"Name":"a","Ports":[1]},{"Name":"a","Ports":[2]}]}"#,
        ] {
            assert!(matches!(Config::from_json(data), Err(Error::Config(_))), "{}", data);
        }
    }

    #[test]
    fn test_reject_too_many_ports() {
        let app = App {
            name: "a".to_string(),
            ports: (1..=MAX_PORTS as u16 + 1).collect(),
            targets: vec![],
        };
        let config = Config { apps: vec![app] };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_malformed_json() {
        assert!(matches!(Config::from_json("{"), Err(Error::Json(_))));
        assert!(matches!(
            Config::from_json(r#"{"Apps":[{"Name":"a","Ports":[70000]}]}"#),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_store_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(write_config(&dir, ECHO));
        assert_eq!(store.read().unwrap(), Config::from_json(ECHO).unwrap());

        let missing = ConfigStore::new(dir.path().join("missing.json"));
        assert!(matches!(missing.read(), Err(Error::IO(_))));
    }

    #[tokio::test]
    async fn test_watcher_delivers_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, ECHO);
        let mut store = ConfigStore::new(&path);
        let mut updates = store.start_watcher().unwrap();

        let update = r#"{"Apps":[{"Name":"echo","Ports":[7]}]}"#;
        fs::write(&path, update).unwrap();

        let config = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config, Config::from_json(update).unwrap());

        store.close();
    }

    #[tokio::test]
    async fn test_watcher_skips_invalid_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, ECHO);
        let mut store = ConfigStore::new(&path);
        let mut updates = store.start_watcher().unwrap();

        // duplicate port across apps
        fs::write(
            &path,
            r#"{"Apps":[{"Name":"a","Ports":[7]},{"Name":"b","Ports":[7]}]}"#,
        )
        .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(700), updates.recv())
                .await
                .is_err()
        );

        let update = r#"{"Apps":[{"Name":"a","Ports":[7]}]}"#;
        fs::write(&path, update).unwrap();
        let config = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config, Config::from_json(update).unwrap());

        store.close();
    }

    #[tokio::test]
    async fn test_close_ends_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, ECHO);
        let mut store = ConfigStore::new(&path);
        let mut updates = store.start_watcher().unwrap();

        store.close();
        let end = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap();
        assert_eq!(end, None);
    }
}
