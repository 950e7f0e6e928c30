//! Runtime config service.
//!
//! Holds the current `VersionedConfig` in a `watch` channel. Readers take a
//! cheap `Arc` snapshot; writers are serialised, validate the new value, bump
//! the version, persist it, swap it in and append a `config_updated` event.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::core::event::{Event, EventKind};
use crate::core::runtime_config::{RuntimeConfig, VersionedConfig};
use crate::error::Result;
use crate::orchestration::events::EventLog;

pub struct ConfigService {
    sender: watch::Sender<Arc<VersionedConfig>>,
    writer: Mutex<()>,
    events: EventLog,
    path: Option<PathBuf>,
}

impl ConfigService {
    /// Start at version 0 with `config`, without persistence.
    pub fn new(config: RuntimeConfig, events: EventLog) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_versioned(
            VersionedConfig { version: 0, config },
            events,
            None,
        ))
    }

    /// Start from the value persisted at `path`, or from `fallback` if the
    /// file does not exist. Later updates are written back to `path`.
    pub fn load(path: &Path, fallback: RuntimeConfig, events: EventLog) -> Result<Self> {
        let versioned = if path.exists() {
            let versioned: VersionedConfig = toml::from_str(&std::fs::read_to_string(path)?)?;
            debug!(path = %path.display(), version = versioned.version, "runtime config loaded");
            versioned
        } else {
            VersionedConfig {
                version: 0,
                config: fallback,
            }
        };
        versioned.config.validate()?;
        Ok(Self::from_versioned(
            versioned,
            events,
            Some(path.to_path_buf()),
        ))
    }

    fn from_versioned(versioned: VersionedConfig, events: EventLog, path: Option<PathBuf>) -> Self {
        let (sender, _) = watch::channel(Arc::new(versioned));
        Self {
            sender,
            writer: Mutex::new(()),
            events,
            path,
        }
    }

    /// Snapshot of the current value.
    pub fn current(&self) -> Arc<VersionedConfig> {
        self.sender.borrow().clone()
    }

    /// Replace the whole config, then run `apply` with the new value.
    ///
    /// `apply` runs under the writer lock, so whatever it derives from the
    /// config (the concurrency limit, gated trees) always tracks the value
    /// that is current.
    ///
    /// # Errors
    /// - `InvalidConfig` if `config` does not validate; nothing changes
    /// - `Io` / `TomlSerialize` if the value cannot be persisted; nothing changes
    /// - whatever `apply` returns; the new value stays in place
    pub fn replace<F>(&self, config: RuntimeConfig, apply: F) -> Result<Arc<VersionedConfig>>
    where
        F: FnOnce(&VersionedConfig) -> Result<()>,
    {
        config.validate()?;
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let next = Arc::new(VersionedConfig {
            version: self.current().version + 1,
            config,
        });
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }

        self.sender.send_replace(next.clone());
        let recorded = self.events.append(Event::system(EventKind::ConfigUpdated {
            version: next.version,
            config: next.config.clone(),
        }));
        apply(&next)?;
        recorded?;
        info!(
            version = next.version,
            max_parallel_tasks = next.config.max_parallel_tasks,
            step_mode = next.config.step_mode,
            "runtime config updated"
        );
        Ok(next)
    }
}

fn persist(path: &Path, versioned: &VersionedConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, toml::to_string_pretty(versioned)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
