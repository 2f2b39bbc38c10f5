//! Resolved player configuration and the TOML settings store.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use widget_engine::backend::{HttpRangeConfig, LocalHostConfig};
use widget_engine::config::{EngineConfig, PlaybackConfig};
use widget_engine::error::SettingsError;
use widget_engine::settings::{Settings, SettingsStore};

use crate::cli::Args;

const SETTINGS_FILE: &str = "widget-settings.toml";

/// Everything the runtime needs, resolved from the command line.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    pub library_root: PathBuf,
    pub start_dir: PathBuf,
    pub remote_base: Option<String>,
    pub http_bind: SocketAddr,
    /// `None` keeps settings in memory.
    pub settings_path: Option<PathBuf>,
    pub host: LocalHostConfig,
    pub engine: EngineConfig,
    pub probe_timeout: Duration,
}

impl PlayerConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let library = args
            .library
            .as_ref()
            .ok_or_else(|| anyhow!("--library is required"))?;
        let library_root = library
            .canonicalize()
            .with_context(|| format!("canonicalize library root {:?}", library))?;
        if !library_root.is_dir() {
            return Err(anyhow!("library root is not a directory: {:?}", library_root));
        }
        let start_dir = match args.start_dir.as_ref() {
            Some(dir) => {
                let dir = dir
                    .canonicalize()
                    .with_context(|| format!("canonicalize start dir {:?}", dir))?;
                if !dir.starts_with(&library_root) {
                    return Err(anyhow!("start dir {:?} is outside the library", dir));
                }
                dir
            }
            None => library_root.clone(),
        };
        let settings_path = if args.no_persist {
            None
        } else {
            Some(args.settings.clone().unwrap_or_else(default_settings_path))
        };
        let timeout = Duration::from_millis(args.http_timeout_ms.max(1));
        Ok(Self {
            library_root,
            start_dir,
            remote_base: normalize_base(args.remote_base.as_deref()),
            http_bind: args.http_bind,
            settings_path,
            host: LocalHostConfig {
                device: normalize_device_name(args.device.clone()),
                playback: PlaybackConfig {
                    chunk_frames: args.chunk_frames.max(64),
                    refill_max_frames: args.refill_max_frames.max(64),
                    buffer_seconds: args.buffer_seconds.max(0.25),
                    ..PlaybackConfig::default()
                },
                http: HttpRangeConfig {
                    timeout,
                    ..HttpRangeConfig::default()
                },
            },
            engine: EngineConfig::default(),
            probe_timeout: timeout,
        })
    }
}

fn default_settings_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SETTINGS_FILE)))
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE))
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn normalize_base(base: Option<&str>) -> Option<String> {
    let base = base?.trim().trim_end_matches('/');
    if base.is_empty() {
        None
    } else {
        Some(base.to_string())
    }
}

/// [`SettingsStore`] backed by a TOML file. A missing file loads defaults.
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&mut self) -> Result<Settings, SettingsError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no settings file; using defaults");
                return Ok(Settings::default());
            }
            Err(err) => return Err(err.into()),
        };
        toml::from_str(&raw).map_err(|e| SettingsError::Decode(e.to_string()))
    }

    fn save(&mut self, settings: &Settings) -> Result<(), SettingsError> {
        let body = toml::to_string_pretty(settings).map_err(|e| SettingsError::Encode(e.to_string()))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
