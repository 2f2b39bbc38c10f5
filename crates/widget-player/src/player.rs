//! Commands accepted by the engine runtime thread and the handle used to send them.

use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use widget_engine::settings::Settings;
use widget_types::TransportAction;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// What `POST /queue/play` asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueTarget {
    /// A listing index in the current queue.
    Index(usize),
    /// A directory relative to the library root, optionally starting at a listing index.
    Directory { path: String, start: Option<usize> },
}

#[derive(Debug)]
pub enum PlayerCommand {
    Transport(TransportAction),
    Seek { ms: u64 },
    SeekBy { delta_ms: i64 },
    Play(QueueTarget, Sender<Result<(), String>>),
    /// Merge a partial settings document; replies with the resulting settings.
    UpdateSettings(serde_json::Value, Sender<Result<Settings, String>>),
    ApplySettings(Sender<Result<(), String>>),
    ConfirmResume(Sender<bool>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// The runtime thread is gone.
    Offline,
    /// The runtime did not answer in time.
    Timeout,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Offline => f.write_str("player offline"),
            CommandError::Timeout => f.write_str("player did not respond"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Handle for sending commands to the runtime thread.
#[derive(Clone, Debug)]
pub struct PlayerHandle {
    cmd_tx: Sender<PlayerCommand>,
}

impl PlayerHandle {
    pub fn new(cmd_tx: Sender<PlayerCommand>) -> Self {
        Self { cmd_tx }
    }

    pub fn send(&self, cmd: PlayerCommand) -> Result<(), CommandError> {
        self.cmd_tx.send(cmd).map_err(|_| CommandError::Offline)
    }

    /// Send a command carrying a reply channel and wait for the answer.
    pub fn request<T>(&self, build: impl FnOnce(Sender<T>) -> PlayerCommand) -> Result<T, CommandError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(build(reply_tx))?;
        reply_rx.recv_timeout(REPLY_TIMEOUT).map_err(|err| match err {
            crossbeam_channel::RecvTimeoutError::Timeout => CommandError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => CommandError::Offline,
        })
    }
}

/// Overlay `patch` onto `base`, recursing into objects; other values replace.
pub fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply a partial settings document on top of `current`.
pub fn patch_settings(current: &Settings, patch: serde_json::Value) -> Result<Settings, String> {
    if !patch.is_object() {
        return Err("settings patch must be a JSON object".to_string());
    }
    let mut value = serde_json::to_value(current).map_err(|e| e.to_string())?;
    merge_json(&mut value, patch);
    serde_json::from_value(value).map_err(|e| e.to_string())
}
