//! Engine runtime thread.
//!
//! Owns the [`Engine`] and everything that is not `Send` (the output stream, the decode
//! handles), multiplexes commands and host callbacks with `select!`, ticks the engine at
//! least every 10 ms and republishes a snapshot for the HTTP API after each turn.

use std::path::{Component, Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use widget_engine::backend::{self, LocalHost, ProbeReply, ThreadedProbe};
use widget_engine::dsp::Calibration;
use widget_engine::host::HandleEvent;
use widget_engine::settings::{MemorySettingsStore, SettingsStore};
use widget_engine::{Engine, EngineEvent, EngineParts};

use crate::config::{PlayerConfig, TomlSettingsStore};
use crate::library::{self, SourceMapper};
use crate::player::{self, PlayerCommand, PlayerHandle, QueueTarget};
use crate::state::{HttpSurface, SharedState};
use crate::traversal::{ContainerCursor, DirectoryTraversal, SiblingReply};

/// Receivers the runtime multiplexes over.
pub struct RuntimeChannels {
    pub commands: Receiver<PlayerCommand>,
    pub handle_events: Receiver<HandleEvent>,
    pub probes: Receiver<ProbeReply>,
    pub siblings: Receiver<SiblingReply>,
}

enum Wake {
    /// `None` once every command sender is gone.
    Command(Option<PlayerCommand>),
    Handle(HandleEvent),
    Probe(ProbeReply),
    Sibling(SiblingReply),
    Idle,
}

pub struct Runtime {
    engine: Engine,
    channels: RuntimeChannels,
    state: SharedState,
    mapper: SourceMapper,
    cursor: ContainerCursor,
    tick: Duration,
    /// Output stream the engine's handles render into; dropped with the runtime.
    _host: Option<LocalHost>,
}

/// Resolve a library-relative directory, refusing anything that escapes the root.
pub fn resolve_container(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let relative = Path::new(relative.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(format!("invalid directory: {}", relative.display()));
    }
    let dir = root.join(relative);
    if !dir.is_dir() {
        return Err(format!("not a directory: {}", relative.display()));
    }
    Ok(dir)
}

impl Runtime {
    pub fn new(engine: Engine, channels: RuntimeChannels, state: SharedState, mapper: SourceMapper, cursor: ContainerCursor) -> Self {
        let tick = Duration::from_millis(10);
        Self {
            engine,
            channels,
            state,
            mapper,
            cursor,
            tick,
            _host: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The cursor only moves past a directory the engine is still waiting on, so the
    /// next hop starts from there.
    fn on_sibling(&mut self, reply: SiblingReply, now: Instant) {
        if self.engine.traversal_token() == Some(reply.token) {
            if let Some(dir) = &reply.dir {
                self.cursor.set(dir.clone());
            }
        }
        self.engine.on_sibling_reply(reply.token, reply.listing, now);
    }

    /// Run until a shutdown command arrives or every command sender is dropped.
    pub fn run(mut self) {
        tracing::info!("engine runtime started");
        self.publish();
        loop {
            let now = Instant::now();
            let wait = self
                .engine
                .next_deadline()
                .map(|due| due.saturating_duration_since(now))
                .unwrap_or(self.tick)
                .min(self.tick);
            let wake = select! {
                recv(self.channels.commands) -> msg => Wake::Command(msg.ok()),
                recv(self.channels.handle_events) -> msg => msg.map(Wake::Handle).unwrap_or(Wake::Idle),
                recv(self.channels.probes) -> msg => msg.map(Wake::Probe).unwrap_or(Wake::Idle),
                recv(self.channels.siblings) -> msg => msg.map(Wake::Sibling).unwrap_or(Wake::Idle),
                default(wait) => Wake::Idle,
            };
            let now = Instant::now();
            let keep_going = match wake {
                Wake::Command(Some(cmd)) => self.handle_command(cmd, now),
                Wake::Command(None) => false,
                Wake::Handle(event) => {
                    self.engine.on_handle_event(event, now);
                    true
                }
                Wake::Probe(reply) => {
                    self.engine.on_probe_result(reply.token, reply.status);
                    true
                }
                Wake::Sibling(reply) => {
                    self.on_sibling(reply, now);
                    true
                }
                Wake::Idle => true,
            };
            if !keep_going {
                break;
            }
            self.engine.tick(now);
            self.publish();
        }
        self.engine.shutdown();
        self.publish();
        self.state.lock().online = false;
        tracing::info!("engine runtime stopped");
    }

    /// Handle one command. Returns `false` on shutdown.
    pub fn handle_command(&mut self, cmd: PlayerCommand, now: Instant) -> bool {
        match cmd {
            PlayerCommand::Transport(action) => self.engine.handle_transport(action, now),
            PlayerCommand::Seek { ms } => self.engine.seek(Duration::from_millis(ms), now),
            PlayerCommand::SeekBy { delta_ms } => self.engine.seek_relative(delta_ms, now),
            PlayerCommand::Play(target, reply) => {
                let result = self.play(target, now);
                if let Err(err) = &result {
                    tracing::warn!(error = %err, "play request rejected");
                }
                let _ = reply.send(result);
            }
            PlayerCommand::UpdateSettings(patch, reply) => {
                let result = player::patch_settings(self.engine.settings(), patch).map(|next| {
                    self.engine.update_settings(|settings| *settings = next);
                    self.engine.settings().clone()
                });
                let _ = reply.send(result);
            }
            PlayerCommand::ApplySettings(reply) => {
                let _ = reply.send(self.engine.apply_settings().map_err(|e| e.to_string()));
            }
            PlayerCommand::ConfirmResume(reply) => {
                let _ = reply.send(self.engine.confirm_resume(now));
            }
            PlayerCommand::Shutdown => {
                tracing::info!("shutdown requested");
                return false;
            }
        }
        true
    }

    fn play(&mut self, target: QueueTarget, now: Instant) -> Result<(), String> {
        match target {
            QueueTarget::Index(index) => {
                if self.engine.play_index(index, now) {
                    Ok(())
                } else {
                    Err(format!("no track at index {index}"))
                }
            }
            QueueTarget::Directory { path, start } => {
                let dir = resolve_container(self.mapper.root(), &path)?;
                let listing = library::list_container(&dir, &self.mapper).map_err(|e| format!("{e:#}"))?;
                if let Some(index) = start.filter(|i| *i >= listing.tracks.len()) {
                    return Err(format!("no track at index {index}"));
                }
                self.cursor.set(dir);
                self.engine.load_container(listing, start, now);
                Ok(())
            }
        }
    }

    fn publish(&mut self) {
        for event in self.engine.drain_events() {
            match &event {
                EngineEvent::ResumeRequested { track, position } => {
                    tracing::warn!(?track, position_ms = position.as_millis() as u64, "playback blocked; waiting for resume");
                }
                other => tracing::debug!(event = ?other, "engine event"),
            }
        }
        if !self.engine.is_traversing() {
            if let Some(container) = self.engine.container() {
                let container = PathBuf::from(container);
                if self.cursor.get() != container {
                    self.cursor.set(container);
                }
            }
        }
        let mut state = self.state.lock();
        state.status = self.engine.status();
        state.notices = self.engine.notices().to_vec();
        state.settings = self.engine.settings().clone();
        state.container = self.engine.container().map(str::to_string);
    }
}

/// Open the output device, build the engine and start the runtime thread.
///
/// The device stream and decode handles are created on the runtime thread itself;
/// startup errors are reported back before this returns.
pub fn spawn_runtime(config: PlayerConfig, state: SharedState) -> Result<(PlayerHandle, JoinHandle<()>)> {
    let (cmd_tx, cmd_rx) = unbounded();
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
    let thread_state = state.clone();
    let join = std::thread::Builder::new()
        .name("widget-engine".to_string())
        .spawn(move || {
            let runtime = match build_runtime(config, thread_state, cmd_rx) {
                Ok(runtime) => {
                    let _ = ready_tx.send(Ok(()));
                    runtime
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            runtime.run();
        })
        .context("spawn engine runtime")?;
    match ready_rx.recv() {
        Ok(Ok(())) => Ok((PlayerHandle::new(cmd_tx), join)),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(anyhow!("engine runtime exited during startup")),
    }
}

fn build_runtime(config: PlayerConfig, state: SharedState, commands: Receiver<PlayerCommand>) -> Result<Runtime> {
    let (handle_tx, handle_events) = unbounded();
    let (probe_tx, probes) = unbounded();
    let (sibling_tx, siblings) = unbounded();

    let host = LocalHost::open(config.host.clone(), handle_tx).context("open output device")?;
    {
        let mut published = state.lock();
        published.device = Some(host.device_name().to_string());
        published.online = true;
    }

    let mapper = SourceMapper::new(config.library_root.clone(), config.remote_base.clone());
    let cursor = ContainerCursor::new(config.start_dir.clone());
    let store: Box<dyn SettingsStore> = match config.settings_path.as_ref() {
        Some(path) => {
            tracing::info!(path = %path.display(), "settings file");
            Box::new(TomlSettingsStore::new(path))
        }
        None => Box::new(MemorySettingsStore::new()),
    };
    let parts = EngineParts {
        handles: host.decode_handles(),
        graph: Box::new(host.graph()),
        surface: Box::new(HttpSurface::new(state.clone())),
        traversal: Box::new(DirectoryTraversal::new(mapper.clone(), cursor.clone(), sibling_tx)),
        probe: Box::new(ThreadedProbe::new(probe_tx, config.probe_timeout)),
        store,
        capabilities: backend::probe_capabilities(),
        calibration: Calibration::default(),
    };
    let mut engine = Engine::new(config.engine.clone(), parts);

    match library::list_container(&config.start_dir, &mapper) {
        Ok(listing) => engine.load_container(listing, None, Instant::now()),
        Err(err) => tracing::warn!(dir = %config.start_dir.display(), error = %err, "initial listing failed"),
    }

    let mut runtime = Runtime::new(
        engine,
        RuntimeChannels {
            commands,
            handle_events,
            probes,
            siblings,
        },
        state,
        mapper,
        cursor,
    );
    runtime._host = Some(host);
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::tests::temp_root;
    use serde_json::json;
    use std::fs;
    use widget_engine::codec::Capabilities;
    use widget_engine::config::EngineConfig;
    use widget_engine::dsp::{SampleGraph, SharedGraph};
    use widget_engine::host::{DecodeHandle, Generation, HandleId, LoadMode, StartRejected};

    struct SilentHandle {
        id: HandleId,
        playing: bool,
        position: Duration,
    }

    impl DecodeHandle for SilentHandle {
        fn id(&self) -> HandleId {
            self.id
        }
        fn bind(&mut self, _locator: &str, _generation: Generation, _mode: LoadMode) {
            self.position = Duration::ZERO;
        }
        fn abort(&mut self) {
            self.playing = false;
        }
        fn start(&mut self) -> Result<(), StartRejected> {
            self.playing = true;
            Ok(())
        }
        fn pause(&mut self) {
            self.playing = false;
        }
        fn is_playing(&self) -> bool {
            self.playing
        }
        fn position(&self) -> Duration {
            self.position
        }
        fn seek(&mut self, position: Duration) {
            self.position = position;
        }
        fn set_gain(&mut self, _gain: f32) {}
    }

    fn silent(id: u32) -> Box<dyn DecodeHandle> {
        Box::new(SilentHandle {
            id: HandleId(id),
            playing: false,
            position: Duration::ZERO,
        })
    }

    fn library() -> PathBuf {
        let root = temp_root("runtime").canonicalize().unwrap();
        for dir in ["album", "other"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        for name in ["01.flac", "02.flac"] {
            fs::write(root.join("album").join(name), b"x").unwrap();
        }
        root
    }

    fn runtime(root: &Path) -> (Runtime, SharedState) {
        let state = SharedState::new();
        let (_, commands) = unbounded();
        let (_, handle_events) = unbounded();
        let (probe_tx, probes) = unbounded();
        let (sibling_tx, siblings) = unbounded();
        let mapper = SourceMapper::new(root.to_path_buf(), None);
        let cursor = ContainerCursor::new(root.to_path_buf());
        let parts = EngineParts {
            handles: [silent(1), silent(2)],
            graph: Box::new(SharedGraph::new(SampleGraph::new(48_000))),
            surface: Box::new(HttpSurface::new(state.clone())),
            traversal: Box::new(DirectoryTraversal::new(mapper.clone(), cursor.clone(), sibling_tx)),
            probe: Box::new(ThreadedProbe::new(probe_tx, Duration::from_secs(1))),
            store: Box::new(MemorySettingsStore::new()),
            capabilities: Capabilities::all(),
            calibration: Calibration::default(),
        };
        let engine = Engine::new(EngineConfig::default(), parts);
        let channels = RuntimeChannels {
            commands,
            handle_events,
            probes,
            siblings,
        };
        (Runtime::new(engine, channels, state.clone(), mapper, cursor), state)
    }

    fn play(rt: &mut Runtime, target: QueueTarget) -> Result<(), String> {
        let (tx, rx) = bounded(1);
        assert!(rt.handle_command(PlayerCommand::Play(target, tx), Instant::now()));
        rx.try_recv().unwrap()
    }

    #[test]
    fn container_paths_stay_inside_the_library() {
        let root = library();
        assert_eq!(resolve_container(&root, "album"), Ok(root.join("album")));
        assert_eq!(resolve_container(&root, "/album"), Ok(root.join("album")));
        assert!(resolve_container(&root, "../album").is_err());
        assert!(resolve_container(&root, "album/../../etc").is_err());
        assert!(resolve_container(&root, "missing").is_err());
    }

    #[test]
    fn playing_a_directory_loads_and_publishes_the_queue() {
        let root = library();
        let (mut rt, state) = runtime(&root);
        play(
            &mut rt,
            QueueTarget::Directory {
                path: "album".to_string(),
                start: Some(1),
            },
        )
        .unwrap();
        rt.publish();

        let published = state.snapshot();
        assert_eq!(published.status.queue_len, 2);
        assert_eq!(published.status.active_index, Some(1));
        assert_eq!(published.container, Some(root.join("album").to_string_lossy().to_string()));
        assert_eq!(rt.cursor.get(), root.join("album"));
        assert!(published.now_playing.metadata.is_some());
    }

    #[test]
    fn out_of_range_start_is_rejected_without_loading() {
        let root = library();
        let (mut rt, state) = runtime(&root);
        let err = play(
            &mut rt,
            QueueTarget::Directory {
                path: "album".to_string(),
                start: Some(5),
            },
        );
        assert!(err.is_err());
        assert!(play(&mut rt, QueueTarget::Index(0)).is_err());
        rt.publish();
        assert_eq!(state.snapshot().status.queue_len, 0);
    }

    #[test]
    fn settings_patch_and_apply_round_trip() {
        let root = library();
        let (mut rt, state) = runtime(&root);
        let (tx, rx) = bounded(1);
        rt.handle_command(
            PlayerCommand::UpdateSettings(json!({ "volume": 0.5, "eq_enabled": true }), tx),
            Instant::now(),
        );
        let settings = rx.try_recv().unwrap().unwrap();
        assert_eq!(settings.volume, 0.5);
        assert!(settings.eq_enabled);

        let (tx, rx) = bounded(1);
        rt.handle_command(PlayerCommand::ApplySettings(tx), Instant::now());
        assert_eq!(rx.try_recv().unwrap(), Ok(()));

        rt.publish();
        let published = state.snapshot();
        assert!(published.settings.eq_enabled);
        assert_eq!(published.status.volume, 0.5);
    }

    #[test]
    fn invalid_settings_patch_leaves_settings_alone() {
        let root = library();
        let (mut rt, _) = runtime(&root);
        let before = rt.engine().settings().clone();
        let (tx, rx) = bounded(1);
        rt.handle_command(PlayerCommand::UpdateSettings(json!({ "volume": "loud" }), tx), Instant::now());
        assert!(rx.try_recv().unwrap().is_err());
        assert_eq!(rt.engine().settings(), &before);
    }

    #[test]
    fn superseded_sibling_reply_leaves_cursor_in_place() {
        let root = library();
        let (mut rt, _) = runtime(&root);
        let (tx, rx) = bounded(1);
        rt.handle_command(PlayerCommand::UpdateSettings(json!({ "end_of_queue": "continue" }), tx), Instant::now());
        rx.try_recv().unwrap().unwrap();
        play(
            &mut rt,
            QueueTarget::Directory {
                path: "album".to_string(),
                start: Some(1),
            },
        )
        .unwrap();

        let next = widget_types::TransportAction::NextTrack;
        rt.handle_command(PlayerCommand::Transport(next), Instant::now());
        rt.handle_command(PlayerCommand::Transport(next), Instant::now());
        let mut replies: Vec<SiblingReply> = (0..2)
            .map(|_| rt.channels.siblings.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        replies.sort_by_key(|r| r.token);
        let fresh = replies.pop().unwrap();
        let stale = replies.pop().unwrap();
        assert_eq!(stale.dir, Some(root.join("other")));

        rt.on_sibling(stale, Instant::now());
        assert_eq!(rt.cursor.get(), root.join("album"));
        rt.on_sibling(fresh, Instant::now());
        assert_eq!(rt.cursor.get(), root.join("other"));
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let root = library();
        let (mut rt, _) = runtime(&root);
        assert!(!rt.handle_command(PlayerCommand::Shutdown, Instant::now()));
    }
}
