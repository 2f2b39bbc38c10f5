//! Single-threaded engine façade.
//!
//! The caller owns the [`Engine`], forwards host events into it, calls [`Engine::tick`]
//! roughly every fade tick and drains [`EngineEvent`]s afterwards. Nothing in here blocks.

use std::time::{Duration, Instant};

use widget_types::{
    Direction, EngineStatus, ErrorKind, Notice, NoticeLevel, SessionState, TrackId, TransportAction,
};

use crate::codec::{self, Capabilities, CodecNegotiator, FailureAction, ResourceProbe};
use crate::config::EngineConfig;
use crate::dsp::{AudioGraph, Calibration, DspChain};
use crate::error::GraphError;
use crate::host::{DecodeFailure, DecodeHandle, Generation, HandleEvent};
use crate::queue::{Advance, Queue};
use crate::session::{PlayOutcome, PlaybackSession, SessionSignal};
use crate::settings::{Settings, SettingsStore};
use crate::surface::{ControlSurface, MediaBridge};
use crate::timers::Scheduler;
use crate::traversal::{ContainerListing, Traversal, TraversalSource, TraversalStep};

/// Outbound notifications for the UI collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Notice(Notice),
    /// Same notice id, refined message.
    NoticeUpdated(Notice),
    NoticeDismissed(u64),
    NowPlaying(TrackId),
    /// Playback was blocked; the user must confirm through [`Engine::confirm_resume`].
    ResumeRequested {
        track: Option<TrackId>,
        position: Duration,
    },
    StateChanged(SessionState),
}

#[derive(Clone, Debug, PartialEq)]
enum TimerTask {
    FadeTick { epoch: u64 },
    SkipAfterError { generation: Generation },
    DismissNotice { id: u64 },
    ResumeExpired { generation: Generation },
}

/// Host collaborators handed to [`Engine::new`].
pub struct EngineParts {
    pub handles: [Box<dyn DecodeHandle>; 2],
    pub graph: Box<dyn AudioGraph>,
    pub surface: Box<dyn ControlSurface>,
    pub traversal: Box<dyn TraversalSource>,
    pub probe: Box<dyn ResourceProbe>,
    pub store: Box<dyn SettingsStore>,
    pub capabilities: Capabilities,
    pub calibration: Calibration,
}

#[derive(Debug)]
struct ErrorContext {
    probe_token: u64,
    notice_id: u64,
    title: String,
}

pub struct Engine {
    config: EngineConfig,
    settings: Settings,
    /// Snapshot applied to the DSP chain by the last explicit rebuild.
    dsp_settings: Settings,
    store: Box<dyn SettingsStore>,
    queue: Queue,
    traversal: Traversal,
    traversal_source: Box<dyn TraversalSource>,
    session: PlaybackSession,
    codec: CodecNegotiator,
    probe: Box<dyn ResourceProbe>,
    dsp: DspChain,
    graph: Box<dyn AudioGraph>,
    bridge: MediaBridge,
    timers: Scheduler<TimerTask>,
    fade_tick_pending: bool,
    events: Vec<EngineEvent>,
    notices: Vec<Notice>,
    next_notice: u64,
    next_probe: u64,
    error: Option<ErrorContext>,
    resume_notice: Option<u64>,
    container: Option<String>,
    last_state: SessionState,
    early_advance: bool,
}

impl Engine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let EngineParts {
            handles,
            mut graph,
            surface,
            traversal,
            probe,
            mut store,
            capabilities,
            calibration,
        } = parts;

        let settings = match store.load() {
            Ok(settings) => settings.sanitized(),
            Err(err) => {
                tracing::warn!(error = %err, "settings load failed; using defaults");
                Settings::default()
            }
        };
        let profile = match calibration.run(graph.as_mut()) {
            Ok((profile, _)) => profile,
            Err(err) => {
                tracing::warn!(error = %err, "eq calibration failed; using primary profile");
                calibration.primary.clone()
            }
        };
        let mut codec = CodecNegotiator::new(
            capabilities,
            format!("{:08x}", rand::random::<u32>()),
            (config.skip_delay_min, config.skip_delay_max),
        );
        codec.apply_settings(&settings);
        let session = PlaybackSession::new(handles, &config, settings.volume);
        let bridge = MediaBridge::new(surface, settings.media_session, config.surface_throttle);

        Self {
            traversal: Traversal::new(config.hop_limit),
            queue: Queue::new(settings.shuffle),
            dsp_settings: settings.clone(),
            settings,
            store,
            traversal_source: traversal,
            session,
            codec,
            probe,
            dsp: DspChain::new(profile),
            graph,
            bridge,
            timers: Scheduler::new(),
            fade_tick_pending: false,
            events: Vec::new(),
            notices: Vec::new(),
            next_notice: 0,
            next_probe: 0,
            error: None,
            resume_notice: None,
            container: None,
            last_state: SessionState::Idle,
            early_advance: false,
            config,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// `true` while a sibling-container request is outstanding.
    pub fn is_traversing(&self) -> bool {
        self.traversal.is_pending()
    }

    /// Token a sibling reply must carry to be accepted.
    pub fn traversal_token(&self) -> Option<u64> {
        self.traversal.pending_token()
    }

    pub fn now_playing(&self) -> Option<&widget_types::NowPlayingMetadata> {
        self.bridge.metadata()
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Earliest pending timer, for callers that sleep between ticks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_due()
    }

    pub fn status(&self) -> EngineStatus {
        let current = self.queue.current();
        EngineStatus {
            now_playing: current.map(|t| t.id),
            title: current.map(|t| t.display_title()),
            state: self.session.state(),
            fade: self.session.fade_state(),
            position_ms: self.session.position().as_millis() as u64,
            duration_ms: self
                .session
                .duration()
                .or(current.and_then(|t| t.duration))
                .map(|d| d.as_millis() as u64),
            volume: self.session.volume(),
            gain: self.session.target_gain(),
            queue_len: self.queue.len(),
            active_index: self.queue.active_index(),
            shuffle: self.queue.is_shuffled(),
            end_of_queue: self.settings.end_of_queue,
            codec_target: Some(self.codec.target()),
            generation: self.session.generation(),
            resume_pending: self.session.resume_pending().is_some(),
        }
    }

    /// Regenerate the queue from a container listing and optionally start a track.
    pub fn load_container(&mut self, listing: ContainerListing, start: Option<usize>, now: Instant) {
        tracing::info!(container = %listing.container, tracks = listing.tracks.len(), "loading container");
        self.traversal.cancel();
        self.container = Some(listing.container);
        self.queue.replace(listing.tracks);
        if let Some(index) = start {
            self.play_index(index, now);
        }
    }

    /// Play the track at listing index `index`.
    pub fn play_index(&mut self, index: usize, now: Instant) -> bool {
        if !self.queue.select(index) {
            tracing::warn!(index, len = self.queue.len(), "play request out of range");
            return false;
        }
        self.start_current(None, now);
        true
    }

    pub fn next(&mut self, now: Instant) {
        self.advance(Direction::Forward, false, now);
    }

    /// Previous track, or restart the current one when past the restart threshold.
    pub fn prev(&mut self, now: Instant) {
        if self.session.poll_position() > self.config.restart_threshold
            && self.queue.current().is_some()
        {
            self.session.seek(Duration::ZERO, now);
            return;
        }
        self.advance(Direction::Backward, false, now);
    }

    pub fn pause(&mut self, now: Instant) {
        self.session.pause();
        self.after_session_call(now);
    }

    /// Resume, confirm a blocked start, or start the current track from idle.
    pub fn play(&mut self, now: Instant) {
        match self.session.state() {
            SessionState::Paused => {
                if self.session.resume(now) == PlayOutcome::Blocked {
                    self.request_resume(now);
                }
            }
            SessionState::Errored(ErrorKind::AutoplayBlocked) => {
                self.confirm_resume(now);
            }
            SessionState::Idle | SessionState::Errored(_) => {
                if self.queue.current().is_some() {
                    self.start_current(None, now);
                } else {
                    self.advance(Direction::Forward, false, now);
                }
            }
            SessionState::Playing | SessionState::Loading => {}
        }
        self.after_session_call(now);
    }

    pub fn toggle_pause(&mut self, now: Instant) {
        match self.session.state() {
            SessionState::Playing | SessionState::Loading => self.pause(now),
            _ => self.play(now),
        }
    }

    pub fn stop(&mut self, now: Instant) {
        self.session.stop();
        self.traversal.cancel();
        self.cancel_error();
        self.after_session_call(now);
    }

    pub fn seek(&mut self, position: Duration, now: Instant) {
        let position = match self.session.duration() {
            Some(duration) => position.min(duration),
            None => position,
        };
        self.session.seek(position, now);
        self.after_session_call(now);
    }

    pub fn seek_relative(&mut self, delta_ms: i64, now: Instant) {
        let current = self.session.poll_position().as_millis() as i64;
        let target = (current + delta_ms).max(0) as u64;
        self.seek(Duration::from_millis(target), now);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.session.set_volume(volume);
        if self.settings.volume != self.session.volume() {
            self.settings.volume = self.session.volume();
            self.persist();
        }
    }

    /// Edit settings. Everything except the DSP chain takes effect immediately; the DSP
    /// chain waits for [`Engine::apply_settings`].
    pub fn update_settings(&mut self, edit: impl FnOnce(&mut Settings)) {
        let mut next = self.settings.clone();
        edit(&mut next);
        let next = next.sanitized();
        if next == self.settings {
            return;
        }
        let before = std::mem::replace(&mut self.settings, next);
        if before.shuffle != self.settings.shuffle {
            self.queue.set_shuffle(self.settings.shuffle);
        }
        if before.volume != self.settings.volume {
            self.session.set_volume(self.settings.volume);
        }
        self.codec.apply_settings(&self.settings);
        self.bridge.set_enabled(self.settings.media_session);
        self.persist();
    }

    /// Rebuild the DSP chain from the current settings.
    pub fn apply_settings(&mut self) -> Result<(), GraphError> {
        self.dsp_settings = self.settings.clone();
        let result = self
            .dsp
            .rebuild(self.graph.as_mut(), self.session.active_handle(), &self.dsp_settings);
        if let Err(err) = &result {
            tracing::warn!(error = %err, "dsp rebuild failed");
        }
        result
    }

    /// Confirm a blocked start. Returns `true` when playback started.
    pub fn confirm_resume(&mut self, now: Instant) -> bool {
        let started = match self.session.confirm_resume(now) {
            Some(PlayOutcome::Started) => {
                tracing::info!("playback resumed after confirmation");
                self.timers
                    .cancel_where(|t| matches!(t, TimerTask::ResumeExpired { .. }));
                if let Some(id) = self.resume_notice.take() {
                    self.dismiss_notice(id);
                }
                true
            }
            Some(PlayOutcome::Blocked) => false,
            None => false,
        };
        self.after_session_call(now);
        started
    }

    pub fn handle_transport(&mut self, action: TransportAction, now: Instant) {
        tracing::debug!(?action, "transport action");
        let step = self.config.seek_step.as_millis() as i64;
        match action {
            TransportAction::Play => self.play(now),
            TransportAction::Pause => self.pause(now),
            TransportAction::TogglePause => self.toggle_pause(now),
            TransportAction::Stop => self.stop(now),
            TransportAction::SeekBackward => self.seek_relative(-step, now),
            TransportAction::SeekForward => self.seek_relative(step, now),
            TransportAction::PreviousTrack => self.prev(now),
            TransportAction::NextTrack => self.next(now),
        }
    }

    pub fn on_handle_event(&mut self, event: HandleEvent, now: Instant) {
        match self.session.on_handle_event(event) {
            None => {}
            Some(SessionSignal::Loaded { duration }) => {
                self.bridge.update_duration(duration);
            }
            Some(SessionSignal::Ended) => {
                tracing::info!(track = ?self.queue.current().map(|t| t.id), "track ended");
                self.advance(Direction::Forward, true, now);
            }
            Some(SessionSignal::Failed(failure)) => self.handle_failure(failure, now),
        }
        self.after_session_call(now);
    }

    pub fn on_sibling_reply(&mut self, token: u64, reply: Option<ContainerListing>, now: Instant) {
        match self.traversal.on_reply(token, reply) {
            TraversalStep::Stale => {
                tracing::debug!(token, "ignoring stale traversal reply");
            }
            TraversalStep::Request { direction, token } => {
                tracing::debug!(hops = self.traversal.hops(), ?direction, "container empty; hopping on");
                self.traversal_source.request_sibling(direction, token);
            }
            TraversalStep::Found { listing, start } => {
                self.load_container(listing, Some(start), now);
            }
            TraversalStep::GiveUp => {
                tracing::info!("traversal hop limit reached");
                self.push_notice(NoticeLevel::Info, "no tracks nearby".to_string(), Some(self.config.notice_ttl), now);
                self.session.stop();
            }
        }
        self.after_session_call(now);
    }

    /// Existence probe result for the current error notice.
    pub fn on_probe_result(&mut self, token: u64, status: Option<u16>) {
        let Some(ctx) = self.error.as_ref().filter(|ctx| ctx.probe_token == token) else {
            return;
        };
        let Some(message) = status.and_then(codec::describe_status) else {
            return;
        };
        let id = ctx.notice_id;
        let message = format!("{message} ({})", ctx.title);
        if let Some(notice) = self.notices.iter_mut().find(|n| n.id == id) {
            notice.message = message;
            self.events.push(EngineEvent::NoticeUpdated(notice.clone()));
        }
    }

    /// Fire due timers and run the periodic checks (stall, preload, crossfade, surface).
    pub fn tick(&mut self, now: Instant) {
        for task in self.timers.pop_due(now) {
            self.run_timer(task, now);
        }
        self.maintain(now);
        self.after_session_call(now);
    }

    /// Stop playback and persist settings.
    pub fn shutdown(&mut self) {
        self.session.stop();
        self.persist();
    }

    fn run_timer(&mut self, task: TimerTask, now: Instant) {
        match task {
            TimerTask::FadeTick { epoch } => {
                self.fade_tick_pending = false;
                if epoch == self.session.fade_epoch() {
                    self.session.step_fades();
                }
            }
            TimerTask::SkipAfterError { generation } => {
                let still_failed = self.session.active_generation() == generation
                    && matches!(self.session.state(), SessionState::Errored(_));
                if still_failed {
                    self.error = None;
                    self.advance(Direction::Forward, false, now);
                }
            }
            TimerTask::DismissNotice { id } => self.dismiss_notice(id),
            TimerTask::ResumeExpired { generation } => {
                if self.session.active_generation() == generation && self.session.abandon_resume() {
                    tracing::info!("autoplay confirmation window expired");
                    if let Some(id) = self.resume_notice.take() {
                        self.dismiss_notice(id);
                    }
                }
            }
        }
    }

    fn maintain(&mut self, now: Instant) {
        let position = self.session.poll_position();
        let state = self.session.state();
        if state == SessionState::Playing {
            if self.session.stalled(now) {
                tracing::warn!(position_ms = position.as_millis() as u64, "playback stalled; restarting handle");
                if self.session.nudge(now) == PlayOutcome::Blocked {
                    self.request_resume(now);
                }
            }
            self.maybe_preload();
            self.maybe_early_advance(now);
        }
        self.bridge.refresh_position(
            now,
            self.session.position(),
            self.session.duration(),
            state == SessionState::Playing,
        );
    }

    fn maybe_preload(&mut self) {
        if self.settings.loop_one || !self.settings.autoplay {
            return;
        }
        let Some(remaining) = self.session.remaining() else {
            return;
        };
        let full = self.settings.preload_full;
        let threshold = if full {
            self.config.preload_full_threshold
        } else {
            self.config.preload_threshold
        };
        if remaining > threshold {
            return;
        }
        let Some(track) = self
            .queue
            .peek_next(self.settings.end_of_queue)
            .and_then(|pos| self.queue.at(pos))
        else {
            return;
        };
        let locator = self.codec.locator(track);
        if self.session.preload(&locator, full) {
            tracing::debug!(track = %track.id, full, remaining_ms = remaining.as_millis() as u64, "preloading next track");
        }
    }

    fn maybe_early_advance(&mut self, now: Instant) {
        if self.early_advance || self.settings.crossfade_ms == 0 || self.settings.loop_one || !self.settings.autoplay {
            return;
        }
        let crossfade = Duration::from_millis(self.settings.crossfade_ms as u64);
        let Some(remaining) = self.session.remaining() else {
            return;
        };
        if remaining > crossfade || self.queue.peek_next(self.settings.end_of_queue).is_none() {
            return;
        }
        self.early_advance = true;
        tracing::debug!(remaining_ms = remaining.as_millis() as u64, "crossfading into next track");
        self.advance(Direction::Forward, true, now);
    }

    fn advance(&mut self, direction: Direction, natural: bool, now: Instant) {
        if natural && !self.settings.autoplay {
            self.session.stop();
            return;
        }
        let repeat_one = natural && self.settings.loop_one;
        match self.queue.advance(direction, self.settings.end_of_queue, repeat_one) {
            Advance::Idle => {}
            Advance::Play(position) => {
                self.queue.commit(position);
                self.start_current(None, now);
            }
            Advance::Restart => {
                self.cancel_error();
                if self.session.restart(now) == PlayOutcome::Blocked {
                    self.request_resume(now);
                }
            }
            Advance::Stop => {
                tracing::info!("end of queue");
                self.session.stop();
            }
            Advance::Traverse(direction) => {
                if let TraversalStep::Request { direction, token } = self.traversal.begin(direction) {
                    tracing::info!(?direction, "queue exhausted; asking for neighbouring container");
                    self.traversal_source.request_sibling(direction, token);
                }
            }
        }
    }

    fn start_current(&mut self, seek: Option<Duration>, now: Instant) {
        let Some(track) = self.queue.current().cloned() else {
            return;
        };
        self.cancel_error();
        self.timers
            .cancel_where(|t| matches!(t, TimerTask::ResumeExpired { .. }));
        if let Some(id) = self.resume_notice.take() {
            self.dismiss_notice(id);
        }
        self.early_advance = false;

        let locator = self.codec.locator(&track);
        let crossfade = (self.settings.crossfade_ms > 0)
            .then(|| Duration::from_millis(self.settings.crossfade_ms as u64));
        tracing::info!(track = %track.id, title = %track.display_title(), locator = %locator, "starting track");
        let outcome = self.session.play(&locator, seek, crossfade, now);

        if let Err(err) = self
            .dsp
            .rebuild(self.graph.as_mut(), self.session.active_handle(), &self.dsp_settings)
        {
            tracing::warn!(error = %err, "dsp chain not applied to new handle");
        }
        self.bridge.announce(&track, track.duration);
        self.events.push(EngineEvent::NowPlaying(track.id));
        if outcome == PlayOutcome::Blocked {
            self.request_resume(now);
        }
    }

    fn handle_failure(&mut self, failure: DecodeFailure, now: Instant) {
        let Some(track) = self.queue.current().cloned() else {
            return;
        };
        match self.codec.on_failure(&track, &failure) {
            FailureAction::RetryTranscoded => {
                self.settings.transcode_aac = self.codec.transcode_aac();
                self.persist();
                self.push_notice(
                    NoticeLevel::Info,
                    "aac is not playable here; switching to transcoded audio".to_string(),
                    Some(self.config.notice_ttl),
                    now,
                );
                self.start_current(None, now);
            }
            FailureAction::Skip { kind, delay } => {
                self.session.mark_failed(kind);
                tracing::warn!(
                    track = %track.id,
                    kind = %kind,
                    detail = %failure.detail,
                    delay_ms = delay.as_millis() as u64,
                    "playback failed; skipping"
                );
                let title = track.display_title();
                let notice_id = self.push_notice(
                    NoticeLevel::Error,
                    format!("{} ({title})", codec::describe(kind)),
                    Some(delay),
                    now,
                );
                self.next_probe += 1;
                let token = self.next_probe;
                if let Some(locator) = self.session.active_locator() {
                    self.probe.probe(locator, token);
                }
                self.error = Some(ErrorContext {
                    probe_token: token,
                    notice_id,
                    title,
                });
                let generation = self.session.active_generation();
                self.timers
                    .schedule(now + delay, TimerTask::SkipAfterError { generation });
            }
        }
    }

    fn cancel_error(&mut self) {
        self.error = None;
        self.timers
            .cancel_where(|t| matches!(t, TimerTask::SkipAfterError { .. }));
    }

    fn request_resume(&mut self, now: Instant) {
        let position = self.session.resume_pending().unwrap_or_default();
        if self.resume_notice.is_none() {
            let id = self.push_notice(
                NoticeLevel::Warn,
                "playback was blocked; press play to continue".to_string(),
                None,
                now,
            );
            self.resume_notice = Some(id);
        }
        self.events.push(EngineEvent::ResumeRequested {
            track: self.queue.current().map(|t| t.id),
            position,
        });
        self.timers
            .cancel_where(|t| matches!(t, TimerTask::ResumeExpired { .. }));
        let generation = self.session.active_generation();
        self.timers.schedule(
            now + self.config.resume_window,
            TimerTask::ResumeExpired { generation },
        );
    }

    fn push_notice(&mut self, level: NoticeLevel, message: String, ttl: Option<Duration>, now: Instant) -> u64 {
        self.next_notice += 1;
        let id = self.next_notice;
        let notice = Notice {
            id,
            level,
            message,
            ttl_ms: ttl.map(|d| d.as_millis() as u64),
        };
        self.notices.push(notice.clone());
        self.events.push(EngineEvent::Notice(notice));
        if let Some(ttl) = ttl {
            self.timers.schedule(now + ttl, TimerTask::DismissNotice { id });
        }
        id
    }

    fn dismiss_notice(&mut self, id: u64) {
        let before = self.notices.len();
        self.notices.retain(|n| n.id != id);
        if self.notices.len() != before {
            self.events.push(EngineEvent::NoticeDismissed(id));
        }
    }

    fn persist(&mut self) {
        if let Err(err) = self.store.save(&self.settings) {
            tracing::warn!(error = %err, "settings save failed");
        }
    }

    fn after_session_call(&mut self, now: Instant) {
        if self.session.is_fading() && !self.fade_tick_pending {
            let epoch = self.session.fade_epoch();
            self.timers
                .schedule(now + self.config.tick, TimerTask::FadeTick { epoch });
            self.fade_tick_pending = true;
        }
        let state = self.session.state();
        if state != self.last_state {
            self.last_state = state;
            self.events.push(EngineEvent::StateChanged(state));
        }
        self.bridge.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FailureCode, HandleEventKind, HandleId, LoadMode};
    use crate::settings::MemorySettingsStore;
    use crate::testing::*;
    use crate::track::Track;
    use std::cell::RefCell;
    use std::rc::Rc;
    use widget_types::EndOfQueueMode;

    struct Harness {
        engine: Engine,
        handles: [Rc<RefCell<HandleLog>>; 2],
        graph: Rc<RefCell<GraphLog>>,
        traversal: Rc<RefCell<Vec<(Direction, u64)>>>,
        probes: Rc<RefCell<Vec<(String, u64)>>>,
        store: Rc<RefCell<MemorySettingsStore>>,
        t0: Instant,
    }

    impl Harness {
        fn new(settings: Settings) -> Self {
            let (a, log_a) = FakeHandle::new(1);
            let (b, log_b) = FakeHandle::new(2);
            let (graph, graph_log) = FakeGraph::new();
            let (surface, _) = FakeSurface::new();
            let (traversal, traversal_log) = FakeTraversal::new();
            let (probe, probe_log) = FakeProbe::new();
            let (store, store_log) = SharedStore::new(settings);
            let engine = Engine::new(
                EngineConfig::default(),
                EngineParts {
                    handles: [Box::new(a), Box::new(b)],
                    graph: Box::new(graph),
                    surface: Box::new(surface),
                    traversal: Box::new(traversal),
                    probe: Box::new(probe),
                    store: Box::new(store),
                    capabilities: Capabilities::all(),
                    calibration: Calibration::default(),
                },
            );
            Self {
                engine,
                handles: [log_a, log_b],
                graph: graph_log,
                traversal: traversal_log,
                probes: probe_log,
                store: store_log,
                t0: Instant::now(),
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.t0 + Duration::from_millis(ms)
        }

        fn binds(&self) -> usize {
            self.handles.iter().map(|h| h.borrow().binds.len()).sum()
        }

        /// Handle index and generation of the most recent bind across both handles.
        fn last_bind(&self) -> (usize, String, Generation, LoadMode) {
            self.handles
                .iter()
                .enumerate()
                .filter_map(|(i, h)| h.borrow().binds.last().cloned().map(|b| (i, b)))
                .max_by_key(|(_, b)| b.1)
                .map(|(i, (loc, generation, mode))| (i, loc, generation, mode))
                .unwrap()
        }

        fn event(&mut self, kind: HandleEventKind, now: Instant) {
            let (index, _, generation, _) = self.last_bind();
            self.engine.on_handle_event(
                HandleEvent {
                    handle: HandleId(index as u32 + 1),
                    generation,
                    kind,
                },
                now,
            );
        }

        fn notices_with(&mut self, level: NoticeLevel) -> Vec<Notice> {
            self.engine
                .drain_events()
                .into_iter()
                .filter_map(|e| match e {
                    EngineEvent::Notice(n) if n.level == level => Some(n),
                    _ => None,
                })
                .collect()
        }
    }

    fn listing(dir: &str, n: usize, ext: &str) -> ContainerListing {
        ContainerListing {
            container: dir.to_string(),
            tracks: (0..n)
                .map(|i| Track::new(format!("{dir}/{i:02}.{ext}")).with_duration(Some(Duration::from_secs(100))))
                .collect(),
        }
    }

    fn continue_mode() -> Settings {
        Settings {
            end_of_queue: EndOfQueueMode::Continue,
            ..Settings::default()
        }
    }

    fn last_traversal_token(h: &Harness) -> u64 {
        h.traversal.borrow().last().unwrap().1
    }

    #[test]
    fn five_empty_containers_then_first_track_of_next() {
        let mut h = Harness::new(continue_mode());
        h.engine.load_container(listing("/m/a", 1, "flac"), Some(0), h.at(0));
        h.event(HandleEventKind::Ended, h.at(1));
        assert_eq!(h.traversal.borrow().len(), 1);

        for _ in 0..5 {
            let token = last_traversal_token(&h);
            h.engine.on_sibling_reply(token, None, h.at(2));
        }
        assert_eq!(h.traversal.borrow().len(), 6);
        let binds = h.binds();
        let token = last_traversal_token(&h);
        h.engine
            .on_sibling_reply(token, Some(listing("/m/g", 3, "flac")), h.at(3));

        assert_eq!(h.binds(), binds + 1);
        assert_eq!(h.last_bind().1, "/m/g/00.flac");
        assert_eq!(h.engine.queue().len(), 3);
        assert_eq!(h.engine.queue().active_index(), Some(0));
        assert_eq!(h.engine.container(), Some("/m/g"));
    }

    #[test]
    fn six_empty_containers_give_one_notice_and_no_play() {
        let mut h = Harness::new(continue_mode());
        h.engine.load_container(listing("/m/a", 1, "flac"), Some(0), h.at(0));
        h.event(HandleEventKind::Ended, h.at(1));
        h.engine.drain_events();
        let binds = h.binds();

        for _ in 0..6 {
            let token = last_traversal_token(&h);
            h.engine.on_sibling_reply(token, None, h.at(2));
        }
        let notices = h.notices_with(NoticeLevel::Info);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message, "no tracks nearby");
        assert_eq!(h.binds(), binds);
        assert_eq!(h.traversal.borrow().len(), 6);
        assert_eq!(h.engine.status().state, SessionState::Idle);
    }

    #[test]
    fn backward_traversal_starts_at_last_track() {
        let mut h = Harness::new(continue_mode());
        h.engine.load_container(listing("/m/b", 2, "flac"), Some(0), h.at(0));
        h.engine.prev(h.at(1));
        assert_eq!(h.traversal.borrow()[0].0, Direction::Backward);
        let token = last_traversal_token(&h);
        h.engine.on_sibling_reply(token, Some(listing("/m/a", 4, "flac")), h.at(2));
        assert_eq!(h.last_bind().1, "/m/a/03.flac");
    }

    #[test]
    fn toggling_eq_wraps_handle_once() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(0), h.at(0));
        assert_eq!(h.graph.borrow().wraps, 0);
        for _ in 0..10 {
            h.engine.update_settings(|s| s.eq_enabled = !s.eq_enabled);
            h.engine.apply_settings().unwrap();
        }
        assert_eq!(h.graph.borrow().wraps, 1);
    }

    #[test]
    fn settings_edits_wait_for_explicit_rebuild() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(0), h.at(0));
        h.engine.update_settings(|s| s.eq_enabled = true);
        h.engine.next(h.at(1));
        assert_eq!(h.graph.borrow().wraps, 0);
        h.engine.apply_settings().unwrap();
        assert_eq!(h.graph.borrow().wraps, 1);
    }

    #[test]
    fn m4a_falls_back_to_transcoding_once() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 2, "m4a"), Some(0), h.at(0));
        assert_eq!(h.last_bind().1, "/m/a/00.m4a");

        let unsupported = DecodeFailure::new(FailureCode::SourceNotSupported, "no aac decoder");
        h.event(HandleEventKind::Failed(unsupported.clone()), h.at(10));
        let (_, locator, _, _) = h.last_bind();
        assert!(locator.starts_with("/m/a/00.m4a?transcode=opus&cache="), "{locator}");
        assert!(h.engine.settings().transcode_aac);

        h.event(HandleEventKind::Loaded { duration: Some(Duration::from_secs(100)) }, h.at(20));
        assert_eq!(h.engine.status().state, SessionState::Playing);
        assert_eq!(h.engine.queue().active_index(), Some(0));

        let binds = h.binds();
        h.event(HandleEventKind::Failed(unsupported), h.at(30));
        assert_eq!(h.binds(), binds);
        assert_eq!(
            h.engine.status().state,
            SessionState::Errored(ErrorKind::FormatUnsupported)
        );
    }

    #[test]
    fn network_error_skips_after_delay_with_single_notice() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 5, "flac"), Some(3), h.at(0));
        h.engine.drain_events();

        h.event(
            HandleEventKind::Failed(DecodeFailure::new(FailureCode::Network, "connection reset")),
            h.at(100),
        );
        assert_eq!(h.probes.borrow().len(), 1);
        h.engine.tick(h.at(100 + 14_000));
        assert_eq!(h.engine.queue().active_index(), Some(3));
        h.engine.tick(h.at(100 + 15_000));
        assert_eq!(h.engine.queue().active_index(), Some(4));
        assert_eq!(h.last_bind().1, "/m/a/04.flac");
        assert_eq!(h.notices_with(NoticeLevel::Error).len(), 1);
    }

    #[test]
    fn probe_result_refines_the_same_notice() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(0), h.at(0));
        h.event(
            HandleEventKind::Failed(DecodeFailure::new(FailureCode::Decode, "bad frame")),
            h.at(10),
        );
        let events = h.engine.drain_events();
        let id = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::Notice(n) if n.level == NoticeLevel::Error => Some(n.id),
                _ => None,
            })
            .unwrap();
        let token = h.probes.borrow()[0].1;
        h.engine.on_probe_result(token, Some(404));
        let events = h.engine.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::NoticeUpdated(n) => {
                assert_eq!(n.id, id);
                assert!(n.message.contains("not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.engine.notices().len(), 1);
        h.engine.on_probe_result(token + 1, Some(403));
        assert!(h.engine.drain_events().is_empty());
    }

    #[test]
    fn autoplay_block_requests_resume_and_expires() {
        let mut h = Harness::new(Settings::default());
        h.handles[0].borrow_mut().reject_starts = 1;
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(0), h.at(0));
        let events = h.engine.drain_events();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::ResumeRequested { .. })));
        assert_eq!(
            h.engine.status().state,
            SessionState::Errored(ErrorKind::AutoplayBlocked)
        );
        assert!(h.engine.status().resume_pending);

        h.engine.tick(h.at(61_000));
        assert_eq!(h.engine.status().state, SessionState::Paused);
        assert!(h.engine.notices().is_empty());
    }

    #[test]
    fn confirm_resume_starts_at_requested_position() {
        let mut h = Harness::new(Settings::default());
        h.handles[0].borrow_mut().reject_starts = 1;
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(0), h.at(0));
        assert!(h.engine.confirm_resume(h.at(5)));
        assert!(h.handles[0].borrow().playing);
        assert_eq!(h.engine.status().state, SessionState::Loading);
        assert!(!h.engine.status().resume_pending);
        assert!(h.engine.notices().is_empty());
    }

    #[test]
    fn stale_events_after_skip_are_ignored() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 3, "flac"), Some(0), h.at(0));
        let (index, _, old, _) = h.last_bind();
        h.engine.next(h.at(10));
        assert_eq!(h.engine.queue().active_index(), Some(1));
        h.engine.on_handle_event(
            HandleEvent {
                handle: HandleId(index as u32 + 1),
                generation: old,
                kind: HandleEventKind::Ended,
            },
            h.at(20),
        );
        assert_eq!(h.engine.queue().active_index(), Some(1));
    }

    #[test]
    fn preloads_next_track_once_and_swaps_on_end() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 3, "flac"), Some(0), h.at(0));
        h.event(HandleEventKind::Loaded { duration: Some(Duration::from_secs(100)) }, h.at(10));
        h.handles[0].borrow_mut().position = Duration::from_secs(90);
        h.engine.tick(h.at(1000));
        assert!(h.handles[1].borrow().binds.is_empty());

        h.handles[0].borrow_mut().position = Duration::from_secs(94);
        h.engine.tick(h.at(2000));
        h.engine.tick(h.at(2010));
        let preload = h.handles[1].borrow().binds.clone();
        assert_eq!(preload.len(), 1);
        assert_eq!(preload[0].0, "/m/a/01.flac");
        assert_eq!(preload[0].2, LoadMode::Preload);

        let generation = h.handles[0].borrow().binds[0].1;
        h.engine.on_handle_event(
            HandleEvent {
                handle: HandleId(1),
                generation,
                kind: HandleEventKind::Ended,
            },
            h.at(8000),
        );
        assert_eq!(h.engine.queue().active_index(), Some(1));
        assert_eq!(h.handles[1].borrow().binds.len(), 1);
        assert!(h.handles[1].borrow().playing);
    }

    #[test]
    fn loop_one_restarts_single_track() {
        let mut h = Harness::new(Settings {
            loop_one: true,
            ..continue_mode()
        });
        h.engine.load_container(listing("/m/a", 1, "flac"), Some(0), h.at(0));
        h.handles[0].borrow_mut().position = Duration::from_secs(99);
        h.event(HandleEventKind::Ended, h.at(10));
        assert!(h.traversal.borrow().is_empty());
        assert_eq!(h.handles[0].borrow().seeks.last(), Some(&Duration::ZERO));
        assert_eq!(h.binds(), 1);
    }

    #[test]
    fn stop_mode_ends_at_last_track() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(1), h.at(0));
        h.event(HandleEventKind::Ended, h.at(10));
        assert_eq!(h.engine.status().state, SessionState::Idle);
        assert!(h.traversal.borrow().is_empty());
    }

    #[test]
    fn pause_fades_out_through_ticks() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(0), h.at(0));
        h.event(HandleEventKind::Loaded { duration: Some(Duration::from_secs(100)) }, h.at(1));
        h.engine.handle_transport(TransportAction::TogglePause, h.at(100));
        assert_eq!(h.engine.status().state, SessionState::Paused);
        assert!(h.handles[0].borrow().playing);
        for step in 1..=40 {
            h.engine.tick(h.at(100 + step * 10));
        }
        assert!(!h.handles[0].borrow().playing);
        assert_eq!(h.handles[0].borrow().gain, 0.0);
    }

    #[test]
    fn transport_seek_moves_by_step() {
        let mut h = Harness::new(Settings::default());
        h.engine.load_container(listing("/m/a", 2, "flac"), Some(0), h.at(0));
        h.event(HandleEventKind::Loaded { duration: Some(Duration::from_secs(100)) }, h.at(1));
        h.handles[0].borrow_mut().position = Duration::from_secs(30);
        h.engine.handle_transport(TransportAction::SeekForward, h.at(10));
        assert_eq!(h.handles[0].borrow().seeks.last(), Some(&Duration::from_secs(40)));
        h.engine.handle_transport(TransportAction::SeekBackward, h.at(20));
        assert_eq!(h.handles[0].borrow().seeks.last(), Some(&Duration::from_secs(30)));
        h.engine.handle_transport(TransportAction::NextTrack, h.at(30));
        assert_eq!(h.engine.queue().active_index(), Some(1));
    }

    #[test]
    fn settings_changes_are_persisted() {
        let mut h = Harness::new(Settings::default());
        h.engine.set_volume(0.2);
        h.engine.update_settings(|s| s.shuffle = true);
        assert!(h.engine.queue().is_shuffled());
        assert_eq!(h.engine.status().volume, 0.2);
        assert_eq!(h.handles[0].borrow().gain, crate::session::perceptual_gain(0.2));
        assert_eq!(h.store.borrow().writes(), 2);
        let saved = h.store.borrow().saved().cloned().unwrap();
        assert!(saved.shuffle);
        assert_eq!(saved.volume, 0.2);
    }

    #[test]
    fn one_write_per_effective_change() {
        let mut h = Harness::new(Settings::default());
        h.engine.update_settings(|s| s.crossfade_ms = 1_500);
        assert_eq!(h.store.borrow().writes(), 1);
        assert_eq!(h.store.borrow().saved().unwrap().crossfade_ms, 1_500);

        h.engine.update_settings(|s| s.crossfade_ms = 1_500);
        let volume = h.engine.settings().volume;
        h.engine.set_volume(volume);
        assert_eq!(h.store.borrow().writes(), 1);
    }
}
