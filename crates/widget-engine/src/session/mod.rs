//! Dual-handle playback session: one active handle, one idle handle used for preloading
//! and crossfades.

mod fade;

use std::time::{Duration, Instant};

use widget_types::{ErrorKind, FadeState, SessionState};

use crate::config::EngineConfig;
use crate::host::{DecodeFailure, DecodeHandle, Generation, HandleEvent, HandleEventKind, HandleId, LoadMode};

pub use fade::{FadePurpose, Ramp, RampDirection, perceptual_gain};

/// Which of the two owned handles a value refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    const BOTH: [Slot; 2] = [Slot::A, Slot::B];
}

#[derive(Debug, Default)]
struct SlotState {
    locator: Option<String>,
    generation: Generation,
    loaded: bool,
    duration: Option<Duration>,
    gain: f32,
    ramp: Option<Ramp>,
}

#[derive(Debug)]
struct PreloadGuard {
    locator: String,
    full: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// The host refused to start; the session waits for [`PlaybackSession::confirm_resume`].
    Blocked,
}

/// Session-level outcome of a host event the engine has to act on.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionSignal {
    Loaded { duration: Option<Duration> },
    Ended,
    Failed(DecodeFailure),
}

#[derive(Clone, Debug)]
struct Timing {
    tick: Duration,
    fade: Duration,
    compensation: f32,
    rewind: Duration,
    cooldown: Duration,
}

pub struct PlaybackSession {
    handles: [Box<dyn DecodeHandle>; 2],
    slots: [SlotState; 2],
    active: Slot,
    generation: u64,
    state: SessionState,
    volume: f32,
    cooldown_until: Option<Instant>,
    preloading: Option<PreloadGuard>,
    pending_resume: Option<Duration>,
    position: Duration,
    fade_epoch: u64,
    timing: Timing,
}

impl PlaybackSession {
    pub fn new(handles: [Box<dyn DecodeHandle>; 2], config: &EngineConfig, volume: f32) -> Self {
        let mut session = Self {
            handles,
            slots: Default::default(),
            active: Slot::A,
            generation: 0,
            state: SessionState::Idle,
            volume: volume.clamp(0.0, 1.0),
            cooldown_until: None,
            preloading: None,
            pending_resume: None,
            position: Duration::ZERO,
            fade_epoch: 0,
            timing: Timing {
                tick: config.tick,
                fade: config.fade,
                compensation: config.fade_compensation,
                rewind: config.fade_rewind,
                cooldown: config.cooldown,
            },
        };
        let target = session.target_gain();
        session.set_slot_gain(Slot::A, target);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Perceptual gain of the configured volume.
    pub fn target_gain(&self) -> f32 {
        perceptual_gain(self.volume)
    }

    /// Gain currently applied to the active handle.
    pub fn gain(&self) -> f32 {
        self.slot(self.active).gain
    }

    pub fn gain_of(&self, slot: Slot) -> f32 {
        self.slot(slot).gain
    }

    pub fn active(&self) -> Slot {
        self.active
    }

    pub fn active_handle(&self) -> HandleId {
        self.handles[self.active.index()].id()
    }

    pub fn handle_ids(&self) -> [HandleId; 2] {
        [self.handles[0].id(), self.handles[1].id()]
    }

    /// Bind counter; bumped every time either handle is bound.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active_generation(&self) -> Generation {
        self.slot(self.active).generation
    }

    pub fn active_locator(&self) -> Option<&str> {
        self.slot(self.active).locator.as_deref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.slot(self.active).duration
    }

    pub fn position(&self) -> Duration {
        self.position
    }

    pub fn resume_pending(&self) -> Option<Duration> {
        self.pending_resume
    }

    pub fn preloading_locator(&self) -> Option<&str> {
        self.preloading.as_ref().map(|g| g.locator.as_str())
    }

    pub fn fade_state(&self) -> FadeState {
        self.slot(self.active)
            .ramp
            .map(|r| r.state())
            .unwrap_or(FadeState::None)
    }

    /// `true` while either handle has a ramp in progress.
    pub fn is_fading(&self) -> bool {
        self.slots.iter().any(|s| s.ramp.is_some())
    }

    /// Token captured by scheduled fade ticks; a hard fade stop invalidates it.
    pub fn fade_epoch(&self) -> u64 {
        self.fade_epoch
    }

    fn slot(&self, slot: Slot) -> &SlotState {
        &self.slots[slot.index()]
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut SlotState {
        &mut self.slots[slot.index()]
    }

    fn handle_mut(&mut self, slot: Slot) -> &mut dyn DecodeHandle {
        self.handles[slot.index()].as_mut()
    }

    fn slot_of(&self, handle: HandleId) -> Option<Slot> {
        Slot::BOTH
            .into_iter()
            .find(|s| self.handles[s.index()].id() == handle)
    }

    fn set_slot_gain(&mut self, slot: Slot, gain: f32) {
        self.slot_mut(slot).gain = gain;
        self.handle_mut(slot).set_gain(gain);
    }

    fn bind(&mut self, slot: Slot, locator: &str, mode: LoadMode) {
        self.generation += 1;
        let generation = Generation(self.generation);
        let state = self.slot_mut(slot);
        state.locator = Some(locator.to_string());
        state.generation = generation;
        state.loaded = false;
        state.duration = None;
        state.ramp = None;
        tracing::debug!(slot = ?slot, generation = %generation, mode = ?mode, locator, "binding decode handle");
        self.handle_mut(slot).bind(locator, generation, mode);
    }

    fn reset_cooldown(&mut self, now: Instant) {
        self.cooldown_until = Some(now + self.timing.cooldown);
    }

    fn start_ramp(&mut self, slot: Slot, direction: RampDirection, length: Duration, purpose: FadePurpose) {
        let ramp = Ramp::new(
            direction,
            self.target_gain(),
            self.timing.tick,
            length,
            self.timing.compensation,
        )
        .with_purpose(purpose);
        self.slot_mut(slot).ramp = Some(ramp);
    }

    /// Cancel the ramp on `slot`. A hard stop also invalidates ticks already scheduled.
    pub fn stop_fade(&mut self, slot: Slot, hard: bool) {
        self.slot_mut(slot).ramp = None;
        if hard {
            self.fade_epoch += 1;
        }
    }

    /// Bind `locator` (or swap in the preloaded handle) and start playback.
    ///
    /// With a `crossfade` length and a still-audible current track, the outgoing handle fades
    /// out while the incoming one fades in.
    pub fn play(&mut self, locator: &str, seek: Option<Duration>, crossfade: Option<Duration>, now: Instant) -> PlayOutcome {
        let outgoing = self.active;
        let audible = matches!(self.state, SessionState::Playing | SessionState::Loading)
            && self.handles[outgoing.index()].is_playing();
        let crossfade = crossfade.filter(|len| audible && !len.is_zero());
        self.stop_fade(outgoing, true);

        let idle = outgoing.other();
        if self.slot(idle).locator.as_deref() == Some(locator) {
            self.stop_fade(idle, true);
            self.active = idle;
            self.handle_mut(idle).seek(seek.unwrap_or_default());
            tracing::debug!(slot = ?idle, locator, "swapping in preloaded handle");
        } else if crossfade.is_some() {
            self.handle_mut(idle).pause();
            self.bind(idle, locator, LoadMode::Play);
            self.active = idle;
            if let Some(pos) = seek {
                self.handle_mut(idle).seek(pos);
            }
        } else {
            self.handle_mut(outgoing).pause();
            self.bind(outgoing, locator, LoadMode::Play);
            if let Some(pos) = seek {
                self.handle_mut(outgoing).seek(pos);
            }
        }
        self.preloading = None;
        self.pending_resume = None;

        let active = self.active;
        if active != outgoing && audible {
            match crossfade {
                Some(len) => self.start_ramp(outgoing, RampDirection::Out, len, FadePurpose::Handoff),
                None => self.handle_mut(outgoing).pause(),
            }
        }

        self.position = seek.unwrap_or_default();
        self.reset_cooldown(now);
        match crossfade {
            Some(len) => {
                self.set_slot_gain(active, 0.0);
                self.start_ramp(active, RampDirection::In, len, FadePurpose::Handoff);
            }
            None => {
                let target = self.target_gain();
                self.set_slot_gain(active, target);
            }
        }
        self.state = if self.slot(active).loaded {
            SessionState::Playing
        } else {
            SessionState::Loading
        };
        self.start_active(self.position)
    }

    fn start_active(&mut self, requested: Duration) -> PlayOutcome {
        let active = self.active;
        match self.handle_mut(active).start() {
            Ok(()) => PlayOutcome::Started,
            Err(_) => {
                tracing::warn!(position_ms = requested.as_millis() as u64, "host rejected playback start");
                self.stop_fade(active, true);
                self.state = SessionState::Errored(ErrorKind::AutoplayBlocked);
                self.pending_resume = Some(requested);
                PlayOutcome::Blocked
            }
        }
    }

    /// Resume an autoplay-blocked start at the originally requested position.
    /// Returns `None` when nothing is waiting.
    pub fn confirm_resume(&mut self, now: Instant) -> Option<PlayOutcome> {
        let position = self.pending_resume?;
        let active = self.active;
        self.handle_mut(active).seek(position);
        self.position = position;
        self.reset_cooldown(now);
        self.set_slot_gain(active, 0.0);
        self.state = if self.slot(active).loaded {
            SessionState::Playing
        } else {
            SessionState::Loading
        };
        let outcome = self.start_active(position);
        if outcome == PlayOutcome::Started {
            self.pending_resume = None;
            self.fade_in_active();
        }
        Some(outcome)
    }

    /// Give up on a pending autoplay confirmation.
    pub fn abandon_resume(&mut self) -> bool {
        if self.pending_resume.take().is_none() {
            return false;
        }
        self.state = SessionState::Paused;
        true
    }

    fn fade_in_active(&mut self) {
        let active = self.active;
        if self.timing.fade.is_zero() {
            let target = self.target_gain();
            self.set_slot_gain(active, target);
        } else {
            self.start_ramp(active, RampDirection::In, self.timing.fade, FadePurpose::Handoff);
        }
    }

    /// Fade out and pause. The handle pauses once the ramp completes.
    pub fn pause(&mut self) {
        if !matches!(self.state, SessionState::Playing | SessionState::Loading) {
            return;
        }
        self.poll_position();
        self.state = SessionState::Paused;
        let active = self.active;
        if self.timing.fade.is_zero() {
            self.stop_fade(active, true);
            self.handle_mut(active).pause();
        } else {
            self.start_ramp(active, RampDirection::Out, self.timing.fade, FadePurpose::Pause);
        }
    }

    /// Resume from pause with a fade-in. An interrupted fade-out ramps back up from where it was.
    pub fn resume(&mut self, now: Instant) -> PlayOutcome {
        match self.state {
            SessionState::Paused => {}
            SessionState::Errored(ErrorKind::AutoplayBlocked) => {
                return self.confirm_resume(now).unwrap_or(PlayOutcome::Blocked);
            }
            _ => return PlayOutcome::Started,
        }
        let active = self.active;
        let was_fading_out = self
            .slot(active)
            .ramp
            .is_some_and(|r| r.direction == RampDirection::Out);
        self.stop_fade(active, true);
        if !was_fading_out {
            self.set_slot_gain(active, 0.0);
        }
        self.reset_cooldown(now);
        self.state = if self.slot(active).loaded {
            SessionState::Playing
        } else {
            SessionState::Loading
        };
        let outcome = self.start_active(self.position);
        if outcome == PlayOutcome::Started {
            self.fade_in_active();
        }
        outcome
    }

    /// Restart the current track from the beginning.
    pub fn restart(&mut self, now: Instant) -> PlayOutcome {
        let active = self.active;
        self.stop_fade(active, true);
        self.handle_mut(active).seek(Duration::ZERO);
        self.position = Duration::ZERO;
        self.reset_cooldown(now);
        let target = self.target_gain();
        self.set_slot_gain(active, target);
        self.state = if self.slot(active).loaded {
            SessionState::Playing
        } else {
            SessionState::Loading
        };
        self.start_active(Duration::ZERO)
    }

    /// Stop both handles immediately.
    pub fn stop(&mut self) {
        for slot in Slot::BOTH {
            self.stop_fade(slot, true);
            self.handle_mut(slot).pause();
        }
        self.pending_resume = None;
        self.state = SessionState::Idle;
    }

    pub fn seek(&mut self, position: Duration, now: Instant) {
        if self.pending_resume.is_some() {
            self.pending_resume = Some(position);
        }
        let active = self.active;
        self.handle_mut(active).seek(position);
        self.position = position;
        self.reset_cooldown(now);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { self.volume };
        let target = self.target_gain();
        for slot in Slot::BOTH {
            let ramping = match self.slot_mut(slot).ramp.as_mut() {
                Some(ramp) => {
                    ramp.retarget(target);
                    true
                }
                None => false,
            };
            if ramping {
                let gain = self.slot(slot).gain.min(target);
                self.set_slot_gain(slot, gain);
            } else if slot == self.active {
                self.set_slot_gain(slot, target);
            }
        }
    }

    pub fn mark_failed(&mut self, kind: ErrorKind) {
        self.stop_fade(self.active, true);
        self.state = SessionState::Errored(kind);
    }

    /// Advance every ramp by one tick.
    pub fn step_fades(&mut self) {
        for slot in Slot::BOTH {
            let Some(ramp) = self.slot(slot).ramp else {
                continue;
            };
            let (gain, done) = ramp.advance(self.slot(slot).gain);
            self.set_slot_gain(slot, gain);
            if done {
                self.slot_mut(slot).ramp = None;
                if ramp.direction == RampDirection::Out {
                    self.complete_fade_out(slot, ramp.purpose);
                }
            }
        }
    }

    fn complete_fade_out(&mut self, slot: Slot, purpose: FadePurpose) {
        self.handle_mut(slot).pause();
        if purpose != FadePurpose::Pause || slot != self.active {
            tracing::debug!(slot = ?slot, "fade-out complete");
            return;
        }
        let rewind = self.timing.rewind;
        let handle = self.handle_mut(slot);
        let rewound = handle.position().saturating_sub(rewind);
        handle.seek(rewound);
        self.position = rewound;
        tracing::debug!(slot = ?slot, position_ms = rewound.as_millis() as u64, "pause fade-out complete");
    }

    /// Bind the idle handle to `locator` ahead of time. Returns `true` when a fetch started.
    pub fn preload(&mut self, locator: &str, full: bool) -> bool {
        let idle = self.active.other();
        if let Some(guard) = &self.preloading {
            if guard.locator == locator {
                return false;
            }
            if guard.full && self.slot(idle).locator.as_deref() == Some(guard.locator.as_str()) {
                tracing::debug!(locator = %guard.locator, "aborting superseded full preload");
                self.handle_mut(idle).abort();
                self.slot_mut(idle).locator = None;
            }
        }
        if self.slot(idle).ramp.is_some() {
            return false;
        }
        self.preloading = Some(PreloadGuard {
            locator: locator.to_string(),
            full,
        });
        if self.slot(idle).locator.as_deref() == Some(locator) {
            return false;
        }
        self.handle_mut(idle).pause();
        let mode = if full { LoadMode::PreloadFull } else { LoadMode::Preload };
        self.bind(idle, locator, mode);
        true
    }

    /// Route a host event. Stale and idle-handle events are absorbed here.
    pub fn on_handle_event(&mut self, event: HandleEvent) -> Option<SessionSignal> {
        let Some(slot) = self.slot_of(event.handle) else {
            tracing::debug!(handle = %event.handle, "event for unknown handle");
            return None;
        };
        if self.slot(slot).generation != event.generation {
            tracing::trace!(handle = %event.handle, generation = %event.generation, "discarding stale handle event");
            return None;
        }
        let is_active = slot == self.active;
        match event.kind {
            HandleEventKind::Loaded { duration } => {
                let state = self.slot_mut(slot);
                state.loaded = true;
                state.duration = duration;
                if !is_active {
                    tracing::debug!(handle = %event.handle, "preload ready");
                    return None;
                }
                if self.state == SessionState::Loading {
                    self.state = SessionState::Playing;
                }
                Some(SessionSignal::Loaded { duration })
            }
            HandleEventKind::Ended => {
                if !is_active {
                    return None;
                }
                self.state = SessionState::Idle;
                Some(SessionSignal::Ended)
            }
            HandleEventKind::Failed(failure) => {
                if is_active {
                    return Some(SessionSignal::Failed(failure));
                }
                // Keep the guard so the failing locator is not refetched every tick.
                tracing::warn!(handle = %event.handle, detail = %failure.detail, "preload failed");
                self.slot_mut(slot).locator = None;
                None
            }
        }
    }

    /// Active handle should be playing but is not, outside the post-bind cooldown.
    pub fn stalled(&self, now: Instant) -> bool {
        let active = self.slot(self.active);
        self.state == SessionState::Playing
            && active.loaded
            && active.ramp.is_none()
            && self.cooldown_until.is_none_or(|until| now >= until)
            && !self.handles[self.active.index()].is_playing()
    }

    /// Ask the active handle to start again after a stall.
    pub fn nudge(&mut self, now: Instant) -> PlayOutcome {
        self.reset_cooldown(now);
        self.start_active(self.position)
    }

    /// Refresh the cached position; only read while the handle reports playing.
    pub fn poll_position(&mut self) -> Duration {
        let handle = &self.handles[self.active.index()];
        if handle.is_playing() {
            self.position = handle.position();
        }
        self.position
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.duration().map(|d| d.saturating_sub(self.position))
    }
}
