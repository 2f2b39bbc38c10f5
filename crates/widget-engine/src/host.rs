//! Seams between the engine and the host that actually fetches, decodes and renders audio.
//!
//! The engine never blocks on the host. Every asynchronous outcome comes back as a
//! [`HandleEvent`] tagged with the [`Generation`] captured at bind time, and the session
//! drops events whose generation no longer matches.

use std::fmt;
use std::time::Duration;

/// Identity of one decode handle, stable for the handle's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Bind token echoed back by host callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a locator is being bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// Bound for immediate playback.
    Play,
    /// Bound ahead of time; buffer only what a normal start needs.
    Preload,
    /// Bound ahead of time; stream speculatively as far as the host allows.
    PreloadFull,
}

/// Raw failure class reported by the host, before engine classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCode {
    Aborted,
    Network,
    Decode,
    SourceNotSupported,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeFailure {
    pub code: FailureCode,
    pub detail: String,
}

impl DecodeFailure {
    pub fn new(code: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HandleEventKind {
    /// Enough media is available to start; duration when the container reports it.
    Loaded { duration: Option<Duration> },
    /// Natural end of media.
    Ended,
    Failed(DecodeFailure),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandleEvent {
    pub handle: HandleId,
    pub generation: Generation,
    pub kind: HandleEventKind,
}

/// The host refused to start playback until the user acts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartRejected;

/// One independently loading decode resource.
pub trait DecodeHandle {
    fn id(&self) -> HandleId;
    /// Start fetching `locator`. Outcomes arrive later as [`HandleEvent`]s tagged with `generation`.
    fn bind(&mut self, locator: &str, generation: Generation, mode: LoadMode);
    /// Drop the current fetch. No further events are produced for it.
    fn abort(&mut self);
    /// Begin (or continue) rendering. Playback starts as soon as media is loaded.
    fn start(&mut self) -> Result<(), StartRejected>;
    fn pause(&mut self);
    /// `true` while the handle is actually producing audio.
    fn is_playing(&self) -> bool;
    fn position(&self) -> Duration;
    fn seek(&mut self, position: Duration);
    /// Linear output gain.
    fn set_gain(&mut self, gain: f32);
}
