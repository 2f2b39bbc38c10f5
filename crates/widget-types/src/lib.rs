use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable track identity derived from the track's source path.
///
/// Serialized as a 16 character hex string so that browser clients never lose
/// precision on the 64-bit value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TrackId(u64);

impl TrackId {
    /// FNV-1a hash of the path bytes.
    pub fn from_path(path: &str) -> Self {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in path.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        Self(hash)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<TrackId> for String {
    fn from(id: TrackId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TrackId {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        u64::from_str_radix(&value, 16).map(TrackId)
    }
}

/// Direction of queue advancement or container traversal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// Failure taxonomy surfaced to users and logs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fetch was cancelled before the media could be decoded.
    Aborted,
    /// Transport failed while fetching the media.
    NetworkError,
    /// Media was fetched but could not be decoded.
    DecodeError,
    /// Neither the source nor any container inside it is playable.
    FormatUnsupported,
    /// The host refused to start playback without an explicit user action.
    AutoplayBlocked,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Aborted => "aborted",
            ErrorKind::NetworkError => "network error",
            ErrorKind::DecodeError => "decode error",
            ErrorKind::FormatUnsupported => "format unsupported",
            ErrorKind::AutoplayBlocked => "autoplay blocked",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(label)
    }
}

/// Transcode target requested from the server when a source is not natively playable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CodecTarget {
    /// Opus in an Ogg container.
    Opus,
    /// Opus in the alternate (caf) container for hosts without Ogg demuxing.
    OpusAlt,
    Mp3,
    Flac,
    Wav,
}

impl CodecTarget {
    /// Value placed in the locator's `transcode=` parameter.
    pub fn hint(self) -> &'static str {
        match self {
            CodecTarget::Opus => "opus",
            CodecTarget::OpusAlt => "caf",
            CodecTarget::Mp3 => "mp3",
            CodecTarget::Flac => "flac",
            CodecTarget::Wav => "wav",
        }
    }

    /// Whether this target carries Opus audio.
    pub fn is_opus(self) -> bool {
        matches!(self, CodecTarget::Opus | CodecTarget::OpusAlt)
    }
}

/// What to do once the last track of the local queue finishes.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndOfQueueMode {
    /// Stop playback after the last track.
    #[default]
    Stop,
    /// Wrap around to the first track.
    Wrap,
    /// Ask the traversal collaborator for a neighbouring container.
    Continue,
}

/// Transport actions registered with the host control surface.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportAction {
    Play,
    Pause,
    TogglePause,
    Stop,
    SeekBackward,
    SeekForward,
    PreviousTrack,
    NextTrack,
}

impl TransportAction {
    pub const ALL: [TransportAction; 8] = [
        TransportAction::Play,
        TransportAction::Pause,
        TransportAction::TogglePause,
        TransportAction::Stop,
        TransportAction::SeekBackward,
        TransportAction::SeekForward,
        TransportAction::PreviousTrack,
        TransportAction::NextTrack,
    ];

    /// Parse the path segment used by the HTTP control surface.
    pub fn from_slug(slug: &str) -> Option<Self> {
        let action = match slug {
            "play" => TransportAction::Play,
            "pause" => TransportAction::Pause,
            "toggle" => TransportAction::TogglePause,
            "stop" => TransportAction::Stop,
            "seek-backward" => TransportAction::SeekBackward,
            "seek-forward" => TransportAction::SeekForward,
            "previous" => TransportAction::PreviousTrack,
            "next" => TransportAction::NextTrack,
            _ => return None,
        };
        Some(action)
    }
}

/// Playback session lifecycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum SessionState {
    #[default]
    Idle,
    /// A handle is bound and asked to play but has not reported its media yet.
    Loading,
    Playing,
    Paused,
    Errored(ErrorKind),
}

/// Gain ramp currently applied to the active handle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FadeState {
    #[default]
    None,
    FadingIn,
    FadingOut,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// Transient, auto-dismissing user-facing message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
    /// Milliseconds until the notice dismisses itself, `None` when it stays until replaced.
    pub ttl_ms: Option<u64>,
}

/// Metadata published to the host "now playing" surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NowPlayingMetadata {
    pub track_id: Option<TrackId>,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Artwork reference (path or URL) for the current container.
    pub artwork: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Position snapshot pushed to the control surface on a throttled schedule.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PositionState {
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub playback_rate: f32,
}

/// Coarse playback state shown by the control surface.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SurfacePlaybackState {
    #[default]
    None,
    Paused,
    Playing,
}

/// Engine snapshot served by the status endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStatus {
    /// Currently selected track id.
    pub now_playing: Option<TrackId>,
    /// Display title of the current track.
    pub title: Option<String>,
    pub state: SessionState,
    pub fade: FadeState,
    /// Elapsed playback time in milliseconds.
    pub position_ms: u64,
    /// Total media duration in milliseconds, when known.
    pub duration_ms: Option<u64>,
    /// User volume in `[0, 1]`.
    pub volume: f32,
    /// Perceptual gain derived from the volume.
    pub gain: f32,
    pub queue_len: usize,
    /// Position of the current track within the play order.
    pub active_index: Option<usize>,
    pub shuffle: bool,
    pub end_of_queue: EndOfQueueMode,
    pub codec_target: Option<CodecTarget>,
    /// Session generation, bumped on every bind.
    pub generation: u64,
    /// `true` while an autoplay block waits for confirmation.
    pub resume_pending: bool,
}
