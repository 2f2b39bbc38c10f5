//! Persisted user settings and the store seam.

use serde::{Deserialize, Serialize};
use widget_types::{CodecTarget, EndOfQueueMode};

use crate::error::SettingsError;

pub const EQ_BANDS: usize = 10;

/// Dynamics compressor parameters, in the units the UI edits them in.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressorSettings {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack_ms: 3.0,
            release_ms: 250.0,
        }
    }
}

impl CompressorSettings {
    fn sanitized(self) -> Self {
        Self {
            threshold_db: self.threshold_db.clamp(-100.0, 0.0),
            knee_db: self.knee_db.clamp(0.0, 40.0),
            ratio: self.ratio.clamp(1.0, 20.0),
            attack_ms: self.attack_ms.clamp(0.0, 1000.0),
            release_ms: self.release_ms.clamp(0.0, 1000.0),
        }
    }
}

/// User-editable settings record. Read once at startup and written on every change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Linear user volume in `[0, 1]`.
    pub volume: f32,
    pub eq_enabled: bool,
    /// Per-band gains in dB, lowest band first.
    pub eq_gains: [f32; EQ_BANDS],
    /// Extra pregain in dB.
    pub boost_db: f32,
    /// Stereo width; `1.0` is unchanged, `0.0` is mono.
    pub width: f32,
    pub compressor_enabled: bool,
    pub compressor: CompressorSettings,
    /// Repeat the current track on natural end.
    pub loop_one: bool,
    pub shuffle: bool,
    /// Advance to the next track when one ends naturally.
    pub autoplay: bool,
    /// Overrides the probed default transcode target.
    pub codec_target: Option<CodecTarget>,
    pub transcode_aac: bool,
    pub transcode_all: bool,
    pub end_of_queue: EndOfQueueMode,
    /// Crossfade length between tracks, `0` for gapless handover.
    pub crossfade_ms: u32,
    /// Stream the next track speculatively well before the current one ends.
    pub preload_full: bool,
    /// Publish now-playing metadata to the control surface.
    pub media_session: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume: 0.75,
            eq_enabled: false,
            eq_gains: [0.0; EQ_BANDS],
            boost_db: 0.0,
            width: 1.0,
            compressor_enabled: false,
            compressor: CompressorSettings::default(),
            loop_one: false,
            shuffle: false,
            autoplay: true,
            codec_target: None,
            transcode_aac: false,
            transcode_all: false,
            end_of_queue: EndOfQueueMode::Stop,
            crossfade_ms: 0,
            preload_full: false,
            media_session: true,
        }
    }
}

impl Settings {
    /// Clamp every numeric field into its editable range.
    pub fn sanitized(mut self) -> Self {
        self.volume = finite_or(self.volume, 0.75).clamp(0.0, 1.0);
        for gain in self.eq_gains.iter_mut() {
            *gain = finite_or(*gain, 0.0).clamp(-24.0, 24.0);
        }
        self.boost_db = finite_or(self.boost_db, 0.0).clamp(-24.0, 24.0);
        self.width = finite_or(self.width, 1.0).clamp(0.0, 2.0);
        self.compressor = self.compressor.sanitized();
        self.crossfade_ms = self.crossfade_ms.min(10_000);
        self
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value } else { fallback }
}

/// Key-value persistence for [`Settings`].
pub trait SettingsStore {
    fn load(&mut self) -> Result<Settings, SettingsError>;
    fn save(&mut self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Store that keeps the record in memory; used by tests and `--no-persist` runs.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    saved: Option<Settings>,
    writes: usize,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(settings: Settings) -> Self {
        Self {
            saved: Some(settings),
            writes: 0,
        }
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Last record written or seeded.
    pub fn saved(&self) -> Option<&Settings> {
        self.saved.as_ref()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&mut self) -> Result<Settings, SettingsError> {
        Ok(self.saved.clone().unwrap_or_default())
    }

    fn save(&mut self, settings: &Settings) -> Result<(), SettingsError> {
        self.saved = Some(settings.clone());
        self.writes += 1;
        Ok(())
    }
}
