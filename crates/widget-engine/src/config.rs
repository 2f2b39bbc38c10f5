use std::time::Duration;

/// Playback tuning parameters shared by decode/resample/output stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Decoder/resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target buffer duration for queue sizing.
    pub buffer_seconds: f32,
    /// Buffer duration used by speculative full-track preloads.
    pub full_preload_seconds: f32,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
            full_preload_seconds: 120.0,
        }
    }
}

/// Timing and policy constants of the cooperative engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Fade ramp tick.
    pub tick: Duration,
    /// Length of a full pause/resume fade.
    pub fade: Duration,
    /// Multiplier applied to every fade step.
    pub fade_compensation: f32,
    /// How far a completed fade-out rewinds the handle.
    pub fade_rewind: Duration,
    /// Window after a bind or seek during which stalls are not reported.
    pub cooldown: Duration,
    /// Remaining time below which the next track is preloaded.
    pub preload_threshold: Duration,
    /// Same threshold when full-track preloading is enabled.
    pub preload_full_threshold: Duration,
    /// Empty containers tolerated before traversal gives up.
    pub hop_limit: u32,
    pub skip_delay_min: Duration,
    pub skip_delay_max: Duration,
    /// Lifetime of transient notices.
    pub notice_ttl: Duration,
    /// Minimum interval between position pushes to the control surface.
    pub surface_throttle: Duration,
    /// How long an autoplay block waits for confirmation before giving up.
    pub resume_window: Duration,
    /// Step used by the seek-forward / seek-backward transport actions.
    pub seek_step: Duration,
    /// `prev` restarts the current track instead when past this position.
    pub restart_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            fade: Duration::from_millis(300),
            fade_compensation: 1.0,
            fade_rewind: Duration::from_millis(800),
            cooldown: Duration::from_millis(500),
            preload_threshold: Duration::from_secs(7),
            preload_full_threshold: Duration::from_secs(90),
            hop_limit: 5,
            skip_delay_min: Duration::from_secs(5),
            skip_delay_max: Duration::from_secs(15),
            notice_ttl: Duration::from_secs(6),
            surface_throttle: Duration::from_secs(1),
            resume_window: Duration::from_secs(60),
            seek_step: Duration::from_secs(10),
            restart_threshold: Duration::from_secs(3),
        }
    }
}
