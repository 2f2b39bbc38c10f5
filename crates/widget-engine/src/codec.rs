//! Codec negotiation: which locator to request for a track, and what to do when it fails.

use std::time::Duration;

use widget_types::{CodecTarget, ErrorKind};

use crate::host::{DecodeFailure, FailureCode};
use crate::settings::Settings;
use crate::track::Track;

/// Decode support probed once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Host prefers the original file whenever it can decode it.
    pub native_preferred: bool,
    pub opus_ogg: bool,
    pub opus_alt: bool,
    pub aac: bool,
    pub mp3: bool,
    pub flac: bool,
    pub wav: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            native_preferred: true,
            opus_ogg: true,
            opus_alt: true,
            aac: true,
            mp3: true,
            flac: true,
            wav: true,
        }
    }

    /// Best transcode target the host can decode.
    pub fn default_target(&self) -> CodecTarget {
        if self.opus_ogg {
            CodecTarget::Opus
        } else if self.opus_alt {
            CodecTarget::OpusAlt
        } else if self.mp3 {
            CodecTarget::Mp3
        } else if self.flac {
            CodecTarget::Flac
        } else {
            CodecTarget::Wav
        }
    }

    fn supports(&self, target: CodecTarget) -> bool {
        match target {
            CodecTarget::Opus => self.opus_ogg,
            CodecTarget::OpusAlt => self.opus_alt,
            CodecTarget::Mp3 => self.mp3,
            CodecTarget::Flac => self.flac,
            CodecTarget::Wav => self.wav,
        }
    }
}

/// Next step after a decode failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureAction {
    /// aac transcoding was just enabled; request the same track again.
    RetryTranscoded,
    /// Give up on the track and skip after `delay`.
    Skip { kind: ErrorKind, delay: Duration },
}

/// Map a host failure code onto the user-facing taxonomy.
pub fn classify(failure: &DecodeFailure) -> ErrorKind {
    match failure.code {
        FailureCode::Aborted => ErrorKind::Aborted,
        FailureCode::Network => ErrorKind::NetworkError,
        FailureCode::Decode => ErrorKind::DecodeError,
        FailureCode::SourceNotSupported => ErrorKind::FormatUnsupported,
        FailureCode::Other => ErrorKind::Unknown,
    }
}

/// Short message shown in the error notice.
pub fn describe(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Aborted => "playback aborted",
        ErrorKind::NetworkError => "network error while loading the track",
        ErrorKind::DecodeError => "the track could not be decoded",
        ErrorKind::FormatUnsupported => "this audio format is not supported",
        ErrorKind::AutoplayBlocked => "playback needs confirmation to start",
        ErrorKind::Unknown => "unknown playback error",
    }
}

/// Refined message once the existence probe reports an HTTP-style status.
pub fn describe_status(status: u16) -> Option<&'static str> {
    match status {
        403 => Some("access denied: you may not have permission to read this file"),
        404 => Some("file not found: it may have been moved or deleted"),
        500..=599 => Some("server error while reading the file"),
        _ => None,
    }
}

fn is_aac_family(ext: &str) -> bool {
    matches!(ext, "m4a" | "aac" | "mp4" | "m4b")
}

#[derive(Debug)]
pub struct CodecNegotiator {
    caps: Capabilities,
    target: CodecTarget,
    transcode_aac: bool,
    transcode_all: bool,
    fallback_used: bool,
    cache_token: String,
    skip_min: Duration,
    skip_max: Duration,
}

impl CodecNegotiator {
    pub fn new(caps: Capabilities, cache_token: impl Into<String>, skip_delays: (Duration, Duration)) -> Self {
        let target = caps.default_target();
        tracing::info!(?caps, target = target.hint(), "codec capabilities probed");
        if !caps.aac {
            tracing::info!("aac decode not advertised; relying on runtime fallback");
        }
        Self {
            caps,
            target,
            transcode_aac: false,
            transcode_all: false,
            fallback_used: false,
            cache_token: cache_token.into(),
            skip_min: skip_delays.0,
            skip_max: skip_delays.0.max(skip_delays.1),
        }
    }

    /// Pick up the codec-related flags from a settings record.
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.target = match settings.codec_target {
            Some(target) if self.caps.supports(target) => target,
            Some(target) => {
                tracing::warn!(target = target.hint(), "codec override not decodable; keeping default");
                self.caps.default_target()
            }
            None => self.caps.default_target(),
        };
        self.transcode_aac = settings.transcode_aac;
        self.transcode_all = settings.transcode_all;
    }

    pub fn target(&self) -> CodecTarget {
        self.target
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    /// Whether the host can play `ext` without asking the server to transcode.
    pub fn is_native(&self, ext: &str) -> bool {
        match ext {
            "mp3" => self.caps.mp3,
            "flac" => self.caps.flac,
            "wav" => self.caps.wav,
            "opus" | "ogg" | "oga" => self.caps.opus_ogg,
            "caf" | "weba" | "webm" => self.caps.opus_alt,
            ext if is_aac_family(ext) => !self.transcode_aac,
            _ => false,
        }
    }

    /// Locator for `track`: the untouched path, or the path plus transcode and cache-bust parameters.
    pub fn locator(&self, track: &Track) -> String {
        let ext = track.extension().unwrap_or_default();
        let native = self.caps.native_preferred && self.is_native(&ext);
        let already_target = ext == self.target.hint() && self.is_native(&ext);
        if (native && !self.transcode_all) || already_target {
            return track.source.clone();
        }
        let sep = if track.source.contains('?') { '&' } else { '?' };
        format!(
            "{}{sep}transcode={}&cache={}",
            track.source,
            self.target.hint(),
            self.cache_token
        )
    }

    /// Decide how to recover from `failure` while playing `track`.
    pub fn on_failure(&mut self, track: &Track, failure: &DecodeFailure) -> FailureAction {
        let kind = classify(failure);
        let ext = track.extension().unwrap_or_default();
        if kind == ErrorKind::FormatUnsupported
            && is_aac_family(&ext)
            && !self.transcode_aac
            && !self.fallback_used
        {
            self.fallback_used = true;
            self.transcode_aac = true;
            if !self.target.is_opus() {
                if self.caps.opus_ogg {
                    self.target = CodecTarget::Opus;
                } else if self.caps.opus_alt {
                    self.target = CodecTarget::OpusAlt;
                }
            }
            tracing::info!(track = %track.id, target = self.target.hint(), "aac unsupported; enabling transcoding");
            return FailureAction::RetryTranscoded;
        }
        FailureAction::Skip {
            kind,
            delay: self.skip_delay(kind),
        }
    }

    /// Current `transcode_aac` flag, including a fallback-triggered change.
    pub fn transcode_aac(&self) -> bool {
        self.transcode_aac
    }

    fn skip_delay(&self, kind: ErrorKind) -> Duration {
        match kind {
            ErrorKind::NetworkError => self.skip_max,
            ErrorKind::Unknown => (self.skip_min + self.skip_max) / 2,
            _ => self.skip_min,
        }
    }
}

/// Host seam for the HEAD-style existence check run alongside an error notice.
pub trait ResourceProbe {
    /// Check `locator`; the status (or `None` when unreachable) comes back tagged with `token`.
    fn probe(&mut self, locator: &str, token: u64);
}
