//! Local audio backend: symphonia decode, rubato resampling and CPAL output behind the
//! [`DecodeHandle`] and [`AudioGraph`](crate::dsp::AudioGraph) seams.

pub mod buffer;
pub mod decode;
pub mod device;
pub mod fetch;
pub mod output;
pub mod resample;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::Sender;

use crate::codec::Capabilities;
use crate::config::PlaybackConfig;
use crate::dsp::{SampleGraph, SharedGraph};
use crate::error::LoadError;
use crate::host::{DecodeFailure, DecodeHandle, FailureCode, Generation, HandleEvent, HandleEventKind, HandleId, LoadMode, StartRejected};

pub use buffer::SampleQueue;
pub use device::DeviceInfo;
pub use fetch::{HttpRangeConfig, ProbeReply, ThreadedProbe};
pub use output::Voice;

/// Formats the bundled decoders can play without server-side transcoding.
pub fn probe_capabilities() -> Capabilities {
    use symphonia::core::codecs::{CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_OPUS, CODEC_TYPE_PCM_S16LE};
    let codecs = symphonia::default::get_codecs();
    let has = |codec| codecs.get_codec(codec).is_some();
    Capabilities {
        native_preferred: true,
        opus_ogg: has(CODEC_TYPE_OPUS),
        opus_alt: has(CODEC_TYPE_OPUS),
        aac: has(CODEC_TYPE_AAC),
        mp3: has(CODEC_TYPE_MP3),
        flac: has(CODEC_TYPE_FLAC),
        wav: has(CODEC_TYPE_PCM_S16LE),
    }
}

#[derive(Clone, Debug, Default)]
pub struct LocalHostConfig {
    /// Substring of the output device name; the default device when unset.
    pub device: Option<String>,
    pub playback: PlaybackConfig,
    pub http: HttpRangeConfig,
}

/// Output stream plus the two voices and DSP graph it renders.
pub struct LocalHost {
    _stream: cpal::Stream,
    device_name: String,
    sample_rate: u32,
    voices: [Arc<Voice>; 2],
    graph: SharedGraph,
    live: Arc<AtomicBool>,
    events: Sender<HandleEvent>,
    config: LocalHostConfig,
}

impl LocalHost {
    pub fn open(config: LocalHostConfig, events: Sender<HandleEvent>) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, config.device.as_deref())?;
        let device_name = device
            .description()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let supported = device::pick_output_config(&device)?;
        let sample_rate = supported.sample_rate();
        let sample_format = supported.sample_format();
        let stream_config = supported.config();

        let graph = SharedGraph::new(SampleGraph::new(sample_rate));
        let voices = [
            Arc::new(Voice::new(HandleId(1), events.clone())),
            Arc::new(Voice::new(HandleId(2), events.clone())),
        ];
        let live = Arc::new(AtomicBool::new(false));
        let stream = output::build_output_stream(
            &device,
            &stream_config,
            sample_format,
            voices.clone(),
            graph.clone(),
            config.playback.refill_max_frames,
            live.clone(),
        )?;
        stream.play().context("start output stream")?;
        tracing::info!(
            device = %device_name,
            rate = sample_rate,
            channels = stream_config.channels,
            format = ?sample_format,
            "output stream started"
        );

        Ok(Self {
            _stream: stream,
            device_name,
            sample_rate,
            voices,
            graph,
            live,
            events,
            config,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn graph(&self) -> SharedGraph {
        self.graph.clone()
    }

    pub fn decode_handles(&self) -> [Box<dyn DecodeHandle>; 2] {
        self.voices.clone().map(|voice| {
            Box::new(LocalDecodeHandle::new(
                voice,
                self.events.clone(),
                self.live.clone(),
                self.sample_rate,
                self.config.playback.clone(),
                self.config.http.clone(),
            )) as Box<dyn DecodeHandle>
        })
    }
}

struct Binding {
    locator: String,
    generation: Generation,
    mode: LoadMode,
    cancel: Arc<AtomicBool>,
}

struct LoadJob {
    locator: String,
    seek: Option<Duration>,
    buffer_seconds: f32,
    out_rate: u32,
    playback: PlaybackConfig,
    http: HttpRangeConfig,
    cancel: Arc<AtomicBool>,
}

impl LoadJob {
    fn run(&self) -> Result<(Arc<SampleQueue>, Option<Duration>), LoadError> {
        let source = fetch::open_media_source(&self.locator, &self.http, self.cancel.clone())?;
        let stream = decode::start_decode(
            source,
            fetch::hint_for(&self.locator),
            self.seek,
            self.buffer_seconds,
            self.cancel.clone(),
        )?;
        if self.cancel.load(Ordering::Relaxed) {
            stream.queue.close();
            return Err(LoadError::Cancelled);
        }
        let queue = resample::start_resampler(
            stream.queue,
            stream.rate,
            self.out_rate,
            &self.playback,
            self.buffer_seconds,
            self.cancel.clone(),
        )?;
        Ok((queue, stream.duration))
    }
}

/// [`DecodeHandle`] backed by one output [`Voice`]. Each bind or seek spawns a loader
/// thread; superseded loaders are cancelled and never report.
pub struct LocalDecodeHandle {
    voice: Arc<Voice>,
    events: Sender<HandleEvent>,
    live: Arc<AtomicBool>,
    out_rate: u32,
    playback: PlaybackConfig,
    http: HttpRangeConfig,
    current: Option<Binding>,
}

impl LocalDecodeHandle {
    pub fn new(
        voice: Arc<Voice>,
        events: Sender<HandleEvent>,
        live: Arc<AtomicBool>,
        out_rate: u32,
        playback: PlaybackConfig,
        http: HttpRangeConfig,
    ) -> Self {
        Self {
            voice,
            events,
            live,
            out_rate,
            playback,
            http,
            current: None,
        }
    }

    fn cancel_current(&mut self) -> Option<Binding> {
        let binding = self.current.take()?;
        binding.cancel.store(true, Ordering::Relaxed);
        Some(binding)
    }

    fn spawn_load(&mut self, locator: String, generation: Generation, mode: LoadMode, seek: Option<Duration>) {
        self.cancel_current();
        self.voice.reset(generation, seek.unwrap_or_default());
        let cancel = Arc::new(AtomicBool::new(false));
        let job = LoadJob {
            locator: locator.clone(),
            seek,
            buffer_seconds: match mode {
                LoadMode::PreloadFull => self.playback.full_preload_seconds,
                LoadMode::Play | LoadMode::Preload => self.playback.buffer_seconds,
            },
            out_rate: self.out_rate,
            playback: self.playback.clone(),
            http: self.http.clone(),
            cancel: cancel.clone(),
        };
        let handle = self.voice.id();
        let voice = self.voice.clone();
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name(format!("load-{}", handle.0))
            .spawn(move || {
                let result = job.run();
                if job.cancel.load(Ordering::Relaxed) {
                    return;
                }
                let kind = match result {
                    Ok((queue, duration)) => {
                        if !voice.attach(generation, queue) {
                            return;
                        }
                        tracing::debug!(%handle, %generation, "media loaded");
                        HandleEventKind::Loaded { duration }
                    }
                    Err(err) => {
                        tracing::warn!(%handle, %generation, locator = %job.locator, error = %err, "media load failed");
                        HandleEventKind::Failed(err.to_failure())
                    }
                };
                let _ = events.send(HandleEvent {
                    handle,
                    generation,
                    kind,
                });
            });
        if let Err(err) = spawned {
            let _ = self.events.send(HandleEvent {
                handle,
                generation,
                kind: HandleEventKind::Failed(DecodeFailure::new(FailureCode::Other, err.to_string())),
            });
        }
        self.current = Some(Binding {
            locator,
            generation,
            mode,
            cancel,
        });
    }
}

impl DecodeHandle for LocalDecodeHandle {
    fn id(&self) -> HandleId {
        self.voice.id()
    }

    fn bind(&mut self, locator: &str, generation: Generation, mode: LoadMode) {
        self.voice.set_playing(false);
        self.spawn_load(locator.to_string(), generation, mode, None);
    }

    fn abort(&mut self) {
        self.voice.set_playing(false);
        if let Some(binding) = self.cancel_current() {
            self.voice.reset(binding.generation, Duration::ZERO);
        }
    }

    fn start(&mut self) -> Result<(), StartRejected> {
        if !self.live.load(Ordering::Relaxed) {
            return Err(StartRejected);
        }
        self.voice.set_playing(true);
        Ok(())
    }

    fn pause(&mut self) {
        self.voice.set_playing(false);
    }

    fn is_playing(&self) -> bool {
        self.voice.is_playing() && !self.voice.is_starved(self.out_rate)
    }

    fn position(&self) -> Duration {
        self.voice.position(self.out_rate)
    }

    fn seek(&mut self, position: Duration) {
        if self.position() == position {
            return;
        }
        let Some(binding) = self.current.as_ref() else {
            return;
        };
        let (locator, generation, mode) = (binding.locator.clone(), binding.generation, binding.mode);
        self.spawn_load(locator, generation, mode, Some(position));
    }

    fn set_gain(&mut self, gain: f32) {
        self.voice.set_gain(gain);
    }
}

/// 16-bit stereo PCM WAV image with a sawtooth payload.
#[cfg(test)]
pub(crate) fn test_wav(rate: u32, frames: u32) -> Vec<u8> {
    let channels = 2u16;
    let data_len = frames * u32::from(channels) * 2;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * u32::from(channels) * 2).to_le_bytes());
    out.extend_from_slice(&(channels * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames * u32::from(channels) {
        out.extend_from_slice(&((i % 64) as i16 * 100).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;

    fn handle(live: bool) -> (LocalDecodeHandle, Receiver<HandleEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let voice = Arc::new(Voice::new(HandleId(1), tx.clone()));
        let handle = LocalDecodeHandle::new(
            voice,
            tx,
            Arc::new(AtomicBool::new(live)),
            8_000,
            PlaybackConfig::default(),
            HttpRangeConfig::default(),
        );
        (handle, rx)
    }

    fn wav_file(name: &str) -> String {
        let path = std::env::temp_dir().join(format!("widget-engine-{}-{name}.wav", std::process::id()));
        std::fs::write(&path, test_wav(8_000, 8_000)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn next_event(rx: &Receiver<HandleEvent>) -> HandleEvent {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn bind_reports_loaded_with_duration() {
        let (mut handle, rx) = handle(true);
        let path = wav_file("loaded");
        handle.bind(&path, Generation(4), LoadMode::Play);
        let event = next_event(&rx);
        assert_eq!(event.generation, Generation(4));
        assert_eq!(
            event.kind,
            HandleEventKind::Loaded {
                duration: Some(Duration::from_secs(1))
            }
        );
        assert!(handle.start().is_ok());
        assert!(handle.is_playing());
        handle.pause();
        assert!(!handle.is_playing());
    }

    #[test]
    fn missing_file_fails_with_generation() {
        let (mut handle, rx) = handle(true);
        handle.bind("/definitely/not/here.flac", Generation(2), LoadMode::Preload);
        let event = next_event(&rx);
        assert_eq!(event.generation, Generation(2));
        assert!(matches!(event.kind, HandleEventKind::Failed(ref f) if f.code == FailureCode::Network));
    }

    #[test]
    fn start_is_rejected_without_live_output() {
        let (mut handle, _rx) = handle(false);
        assert_eq!(handle.start(), Err(StartRejected));
        assert!(!handle.is_playing());
    }

    #[test]
    fn seek_reloads_from_offset_with_same_generation() {
        let (mut handle, rx) = handle(true);
        let path = wav_file("seek");
        handle.bind(&path, Generation(9), LoadMode::Play);
        next_event(&rx);
        handle.seek(Duration::ZERO);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        handle.seek(Duration::from_millis(500));
        let event = next_event(&rx);
        assert_eq!(event.generation, Generation(9));
        assert!(matches!(event.kind, HandleEventKind::Loaded { .. }));
        assert_eq!(handle.position(), Duration::from_millis(500));
    }

    #[test]
    fn wav_is_natively_playable() {
        let caps = probe_capabilities();
        assert!(caps.wav && caps.flac && caps.mp3);
        assert!(!caps.opus_ogg);
    }
}
