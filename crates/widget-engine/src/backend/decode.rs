//! Symphonia decode stage.
//!
//! Probes the container synchronously so format errors surface before anything is
//! reported as loaded, then decodes on a background thread into a [`SampleQueue`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::backend::buffer::{SampleQueue, capacity_for};
use crate::error::LoadError;

/// A running decode: the queue it fills and what the container told us.
pub struct DecodedStream {
    pub queue: Arc<SampleQueue>,
    pub rate: u32,
    pub channels: usize,
    pub duration: Option<Duration>,
}

fn load_error(err: SymphoniaError) -> LoadError {
    match err {
        SymphoniaError::Unsupported(what) => LoadError::Unsupported(what.to_string()),
        SymphoniaError::IoError(io) => LoadError::Http(io.to_string()),
        other => LoadError::Decode(other.to_string()),
    }
}

/// Probe `source` and start decoding from `seek` on a background thread.
///
/// The thread stops when the source ends, `cancel` is raised or the queue is closed by
/// its consumer; the queue is closed in every case.
pub fn start_decode(
    source: Box<dyn MediaSource>,
    hint: Hint,
    seek: Option<Duration>,
    buffer_seconds: f32,
    cancel: Arc<AtomicBool>,
) -> Result<DecodedStream, LoadError> {
    let mss = MediaSourceStream::new(source, Default::default());
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(load_error)?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| LoadError::Unsupported("no default audio track".to_string()))?;
    let params = track.codec_params.clone();
    let track_id = track.id;
    let channels = params
        .channels
        .ok_or_else(|| LoadError::Unsupported("unknown channel layout".to_string()))?
        .count();
    let rate = params
        .sample_rate
        .ok_or_else(|| LoadError::Unsupported("unknown sample rate".to_string()))?;
    let duration = duration_from_params(&params);

    let decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(load_error)?;

    if let Some(position) = seek.filter(|p| !p.is_zero()) {
        let time = Time::new(position.as_secs(), f64::from(position.subsec_millis()) / 1000.0);
        if let Err(err) = format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(track_id),
            },
        ) {
            tracing::warn!(error = %err, position_ms = position.as_millis() as u64, "seek failed; decoding from start");
        }
    }

    let queue = Arc::new(SampleQueue::new(channels, capacity_for(rate, channels, buffer_seconds)));
    let producer = queue.clone();
    thread::spawn(move || {
        if let Err(err) = decode_loop(format, decoder, track_id, &producer, &cancel) {
            tracing::warn!(error = %err, "decoder thread stopped");
        }
        producer.close();
    });

    Ok(DecodedStream {
        queue,
        rate,
        channels,
        duration,
    })
}

fn decode_loop(
    mut format: Box<dyn FormatReader>,
    mut decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    queue: &SampleQueue,
    cancel: &AtomicBool,
) -> Result<(), LoadError> {
    let mut corrupt = 0usize;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(err) => return Err(load_error(err)),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(detail)) => {
                corrupt += 1;
                tracing::debug!(detail, corrupt, "skipping corrupt packet");
                continue;
            }
            Err(err) => return Err(load_error(err)),
        };
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buf.copy_interleaved_ref(decoded);
        if !queue.push_blocking(buf.samples()) {
            return Ok(());
        }
    }
}

/// Container-reported duration, when both frame count and rate are known.
pub fn duration_from_params(params: &CodecParameters) -> Option<Duration> {
    let frames = params.n_frames?;
    let rate = u64::from(params.sample_rate?);
    if rate == 0 {
        return None;
    }
    Some(Duration::from_millis(frames.saturating_mul(1000) / rate))
}
