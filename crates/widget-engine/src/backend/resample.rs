//! Rubato sinc resampler between the decoder queue and the output rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::backend::buffer::{PopStrategy, SampleQueue, capacity_for};
use crate::config::PlaybackConfig;
use crate::error::LoadError;

fn sinc_parameters() -> SincInterpolationParameters {
    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    }
}

struct Stage {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    out: Vec<f32>,
    indexing: Indexing,
}

impl Stage {
    /// Resample one block; `partial` marks a short final block.
    fn process(&mut self, input: &[f32], partial: Option<usize>) -> Result<&[f32], LoadError> {
        let frames = input.len() / self.channels;
        let input = InterleavedSlice::new(input, self.channels, frames)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        let capacity = self.out.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.out, self.channels, capacity)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial;
        let (_, produced) = self
            .resampler
            .process_into_buffer(&input, &mut output, Some(&self.indexing))
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        Ok(&self.out[..produced * self.channels])
    }
}

/// Feed `source` (at `src_rate`) through a resampler into a new queue at `dst_rate`.
/// Equal rates pass the source queue through untouched.
pub fn start_resampler(
    source: Arc<SampleQueue>,
    src_rate: u32,
    dst_rate: u32,
    config: &PlaybackConfig,
    buffer_seconds: f32,
    cancel: Arc<AtomicBool>,
) -> Result<Arc<SampleQueue>, LoadError> {
    if src_rate == dst_rate {
        return Ok(source);
    }
    let channels = source.channels();
    let chunk = config.chunk_frames.max(1);
    let resampler = Async::<f32>::new_sinc(
        f64::from(dst_rate) / f64::from(src_rate),
        1.1,
        &sinc_parameters(),
        chunk,
        channels,
        FixedAsync::Input,
    )
    .map_err(|e| LoadError::Resample(e.to_string()))?;

    let sink = Arc::new(SampleQueue::new(channels, capacity_for(dst_rate, channels, buffer_seconds)));
    let producer = sink.clone();
    let mut stage = Stage {
        resampler: Box::new(resampler),
        channels,
        out: vec![0.0; channels * chunk * 3],
        indexing: Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        },
    };

    thread::spawn(move || {
        let cancelled = || cancel.load(Ordering::Relaxed);
        while let Some(block) = source.pop(PopStrategy::BlockingExact { frames: chunk }) {
            if cancelled() {
                break;
            }
            match stage.process(&block, None) {
                Ok(out) => {
                    if !producer.push_blocking(out) {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "resampler stopped");
                    break;
                }
            }
        }
        while !cancelled() {
            let Some(tail) = source.pop(PopStrategy::BlockingUpTo { max_frames: chunk }) else {
                break;
            };
            let frames = tail.len() / channels;
            match stage.process(&tail, Some(frames)) {
                Ok(out) if !out.is_empty() => {
                    producer.push_blocking(out);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "resampler tail failed");
                    break;
                }
            }
        }
        source.close();
        producer.close();
    });

    Ok(sink)
}
