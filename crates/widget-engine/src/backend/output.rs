//! CPAL output stage: mixes both decode voices, routing wrapped ones through the DSP graph.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;
use crossbeam_channel::Sender;

use crate::backend::buffer::{PopStrategy, SampleQueue};
use crate::dsp::SharedGraph;
use crate::host::{Generation, HandleEvent, HandleEventKind, HandleId};

/// Starvation longer than this counts as a stall.
const STALL_AFTER: Duration = Duration::from_millis(250);

/// Playback state of one decode handle, shared with the output callback.
pub struct Voice {
    id: HandleId,
    events: Sender<HandleEvent>,
    state: Mutex<VoiceState>,
}

#[derive(Default)]
pub struct VoiceState {
    generation: Generation,
    source: Option<Arc<SampleQueue>>,
    pending: Vec<f32>,
    cursor: usize,
    playing: bool,
    gain: f32,
    played_frames: u64,
    offset: Duration,
    ended: bool,
    /// Frames requested in a row while the source had nothing buffered.
    starved_frames: u64,
}

impl Voice {
    pub fn new(id: HandleId, events: Sender<HandleEvent>) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(VoiceState::default()),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, VoiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detach the current source and start counting from `offset` for `generation`.
    pub fn reset(&self, generation: Generation, offset: Duration) {
        let mut st = self.lock();
        if let Some(source) = st.source.take() {
            source.close();
        }
        st.generation = generation;
        st.pending.clear();
        st.cursor = 0;
        st.played_frames = 0;
        st.offset = offset;
        st.ended = false;
        st.starved_frames = 0;
    }

    /// Attach a decoded source unless the voice moved on to another generation meanwhile.
    pub fn attach(&self, generation: Generation, source: Arc<SampleQueue>) -> bool {
        let mut st = self.lock();
        if st.generation != generation {
            source.close();
            return false;
        }
        st.source = Some(source);
        true
    }

    pub fn set_playing(&self, playing: bool) {
        self.lock().playing = playing;
    }

    pub fn set_gain(&self, gain: f32) {
        self.lock().gain = gain;
    }

    pub fn is_playing(&self) -> bool {
        let st = self.lock();
        st.playing && !st.ended
    }

    /// Playing, but the source has run dry for longer than [`STALL_AFTER`].
    pub fn is_starved(&self, rate: u32) -> bool {
        let st = self.lock();
        let limit = (STALL_AFTER.as_secs_f64() * f64::from(rate.max(1))) as u64;
        st.playing && !st.ended && st.starved_frames >= limit.max(1)
    }

    pub fn position(&self, rate: u32) -> Duration {
        let st = self.lock();
        let played = Duration::from_secs_f64(st.played_frames as f64 / f64::from(rate.max(1)));
        st.offset + played
    }

    /// Next stereo frame, or `None` when paused or starved. Reports the natural end once.
    fn pull(&self, st: &mut VoiceState, refill_max_frames: usize) -> Option<[f32; 2]> {
        if !st.playing || st.ended {
            return None;
        }
        let source = st.source.clone()?;
        let channels = source.channels();
        if st.cursor + channels > st.pending.len() {
            st.cursor = 0;
            match source.pop(PopStrategy::NonBlocking {
                max_frames: refill_max_frames,
            }) {
                Some(block) => {
                    st.pending = block;
                    st.starved_frames = 0;
                }
                None => {
                    st.pending.clear();
                    if !source.is_drained() {
                        st.starved_frames += 1;
                    } else {
                        st.ended = true;
                        let _ = self.events.send(HandleEvent {
                            handle: self.id,
                            generation: st.generation,
                            kind: HandleEventKind::Ended,
                        });
                    }
                    return None;
                }
            }
        }
        let frame = &st.pending[st.cursor..st.cursor + channels];
        let stereo = match channels {
            1 => [frame[0], frame[0]],
            _ => [frame[0], frame[1]],
        };
        st.cursor += channels;
        st.played_frames += 1;
        Some([stereo[0] * st.gain, stereo[1] * st.gain])
    }
}

/// Mix one callback's worth of interleaved `f32` output.
pub fn render_block(out: &mut [f32], channels_out: usize, voices: &[Arc<Voice>], graph: &SharedGraph, refill_max_frames: usize) {
    let mut states: Vec<MutexGuard<'_, VoiceState>> = voices.iter().map(|v| v.lock()).collect();
    let mut graph = graph.lock();
    let wrapped: Vec<bool> = voices.iter().map(|v| graph.is_wrapped(v.id())).collect();
    let use_graph = graph.has_sources();
    let mut inputs = Vec::with_capacity(voices.len());

    for frame in out.chunks_mut(channels_out.max(1)) {
        inputs.clear();
        let mut direct = [0.0f32; 2];
        for (index, voice) in voices.iter().enumerate() {
            let Some(sample) = voice.pull(&mut states[index], refill_max_frames) else {
                continue;
            };
            if wrapped[index] {
                inputs.push((voice.id(), sample));
            } else {
                direct[0] += sample[0];
                direct[1] += sample[1];
            }
        }
        let processed = if use_graph { graph.render(&inputs) } else { [0.0; 2] };
        let mix = [direct[0] + processed[0], direct[1] + processed[1]];
        match frame.len() {
            1 => frame[0] = 0.5 * (mix[0] + mix[1]),
            _ => {
                frame[0] = mix[0];
                frame[1] = mix[1];
                frame[2..].fill(0.0);
            }
        }
    }
}

/// Build the output stream in the device's sample format.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    voices: [Arc<Voice>; 2],
    graph: SharedGraph,
    refill_max_frames: usize,
    live: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, voices, graph, refill_max_frames, live),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, voices, graph, refill_max_frames, live),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, voices, graph, refill_max_frames, live),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, voices, graph, refill_max_frames, live),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    voices: [Arc<Voice>; 2],
    graph: SharedGraph,
    refill_max_frames: usize,
    live: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = usize::from(config.channels);
    let refill_max_frames = refill_max_frames.max(1);
    let mut scratch: Vec<f32> = Vec::new();
    let live_on_error = live.clone();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            scratch.resize(data.len(), 0.0);
            render_block(&mut scratch, channels_out, &voices, &graph, refill_max_frames);
            for (dst, src) in data.iter_mut().zip(&scratch) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        move |err| {
            tracing::warn!(error = %err, "output stream error");
            live_on_error.store(false, Ordering::Relaxed);
        },
        None,
    )?;
    live.store(true, Ordering::Relaxed);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::{AudioGraph, NodeSpec, SampleGraph};

    fn voice(id: u32) -> (Arc<Voice>, crossbeam_channel::Receiver<HandleEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Voice::new(HandleId(id), tx)), rx)
    }

    fn queue(samples: &[f32], channels: usize) -> Arc<SampleQueue> {
        let q = Arc::new(SampleQueue::new(channels, 1024));
        q.push_blocking(samples);
        q.close();
        q
    }

    #[test]
    fn paused_voice_outputs_silence() {
        let (v, _) = voice(1);
        v.reset(Generation(1), Duration::ZERO);
        v.attach(Generation(1), queue(&[0.5, 0.5], 2));
        v.set_gain(1.0);
        let graph = SharedGraph::new(SampleGraph::new(48_000));
        let mut out = [1.0f32; 4];
        render_block(&mut out, 2, &[v.clone()], &graph, 64);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(v.position(48_000), Duration::ZERO);
    }

    #[test]
    fn mono_source_is_duplicated_and_gain_applied() {
        let (v, _) = voice(1);
        v.reset(Generation(1), Duration::ZERO);
        v.attach(Generation(1), queue(&[1.0, 0.5], 1));
        v.set_gain(0.5);
        v.set_playing(true);
        let graph = SharedGraph::new(SampleGraph::new(48_000));
        let mut out = [0.0f32; 4];
        render_block(&mut out, 2, &[v], &graph, 64);
        assert_eq!(out, [0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn end_of_source_reports_once() {
        let (v, rx) = voice(3);
        v.reset(Generation(7), Duration::from_secs(1));
        v.attach(Generation(7), queue(&[0.1, 0.1], 2));
        v.set_gain(1.0);
        v.set_playing(true);
        let graph = SharedGraph::new(SampleGraph::new(48_000));
        let mut out = [0.0f32; 8];
        render_block(&mut out, 2, &[v.clone()], &graph, 64);
        render_block(&mut out, 2, &[v.clone()], &graph, 64);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].generation, Generation(7));
        assert_eq!(events[0].kind, HandleEventKind::Ended);
        assert!(!v.is_playing());
        assert_eq!(v.position(48_000), Duration::from_secs(1) + Duration::from_secs_f64(1.0 / 48_000.0));
    }

    #[test]
    fn dry_source_reads_as_starved_until_refilled() {
        let (v, _) = voice(1);
        v.reset(Generation(1), Duration::ZERO);
        let q = Arc::new(SampleQueue::new(2, 1024));
        v.attach(Generation(1), q.clone());
        v.set_gain(1.0);
        v.set_playing(true);
        let graph = SharedGraph::new(SampleGraph::new(48_000));
        let mut out = [0.0f32; 64];
        render_block(&mut out, 2, &[v.clone()], &graph, 64);
        assert!(v.is_playing());
        assert!(v.is_starved(100));
        assert!(!v.is_starved(48_000));

        q.push_blocking(&[0.2, 0.2]);
        render_block(&mut out[..2], 2, &[v.clone()], &graph, 64);
        assert!(!v.is_starved(100));
    }

    #[test]
    fn stale_attach_is_refused() {
        let (v, _) = voice(1);
        v.reset(Generation(2), Duration::ZERO);
        let q = queue(&[0.0, 0.0], 2);
        assert!(!v.attach(Generation(1), q.clone()));
        assert!(q.is_closed());
    }

    #[test]
    fn wrapped_voice_goes_through_graph() {
        let (v, _) = voice(1);
        v.reset(Generation(1), Duration::ZERO);
        v.attach(Generation(1), queue(&[1.0, 1.0], 2));
        v.set_gain(1.0);
        v.set_playing(true);
        let mut graph = SharedGraph::new(SampleGraph::new(48_000));
        let src = graph.wrap_source(HandleId(1)).unwrap();
        let half = graph.create(NodeSpec::Gain(0.5)).unwrap();
        let dest = graph.destination();
        graph.connect(src, 0, half, 0).unwrap();
        graph.connect(half, 0, dest, 0).unwrap();
        let mut out = [0.0f32; 2];
        render_block(&mut out, 2, &[v], &graph, 64);
        assert_eq!(out, [0.5, 0.5]);
    }

    #[test]
    fn mono_output_downmixes() {
        let (v, _) = voice(1);
        v.reset(Generation(1), Duration::ZERO);
        v.attach(Generation(1), queue(&[1.0, 0.0], 2));
        v.set_gain(1.0);
        v.set_playing(true);
        let graph = SharedGraph::new(SampleGraph::new(48_000));
        let mut out = [0.0f32; 1];
        render_block(&mut out, 1, &[v], &graph, 64);
        assert_eq!(out, [0.5]);
    }
}
