use std::collections::BTreeMap;

use crate::error::GraphError;
use crate::host::HandleId;
use crate::settings::{CompressorSettings, EQ_BANDS, Settings};

use super::calibration::{BAND_FREQS, CalibrationProfile};
use super::filters::{BiquadKind, db_to_linear};
use super::graph::{AudioGraph, NodeId, NodeSpec};

/// Headroom applied ahead of the EQ, before the user boost.
pub const BASE_PREGAIN: f32 = 0.94;

/// One stage of the processing chain, in signal order.
#[derive(Clone, Debug, PartialEq)]
pub enum StageDescriptor {
    Compressor(CompressorSettings),
    /// Linear gain.
    Pregain(f32),
    Band {
        kind: BiquadKind,
        freq_hz: f32,
        q: f32,
        gain_db: f32,
    },
    /// Width in `[0, 1)`; `1` needs no stage.
    Width(f32),
}

/// Builds the compressor → pregain → EQ → width chain into an [`AudioGraph`].
///
/// Every wrapped handle feeds a shared input bus, so a rebuild only replaces the nodes
/// behind the bus and the source wrappers stay untouched.
#[derive(Debug)]
pub struct DspChain {
    profile: CalibrationProfile,
    /// Append-only: a handle is wrapped at most once for its lifetime.
    sources: BTreeMap<HandleId, NodeId>,
    bus: Option<NodeId>,
    nodes: Vec<NodeId>,
    applied: Vec<StageDescriptor>,
}

impl DspChain {
    pub fn new(profile: CalibrationProfile) -> Self {
        Self {
            profile,
            sources: BTreeMap::new(),
            bus: None,
            nodes: Vec::new(),
            applied: Vec::new(),
        }
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    /// Stages currently built into the graph.
    pub fn applied(&self) -> &[StageDescriptor] {
        &self.applied
    }

    pub fn is_wrapped(&self, handle: HandleId) -> bool {
        self.sources.contains_key(&handle)
    }

    /// Whether `settings` change the signal at all.
    pub fn needs_graph(settings: &Settings) -> bool {
        settings.eq_enabled
            || settings.compressor_enabled
            || settings.boost_db != 0.0
            || settings.width < 1.0
    }

    /// Stage list for `settings`; empty when the signal passes through unchanged.
    pub fn describe(&self, settings: &Settings) -> Vec<StageDescriptor> {
        if !Self::needs_graph(settings) {
            return Vec::new();
        }
        let mut stages = Vec::with_capacity(EQ_BANDS + 3);
        if settings.compressor_enabled {
            stages.push(StageDescriptor::Compressor(settings.compressor));
        }
        stages.push(StageDescriptor::Pregain(BASE_PREGAIN * db_to_linear(settings.boost_db)));
        if settings.eq_enabled {
            for (i, band) in self.profile.bands.iter().enumerate() {
                stages.push(StageDescriptor::Band {
                    kind: CalibrationProfile::kind_of(i),
                    freq_hz: BAND_FREQS[i],
                    q: band.q,
                    gain_db: settings.eq_gains[i] * band.gain_scale,
                });
            }
        }
        let width = settings.width.clamp(0.0, 1.0);
        if width < 1.0 {
            stages.push(StageDescriptor::Width(width));
        }
        stages
    }

    /// Rebuild the chain for `settings` and make sure `handle` is routed through it.
    pub fn rebuild(&mut self, graph: &mut dyn AudioGraph, handle: HandleId, settings: &Settings) -> Result<(), GraphError> {
        let stages = self.describe(settings);
        if !stages.is_empty() && !self.sources.contains_key(&handle) {
            let bus = self.bus(graph)?;
            let source = graph.wrap_source(handle)?;
            self.sources.insert(handle, source);
            graph.connect(source, 0, bus, 0)?;
            tracing::debug!(handle = %handle, node = %source, "wrapped decode handle");
        }
        let Some(bus) = self.bus else {
            self.applied = stages;
            return Ok(());
        };

        self.teardown(graph, bus);
        if let Err(err) = self.build(graph, bus, &stages) {
            tracing::warn!(error = %err, "dsp chain build failed; routing input straight to output");
            self.teardown(graph, bus);
            self.applied.clear();
            let destination = graph.destination();
            graph.connect(bus, 0, destination, 0)?;
            return Err(err);
        }
        tracing::debug!(stages = stages.len(), nodes = self.nodes.len(), "dsp chain rebuilt");
        self.applied = stages;
        Ok(())
    }

    fn bus(&mut self, graph: &mut dyn AudioGraph) -> Result<NodeId, GraphError> {
        if let Some(bus) = self.bus {
            return Ok(bus);
        }
        let bus = graph.create(NodeSpec::Gain(1.0))?;
        self.bus = Some(bus);
        Ok(bus)
    }

    fn teardown(&mut self, graph: &mut dyn AudioGraph, bus: NodeId) {
        graph.disconnect(bus);
        for node in self.nodes.drain(..) {
            graph.disconnect(node);
            graph.release(node);
        }
    }

    fn add(&mut self, graph: &mut dyn AudioGraph, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let node = graph.create(spec)?;
        self.nodes.push(node);
        Ok(node)
    }

    fn build(&mut self, graph: &mut dyn AudioGraph, bus: NodeId, stages: &[StageDescriptor]) -> Result<(), GraphError> {
        let mut tail = bus;
        for stage in stages {
            tail = match stage {
                StageDescriptor::Compressor(params) => {
                    let node = self.add(graph, NodeSpec::Compressor(*params))?;
                    graph.connect(tail, 0, node, 0)?;
                    node
                }
                StageDescriptor::Pregain(gain) => {
                    let node = self.add(graph, NodeSpec::Gain(*gain))?;
                    graph.connect(tail, 0, node, 0)?;
                    node
                }
                StageDescriptor::Band {
                    kind,
                    freq_hz,
                    q,
                    gain_db,
                } => {
                    let node = self.add(
                        graph,
                        NodeSpec::Biquad {
                            kind: *kind,
                            freq_hz: *freq_hz,
                            q: *q,
                            gain_db: *gain_db,
                        },
                    )?;
                    graph.connect(tail, 0, node, 0)?;
                    node
                }
                StageDescriptor::Width(width) => self.build_width(graph, tail, *width)?,
            };
        }
        let destination = graph.destination();
        graph.connect(tail, 0, destination, 0)
    }

    /// split → four cross gains → merge. `L' = aL + bR`, `R' = bL + aR`.
    fn build_width(&mut self, graph: &mut dyn AudioGraph, tail: NodeId, width: f32) -> Result<NodeId, GraphError> {
        let direct = (1.0 + width) / 2.0;
        let cross = (1.0 - width) / 2.0;
        let split = self.add(graph, NodeSpec::Splitter { outputs: 2 })?;
        let merge = self.add(graph, NodeSpec::Merger { inputs: 2 })?;
        graph.connect(tail, 0, split, 0)?;
        for (from_channel, to_channel, gain) in [(0, 0, direct), (1, 0, cross), (0, 1, cross), (1, 1, direct)] {
            let node = self.add(graph, NodeSpec::Gain(gain))?;
            graph.connect(split, from_channel, node, 0)?;
            graph.connect(node, 0, merge, to_channel)?;
        }
        Ok(merge)
    }
}
