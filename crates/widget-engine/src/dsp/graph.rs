use std::fmt;

use crate::error::GraphError;
use crate::host::HandleId;
use crate::settings::CompressorSettings;

use super::filters::BiquadKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Processing node kinds an [`AudioGraph`] can create.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeSpec {
    Gain(f32),
    Biquad {
        kind: BiquadKind,
        freq_hz: f32,
        q: f32,
        gain_db: f32,
    },
    Compressor(CompressorSettings),
    /// Stereo input to `outputs` mono outputs, one per channel.
    Splitter { outputs: usize },
    /// `inputs` mono inputs to one stereo output.
    Merger { inputs: usize },
}

/// Host signal graph that the DSP chain is built into.
pub trait AudioGraph {
    /// Route a decode handle's output through a new source node. A handle may only be
    /// wrapped once; its direct output to the device stops when it is.
    fn wrap_source(&mut self, handle: HandleId) -> Result<NodeId, GraphError>;
    fn create(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError>;
    fn connect(&mut self, from: NodeId, output: usize, to: NodeId, input: usize) -> Result<(), GraphError>;
    /// Remove every outgoing connection of `node`.
    fn disconnect(&mut self, node: NodeId);
    /// Drop a node created with [`AudioGraph::create`]. Source nodes are never released.
    fn release(&mut self, node: NodeId);
    /// The device sink.
    fn destination(&self) -> NodeId;
    /// Linear magnitude response of `node` at `freq_hz`.
    fn magnitude_response(&mut self, node: NodeId, freq_hz: f32) -> Result<f32, GraphError>;
}
