//! In-process [`AudioGraph`] rendered frame by frame from the output callback.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::GraphError;
use crate::host::HandleId;

use super::filters::{Biquad, Coefficients, Compressor};
use super::graph::{AudioGraph, NodeId, NodeSpec};

const DESTINATION: NodeId = NodeId(0);
const MAX_PORTS: usize = 2;
const SILENT: [f32; 2] = [0.0; 2];

type Ports = [[f32; 2]; MAX_PORTS];

#[derive(Debug)]
enum Processor {
    Destination,
    Source(HandleId),
    Gain(f32),
    Biquad([Biquad; 2]),
    Compressor(Compressor),
    Splitter,
    Merger,
}

#[derive(Debug)]
struct RenderNode {
    processor: Processor,
    inputs: usize,
    outputs: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Edge {
    from: NodeId,
    output: usize,
    to: NodeId,
    input: usize,
}

#[derive(Debug)]
struct Step {
    node: NodeId,
    /// `(step index of the upstream node, its output port, our input port)`
    incoming: Vec<(usize, usize, usize)>,
}

#[derive(Debug, Default)]
struct Plan {
    steps: Vec<Step>,
    outputs: Vec<Ports>,
}

/// Stereo signal graph with real biquad, compressor and channel-routing nodes.
///
/// Mono signals (splitter outputs) travel as identical left/right pairs; merger inputs
/// downmix whatever reaches them.
#[derive(Debug)]
pub struct SampleGraph {
    sample_rate: f32,
    nodes: BTreeMap<NodeId, RenderNode>,
    next_id: u32,
    edges: Vec<Edge>,
    sources: HashMap<HandleId, NodeId>,
    plan: Option<Plan>,
}

impl SampleGraph {
    pub fn new(sample_rate: u32) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            DESTINATION,
            RenderNode {
                processor: Processor::Destination,
                inputs: 1,
                outputs: 0,
            },
        );
        Self {
            sample_rate: sample_rate as f32,
            nodes,
            next_id: 1,
            edges: Vec::new(),
            sources: HashMap::new(),
            plan: None,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Whether `handle` is routed through the graph instead of straight to the device.
    pub fn is_wrapped(&self, handle: HandleId) -> bool {
        self.sources.contains_key(&handle)
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn insert(&mut self, processor: Processor, inputs: usize, outputs: usize) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            RenderNode {
                processor,
                inputs,
                outputs,
            },
        );
        self.plan = None;
        id
    }

    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = Vec::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if seen.contains(&node) {
                continue;
            }
            seen.push(node);
            stack.extend(self.edges.iter().filter(|e| e.from == node).map(|e| e.to));
        }
        false
    }

    /// Kahn's algorithm over the current nodes and edges.
    fn compile(&self) -> Plan {
        let mut indegree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        for edge in &self.edges {
            if let Some(count) = indegree.get_mut(&edge.to) {
                *count += 1;
            }
        }
        let mut ready: Vec<NodeId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop() {
            order.push(node);
            for edge in self.edges.iter().filter(|e| e.from == node) {
                if let Some(count) = indegree.get_mut(&edge.to) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(edge.to);
                    }
                }
            }
        }
        let position: HashMap<NodeId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let steps = order
            .iter()
            .map(|node| Step {
                node: *node,
                incoming: self
                    .edges
                    .iter()
                    .filter(|e| e.to == *node)
                    .filter_map(|e| position.get(&e.from).map(|src| (*src, e.output, e.input)))
                    .collect(),
            })
            .collect::<Vec<_>>();
        let outputs = vec![[SILENT; MAX_PORTS]; steps.len()];
        Plan { steps, outputs }
    }

    /// Render one frame. `inputs` carries the current frame of every wrapped handle.
    pub fn render(&mut self, inputs: &[(HandleId, [f32; 2])]) -> [f32; 2] {
        if self.plan.is_none() {
            self.plan = Some(self.compile());
        }
        let Self { plan, nodes, .. } = self;
        let Some(Plan { steps, outputs }) = plan.as_mut() else {
            return SILENT;
        };
        let mut result = SILENT;
        for (index, step) in steps.iter().enumerate() {
            let mut ins = [SILENT; MAX_PORTS];
            for &(src, output, input) in &step.incoming {
                let v = outputs[src][output];
                ins[input][0] += v[0];
                ins[input][1] += v[1];
            }
            let Some(node) = nodes.get_mut(&step.node) else {
                continue;
            };
            let out: Ports = match &mut node.processor {
                Processor::Destination => {
                    result = ins[0];
                    [SILENT; MAX_PORTS]
                }
                Processor::Source(handle) => {
                    let frame = inputs
                        .iter()
                        .find(|(id, _)| *id == *handle)
                        .map(|(_, frame)| *frame)
                        .unwrap_or(SILENT);
                    [frame, SILENT]
                }
                Processor::Gain(gain) => [[ins[0][0] * *gain, ins[0][1] * *gain], SILENT],
                Processor::Biquad([left, right]) => {
                    [[left.process(ins[0][0]), right.process(ins[0][1])], SILENT]
                }
                Processor::Compressor(comp) => [comp.process_stereo(ins[0]), SILENT],
                Processor::Splitter => [[ins[0][0]; 2], [ins[0][1]; 2]],
                Processor::Merger => [
                    [0.5 * (ins[0][0] + ins[0][1]), 0.5 * (ins[1][0] + ins[1][1])],
                    SILENT,
                ],
            };
            outputs[index] = out;
        }
        result
    }
}

impl AudioGraph for SampleGraph {
    fn wrap_source(&mut self, handle: HandleId) -> Result<NodeId, GraphError> {
        if self.sources.contains_key(&handle) {
            return Err(GraphError::AlreadyWrapped(handle));
        }
        let id = self.insert(Processor::Source(handle), 0, 1);
        self.sources.insert(handle, id);
        Ok(id)
    }

    fn create(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let rate = self.sample_rate;
        let id = match spec {
            NodeSpec::Gain(gain) => self.insert(Processor::Gain(gain), 1, 1),
            NodeSpec::Biquad {
                kind,
                freq_hz,
                q,
                gain_db,
            } => {
                let coeffs = Coefficients::design(kind, freq_hz, q, gain_db, rate);
                self.insert(
                    Processor::Biquad([Biquad::new(coeffs), Biquad::new(coeffs)]),
                    1,
                    1,
                )
            }
            NodeSpec::Compressor(params) => {
                self.insert(Processor::Compressor(Compressor::new(&params, rate)), 1, 1)
            }
            NodeSpec::Splitter { outputs } => self.insert(Processor::Splitter, 1, outputs.min(MAX_PORTS)),
            NodeSpec::Merger { inputs } => self.insert(Processor::Merger, inputs.min(MAX_PORTS), 1),
        };
        Ok(id)
    }

    fn connect(&mut self, from: NodeId, output: usize, to: NodeId, input: usize) -> Result<(), GraphError> {
        let src = self.nodes.get(&from).ok_or(GraphError::UnknownNode(from))?;
        if output >= src.outputs {
            return Err(GraphError::InvalidPort { node: from, port: output });
        }
        let dst = self.nodes.get(&to).ok_or(GraphError::UnknownNode(to))?;
        if input >= dst.inputs {
            return Err(GraphError::InvalidPort { node: to, port: input });
        }
        if self.reaches(to, from) {
            return Err(GraphError::Cycle { from, to });
        }
        let edge = Edge {
            from,
            output,
            to,
            input,
        };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
            self.plan = None;
        }
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) {
        self.edges.retain(|e| e.from != node);
        self.plan = None;
    }

    fn release(&mut self, node: NodeId) {
        if node == DESTINATION || self.sources.values().any(|id| *id == node) {
            return;
        }
        self.nodes.remove(&node);
        self.edges.retain(|e| e.from != node && e.to != node);
        self.plan = None;
    }

    fn destination(&self) -> NodeId {
        DESTINATION
    }

    fn magnitude_response(&mut self, node: NodeId, freq_hz: f32) -> Result<f32, GraphError> {
        let entry = self.nodes.get(&node).ok_or(GraphError::UnknownNode(node))?;
        Ok(match &entry.processor {
            Processor::Biquad([left, _]) => left.coefficients().magnitude_at(freq_hz, self.sample_rate),
            Processor::Gain(gain) => gain.abs(),
            _ => 1.0,
        })
    }
}

/// [`SampleGraph`] shared between the engine thread and the output callback.
#[derive(Clone, Debug)]
pub struct SharedGraph(Arc<Mutex<SampleGraph>>);

impl SharedGraph {
    pub fn new(graph: SampleGraph) -> Self {
        Self(Arc::new(Mutex::new(graph)))
    }

    pub fn lock(&self) -> MutexGuard<'_, SampleGraph> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioGraph for SharedGraph {
    fn wrap_source(&mut self, handle: HandleId) -> Result<NodeId, GraphError> {
        self.lock().wrap_source(handle)
    }

    fn create(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        self.lock().create(spec)
    }

    fn connect(&mut self, from: NodeId, output: usize, to: NodeId, input: usize) -> Result<(), GraphError> {
        self.lock().connect(from, output, to, input)
    }

    fn disconnect(&mut self, node: NodeId) {
        self.lock().disconnect(node)
    }

    fn release(&mut self, node: NodeId) {
        self.lock().release(node)
    }

    fn destination(&self) -> NodeId {
        DESTINATION
    }

    fn magnitude_response(&mut self, node: NodeId, freq_hz: f32) -> Result<f32, GraphError> {
        self.lock().magnitude_response(node, freq_hz)
    }
}
