//! Recording fakes for the host seams, shared by the unit tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use widget_types::{Direction, NowPlayingMetadata, PositionState, SurfacePlaybackState, TransportAction};

use crate::codec::ResourceProbe;
use crate::dsp::{AudioGraph, Coefficients, NodeId, NodeSpec, db_to_linear};
use crate::error::{GraphError, SettingsError};
use crate::host::{DecodeHandle, Generation, HandleId, LoadMode, StartRejected};
use crate::settings::{MemorySettingsStore, Settings, SettingsStore};
use crate::surface::ControlSurface;
use crate::traversal::TraversalSource;

#[derive(Debug, Default)]
pub struct HandleLog {
    pub binds: Vec<(String, Generation, LoadMode)>,
    pub aborts: usize,
    pub starts: usize,
    /// Upcoming `start` calls to reject.
    pub reject_starts: usize,
    pub playing: bool,
    pub position: Duration,
    pub seeks: Vec<Duration>,
    pub gains: Vec<f32>,
    pub gain: f32,
}

pub struct FakeHandle {
    id: HandleId,
    log: Rc<RefCell<HandleLog>>,
}

impl FakeHandle {
    pub fn new(id: u32) -> (Self, Rc<RefCell<HandleLog>>) {
        let log = Rc::new(RefCell::new(HandleLog::default()));
        (
            Self {
                id: HandleId(id),
                log: log.clone(),
            },
            log,
        )
    }
}

impl DecodeHandle for FakeHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn bind(&mut self, locator: &str, generation: Generation, mode: LoadMode) {
        let mut log = self.log.borrow_mut();
        log.binds.push((locator.to_string(), generation, mode));
        log.playing = false;
        log.position = Duration::ZERO;
    }

    fn abort(&mut self) {
        let mut log = self.log.borrow_mut();
        log.aborts += 1;
        log.playing = false;
    }

    fn start(&mut self) -> Result<(), StartRejected> {
        let mut log = self.log.borrow_mut();
        if log.reject_starts > 0 {
            log.reject_starts -= 1;
            return Err(StartRejected);
        }
        log.starts += 1;
        log.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.log.borrow_mut().playing = false;
    }

    fn is_playing(&self) -> bool {
        self.log.borrow().playing
    }

    fn position(&self) -> Duration {
        self.log.borrow().position
    }

    fn seek(&mut self, position: Duration) {
        let mut log = self.log.borrow_mut();
        log.position = position;
        log.seeks.push(position);
    }

    fn set_gain(&mut self, gain: f32) {
        let mut log = self.log.borrow_mut();
        log.gain = gain;
        log.gains.push(gain);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GraphOp {
    Wrap(HandleId),
    Create(NodeId),
    Connect(NodeId, usize, NodeId, usize),
    Disconnect(NodeId),
    Release(NodeId),
}

#[derive(Debug, Default)]
pub struct GraphLog {
    pub wraps: usize,
    pub created: Vec<(NodeId, NodeSpec)>,
    pub released: Vec<NodeId>,
    pub ops: Vec<GraphOp>,
    pub fail_creates: bool,
    /// Added to every biquad magnitude measurement.
    pub response_skew_db: f32,
}

pub struct FakeGraph {
    next: u32,
    log: Rc<RefCell<GraphLog>>,
}

impl FakeGraph {
    pub fn new() -> (Self, Rc<RefCell<GraphLog>>) {
        let log = Rc::new(RefCell::new(GraphLog::default()));
        (
            Self {
                next: 1,
                log: log.clone(),
            },
            log,
        )
    }

    fn allocate(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }
}

impl AudioGraph for FakeGraph {
    fn wrap_source(&mut self, handle: HandleId) -> Result<NodeId, GraphError> {
        let id = self.allocate();
        let mut log = self.log.borrow_mut();
        log.wraps += 1;
        log.ops.push(GraphOp::Wrap(handle));
        Ok(id)
    }

    fn create(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        if self.log.borrow().fail_creates {
            return Err(GraphError::UnknownNode(NodeId(u32::MAX)));
        }
        let id = self.allocate();
        let mut log = self.log.borrow_mut();
        log.created.push((id, spec));
        log.ops.push(GraphOp::Create(id));
        Ok(id)
    }

    fn connect(&mut self, from: NodeId, output: usize, to: NodeId, input: usize) -> Result<(), GraphError> {
        self.log
            .borrow_mut()
            .ops
            .push(GraphOp::Connect(from, output, to, input));
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) {
        self.log.borrow_mut().ops.push(GraphOp::Disconnect(node));
    }

    fn release(&mut self, node: NodeId) {
        let mut log = self.log.borrow_mut();
        log.released.push(node);
        log.ops.push(GraphOp::Release(node));
    }

    fn destination(&self) -> NodeId {
        NodeId(0)
    }

    fn magnitude_response(&mut self, node: NodeId, freq_hz: f32) -> Result<f32, GraphError> {
        let log = self.log.borrow();
        let spec = log
            .created
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, spec)| spec.clone())
            .ok_or(GraphError::UnknownNode(node))?;
        match spec {
            NodeSpec::Biquad {
                kind,
                freq_hz: centre,
                q,
                gain_db,
            } => {
                let coeffs = Coefficients::design(kind, centre, q, gain_db, 48_000.0);
                Ok(coeffs.magnitude_at(freq_hz, 48_000.0) * db_to_linear(log.response_skew_db))
            }
            _ => Ok(1.0),
        }
    }
}

#[derive(Debug, Default)]
pub struct SurfaceLog {
    pub registered: Vec<TransportAction>,
    pub metadata: Vec<Option<NowPlayingMetadata>>,
    pub states: Vec<SurfacePlaybackState>,
    pub positions: Vec<PositionState>,
}

pub struct FakeSurface(pub Rc<RefCell<SurfaceLog>>);

impl FakeSurface {
    pub fn new() -> (Self, Rc<RefCell<SurfaceLog>>) {
        let log = Rc::new(RefCell::new(SurfaceLog::default()));
        (Self(log.clone()), log)
    }
}

impl ControlSurface for FakeSurface {
    fn register_actions(&mut self, actions: &[TransportAction]) {
        self.0.borrow_mut().registered = actions.to_vec();
    }

    fn publish_metadata(&mut self, metadata: Option<&NowPlayingMetadata>) {
        self.0.borrow_mut().metadata.push(metadata.cloned());
    }

    fn publish_state(&mut self, state: SurfacePlaybackState) {
        self.0.borrow_mut().states.push(state);
    }

    fn publish_position(&mut self, position: &PositionState) {
        self.0.borrow_mut().positions.push(*position);
    }
}

pub struct FakeTraversal(pub Rc<RefCell<Vec<(Direction, u64)>>>);

impl FakeTraversal {
    pub fn new() -> (Self, Rc<RefCell<Vec<(Direction, u64)>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (Self(log.clone()), log)
    }
}

impl TraversalSource for FakeTraversal {
    fn request_sibling(&mut self, direction: Direction, token: u64) {
        self.0.borrow_mut().push((direction, token));
    }
}

pub struct FakeProbe(pub Rc<RefCell<Vec<(String, u64)>>>);

impl FakeProbe {
    pub fn new() -> (Self, Rc<RefCell<Vec<(String, u64)>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (Self(log.clone()), log)
    }
}

impl ResourceProbe for FakeProbe {
    fn probe(&mut self, locator: &str, token: u64) {
        self.0.borrow_mut().push((locator.to_string(), token));
    }
}

/// Settings store whose record the test keeps a handle to.
pub struct SharedStore(pub Rc<RefCell<MemorySettingsStore>>);

impl SharedStore {
    pub fn new(settings: Settings) -> (Self, Rc<RefCell<MemorySettingsStore>>) {
        let store = Rc::new(RefCell::new(MemorySettingsStore::with(settings)));
        (Self(store.clone()), store)
    }
}

impl SettingsStore for SharedStore {
    fn load(&mut self) -> Result<Settings, SettingsError> {
        self.0.borrow_mut().load()
    }

    fn save(&mut self, settings: &Settings) -> Result<(), SettingsError> {
        self.0.borrow_mut().save(settings)
    }
}
