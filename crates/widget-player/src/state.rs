//! State the runtime publishes for the HTTP API, and the control surface that feeds it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use widget_engine::settings::Settings;
use widget_engine::surface::ControlSurface;
use widget_types::{
    EngineStatus, Notice, NowPlayingMetadata, PositionState, SurfacePlaybackState, TransportAction,
};

/// What a system "now playing" panel would show.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NowPlayingView {
    pub metadata: Option<NowPlayingMetadata>,
    pub state: Option<SurfacePlaybackState>,
    pub position: Option<PositionState>,
    /// Transport actions the engine registered.
    pub actions: Vec<TransportAction>,
}

#[derive(Clone, Debug, Default)]
pub struct PublishedState {
    pub status: EngineStatus,
    pub now_playing: NowPlayingView,
    pub notices: Vec<Notice>,
    pub settings: Settings,
    pub container: Option<String>,
    pub device: Option<String>,
    pub online: bool,
}

/// Snapshot shared between the runtime thread and HTTP handlers.
#[derive(Clone, Debug, Default)]
pub struct SharedState(Arc<Mutex<PublishedState>>);

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, PublishedState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> PublishedState {
        self.lock().clone()
    }
}

/// [`ControlSurface`] that publishes into [`SharedState`]; presses arrive as HTTP
/// transport requests.
pub struct HttpSurface {
    state: SharedState,
}

impl HttpSurface {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

impl ControlSurface for HttpSurface {
    fn register_actions(&mut self, actions: &[TransportAction]) {
        self.state.lock().now_playing.actions = actions.to_vec();
    }

    fn publish_metadata(&mut self, metadata: Option<&NowPlayingMetadata>) {
        let mut state = self.state.lock();
        state.now_playing.metadata = metadata.cloned();
        if metadata.is_none() {
            state.now_playing.position = None;
        }
    }

    fn publish_state(&mut self, playback: SurfacePlaybackState) {
        self.state.lock().now_playing.state = Some(playback);
    }

    fn publish_position(&mut self, position: &PositionState) {
        self.state.lock().now_playing.position = Some(*position);
    }
}
