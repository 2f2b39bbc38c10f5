//! Bridge to the host "now playing" control surface.

use std::time::{Duration, Instant};

use widget_types::{NowPlayingMetadata, PositionState, SessionState, SurfacePlaybackState, TransportAction};

use crate::track::Track;

/// Host media-control surface. Transport presses come back through
/// [`Engine::handle_transport`](crate::engine::Engine::handle_transport).
pub trait ControlSurface {
    fn register_actions(&mut self, actions: &[TransportAction]);
    /// `None` clears the surface.
    fn publish_metadata(&mut self, metadata: Option<&NowPlayingMetadata>);
    fn publish_state(&mut self, state: SurfacePlaybackState);
    fn publish_position(&mut self, position: &PositionState);
}

fn surface_state(state: SessionState) -> SurfacePlaybackState {
    match state {
        SessionState::Playing | SessionState::Loading => SurfacePlaybackState::Playing,
        SessionState::Paused | SessionState::Errored(_) => SurfacePlaybackState::Paused,
        SessionState::Idle => SurfacePlaybackState::None,
    }
}

/// Publishes metadata on track change and position on a throttled schedule.
pub struct MediaBridge {
    surface: Box<dyn ControlSurface>,
    enabled: bool,
    registered: bool,
    current: Option<NowPlayingMetadata>,
    last_state: Option<SurfacePlaybackState>,
    last_push: Option<Instant>,
    throttle: Duration,
}

impl MediaBridge {
    pub fn new(surface: Box<dyn ControlSurface>, enabled: bool, throttle: Duration) -> Self {
        let mut bridge = Self {
            surface,
            enabled: false,
            registered: false,
            current: None,
            last_state: None,
            last_push: None,
            throttle,
        };
        bridge.set_enabled(enabled);
        bridge
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn metadata(&self) -> Option<&NowPlayingMetadata> {
        self.current.as_ref()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            if !self.registered {
                self.surface.register_actions(&TransportAction::ALL);
                self.registered = true;
            }
            self.surface.publish_metadata(self.current.as_ref());
            if let Some(state) = self.last_state {
                self.surface.publish_state(state);
            }
            self.last_push = None;
        } else {
            self.surface.publish_metadata(None);
            self.surface.publish_state(SurfacePlaybackState::None);
        }
        tracing::debug!(enabled, "control surface publishing toggled");
    }

    /// Publish metadata for a newly selected track.
    pub fn announce(&mut self, track: &Track, duration: Option<Duration>) {
        let metadata = NowPlayingMetadata {
            track_id: Some(track.id),
            title: track.display_title(),
            artist: track.tags.artist.clone(),
            album: track.tags.album.clone(),
            artwork: track.tags.artwork.clone(),
            duration_ms: duration.or(track.duration).map(|d| d.as_millis() as u64),
        };
        self.current = Some(metadata);
        self.last_push = None;
        if self.enabled {
            self.surface.publish_metadata(self.current.as_ref());
        }
    }

    /// Republish when the loaded media reveals a different duration.
    pub fn update_duration(&mut self, duration: Option<Duration>) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let duration_ms = duration.map(|d| d.as_millis() as u64);
        if duration_ms.is_none() || current.duration_ms == duration_ms {
            return;
        }
        current.duration_ms = duration_ms;
        if self.enabled {
            self.surface.publish_metadata(self.current.as_ref());
        }
    }

    pub fn set_state(&mut self, state: SessionState) {
        let mapped = surface_state(state);
        if self.last_state == Some(mapped) {
            return;
        }
        self.last_state = Some(mapped);
        if self.enabled {
            self.surface.publish_state(mapped);
        }
    }

    /// Push the position unless one was pushed within the throttle window.
    pub fn refresh_position(&mut self, now: Instant, position: Duration, duration: Option<Duration>, playing: bool) -> bool {
        if !self.enabled || self.current.is_none() {
            return false;
        }
        if self
            .last_push
            .is_some_and(|last| now.saturating_duration_since(last) < self.throttle)
        {
            return false;
        }
        self.last_push = Some(now);
        self.surface.publish_position(&PositionState {
            position_ms: position.as_millis() as u64,
            duration_ms: duration.map(|d| d.as_millis() as u64),
            playback_rate: if playing { 1.0 } else { 0.0 },
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSurface;
    use crate::track::TrackTags;

    fn bridge(enabled: bool) -> (MediaBridge, std::rc::Rc<std::cell::RefCell<crate::testing::SurfaceLog>>) {
        let (surface, log) = FakeSurface::new();
        (MediaBridge::new(Box::new(surface), enabled, Duration::from_secs(1)), log)
    }

    #[test]
    fn registers_transport_actions_when_enabled() {
        let (_bridge, log) = bridge(true);
        assert_eq!(log.borrow().registered.len(), TransportAction::ALL.len());
        let (_bridge, log) = bridge(false);
        assert!(log.borrow().registered.is_empty());
    }

    #[test]
    fn announce_publishes_tags() {
        let (mut bridge, log) = bridge(true);
        let track = Track::new("/m/a/01.flac").with_tags(TrackTags {
            title: Some("One".into()),
            artist: Some("Band".into()),
            album: Some("Record".into()),
            artwork: Some("/m/a/cover.jpg".into()),
        });
        bridge.announce(&track, Some(Duration::from_secs(90)));
        let published = log.borrow().metadata.last().cloned().flatten().unwrap();
        assert_eq!(published.title, "One");
        assert_eq!(published.artwork.as_deref(), Some("/m/a/cover.jpg"));
        assert_eq!(published.duration_ms, Some(90_000));
        assert_eq!(published.track_id, Some(track.id));
    }

    #[test]
    fn position_is_throttled() {
        let (mut bridge, log) = bridge(true);
        bridge.announce(&Track::new("/a.mp3"), None);
        let t0 = Instant::now();
        assert!(bridge.refresh_position(t0, Duration::from_secs(1), None, true));
        assert!(!bridge.refresh_position(t0 + Duration::from_millis(500), Duration::from_secs(2), None, true));
        assert!(bridge.refresh_position(t0 + Duration::from_secs(1), Duration::from_secs(2), None, true));
        assert_eq!(log.borrow().positions.len(), 2);
    }

    #[test]
    fn disabled_bridge_stays_quiet_until_enabled() {
        let (mut bridge, log) = bridge(false);
        bridge.announce(&Track::new("/a.mp3"), None);
        bridge.set_state(SessionState::Playing);
        assert!(!bridge.refresh_position(Instant::now(), Duration::ZERO, None, true));
        assert!(log.borrow().metadata.is_empty());

        bridge.set_enabled(true);
        let log = log.borrow();
        assert_eq!(log.metadata.len(), 1);
        assert_eq!(log.states, vec![SurfacePlaybackState::Playing]);
    }

    #[test]
    fn disabling_clears_the_surface() {
        let (mut bridge, log) = bridge(true);
        bridge.announce(&Track::new("/a.mp3"), None);
        bridge.set_enabled(false);
        assert_eq!(log.borrow().metadata.last(), Some(&None));
    }

    #[test]
    fn state_changes_publish_once() {
        let (mut bridge, log) = bridge(true);
        bridge.set_state(SessionState::Loading);
        bridge.set_state(SessionState::Playing);
        bridge.set_state(SessionState::Paused);
        assert_eq!(
            log.borrow().states,
            vec![SurfacePlaybackState::Playing, SurfacePlaybackState::Paused]
        );
    }
}
