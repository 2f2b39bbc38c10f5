//! Cross-container traversal once the local queue is exhausted.

use widget_types::Direction;

use crate::track::Track;

/// Playable tracks of one container, in listing order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerListing {
    /// Container path, for logs and artwork lookup.
    pub container: String,
    pub tracks: Vec<Track>,
}

/// External directory collaborator. Replies arrive later through
/// [`Engine::on_sibling_reply`](crate::engine::Engine::on_sibling_reply) tagged with `token`.
pub trait TraversalSource {
    fn request_sibling(&mut self, direction: Direction, token: u64);
}

#[derive(Clone, Debug, PartialEq)]
pub enum TraversalStep {
    /// Ask the collaborator for the next container.
    Request { direction: Direction, token: u64 },
    /// Regenerate the queue from `listing` and play listing index `start`.
    Found { listing: ContainerListing, start: usize },
    /// Hop limit exceeded.
    GiveUp,
    /// Reply for a request that is no longer pending.
    Stale,
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    token: u64,
    direction: Direction,
}

/// Hop-limited sibling search.
#[derive(Debug)]
pub struct Traversal {
    hop_limit: u32,
    hops: u32,
    next_token: u64,
    pending: Option<Pending>,
}

impl Traversal {
    pub fn new(hop_limit: u32) -> Self {
        Self {
            hop_limit,
            hops: 0,
            next_token: 0,
            pending: None,
        }
    }

    /// Start a fresh search, superseding any in flight.
    pub fn begin(&mut self, direction: Direction) -> TraversalStep {
        self.hops = 0;
        self.request(direction)
    }

    fn request(&mut self, direction: Direction) -> TraversalStep {
        self.next_token += 1;
        let token = self.next_token;
        self.pending = Some(Pending { token, direction });
        TraversalStep::Request { direction, token }
    }

    pub fn on_reply(&mut self, token: u64, reply: Option<ContainerListing>) -> TraversalStep {
        let Some(pending) = self.pending.filter(|p| p.token == token) else {
            return TraversalStep::Stale;
        };
        self.pending = None;
        match reply.filter(|listing| !listing.tracks.is_empty()) {
            Some(listing) => {
                self.hops = 0;
                let start = match pending.direction {
                    Direction::Forward => 0,
                    Direction::Backward => listing.tracks.len() - 1,
                };
                TraversalStep::Found { listing, start }
            }
            None => {
                self.hops += 1;
                if self.hops > self.hop_limit {
                    self.hops = 0;
                    TraversalStep::GiveUp
                } else {
                    self.request(pending.direction)
                }
            }
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
        self.hops = 0;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Token of the request still awaiting a reply.
    pub fn pending_token(&self) -> Option<u64> {
        self.pending.map(|p| p.token)
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }
}
