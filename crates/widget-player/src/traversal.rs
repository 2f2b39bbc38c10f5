//! Sibling-directory collaborator for cross-container traversal.
//!
//! Each request lists the sibling of the shared cursor on a worker thread; the listing comes
//! back through the runtime's reply channel, which moves the cursor once the engine still
//! wants that reply.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::Sender;
use widget_engine::traversal::{ContainerListing, TraversalSource};
use widget_types::Direction;

use crate::library::{self, SourceMapper};

/// Traversal reply tagged with the engine's request token.
#[derive(Debug)]
pub struct SiblingReply {
    pub token: u64,
    /// Directory that was listed; `None` past either end of the library.
    pub dir: Option<PathBuf>,
    pub listing: Option<ContainerListing>,
}

/// Directory the next sibling request starts from.
#[derive(Clone, Debug)]
pub struct ContainerCursor(Arc<Mutex<PathBuf>>);

impl ContainerCursor {
    pub fn new(dir: PathBuf) -> Self {
        Self(Arc::new(Mutex::new(dir)))
    }

    pub fn get(&self) -> PathBuf {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, dir: PathBuf) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = dir;
    }
}

/// Next sibling of `current` in `direction`, staying below `root`.
///
/// Forward order is depth-first: a directory's own children come before its next
/// sibling, so an artist folder leads into its albums.
pub fn sibling_of(root: &Path, current: &Path, direction: Direction) -> Option<PathBuf> {
    if direction == Direction::Forward {
        if let Some(first) = library::subdirectories(current).ok()?.into_iter().next() {
            return Some(first);
        }
    }
    let mut node = current.to_path_buf();
    loop {
        if node == root {
            return None;
        }
        let parent = node.parent()?.to_path_buf();
        if !parent.starts_with(root) {
            return None;
        }
        let siblings = library::subdirectories(&parent).ok()?;
        let index = siblings.iter().position(|d| *d == node)?;
        let next = match direction {
            Direction::Forward => siblings.get(index + 1),
            Direction::Backward => index.checked_sub(1).and_then(|i| siblings.get(i)),
        };
        match (next, direction) {
            (Some(next), Direction::Forward) => return Some(next.clone()),
            (Some(prev), Direction::Backward) => return Some(deepest_last(prev)),
            (None, Direction::Forward) => node = parent,
            (None, Direction::Backward) => return Some(parent),
        }
    }
}

/// Last directory in depth-first order below `dir`, mirroring forward traversal.
fn deepest_last(dir: &Path) -> PathBuf {
    let mut node = dir.to_path_buf();
    while let Some(last) = library::subdirectories(&node).ok().and_then(|d| d.into_iter().last()) {
        node = last;
    }
    node
}

/// [`TraversalSource`] over the local filesystem.
pub struct DirectoryTraversal {
    mapper: SourceMapper,
    cursor: ContainerCursor,
    replies: Sender<SiblingReply>,
}

impl DirectoryTraversal {
    pub fn new(mapper: SourceMapper, cursor: ContainerCursor, replies: Sender<SiblingReply>) -> Self {
        Self {
            mapper,
            cursor,
            replies,
        }
    }
}

impl TraversalSource for DirectoryTraversal {
    fn request_sibling(&mut self, direction: Direction, token: u64) {
        let current = self.cursor.get();
        let Some(next) = sibling_of(self.mapper.root(), &current, direction) else {
            tracing::info!(from = %current.display(), ?direction, "no sibling container");
            let _ = self.replies.send(SiblingReply {
                token,
                dir: None,
                listing: None,
            });
            return;
        };
        let mapper = self.mapper.clone();
        let replies = self.replies.clone();
        thread::spawn(move || {
            let listing = match library::list_container(&next, &mapper) {
                Ok(listing) => Some(listing),
                Err(err) => {
                    tracing::warn!(dir = %next.display(), error = %err, "sibling listing failed");
                    None
                }
            };
            let _ = replies.send(SiblingReply {
                token,
                dir: Some(next),
                listing,
            });
        });
    }
}
