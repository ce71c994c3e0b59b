pub mod lru;

pub use lru::LruReplacer;

use crate::buffer::FrameId;

/// Victim-selection policy over unpinned buffer frames.
pub trait Replacer {
    fn new(capacity: usize) -> Self
    where
        Self: Sized;

    /// Pick a frame to evict and remove it from the candidate set.
    fn victim(&mut self) -> Option<FrameId>;

    /// Remove a frame from the candidate set (its page is pinned).
    fn pin(&mut self, frame_id: FrameId);

    /// Add a frame to the candidate set (its pin count dropped to zero).
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of frames currently eligible for eviction.
    fn size(&self) -> usize;
}
