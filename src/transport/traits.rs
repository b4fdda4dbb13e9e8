//! Transport seams the engine is written against, so the same loops run over
//! UDP sockets or an in-memory simulator.

use async_trait::async_trait;

use crate::errors::Result;

/// The bidirectional command channel.
#[async_trait]
pub trait CommandLink: Send + 'static {
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Waits for the next reply. Must be cancel-safe: dropping the future
    /// before it completes loses nothing.
    async fn recv(&mut self) -> Result<Vec<u8>>;

    /// Drops replies already waiting without blocking, returning how many.
    /// Called before a new command is first sent so a late reply to an
    /// abandoned command is never matched to its successor.
    fn discard_stale(&mut self) -> usize {
        0
    }

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// A receive-only datagram channel (status or video).
#[async_trait]
pub trait DatagramSource: Send + 'static {
    /// Waits for the next datagram. Must be cancel-safe.
    async fn recv(&mut self) -> Result<Vec<u8>>;
}
