//! Point-to-point byte transports the collectives run on.

mod local;
mod mailbox;
mod tcp;

pub use local::{LocalMesh, LocalTransport};
pub use tcp::TcpTransport;
pub(crate) use tcp::bind_loopback;

use crate::error::Result;
use crate::types::Rank;
use futures::future::BoxFuture;

/// Tagged point-to-point messaging between the ranks of one world.
///
/// Messages are matched by `(source, tag)`. A send may complete before the
/// matching receive is posted; the transport buffers it. Only one receive
/// may be outstanding per `(source, tag)` at a time.
pub trait Transport: Send + Sync {
    /// This endpoint's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks reachable through this transport.
    fn world_size(&self) -> u32;

    /// Send `data` to `dest` under `tag`.
    fn send<'a>(&'a self, dest: Rank, tag: u64, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Receive the next message from `src` under `tag` into `buf`.
    ///
    /// Fails with `BufferSizeMismatch` if the message length differs from
    /// `buf.len()`.
    fn recv<'a>(&'a self, src: Rank, tag: u64, buf: &'a mut [u8]) -> BoxFuture<'a, Result<()>>;
}

/// Copy a received payload into the caller's buffer, checking its length.
pub(crate) fn copy_payload(payload: &[u8], buf: &mut [u8]) -> Result<()> {
    if payload.len() != buf.len() {
        return Err(crate::error::FlexError::BufferSizeMismatch {
            expected: buf.len(),
            actual: payload.len(),
        });
    }
    buf.copy_from_slice(payload);
    Ok(())
}

/// Reject ranks outside `0..world_size`.
pub(crate) fn check_rank(rank: Rank, world_size: u32) -> Result<()> {
    if rank >= world_size {
        return Err(crate::error::FlexError::InvalidRank { rank, world_size });
    }
    Ok(())
}
