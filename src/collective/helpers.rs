use crate::client::Communicator;
use crate::error::{FlexError, Result};
use crate::types::Rank;
use futures::future::try_join_all;
use std::future::Future;

/// Message classes multiplexed over one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TagKind {
    Barrier = 1,
    ReduceScatter = 2,
    AllGather = 3,
    LonelyFold = 4,
    LonelyResult = 5,
    Split = 6,
}

const SEQ_BITS: u32 = 12;
const STAGE_BITS: u32 = 8;
const INDEX_BITS: u32 = 24;

/// Pack a message tag.
///
/// Layout, high to low: comm id (16) | kind (4) | sequence (12) | stage (8) |
/// index (24). Sequence numbers wrap; collectives end in a barrier, so two
/// in-flight uses of the same sequence on one communicator cannot overlap.
pub(crate) fn make_tag(comm_id: u16, kind: TagKind, seq: u64, stage: usize, index: usize) -> u64 {
    debug_assert!(stage < 1 << STAGE_BITS, "stage {stage} does not fit in a tag");
    debug_assert!(index < 1 << INDEX_BITS, "index {index} does not fit in a tag");
    ((comm_id as u64) << 48)
        | ((kind as u64) << 44)
        | ((seq & ((1 << SEQ_BITS) - 1)) << 32)
        | (((stage as u64) & ((1 << STAGE_BITS) - 1)) << INDEX_BITS)
        | ((index as u64) & ((1 << INDEX_BITS) - 1))
}

/// Wait on a set of transfers, failing on the first error.
///
/// Takes the futures already collected: a lazy iterator of borrowing
/// closures would make the enclosing future `!Send`.
pub(crate) async fn wait_all<F>(futs: Vec<F>) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    if futs.is_empty() {
        return Ok(());
    }
    try_join_all(futs).await?;
    Ok(())
}

/// Send to a communicator rank, wrapping errors as `CollectiveFailed`.
pub(crate) async fn collective_send(
    comm: &Communicator,
    dest: Rank,
    tag: u64,
    data: &[u8],
    operation: &'static str,
) -> Result<()> {
    comm.send_to(dest, tag, data)
        .await
        .map_err(|e| FlexError::CollectiveFailed {
            operation,
            rank: dest,
            reason: e.to_string(),
        })
}

/// Receive from a communicator rank, wrapping errors as `CollectiveFailed`.
pub(crate) async fn collective_recv(
    comm: &Communicator,
    src: Rank,
    tag: u64,
    buf: &mut [u8],
    operation: &'static str,
) -> Result<()> {
    comm.recv_from(src, tag, buf)
        .await
        .map_err(|e| FlexError::CollectiveFailed {
            operation,
            rank: src,
            reason: e.to_string(),
        })
}
