//! Side exchange for ranks outside the regular tree.
//!
//! A lonely rank hands block `i` of its contribution to regular rank `i`,
//! which folds it in during its final reduce-scatter stage, then gets the
//! fully reduced block `i` back from the same rank.

use super::helpers::{TagKind, collective_recv, collective_send, make_tag, wait_all};
use crate::client::Communicator;
use crate::error::Result;
use crate::partition::PartitionContext;
use crate::types::{Rank, SendBuf};

const OPERATION: &str = "allreduce";

/// Lonely-rank side of the exchange.
pub(super) async fn exchange_as_lonely(
    comm: &Communicator,
    ctx: &PartitionContext,
    send: SendBuf<'_>,
    recv: &mut [u8],
    seq: u64,
) -> Result<()> {
    tracing::debug!(rank = ctx.this_rank, num_regular = ctx.num_regular, "lonely exchange");
    {
        let input: &[u8] = match send {
            SendBuf::Buffer(input) => input,
            SendBuf::InPlace => &*recv,
        };
        let mut sends = Vec::new();
        for b in 0..ctx.num_regular {
            if ctx.block_len(b) == 0 {
                continue;
            }
            let tag = make_tag(comm.comm_id(), TagKind::LonelyFold, seq, 0, b);
            sends.push(collective_send(comm, b as Rank, tag, &input[ctx.block_bytes(b)], OPERATION));
        }
        // Transports buffer sends; these complete without a posted receive.
        wait_all(sends).await?;
    }

    let mut recvs = Vec::new();
    for (b, chunk) in recv.chunks_mut(ctx.slot_bytes()).enumerate() {
        let tag = make_tag(comm.comm_id(), TagKind::LonelyResult, seq, 0, b);
        recvs.push(collective_recv(comm, b as Rank, tag, chunk, OPERATION));
    }
    wait_all(recvs).await
}

/// Regular-rank side: send the reduced block this rank owns to every lonely rank.
pub(super) async fn return_to_lonely(
    comm: &Communicator,
    ctx: &PartitionContext,
    reduced: &[u8],
    seq: u64,
) -> Result<()> {
    if reduced.is_empty() {
        return Ok(());
    }
    let tag = make_tag(comm.comm_id(), TagKind::LonelyResult, seq, 0, ctx.this_rank);
    let mut sends = Vec::new();
    for l in ctx.num_regular..ctx.total_peers {
        sends.push(collective_send(comm, l as Rank, tag, reduced, OPERATION));
    }
    wait_all(sends).await
}
