use super::helpers::{TagKind, collective_recv, collective_send, make_tag};
use crate::client::Communicator;
use crate::error::{FlexError, Result};
use crate::types::Rank;

/// Threshold: use two-phase barrier for small worlds, dissemination for larger.
const DISSEMINATION_THRESHOLD: u32 = 5;

/// Barrier: blocks until all ranks of `comm` reach this point.
///
/// Dispatches on world size:
/// - `two_phase_barrier` for world_size <= 4 (lower constant overhead)
/// - `dissemination_barrier` for world_size >= 5 (O(log N) rounds, no coordinator)
pub async fn barrier(comm: &Communicator) -> Result<()> {
    let world = comm.world_size();
    if world <= 1 {
        return Ok(());
    }

    let epoch = comm.next_barrier_epoch();
    tracing::trace!(rank = comm.rank(), world, epoch, "barrier");
    if world < DISSEMINATION_THRESHOLD {
        two_phase_barrier(comm, epoch).await
    } else {
        dissemination_barrier(comm, epoch).await
    }
}

/// Two-phase barrier: all ranks report to rank 0, rank 0 releases everyone.
async fn two_phase_barrier(comm: &Communicator, epoch: u64) -> Result<()> {
    let rank = comm.rank();
    let world = comm.world_size();
    let arrive = make_tag(comm.comm_id(), TagKind::Barrier, epoch, 0, 0);
    let release = make_tag(comm.comm_id(), TagKind::Barrier, epoch, 1, 0);

    if rank == 0 {
        for r in 1..world {
            recv_epoch(comm, r, arrive, epoch).await?;
        }
        for r in 1..world {
            collective_send(comm, r, release, &epoch.to_le_bytes(), "barrier").await?;
        }
    } else {
        collective_send(comm, 0, arrive, &epoch.to_le_bytes(), "barrier").await?;
        recv_epoch(comm, 0, release, epoch).await?;
    }
    Ok(())
}

/// Dissemination barrier: O(log N) rounds, no single coordinator.
///
/// In round r, rank i sends to rank `(i + 2^r) % N` and receives from
/// rank `(i - 2^r + N) % N`. After `ceil(log2(N))` rounds, every rank
/// has transitively heard from every other rank.
async fn dissemination_barrier(comm: &Communicator, epoch: u64) -> Result<()> {
    let rank = comm.rank();
    let world = comm.world_size();
    let num_rounds = u32::BITS - (world - 1).leading_zeros();

    for round in 0..num_rounds {
        let distance = 1u32 << round;
        let send_to = (rank + distance) % world;
        let recv_from = (rank + world - distance) % world;
        let tag = make_tag(comm.comm_id(), TagKind::Barrier, epoch, 0, round as usize);

        let payload = epoch.to_le_bytes();
        let send_fut = collective_send(comm, send_to, tag, &payload, "barrier");
        let recv_fut = recv_epoch(comm, recv_from, tag, epoch);
        tokio::try_join!(send_fut, recv_fut)?;
    }
    Ok(())
}

async fn recv_epoch(comm: &Communicator, src: Rank, tag: u64, epoch: u64) -> Result<()> {
    let mut buf = [0u8; 8];
    collective_recv(comm, src, tag, &mut buf, "barrier").await?;
    let got = u64::from_le_bytes(buf);
    if got != epoch {
        return Err(FlexError::CollectiveFailed {
            operation: "barrier",
            rank: src,
            reason: format!("expected Barrier(epoch={epoch}), got epoch {got}"),
        });
    }
    Ok(())
}
