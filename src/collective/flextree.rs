//! Staged reduce-scatter / all-gather allreduce over an arbitrary radix plan.
//!
//! Phase 1 walks the stages forward: at each stage every rank sends the
//! blocks a peer will own next to that peer, receives the copies of its own
//! next blocks into scratch slots, and folds them with its local values.
//! Values ping-pong between the receive buffer and a scratch region so the
//! kernel never writes a buffer it reads. After the last stage rank `r`
//! holds the fully reduced block `r`. Phase 2 walks the stages backward and
//! redistributes owned blocks until every rank holds the whole result.

use super::barrier::barrier;
use super::helpers::{TagKind, collective_recv, collective_send, make_tag, wait_all};
use super::lonely;
use crate::client::Communicator;
use crate::error::{FlexError, Result};
use crate::partition::PartitionContext;
use crate::reduce::reduce;
use crate::topology::{Operation, StagePlan, Topology};
use crate::types::{DataType, Rank, ReduceOp, SendBuf};

const OPERATION: &str = "allreduce";

/// Stages that fit in a message tag.
const MAX_STAGES: usize = 255;

/// Block indices that fit in a message tag.
const MAX_BLOCKS: usize = 1 << 24;

/// Run one allreduce over `comm` following `plan`.
///
/// Every precondition is checked before any message is sent, so a rejected
/// call leaves the group in a consistent state.
pub(crate) async fn flextree_allreduce(
    comm: &Communicator,
    send: SendBuf<'_>,
    recv: &mut [u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    plan: &StagePlan,
) -> Result<()> {
    validate(comm, send, recv, count, dtype, op, plan)?;

    let world = comm.world_size() as usize;
    if world == 1 || count == 0 {
        if let SendBuf::Buffer(input) = send {
            recv.copy_from_slice(input);
        }
        return Ok(());
    }

    let rank = comm.rank() as usize;
    let seq = comm.next_collective_seq();
    let ctx = PartitionContext::new(world, rank, count, dtype.size_in_bytes(), plan.num_lonely());
    tracing::debug!(
        rank,
        world,
        count,
        %dtype,
        %op,
        stages = ?plan.stages(),
        num_lonely = plan.num_lonely(),
        "flextree allreduce"
    );

    // The split is collective, so every rank builds it before branching.
    let regular_group = if plan.num_lonely() > 0 {
        Some(comm.lonely_group(plan.num_lonely()).await?)
    } else {
        None
    };

    if ctx.is_lonely() {
        lonely::exchange_as_lonely(comm, &ctx, send, recv, seq).await?;
        return barrier(comm).await;
    }

    let topo = plan.topology(rank);
    let mut scratch = comm.scratch.lock().await;
    let buf = scratch.acquire(ctx.total_bytes() + slot_region_bytes(&ctx, &topo));
    let (pong, slots) = buf.split_at_mut(ctx.total_bytes());

    let driver = StagedDriver {
        comm,
        group: regular_group.as_deref().unwrap_or(comm),
        ctx: &ctx,
        topo: &topo,
        dtype,
        op,
        seq,
        parallel_threshold: comm.config().parallel_reduce_bytes,
    };

    driver.reduce_scatter(send, recv, pong, slots).await?;

    if plan.num_lonely() == 0 {
        return driver.all_gather(recv, pong).await;
    }

    let reduced = recv[ctx.block_bytes(rank)].to_vec();
    tokio::try_join!(
        driver.all_gather(recv, pong),
        lonely::return_to_lonely(comm, &ctx, &reduced, seq),
    )?;
    barrier(comm).await
}

fn validate(
    comm: &Communicator,
    send: SendBuf<'_>,
    recv: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    plan: &StagePlan,
) -> Result<()> {
    if !dtype.supports(op) {
        return Err(FlexError::UnsupportedDType { dtype, op });
    }
    let expected = count * dtype.size_in_bytes();
    if recv.len() != expected {
        return Err(FlexError::BufferSizeMismatch {
            expected,
            actual: recv.len(),
        });
    }
    if let SendBuf::Buffer(input) = send
        && input.len() != expected
    {
        return Err(FlexError::BufferSizeMismatch {
            expected,
            actual: input.len(),
        });
    }
    let world = comm.world_size() as usize;
    if plan.total_peers() != world {
        return Err(FlexError::invalid_stages(
            plan.stages(),
            format!("plan covers {} peers, group has {world}", plan.total_peers()),
        ));
    }
    if plan.stages().len() > MAX_STAGES || plan.num_regular() >= MAX_BLOCKS {
        return Err(FlexError::invalid_stages(
            plan.stages(),
            "plan too large to address in message tags",
        ));
    }
    Ok(())
}

/// Bytes of receive slots needed by the largest stage, plus one slot per
/// lonely rank for the final fold.
fn slot_region_bytes(ctx: &PartitionContext, topo: &Topology) -> usize {
    let widest = topo
        .recv
        .stages
        .iter()
        .map(|ops| (ops.len() - 1) * ops[0].blocks.len())
        .max()
        .unwrap_or(0);
    (widest + topo.recv.lonely.len()) * ctx.slot_bytes()
}

/// Per-invocation state of a regular rank.
struct StagedDriver<'a> {
    comm: &'a Communicator,
    /// Group that synchronizes between stages (the regular ranks).
    group: &'a Communicator,
    ctx: &'a PartitionContext,
    topo: &'a Topology,
    dtype: DataType,
    op: ReduceOp,
    seq: u64,
    parallel_threshold: usize,
}

impl StagedDriver<'_> {
    fn tag(&self, kind: TagKind, stage: usize, block: usize) -> u64 {
        make_tag(self.comm.comm_id(), kind, self.seq, stage, block)
    }

    /// Phase 1. On return block `rank` of `x` holds the fully reduced value.
    async fn reduce_scatter(
        &self,
        send: SendBuf<'_>,
        x: &mut [u8],
        y: &mut [u8],
        slots: &mut [u8],
    ) -> Result<()> {
        let num_stages = self.topo.recv.num_stages();
        // A lone regular rank still has to fold in the lonely ranks.
        let steps: Vec<Option<usize>> = if num_stages == 0 {
            vec![None]
        } else {
            (0..num_stages).map(Some).collect()
        };

        for (k, &stage) in steps.iter().enumerate() {
            let (src, dst): (&[u8], &mut [u8]) = match send {
                SendBuf::Buffer(input) if k == 0 => (input, &mut *y),
                _ if k % 2 == 1 => (&*y, &mut *x),
                _ => (&*x, &mut *y),
            };
            let last = k + 1 == steps.len();
            self.reduce_stage(stage, src, dst, &mut *slots, last).await?;
            barrier(self.group).await?;
        }

        // Even step count leaves the result in x already.
        if steps.len() % 2 == 1 {
            let own = self.ctx.block_bytes(self.ctx.this_rank);
            x[own.clone()].copy_from_slice(&y[own]);
        }
        Ok(())
    }

    /// One reduce-scatter stage: ship peers their next blocks, gather and
    /// fold the copies of ours from `src` into `dst`.
    async fn reduce_stage(
        &self,
        stage: Option<usize>,
        src: &[u8],
        dst: &mut [u8],
        slots: &mut [u8],
        last: bool,
    ) -> Result<()> {
        let ctx = self.ctx;
        let comm = self.comm;
        let rank = ctx.this_rank;
        let stage_idx = stage.unwrap_or(0);
        let (send_ops, recv_ops): (&[Operation], &[Operation]) = match stage {
            Some(i) => (
                self.topo.send.stages[i].as_slice(),
                self.topo.recv.stages[i].as_slice(),
            ),
            None => (&[], &[]),
        };
        let owned: &[usize] = recv_ops
            .first()
            .map_or(std::slice::from_ref(&rank), |op| op.blocks.as_slice());
        let peers: Vec<Rank> = recv_ops
            .iter()
            .filter(|op| op.peer != rank)
            .map(|op| op.peer as Rank)
            .collect();
        let lonely_peers: Vec<Rank> = if last {
            self.topo.recv.lonely.iter().map(|op| op.peer as Rank).collect()
        } else {
            Vec::new()
        };
        let slot_bytes = ctx.slot_bytes();

        if let Some(i) = stage {
            tracing::debug!(rank, stage = i, radix = recv_ops.len(), blocks = owned.len(), "reduce-scatter stage");
        }

        let mut sends = Vec::new();
        for op in send_ops {
            if op.peer == rank {
                continue;
            }
            let peer = op.peer as Rank;
            for &b in &op.blocks {
                if ctx.block_len(b) == 0 {
                    continue;
                }
                tracing::trace!(rank, peer, block = b, "send block");
                let tag = self.tag(TagKind::ReduceScatter, stage_idx, b);
                sends.push(collective_send(comm, peer, tag, &src[ctx.block_bytes(b)], OPERATION));
            }
        }

        let recv_and_fold = async {
            // Peer-major slots: copy of owned[t] from peers[j] at j * owned.len() + t.
            let (peer_slots, lonely_slots) = slots.split_at_mut(peers.len() * owned.len() * slot_bytes);
            {
                let mut recvs = Vec::new();
                for (k, slot) in peer_slots.chunks_mut(slot_bytes).enumerate() {
                    let peer = peers[k / owned.len()];
                    let b = owned[k % owned.len()];
                    let len = ctx.block_bytes(b).len();
                    if len == 0 {
                        continue;
                    }
                    let tag = self.tag(TagKind::ReduceScatter, stage_idx, b);
                    recvs.push(collective_recv(comm, peer, tag, &mut slot[..len], OPERATION));
                }
                let own_len = ctx.block_bytes(rank).len();
                if own_len > 0 {
                    let tag = self.tag(TagKind::LonelyFold, 0, rank);
                    for (slot, &l) in lonely_slots.chunks_mut(slot_bytes).zip(&lonely_peers) {
                        recvs.push(collective_recv(comm, l, tag, &mut slot[..own_len], OPERATION));
                    }
                }
                wait_all(recvs).await?;
            }

            let peer_slots = &*peer_slots;
            let lonely_slots = &*lonely_slots;
            for (t, &b) in owned.iter().enumerate() {
                let range = ctx.block_bytes(b);
                let len = range.len();
                if len == 0 {
                    continue;
                }
                let mut inputs: Vec<&[u8]> = Vec::with_capacity(1 + peers.len() + lonely_peers.len());
                inputs.push(&src[range.clone()]);
                for j in 0..peers.len() {
                    let off = (j * owned.len() + t) * slot_bytes;
                    inputs.push(&peer_slots[off..off + len]);
                }
                if b == rank {
                    inputs.extend(
                        lonely_slots
                            .chunks(slot_bytes)
                            .take(lonely_peers.len())
                            .map(|slot| &slot[..len]),
                    );
                }

                let out = &mut dst[range];
                if inputs.len() == 1 {
                    out.copy_from_slice(inputs[0]);
                } else {
                    reduce(self.op, self.dtype, &inputs, out, self.parallel_threshold);
                }
            }
            Ok::<_, FlexError>(())
        };

        tokio::try_join!(wait_all(sends), recv_and_fold)?;
        Ok(())
    }

    /// Phase 2: replay the stages backward, sending owned blocks to the
    /// group and receiving the blocks peers own straight into `x`.
    async fn all_gather(&self, x: &mut [u8], y: &mut [u8]) -> Result<()> {
        let ctx = self.ctx;
        let comm = self.comm;
        let rank = ctx.this_rank;
        let slot_bytes = ctx.slot_bytes();

        for i in (0..self.topo.recv.num_stages()).rev() {
            let recv_ops = &self.topo.recv.stages[i];
            let send_ops = &self.topo.send.stages[i];
            let owned = &recv_ops[0].blocks;
            tracing::debug!(rank, stage = i, radix = recv_ops.len(), "all-gather stage");

            // Snapshot owned blocks so sends never alias the receive targets.
            let mut pieces = Vec::with_capacity(owned.len());
            let mut cursor = 0;
            for &b in owned {
                let range = ctx.block_bytes(b);
                if range.is_empty() {
                    continue;
                }
                let len = range.len();
                y[cursor..cursor + len].copy_from_slice(&x[range]);
                pieces.push((b, cursor..cursor + len));
                cursor += len;
            }
            let snapshot = &y[..cursor];

            let mut sends = Vec::new();
            for op in recv_ops {
                if op.peer == rank {
                    continue;
                }
                for (b, range) in &pieces {
                    let tag = self.tag(TagKind::AllGather, i, *b);
                    sends.push(collective_send(
                        comm,
                        op.peer as Rank,
                        tag,
                        &snapshot[range.clone()],
                        OPERATION,
                    ));
                }
            }

            let mut chunks: Vec<Option<&mut [u8]>> = x.chunks_mut(slot_bytes).map(Some).collect();
            let mut recvs = Vec::new();
            for op in send_ops.iter().filter(|op| op.peer != rank) {
                for &b in &op.blocks {
                    if let Some(chunk) = chunks.get_mut(b).and_then(Option::take) {
                        let tag = self.tag(TagKind::AllGather, i, b);
                        recvs.push(collective_recv(comm, op.peer as Rank, tag, chunk, OPERATION));
                    }
                }
            }

            tokio::try_join!(wait_all(sends), wait_all(recvs))?;
            barrier(self.group).await?;
        }
        Ok(())
    }
}
