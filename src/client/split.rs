use crate::collective::{TagKind, collective_recv, collective_send, make_tag, wait_all};
use crate::error::{FlexError, Result};
use crate::types::Rank;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::Communicator;

impl Communicator {
    /// Split this communicator into sub-groups.
    ///
    /// All ranks must call `split` simultaneously. Ranks with the same `color`
    /// end up in the same sub-communicator, ordered by `key` (ties broken by
    /// the rank in this communicator).
    ///
    /// The returned communicator shares the transport and tags its traffic
    /// with a fresh communicator id, so its collectives never match messages
    /// of the parent or of sibling groups.
    pub async fn split(&self, color: u32, key: u32) -> Result<Communicator> {
        let world = self.world_size();
        let rank = self.rank;
        let split_gen = self.split_generation.fetch_add(1, Ordering::Relaxed);
        let tag = make_tag(self.comm_id, TagKind::Split, split_gen, 0, 0);

        // Step 1: exchange (color, key) with every rank as [color LE][key LE].
        let mut my_info = [0u8; 8];
        my_info[..4].copy_from_slice(&color.to_le_bytes());
        my_info[4..].copy_from_slice(&key.to_le_bytes());

        let mut all_info = vec![0u8; 8 * world as usize];
        all_info[rank as usize * 8..(rank as usize + 1) * 8].copy_from_slice(&my_info);

        let mut sends = Vec::new();
        let mut recvs = Vec::new();
        for (r, slot) in all_info.chunks_mut(8).enumerate() {
            let r = r as Rank;
            if r == rank {
                continue;
            }
            sends.push(collective_send(self, r, tag, &my_info, "split"));
            recvs.push(collective_recv(self, r, tag, slot, "split"));
        }
        tokio::try_join!(wait_all(sends), wait_all(recvs))?;

        // Step 2: our group (same color), sorted by (key, rank).
        let mut group: Vec<(u32, Rank)> = Vec::new();
        for (r, info) in all_info.as_chunks::<8>().0.iter().enumerate() {
            let (c, k) = decode_entry(info);
            if c == color {
                group.push((k, r as Rank));
            }
        }
        group.sort_unstable();

        let new_rank = group
            .iter()
            .position(|&(_, r)| r == rank)
            .ok_or(FlexError::UnknownPeer { rank })? as Rank;
        let members = group
            .iter()
            .map(|&(_, r)| self.transport_rank(r))
            .collect::<Result<Arc<[Rank]>>>()?;

        let comm_id = derive_comm_id(self.comm_id, split_gen, color);
        tracing::debug!(
            rank,
            color,
            new_rank,
            new_world = members.len(),
            comm_id,
            "split communicator"
        );

        Ok(Communicator::with_members(
            Arc::clone(&self.transport),
            new_rank,
            members,
            comm_id,
            Arc::clone(&self.config),
        ))
    }
}

/// `[color LE][key LE]`.
fn decode_entry(info: &[u8; 8]) -> (u32, u32) {
    let [c0, c1, c2, c3, k0, k1, k2, k3] = *info;
    (
        u32::from_le_bytes([c0, c1, c2, c3]),
        u32::from_le_bytes([k0, k1, k2, k3]),
    )
}

/// FNV-1a over (parent id, generation, color), folded to a non-zero u16.
/// 0 is reserved for the root communicator.
fn derive_comm_id(parent: u16, generation: u64, color: u32) -> u16 {
    let mut h: u64 = 0xcbf29ce484222325;
    let bytes = parent
        .to_le_bytes()
        .into_iter()
        .chain(generation.to_le_bytes())
        .chain(color.to_le_bytes());
    for b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    let id = ((h >> 48) ^ (h >> 32) ^ (h >> 16) ^ h) as u16;
    if id == 0 { 1 } else { id }
}
