use crate::config::FlexConfig;
use crate::error::{FlexError, Result};
use crate::scratch::ScratchBuffer;
use crate::transport::{LocalMesh, TcpTransport, Transport};
use crate::types::Rank;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// A group of ranks that run collectives together.
///
/// Wraps a [`Transport`] and maps communicator ranks onto transport ranks.
/// The root communicator covers the whole transport world; [`split`] derives
/// sub-communicators that share the transport but tag their traffic with a
/// distinct communicator id.
///
/// Collectives on one communicator are serialized: each holds the scratch
/// buffer for its whole duration.
///
/// # Example
///
/// ```no_run
/// use flextree::{Communicator, FlexConfig};
///
/// # async fn example() -> flextree::Result<()> {
/// let comms = Communicator::bootstrap_local(4, FlexConfig::default());
/// assert_eq!(comms[0].rank(), 0);
/// assert_eq!(comms[0].world_size(), 4);
/// # Ok(())
/// # }
/// ```
///
/// [`split`]: Communicator::split
pub struct Communicator {
    pub(super) transport: Arc<dyn Transport>,
    pub(super) rank: Rank,
    /// Communicator rank -> transport rank.
    pub(super) members: Arc<[Rank]>,
    /// 0 for the root communicator.
    pub(super) comm_id: u16,
    pub(super) config: Arc<FlexConfig>,
    pub(crate) scratch: Mutex<ScratchBuffer>,
    pub(super) barrier_epoch: AtomicU64,
    pub(super) collective_seq: AtomicU64,
    /// Advanced in lockstep by every member, since `split` is collective.
    pub(super) split_generation: AtomicU64,
    /// Regular/lonely sub-communicator this rank belongs to, per lonely count.
    pub(super) lonely_groups: Mutex<HashMap<usize, Arc<Communicator>>>,
}

impl Communicator {
    /// Root communicator over every rank of `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: FlexConfig) -> Self {
        let rank = transport.rank();
        let members: Arc<[Rank]> = (0..transport.world_size()).collect();
        Self::with_members(transport, rank, members, 0, Arc::new(config))
    }

    pub(super) fn with_members(
        transport: Arc<dyn Transport>,
        rank: Rank,
        members: Arc<[Rank]>,
        comm_id: u16,
        config: Arc<FlexConfig>,
    ) -> Self {
        Self {
            transport,
            rank,
            members,
            comm_id,
            config,
            scratch: Mutex::new(ScratchBuffer::new()),
            barrier_epoch: AtomicU64::new(0),
            collective_seq: AtomicU64::new(0),
            split_generation: AtomicU64::new(0),
            lonely_groups: Mutex::new(HashMap::new()),
        }
    }

    /// One communicator per rank over an in-process mesh.
    pub fn bootstrap_local(world_size: u32, config: FlexConfig) -> Vec<Communicator> {
        LocalMesh::new(world_size)
            .endpoints()
            .into_iter()
            .map(|ep| Communicator::new(ep, config.clone()))
            .collect()
    }

    /// One communicator per rank over a loopback TCP mesh.
    ///
    /// Mesh formation is bounded by `config.connect_timeout`.
    pub async fn bootstrap_tcp_local(world_size: u32, config: FlexConfig) -> Result<Vec<Communicator>> {
        let transports = TcpTransport::bootstrap_local(world_size, config.connect_timeout).await?;
        Ok(transports
            .into_iter()
            .map(|t| Communicator::new(Arc::new(t), config.clone()))
            .collect())
    }

    /// Join a TCP mesh as `rank` and wrap it in a root communicator.
    ///
    /// `listener` must be bound to `addrs[rank]`. Fails with
    /// `MeshFormationTimeout` if the peers are not all connected within
    /// `config.connect_timeout`.
    pub async fn connect_tcp(
        rank: Rank,
        listener: TcpListener,
        addrs: &[SocketAddr],
        config: FlexConfig,
    ) -> Result<Communicator> {
        let transport = TcpTransport::establish(rank, listener, addrs, config.connect_timeout).await?;
        Ok(Communicator::new(Arc::new(transport), config))
    }

    /// This rank within the communicator (0-indexed).
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the communicator.
    pub fn world_size(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn config(&self) -> &FlexConfig {
        &self.config
    }

    pub(crate) fn comm_id(&self) -> u16 {
        self.comm_id
    }

    /// Transport rank backing communicator rank `rank`.
    pub(crate) fn transport_rank(&self, rank: Rank) -> Result<Rank> {
        self.members
            .get(rank as usize)
            .copied()
            .ok_or(FlexError::InvalidRank {
                rank,
                world_size: self.world_size(),
            })
    }

    pub(crate) async fn send_to(&self, dest: Rank, tag: u64, data: &[u8]) -> Result<()> {
        let dest = self.transport_rank(dest)?;
        self.transport.send(dest, tag, data).await
    }

    pub(crate) async fn recv_from(&self, src: Rank, tag: u64, buf: &mut [u8]) -> Result<()> {
        let src = self.transport_rank(src)?;
        self.transport.recv(src, tag, buf).await
    }

    pub(crate) fn next_barrier_epoch(&self) -> u64 {
        self.barrier_epoch.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_collective_seq(&self) -> u64 {
        self.collective_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Block until every rank of the communicator has called `barrier`.
    pub async fn barrier(&self) -> Result<()> {
        crate::collective::barrier(self).await
    }

    /// The sub-communicator separating the last `num_lonely` ranks from the
    /// regular group. Built by a collective `split` on first use.
    pub(crate) async fn lonely_group(&self, num_lonely: usize) -> Result<Arc<Communicator>> {
        let mut groups = self.lonely_groups.lock().await;
        if let Some(group) = groups.get(&num_lonely) {
            return Ok(Arc::clone(group));
        }
        let num_regular = self.world_size() as usize - num_lonely;
        let color = u32::from(self.rank as usize >= num_regular);
        let group = Arc::new(self.split(color, self.rank).await?);
        tracing::debug!(
            rank = self.rank,
            num_lonely,
            sub_rank = group.rank(),
            sub_world = group.world_size(),
            "built lonely split"
        );
        groups.insert(num_lonely, Arc::clone(&group));
        Ok(group)
    }
}
