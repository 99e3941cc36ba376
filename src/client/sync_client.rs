use crate::config::FlexConfig;
use crate::error::{FlexError, Result};
use crate::topology::StagePlan;
use crate::transport::bind_loopback;
use crate::types::{DataType, Element, Rank, ReduceOp, SendBuf};

use super::Communicator;
use tokio::net::TcpListener;

/// Blocking wrapper around [`Communicator`].
///
/// Owns a `tokio::runtime::Runtime` and calls `block_on()` for each operation.
/// Ranks of one world must run on separate threads.
pub struct SyncCommunicator {
    inner: Communicator,
    rt: tokio::runtime::Runtime,
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| FlexError::transport_with_source("tokio runtime", e))
}

impl SyncCommunicator {
    /// In-process mesh, one blocking communicator per rank.
    pub fn bootstrap_local(world_size: u32, config: FlexConfig) -> Result<Vec<Self>> {
        Communicator::bootstrap_local(world_size, config)
            .into_iter()
            .map(Self::from_async)
            .collect()
    }

    /// Loopback TCP mesh, one blocking communicator per rank.
    ///
    /// Each rank joins the mesh from its own thread inside its own runtime,
    /// so its sockets and receive loops live and die with that communicator.
    pub fn bootstrap_tcp_local(world_size: u32, config: FlexConfig) -> Result<Vec<Self>> {
        let (listeners, addrs) = bind_loopback(world_size)?;
        let addrs = &addrs;
        std::thread::scope(|s| {
            let mut handles = Vec::with_capacity(listeners.len());
            for (rank, listener) in listeners.into_iter().enumerate() {
                let config = config.clone();
                handles.push(s.spawn(move || -> Result<Self> {
                    let rt = runtime()?;
                    let listener = {
                        let _ctx = rt.enter();
                        TcpListener::from_std(listener)?
                    };
                    let inner =
                        rt.block_on(Communicator::connect_tcp(rank as Rank, listener, addrs, config))?;
                    Ok(SyncCommunicator { inner, rt })
                }));
            }
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .map_err(|_| FlexError::transport("tcp bootstrap thread panicked"))
                        .and_then(std::convert::identity)
                })
                .collect()
        })
    }

    /// Wrap an existing async communicator with a new tokio runtime.
    pub fn from_async(inner: Communicator) -> Result<Self> {
        Ok(Self {
            inner,
            rt: runtime()?,
        })
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.inner.world_size()
    }

    pub fn barrier(&self) -> Result<()> {
        self.rt.block_on(self.inner.barrier())
    }

    pub fn all_reduce(
        &self,
        send: SendBuf<'_>,
        recv: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        self.rt
            .block_on(self.inner.all_reduce(send, recv, count, dtype, op))
    }

    pub fn all_reduce_with_plan(
        &self,
        send: SendBuf<'_>,
        recv: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        plan: &StagePlan,
    ) -> Result<()> {
        self.rt
            .block_on(self.inner.all_reduce_with_plan(send, recv, count, dtype, op, plan))
    }

    pub fn all_reduce_slice<T: Element>(&self, data: &mut [T], op: ReduceOp) -> Result<()> {
        self.rt.block_on(self.inner.all_reduce_slice(data, op))
    }

    /// Split into sub-groups; see [`Communicator::split`].
    pub fn split(&self, color: u32, key: u32) -> Result<SyncCommunicator> {
        let inner = self.rt.block_on(self.inner.split(color, key))?;
        Self::from_async(inner)
    }

    /// Access the underlying async communicator.
    pub fn as_async(&self) -> &Communicator {
        &self.inner
    }
}
