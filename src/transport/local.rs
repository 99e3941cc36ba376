use super::mailbox::Mailbox;
use super::{Transport, check_rank, copy_payload};
use crate::error::Result;
use crate::types::Rank;
use futures::future::BoxFuture;
use std::sync::Arc;

/// In-process full mesh: one mailbox per rank, sends deliver directly.
///
/// Used to run every rank of a world as tokio tasks inside one process.
#[derive(Clone)]
pub struct LocalMesh {
    mailboxes: Arc<[Mailbox]>,
}

impl LocalMesh {
    pub fn new(world_size: u32) -> Self {
        Self {
            mailboxes: (0..world_size).map(|_| Mailbox::new()).collect(),
        }
    }

    pub fn world_size(&self) -> u32 {
        self.mailboxes.len() as u32
    }

    /// Endpoint for `rank`.
    pub fn endpoint(&self, rank: Rank) -> Result<Arc<LocalTransport>> {
        check_rank(rank, self.world_size())?;
        Ok(Arc::new(LocalTransport {
            rank,
            mailboxes: Arc::clone(&self.mailboxes),
        }))
    }

    /// Endpoints for every rank, in rank order.
    pub fn endpoints(&self) -> Vec<Arc<LocalTransport>> {
        (0..self.world_size())
            .map(|rank| {
                Arc::new(LocalTransport {
                    rank,
                    mailboxes: Arc::clone(&self.mailboxes),
                })
            })
            .collect()
    }

    /// Simulate `rank` dropping out: every receive from it now fails.
    pub fn disconnect(&self, rank: Rank) -> Result<()> {
        for mailbox in self.mailboxes.iter() {
            mailbox.close_peer(rank)?;
        }
        Ok(())
    }
}

/// One rank's view of a [`LocalMesh`].
pub struct LocalTransport {
    rank: Rank,
    mailboxes: Arc<[Mailbox]>,
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.mailboxes.len() as u32
    }

    fn send<'a>(&'a self, dest: Rank, tag: u64, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            check_rank(dest, self.world_size())?;
            tracing::trace!(src = self.rank, dest, tag, len = data.len(), "local send");
            self.mailboxes[dest as usize].deliver(self.rank, tag, data.to_vec())
        })
    }

    fn recv<'a>(&'a self, src: Rank, tag: u64, buf: &'a mut [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            check_rank(src, self.world_size())?;
            let payload = self.mailboxes[self.rank as usize].take(src, tag).await?;
            copy_payload(&payload, buf)
        })
    }
}
