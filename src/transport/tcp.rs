use super::mailbox::Mailbox;
use super::{Transport, check_rank, copy_payload};
use crate::error::{FlexError, Result};
use crate::types::Rank;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Maximum frame payload sent to or accepted from a peer (4 GiB).
const MAX_TCP_FRAME_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Upfront payload allocation; larger frames grow as bytes actually arrive.
const INITIAL_PAYLOAD_CAPACITY: u64 = 1024 * 1024;

/// Delay between connection attempts while a peer is not yet listening.
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Full-mesh transport over plain TCP, one stream per peer pair.
///
/// Frames are `[tag: u64 LE][len: u64 LE][payload]`. A background task per
/// peer reads frames into a shared [`Mailbox`]; when a peer's stream ends,
/// receives from it fail with `PeerDisconnected`.
pub struct TcpTransport {
    rank: Rank,
    world_size: u32,
    writers: HashMap<Rank, Mutex<WriteHalf<TcpStream>>>,
    mailbox: Arc<Mailbox>,
    recv_handles: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    /// Form the mesh for `rank`, given every rank's listen address.
    ///
    /// `listener` must already be bound to `addrs[rank]`. Each rank accepts
    /// connections from higher ranks and connects to lower ones, announcing
    /// itself with its rank as a 4-byte LE prefix.
    pub async fn establish(
        rank: Rank,
        listener: TcpListener,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Self> {
        let world_size = addrs.len() as u32;
        check_rank(rank, world_size)?;
        let expected = world_size - 1;
        let connected = AtomicU32::new(0);

        let formed = tokio::time::timeout(timeout, async {
            let (accepted, dialed) = tokio::try_join!(
                accept_higher(&listener, rank, world_size, &connected),
                connect_lower(rank, addrs, &connected),
            )?;
            Ok::<_, FlexError>(accepted.into_iter().chain(dialed).collect::<Vec<_>>())
        })
        .await
        .map_err(|_| FlexError::MeshFormationTimeout {
            connected: connected.load(Ordering::Relaxed),
            expected,
        })??;

        tracing::debug!(rank, world_size, "tcp mesh formed");
        Ok(Self::from_streams(rank, world_size, formed))
    }

    /// Build a loopback mesh of `world_size` ranks inside this process.
    pub async fn bootstrap_local(world_size: u32, timeout: Duration) -> Result<Vec<TcpTransport>> {
        let (listeners, addrs) = bind_loopback(world_size)?;
        let mut futs = Vec::with_capacity(listeners.len());
        for (rank, listener) in listeners.into_iter().enumerate() {
            let listener = TcpListener::from_std(listener)?;
            futs.push(Self::establish(rank as Rank, listener, &addrs, timeout));
        }
        futures::future::try_join_all(futs).await
    }

    fn from_streams(rank: Rank, world_size: u32, streams: Vec<(Rank, TcpStream)>) -> Self {
        let mailbox = Arc::new(Mailbox::new());
        let mut writers = HashMap::with_capacity(streams.len());
        let mut recv_handles = Vec::with_capacity(streams.len());
        for (peer, stream) in streams {
            let (reader, writer) = tokio::io::split(stream);
            writers.insert(peer, Mutex::new(writer));
            let mailbox = Arc::clone(&mailbox);
            recv_handles.push(tokio::spawn(recv_loop(rank, peer, reader, mailbox)));
        }
        Self {
            rank,
            world_size,
            writers,
            mailbox,
            recv_handles,
        }
    }

    /// Write a tagged frame: `[tag: u64 LE][len: u64 LE][payload]`.
    async fn write_frame(&self, dest: Rank, tag: u64, data: &[u8]) -> Result<()> {
        check_frame_len(data.len() as u64)?;
        let writer = self
            .writers
            .get(&dest)
            .ok_or(FlexError::UnknownPeer { rank: dest })?;
        let mut header = [0u8; 16];
        header[..8].copy_from_slice(&tag.to_le_bytes());
        header[8..].copy_from_slice(&(data.len() as u64).to_le_bytes());

        let mut writer = writer.lock().await;
        writer
            .write_all(&header)
            .await
            .map_err(|e| FlexError::transport_with_source(format!("tcp write header to {dest}"), e))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| FlexError::transport_with_source(format!("tcp write payload to {dest}"), e))?;
        writer
            .flush()
            .await
            .map_err(|e| FlexError::transport_with_source(format!("tcp flush to {dest}"), e))?;
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for handle in &self.recv_handles {
            handle.abort();
        }
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn send<'a>(&'a self, dest: Rank, tag: u64, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            check_rank(dest, self.world_size)?;
            if dest == self.rank {
                return self.mailbox.deliver(self.rank, tag, data.to_vec());
            }
            self.write_frame(dest, tag, data).await
        })
    }

    fn recv<'a>(&'a self, src: Rank, tag: u64, buf: &'a mut [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            check_rank(src, self.world_size)?;
            let payload = self.mailbox.take(src, tag).await?;
            copy_payload(&payload, buf)
        })
    }
}

/// Bind one non-blocking loopback listener per rank.
///
/// Plain `std` listeners so each rank can adopt its own into whichever tokio
/// runtime will drive it.
pub(crate) fn bind_loopback(
    world_size: u32,
) -> Result<(Vec<std::net::TcpListener>, Vec<SocketAddr>)> {
    let mut listeners = Vec::with_capacity(world_size as usize);
    let mut addrs = Vec::with_capacity(world_size as usize);
    for _ in 0..world_size {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .map_err(|e| FlexError::transport_with_source("tcp listen", e))?;
        listener.set_nonblocking(true)?;
        addrs.push(listener.local_addr()?);
        listeners.push(listener);
    }
    Ok((listeners, addrs))
}

fn check_frame_len(len: u64) -> Result<()> {
    if len > MAX_TCP_FRAME_SIZE {
        return Err(FlexError::FrameTooLarge {
            len,
            max: MAX_TCP_FRAME_SIZE,
        });
    }
    Ok(())
}

async fn accept_higher(
    listener: &TcpListener,
    rank: Rank,
    world_size: u32,
    connected: &AtomicU32,
) -> Result<Vec<(Rank, TcpStream)>> {
    let mut streams: Vec<(Rank, TcpStream)> = Vec::new();
    while streams.len() < (world_size - rank - 1) as usize {
        let (mut stream, addr) = listener
            .accept()
            .await
            .map_err(|e| FlexError::transport_with_source("tcp accept", e))?;
        let mut hello = [0u8; 4];
        stream
            .read_exact(&mut hello)
            .await
            .map_err(|e| FlexError::transport_with_source(format!("tcp handshake from {addr}"), e))?;
        let peer = u32::from_le_bytes(hello);
        if peer <= rank || peer >= world_size || streams.iter().any(|(r, _)| *r == peer) {
            tracing::warn!(rank, peer, %addr, "rejecting unexpected tcp peer");
            continue;
        }
        stream.set_nodelay(true)?;
        connected.fetch_add(1, Ordering::Relaxed);
        streams.push((peer, stream));
    }
    Ok(streams)
}

async fn connect_lower(
    rank: Rank,
    addrs: &[SocketAddr],
    connected: &AtomicU32,
) -> Result<Vec<(Rank, TcpStream)>> {
    let mut streams = Vec::with_capacity(rank as usize);
    for peer in 0..rank {
        let addr = addrs[peer as usize];
        let mut stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    tracing::trace!(rank, peer, %addr, "tcp connect retry: {e}");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        };
        stream.set_nodelay(true)?;
        stream
            .write_all(&rank.to_le_bytes())
            .await
            .map_err(|e| FlexError::ConnectionFailed {
                rank: peer,
                reason: e.to_string(),
            })?;
        connected.fetch_add(1, Ordering::Relaxed);
        streams.push((peer, stream));
    }
    Ok(streams)
}

/// Background loop: read frames from `peer` and deliver them to the mailbox.
async fn recv_loop(rank: Rank, peer: Rank, mut reader: ReadHalf<TcpStream>, mailbox: Arc<Mailbox>) {
    let mut header = [0u8; 16];
    loop {
        if let Err(e) = reader.read_exact(&mut header).await {
            tracing::debug!(rank, peer, "tcp recv loop ended: {e}");
            break;
        }
        let mut tag_bytes = [0u8; 8];
        let mut len_bytes = [0u8; 8];
        tag_bytes.copy_from_slice(&header[..8]);
        len_bytes.copy_from_slice(&header[8..]);
        let tag = u64::from_le_bytes(tag_bytes);
        let len = u64::from_le_bytes(len_bytes);

        if let Err(e) = check_frame_len(len) {
            tracing::warn!(rank, peer, "closing tcp connection: {e}");
            break;
        }

        // Grow with the bytes received rather than trusting the header.
        let mut payload = Vec::with_capacity(len.min(INITIAL_PAYLOAD_CAPACITY) as usize);
        match (&mut reader).take(len).read_to_end(&mut payload).await {
            Ok(n) if n as u64 == len => {}
            Ok(n) => {
                tracing::debug!(rank, peer, len, received = n, "tcp stream ended mid-frame");
                break;
            }
            Err(e) => {
                tracing::debug!(rank, peer, "tcp recv loop ended reading payload: {e}");
                break;
            }
        }
        if let Err(e) = mailbox.deliver(peer, tag, payload) {
            tracing::warn!(rank, peer, "dropping tcp frame: {e}");
            break;
        }
    }
    if let Err(e) = mailbox.close_peer(peer) {
        tracing::warn!(rank, peer, "failed to close peer mailbox: {e}");
    }
}
