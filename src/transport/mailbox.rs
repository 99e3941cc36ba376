use crate::error::{FlexError, Result};
use crate::types::Rank;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

type Key = (Rank, u64);

enum Slot {
    /// Messages that arrived before anyone asked for them, oldest first.
    Ready(VecDeque<Vec<u8>>),
    /// A receive is parked on this key.
    Waiting(oneshot::Sender<Result<Vec<u8>>>),
}

#[derive(Default)]
struct State {
    slots: HashMap<Key, Slot>,
    closed: HashSet<Rank>,
}

/// Per-endpoint matching of incoming messages to receives by `(source, tag)`.
///
/// Either side may arrive first: early messages are queued, early receives
/// park on a oneshot that the delivering side completes. At most one receive
/// may wait on a given key.
#[derive(Default)]
pub(crate) struct Mailbox {
    state: Mutex<State>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| FlexError::LockPoisoned("mailbox"))
    }

    /// Hand a message from `src` to whoever waits on `(src, tag)`, or queue it.
    pub(crate) fn deliver(&self, src: Rank, tag: u64, payload: Vec<u8>) -> Result<()> {
        let mut st = self.lock()?;
        let key = (src, tag);
        match st.slots.remove(&key) {
            Some(Slot::Waiting(tx)) => {
                // The receive may have been dropped; keep the payload if so.
                if let Err(Ok(payload)) = tx.send(Ok(payload)) {
                    st.slots.insert(key, Slot::Ready(VecDeque::from([payload])));
                }
            }
            Some(Slot::Ready(mut queue)) => {
                queue.push_back(payload);
                st.slots.insert(key, Slot::Ready(queue));
            }
            None => {
                st.slots.insert(key, Slot::Ready(VecDeque::from([payload])));
            }
        }
        Ok(())
    }

    /// Wait for the next message from `src` carrying `tag`.
    pub(crate) async fn take(&self, src: Rank, tag: u64) -> Result<Vec<u8>> {
        let rx = {
            let mut st = self.lock()?;
            let key = (src, tag);
            match st.slots.get_mut(&key) {
                Some(Slot::Ready(queue)) => {
                    let payload = queue.pop_front();
                    if queue.is_empty() {
                        st.slots.remove(&key);
                    }
                    if let Some(payload) = payload {
                        return Ok(payload);
                    }
                }
                Some(Slot::Waiting(tx)) if !tx.is_closed() => {
                    return Err(FlexError::DuplicateReceive { rank: src, tag });
                }
                _ => {}
            }
            if st.closed.contains(&src) {
                return Err(FlexError::PeerDisconnected { rank: src });
            }
            let (tx, rx) = oneshot::channel();
            st.slots.insert(key, Slot::Waiting(tx));
            rx
        };

        rx.await
            .map_err(|_| FlexError::PeerDisconnected { rank: src })?
    }

    /// Mark `src` as gone: parked receives on it fail, future ones fail fast.
    /// Already queued messages stay readable.
    pub(crate) fn close_peer(&self, src: Rank) -> Result<()> {
        let mut st = self.lock()?;
        st.closed.insert(src);
        let parked: Vec<Key> = st
            .slots
            .iter()
            .filter(|(key, slot)| key.0 == src && matches!(slot, Slot::Waiting(_)))
            .map(|(key, _)| *key)
            .collect();
        for key in parked {
            if let Some(Slot::Waiting(tx)) = st.slots.remove(&key) {
                let _ = tx.send(Err(FlexError::PeerDisconnected { rank: src }));
            }
        }
        Ok(())
    }
}
