//! Communicator — one worker's endpoint into the process group
//!
//! Workers share nothing but their mailboxes. Every message is addressed by
//! `(source rank, tag)`; a receive posted before the matching send parks a
//! oneshot waiter, a send that arrives first is queued until claimed.
//!
//! Collectives (broadcast, scatter, gather, max reduction) are built on the
//! same point-to-point layer. All ranks must call collectives in the same
//! order, since each call consumes the next collective sequence number.

use super::protocol::Tag;
use crate::error::{EvoError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

type Key = (usize, Tag);

#[derive(Default)]
struct Mailbox {
    queued: HashMap<Key, VecDeque<Vec<u8>>>,
    waiting: HashMap<Key, oneshot::Sender<Vec<u8>>>,
}

enum Posted {
    Ready(Vec<u8>),
    Waiting(oneshot::Receiver<Vec<u8>>),
}

/// A worker's handle on the group
pub struct Communicator {
    rank: usize,
    size: usize,
    mailboxes: Arc<Vec<Mutex<Mailbox>>>,
    sequence: u64,
}

/// Create a group of `size` connected endpoints, one per worker
pub fn local_group(size: usize) -> Vec<Communicator> {
    let mailboxes: Arc<Vec<Mutex<Mailbox>>> =
        Arc::new((0..size).map(|_| Mutex::new(Mailbox::default())).collect());
    (0..size)
        .map(|rank| Communicator {
            rank,
            size,
            mailboxes: mailboxes.clone(),
            sequence: 0,
        })
        .collect()
}

impl Communicator {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn mailbox(&self, rank: usize) -> Result<std::sync::MutexGuard<'_, Mailbox>> {
        self.mailboxes
            .get(rank)
            .ok_or_else(|| EvoError::comm(format!("rank {} outside group of {}", rank, self.size)))?
            .lock()
            .map_err(|_| EvoError::comm("mailbox lock poisoned"))
    }

    fn deliver(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<()> {
        let mut mailbox = self.mailbox(dest)?;
        let key = (self.rank, tag);
        match mailbox.waiting.remove(&key) {
            Some(waiter) => waiter.send(payload).map_err(|_| {
                EvoError::comm(format!("rank {} abandoned receive for {:?}", dest, tag))
            }),
            None => {
                mailbox.queued.entry(key).or_default().push_back(payload);
                Ok(())
            }
        }
    }

    fn post(&self, source: usize, tag: Tag) -> Result<Posted> {
        let mut mailbox = self.mailbox(self.rank)?;
        let key = (source, tag);
        if let Some(queue) = mailbox.queued.get_mut(&key) {
            if let Some(payload) = queue.pop_front() {
                if queue.is_empty() {
                    mailbox.queued.remove(&key);
                }
                return Ok(Posted::Ready(payload));
            }
        }
        if mailbox.waiting.contains_key(&key) {
            return Err(EvoError::comm(format!(
                "duplicate receive posted for {:?} from rank {}",
                tag, source
            )));
        }
        let (tx, rx) = oneshot::channel();
        mailbox.waiting.insert(key, tx);
        Ok(Posted::Waiting(rx))
    }

    /// Non-blocking send; the returned future resolves once the payload is
    /// handed to the destination mailbox
    pub fn isend(
        &self,
        dest: usize,
        tag: Tag,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let delivered = self.deliver(dest, tag, payload);
        async move { delivered }
    }

    /// Non-blocking receive into a buffer of `capacity` bytes.
    ///
    /// A payload larger than `capacity` is an error rather than a silent
    /// truncation.
    pub fn irecv(
        &self,
        source: usize,
        tag: Tag,
        capacity: usize,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send + 'static {
        let posted = self.post(source, tag);
        let rank = self.rank;
        async move {
            let payload = match posted? {
                Posted::Ready(payload) => payload,
                Posted::Waiting(rx) => rx.await.map_err(|_| {
                    EvoError::comm(format!("rank {} left before sending {:?}", source, tag))
                })?,
            };
            if payload.len() > capacity {
                return Err(EvoError::comm(format!(
                    "rank {} received {} bytes for {:?} into a {} byte buffer",
                    rank,
                    payload.len(),
                    tag,
                    capacity
                )));
            }
            Ok(payload)
        }
    }

    pub async fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        self.irecv(source, tag, usize::MAX).await
    }

    fn next_collective(&mut self) -> Tag {
        let tag = Tag::Collective(self.sequence);
        self.sequence += 1;
        tag
    }

    /// Root's value is returned on every rank
    pub async fn broadcast<T>(&mut self, value: Option<T>, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let tag = self.next_collective();
        if self.rank == root {
            let value =
                value.ok_or_else(|| EvoError::comm("broadcast root has no value to send"))?;
            let bytes = serde_json::to_vec(&value)?;
            for dest in (0..self.size).filter(|&d| d != root) {
                self.deliver(dest, tag, bytes.clone())?;
            }
            Ok(value)
        } else {
            let bytes = self.recv(root, tag).await?;
            Ok(serde_json::from_slice(&bytes)?)
        }
    }

    /// Root supplies one chunk per rank; every rank returns its own chunk
    pub async fn scatter<T>(&mut self, chunks: Option<Vec<T>>, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let tag = self.next_collective();
        if self.rank == root {
            let chunks = chunks.ok_or_else(|| EvoError::comm("scatter root has no chunks"))?;
            if chunks.len() != self.size {
                return Err(EvoError::comm(format!(
                    "scatter needs {} chunks, got {}",
                    self.size,
                    chunks.len()
                )));
            }
            let mut own = None;
            for (dest, chunk) in chunks.into_iter().enumerate() {
                if dest == root {
                    own = Some(chunk);
                } else {
                    self.deliver(dest, tag, serde_json::to_vec(&chunk)?)?;
                }
            }
            own.ok_or_else(|| EvoError::comm("scatter lost the root chunk"))
        } else {
            let bytes = self.recv(root, tag).await?;
            Ok(serde_json::from_slice(&bytes)?)
        }
    }

    /// Collect one value per rank at `root`, in rank order
    pub async fn gather<T>(&mut self, value: T, root: usize) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        let tag = self.next_collective();
        if self.rank != root {
            self.deliver(root, tag, serde_json::to_vec(&value)?)?;
            return Ok(None);
        }
        let mut own = Some(value);
        let mut gathered = Vec::with_capacity(self.size);
        for source in 0..self.size {
            if source == root {
                gathered.push(own.take().ok_or_else(|| EvoError::comm("gather lost root value"))?);
            } else {
                let bytes = self.recv(source, tag).await?;
                gathered.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(Some(gathered))
    }

    /// Maximum of `value` across the group, known to every rank
    pub async fn all_reduce_max(&mut self, value: u64) -> Result<u64> {
        let gathered = self.gather(value, 0).await?;
        let max = gathered.map(|values| values.into_iter().max().unwrap_or(0));
        self.broadcast(max, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::try_join_all;

    #[tokio::test]
    async fn test_send_before_receive() {
        let group = local_group(2);
        group[0].isend(1, Tag::Slot(3), vec![1, 2, 3]).await.unwrap();
        let got = group[1].irecv(0, Tag::Slot(3), 16).await.unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_receive_before_send() {
        let group = local_group(2);
        let pending = group[1].irecv(0, Tag::Slot(0), 16);
        group[0].isend(1, Tag::Slot(0), vec![9]).await.unwrap();
        assert_eq!(pending.await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_tags_do_not_cross() {
        let group = local_group(2);
        let a = group[1].irecv(0, Tag::Slot(1), 8);
        let b = group[1].irecv(0, Tag::Slot(2), 8);
        group[0].isend(1, Tag::Slot(2), vec![2]).await.unwrap();
        group[0].isend(1, Tag::Slot(1), vec![1]).await.unwrap();
        assert_eq!(a.await.unwrap(), vec![1]);
        assert_eq!(b.await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let group = local_group(2);
        group[0].isend(1, Tag::Slot(0), vec![0; 10]).await.unwrap();
        let result = group[1].irecv(0, Tag::Slot(0), 4).await;
        assert!(matches!(result, Err(EvoError::Communication(_))));
    }

    #[tokio::test]
    async fn test_collectives() {
        let group = local_group(4);
        let tasks = group.into_iter().map(|mut comm| {
            tokio::spawn(async move {
                let rank = comm.rank();
                let word: String = comm
                    .broadcast((rank == 0).then(|| "hello".to_string()), 0)
                    .await?;
                let chunks = (rank == 0).then(|| vec![10u32, 11, 12, 13]);
                let mine = comm.scatter(chunks, 0).await?;
                let all = comm.gather(mine * 2, 0).await?;
                let max = comm.all_reduce_max(rank as u64 * 5).await?;
                Ok::<_, EvoError>((rank, word, mine, all, max))
            })
        });
        let results = try_join_all(tasks).await.unwrap();
        for result in results {
            let (rank, word, mine, all, max) = result.unwrap();
            assert_eq!(word, "hello");
            assert_eq!(mine, 10 + rank as u32);
            assert_eq!(max, 15);
            if rank == 0 {
                assert_eq!(all, Some(vec![20, 22, 24, 26]));
            } else {
                assert_eq!(all, None);
            }
        }
    }
}
