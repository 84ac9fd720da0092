//! KV storage service used by the sync driver.
//!
//! [`KvStore`] is the seam between the driver and whatever cache engine backs
//! it. [`InMemoryKvStore`] is a host-memory implementation that answers
//! retrievals with the longest stored token prefix.
//!
//! Every entry records the [`KvLayout`] it was stored with, so a partial
//! layer or head range is only ever served back for layers and heads it holds.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::cache::block::TokenId;
use crate::transfer::tensor::Tensor;
use crate::transfer::TransportError;

/// Key and value tensors of one layer, each `[num_tokens, num_heads, head_size]`.
pub type KvPair = (Tensor, Tensor);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("device {0} is not supported by this store")]
    UnsupportedDevice(Device),

    #[error("store worker has shut down")]
    Closed,

    #[error("entry holds {have} layers, {needed} required")]
    LayerCountMismatch { have: usize, needed: usize },

    #[error("layer {layer} holds {have} heads, expected {expected}")]
    HeadCountMismatch {
        layer: usize,
        have: usize,
        expected: usize,
    },

    #[error("layer {layer} covers {have} tokens, expected {expected}")]
    TokenCountMismatch {
        layer: usize,
        have: usize,
        expected: usize,
    },

    #[error(transparent)]
    Tensor(#[from] TransportError),
}

/// Where retrieved tensors should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Absolute layer and head ranges covered by a set of KV tensors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvLayout {
    pub layers: Range<usize>,
    pub heads: Range<usize>,
}

impl KvLayout {
    pub fn new(layers: Range<usize>, heads: Range<usize>) -> Self {
        Self { layers, heads }
    }

    /// Whether every layer and head of `other` is held here.
    pub fn covers(&self, other: &KvLayout) -> bool {
        self.layers.start <= other.layers.start
            && other.layers.end <= self.layers.end
            && self.heads.start <= other.heads.start
            && other.heads.end <= self.heads.end
    }
}

/// Result of a retrieval: one pair per requested layer, narrowed to the
/// requested heads and to the first `num_hit_tokens` tokens of the query.
#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    pub kv: Vec<KvPair>,
    pub num_hit_tokens: usize,
}

impl Retrieved {
    pub fn miss() -> Self {
        Self::default()
    }

    pub fn is_hit(&self) -> bool {
        self.num_hit_tokens > 0
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Persist KV for `token_ids`, one pair per layer of `layout.layers`, each
    /// holding `layout.heads`. With `blocking = false` the call may return
    /// before the entry is visible to `retrieve`.
    async fn store(
        &self,
        token_ids: &[TokenId],
        layout: KvLayout,
        kv: Vec<KvPair>,
        blocking: bool,
    ) -> Result<(), StoreError>;

    /// Look up the longest cached prefix of `token_ids` among entries that
    /// cover `want`.
    async fn retrieve(
        &self,
        token_ids: &[TokenId],
        want: &KvLayout,
        device: Device,
    ) -> Result<Retrieved, StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub stores: u64,
    pub retrievals: u64,
    pub hits: u64,
    pub hit_tokens: u64,
    pub entries: usize,
}

enum Command {
    Put {
        token_ids: Vec<TokenId>,
        entry: Entry,
        ack: Option<oneshot::Sender<()>>,
    },
    Flush(oneshot::Sender<()>),
}

struct Entry {
    layout: KvLayout,
    kv: Vec<KvPair>,
}

impl Entry {
    /// Narrow to the layers and heads of `want` and the first `tokens` tokens.
    fn select(&self, want: &KvLayout, tokens: usize) -> Result<Vec<KvPair>, TransportError> {
        let first = want.layers.start - self.layout.layers.start;
        let head_offset = want.heads.start - self.layout.heads.start;
        let narrow = |t: &Tensor| -> Result<Tensor, TransportError> {
            let t = t.narrow(0, 0, tokens)?;
            if want.heads == self.layout.heads {
                Ok(t)
            } else {
                t.narrow(1, head_offset, want.heads.len())
            }
        };
        self.kv[first..first + want.layers.len()]
            .iter()
            .map(|(k, v)| -> Result<KvPair, TransportError> { Ok((narrow(k)?, narrow(v)?)) })
            .collect()
    }
}

/// Entries sharing a token sequence differ in layout; storing the same layout
/// again replaces the old tensors.
#[derive(Default)]
struct Inner {
    entries: HashMap<Vec<TokenId>, Vec<Entry>>,
    stats: StoreStats,
}

impl Inner {
    fn count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Host-memory store with a background writer.
///
/// Writes are queued onto a worker task so non-blocking stores never wait on
/// the entry map. Must be created inside a tokio runtime.
pub struct InMemoryKvStore {
    inner: Arc<RwLock<Inner>>,
    tx: mpsc::Sender<Command>,
}

impl InMemoryKvStore {
    /// Create a store whose write queue holds up to `queue_depth` pending stores.
    pub fn new(queue_depth: usize) -> Self {
        let inner = Arc::new(RwLock::new(Inner::default()));
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        tokio::spawn(run_writer(Arc::clone(&inner), rx));
        Self { inner, tx }
    }

    /// Wait until every store queued before this call is visible.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| StoreError::Closed)?;
        done.await.map_err(|_| StoreError::Closed)
    }

    /// Number of stored entries across all token sequences.
    pub async fn len(&self) -> usize {
        self.inner.read().await.count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> StoreStats {
        self.inner.read().await.stats.clone()
    }
}

async fn run_writer(inner: Arc<RwLock<Inner>>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Put {
                token_ids,
                entry,
                ack,
            } => {
                let mut guard = inner.write().await;
                let num_tokens = token_ids.len();
                let slot = guard.entries.entry(token_ids).or_default();
                match slot.iter_mut().find(|e| e.layout == entry.layout) {
                    Some(existing) => {
                        debug!(num_tokens, layout = ?entry.layout, "Replaced cached KV entry");
                        *existing = entry;
                    }
                    None => slot.push(entry),
                }
                guard.stats.stores += 1;
                guard.stats.entries = guard.count();
                drop(guard);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("KV store writer stopped");
}

fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn check_entry(kv: &[KvPair], layout: &KvLayout, num_tokens: usize) -> Result<(), StoreError> {
    if kv.len() != layout.layers.len() {
        return Err(StoreError::LayerCountMismatch {
            have: kv.len(),
            needed: layout.layers.len(),
        });
    }
    for (layer, (key, value)) in layout.layers.clone().zip(kv) {
        for tensor in [key, value] {
            let have = tensor.shape().first().copied().unwrap_or(0);
            if have != num_tokens {
                return Err(StoreError::TokenCountMismatch {
                    layer,
                    have,
                    expected: num_tokens,
                });
            }
            let have = tensor.shape().get(1).copied().unwrap_or(0);
            if have != layout.heads.len() {
                return Err(StoreError::HeadCountMismatch {
                    layer,
                    have,
                    expected: layout.heads.len(),
                });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn store(
        &self,
        token_ids: &[TokenId],
        layout: KvLayout,
        kv: Vec<KvPair>,
        blocking: bool,
    ) -> Result<(), StoreError> {
        check_entry(&kv, &layout, token_ids.len())?;

        let (ack, done) = if blocking {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.tx
            .send(Command::Put {
                token_ids: token_ids.to_vec(),
                entry: Entry { layout, kv },
                ack,
            })
            .await
            .map_err(|_| StoreError::Closed)?;

        if let Some(done) = done {
            done.await.map_err(|_| StoreError::Closed)?;
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        token_ids: &[TokenId],
        want: &KvLayout,
        device: Device,
    ) -> Result<Retrieved, StoreError> {
        if device != Device::Cpu {
            warn!(%device, "Retrieval requested on a device this store cannot serve");
            return Err(StoreError::UnsupportedDevice(device));
        }

        let mut guard = self.inner.write().await;
        guard.stats.retrievals += 1;

        let best = guard
            .entries
            .iter()
            .flat_map(|(key, entries)| {
                let hit = common_prefix_len(key, token_ids);
                entries.iter().map(move |entry| (hit, entry))
            })
            .filter(|(hit, entry)| *hit > 0 && entry.layout.covers(want))
            .max_by_key(|(hit, _)| *hit);

        let Some((hit, entry)) = best else {
            return Ok(Retrieved::miss());
        };
        let kv = entry.select(want, hit)?;

        guard.stats.hits += 1;
        guard.stats.hit_tokens += hit as u64;
        debug!(hit, query_len = token_ids.len(), "KV prefix hit");

        Ok(Retrieved {
            kv,
            num_hit_tokens: hit,
        })
    }
}
