//! Storage-side KV sync driver.
//!
//! The driver alternates two phases against one peer:
//!
//! - **Retrieve**: the peer sends a batch of token sequences; the driver looks
//!   each one up in the [`KvStore`], answers with per-request hit counts, then
//!   streams key/value tensors for every hit followed by a zero filler.
//!   The hit-count answer is a batch object whose `token_range[i]` is
//!   `(0, hit_i)`. It is one object frame more than the bare tensor exchange,
//!   and peers must receive it before sizing their tensor receives.
//! - **Store**: the driver sends a probe, the peer answers with a batch, and the
//!   driver receives key/value tensors and a filler for every request and hands
//!   them to the store without waiting for persistence. Entries keep the
//!   request's layer and head ranges, and are only served for ranges they cover.
//!
//! Both sides must issue the exact same call sequence. Per-request problems
//! (store failures, invalid ranges) therefore degrade to a miss or a dropped
//! store and never change which frames are exchanged. Transport failures leave
//! the stream misaligned and poison the session.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ModelConfig;
use crate::transfer::metadata::{MetadataMessage, RequestBatchMetadata, RequestMeta};
use crate::transfer::tensor::Tensor;
use crate::transfer::{TransportChannel, TransportError};

use super::store::{Device, KvLayout, KvPair, KvStore, StoreError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("sync session is poisoned by an earlier failure")]
    SessionPoisoned,
}

impl SyncError {
    /// Whether the session must be torn down and re-established.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::SessionPoisoned)
    }
}

/// Phase the driver runs on its next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Retrieve,
    Store,
    /// Terminal: an earlier phase failed mid-exchange.
    Poisoned,
}

impl SyncPhase {
    fn next(self) -> Self {
        match self {
            SyncPhase::Retrieve => SyncPhase::Store,
            SyncPhase::Store => SyncPhase::Retrieve,
            SyncPhase::Poisoned => SyncPhase::Poisoned,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Retrieve => write!(f, "retrieve"),
            SyncPhase::Store => write!(f, "store"),
            SyncPhase::Poisoned => write!(f, "poisoned"),
        }
    }
}

/// Outcome of one completed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: SyncPhase,
    /// Requests in the batch.
    pub requests: usize,
    /// Retrieve: requests with a cache hit. Store: requests handed to the store.
    pub served: usize,
    /// Tokens whose KV crossed the wire.
    pub tokens: usize,
    /// Key and value tensors exchanged (fillers excluded).
    pub tensors: usize,
}

/// Cumulative driver counters.
#[derive(Debug, Default, Clone)]
pub struct DriverStats {
    pub retrieve_phases: u64,
    pub store_phases: u64,
    pub requests_retrieved: u64,
    pub requests_hit: u64,
    pub tokens_sent: u64,
    pub requests_stored: u64,
    pub stores_dropped: u64,
    pub tokens_received: u64,
    pub total_phase_time_ms: u64,
}

/// Tensors to send for one request of a retrieve batch.
struct Hit {
    tokens: usize,
    /// Key/value per layer of the request's layer range, heads already selected.
    kv: Vec<KvPair>,
}

pub struct SyncDriver {
    model: ModelConfig,
    device: Device,
    channel: TransportChannel,
    store: Arc<dyn KvStore>,
    phase: SyncPhase,
    in_flight: bool,
    stats: DriverStats,
}

impl SyncDriver {
    pub fn new(
        model: ModelConfig,
        device: Device,
        channel: TransportChannel,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, SyncError> {
        if model.end_layer <= model.start_layer {
            return Err(SyncError::InvalidArgument(format!(
                "empty layer range {}..{}",
                model.start_layer, model.end_layer
            )));
        }
        if model.num_heads == 0 || model.head_size == 0 {
            return Err(SyncError::InvalidArgument(format!(
                "degenerate head layout: {} heads of size {}",
                model.num_heads, model.head_size
            )));
        }

        info!(
            layers = ?(model.start_layer..model.end_layer),
            num_heads = model.num_heads,
            head_size = model.head_size,
            dtype = %model.dtype,
            "KV sync driver initialized"
        );
        Ok(Self {
            model,
            device,
            channel,
            store,
            phase: SyncPhase::Retrieve,
            in_flight: false,
            stats: DriverStats::default(),
        })
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.channel
    }

    /// Run the current phase, bounded by `deadline` if given.
    ///
    /// Expiry counts as a protocol desync. Any error poisons the session.
    pub async fn step(&mut self, deadline: Option<Duration>) -> Result<PhaseReport, SyncError> {
        let phase = self.phase;
        if phase == SyncPhase::Poisoned {
            return Err(SyncError::SessionPoisoned);
        }

        let start = Instant::now();
        self.in_flight = true;
        let result = match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.run_phase(phase)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ProtocolDesync(format!(
                    "{phase} phase did not complete within {limit:?}"
                ))
                .into()),
            },
            None => self.run_phase(phase).await,
        };
        self.in_flight = false;
        self.stats.total_phase_time_ms += start.elapsed().as_millis() as u64;

        match result {
            Ok(report) => {
                self.phase = phase.next();
                Ok(report)
            }
            Err(e) => {
                error!(%phase, error = %e, "Sync phase failed, poisoning session");
                self.phase = SyncPhase::Poisoned;
                Err(e)
            }
        }
    }

    /// Alternate phases until `shutdown` resolves or a phase fails.
    ///
    /// Shutdown is honoured between and during phases. Interrupting a phase
    /// poisons the session.
    pub async fn run<F>(
        &mut self,
        shutdown: F,
        deadline: Option<Duration>,
    ) -> Result<DriverStats, SyncError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                result = self.step(deadline) => Some(result),
            };

            match outcome {
                Some(result) => {
                    result?;
                }
                None => {
                    if self.in_flight {
                        warn!(phase = %self.phase, "Shutdown interrupted a phase");
                        self.in_flight = false;
                        self.phase = SyncPhase::Poisoned;
                    }
                    info!(
                        retrieve_phases = self.stats.retrieve_phases,
                        store_phases = self.stats.store_phases,
                        "KV sync driver stopped"
                    );
                    return Ok(self.stats.clone());
                }
            }
        }
    }

    async fn run_phase(&mut self, phase: SyncPhase) -> Result<PhaseReport, SyncError> {
        match phase {
            SyncPhase::Retrieve => self.retrieve_and_send().await,
            SyncPhase::Store => self.recv_and_store().await,
            SyncPhase::Poisoned => Err(SyncError::SessionPoisoned),
        }
    }

    /// RETRIEVE phase: answer one batch from the store.
    async fn retrieve_and_send(&mut self) -> Result<PhaseReport, SyncError> {
        let batch = match self.channel.recv_object::<MetadataMessage>().await? {
            MetadataMessage::Batch(batch) => batch,
            MetadataMessage::Probe => {
                return Err(TransportError::ProtocolDesync(
                    "expected a request batch, peer sent a probe".into(),
                )
                .into())
            }
        };
        info!(requests = batch.len(), "Retrieving KV for batch");

        let mut hits = Vec::with_capacity(batch.len());
        for (i, req) in batch.requests().enumerate() {
            hits.push(self.lookup(i, &req).await);
        }

        let response = RequestBatchMetadata::new(
            batch.token_ids().to_vec(),
            batch.layer_range().to_vec(),
            batch.head_range().to_vec(),
            hits.iter()
                .map(|h| (0, h.as_ref().map_or(0, |h| h.tokens)))
                .collect(),
        )?;
        self.channel
            .send_object(&MetadataMessage::Batch(response))
            .await?;

        let mut report = PhaseReport {
            phase: SyncPhase::Retrieve,
            requests: batch.len(),
            served: 0,
            tokens: 0,
            tensors: 0,
        };
        let batch_layers = batch.layer_range();
        for (i, hit) in hits.into_iter().enumerate() {
            let Some(hit) = hit else { continue };
            for (offset, (key, value)) in hit.kv.iter().enumerate() {
                debug!(request = i, layer = batch_layers[i].0 + offset, "Sending layer");
                self.channel.send(key).await?;
                self.channel.send(value).await?;
                report.tensors += 2;
            }
            let filler = self.filler(hit.tokens);
            self.channel.send(&filler).await?;
            report.served += 1;
            report.tokens += hit.tokens;
        }

        info!(
            hits = report.served,
            requests = report.requests,
            "Retrieve phase complete"
        );
        self.stats.retrieve_phases += 1;
        self.stats.requests_retrieved += report.requests as u64;
        self.stats.requests_hit += report.served as u64;
        self.stats.tokens_sent += report.tokens as u64;
        Ok(report)
    }

    /// STORE phase: solicit one batch and hand it to the store.
    async fn recv_and_store(&mut self) -> Result<PhaseReport, SyncError> {
        self.channel.send_object(&MetadataMessage::Probe).await?;
        let batch = match self.channel.recv_object::<MetadataMessage>().await? {
            MetadataMessage::Batch(batch) => batch,
            MetadataMessage::Probe => {
                return Err(TransportError::ProtocolDesync(
                    "expected a request batch, peer answered the probe with a probe".into(),
                )
                .into())
            }
        };
        debug!(requests = batch.len(), "Receiving KV batch");

        let mut report = PhaseReport {
            phase: SyncPhase::Store,
            requests: batch.len(),
            served: 0,
            tokens: 0,
            tensors: 0,
        };
        for (i, req) in batch.requests().enumerate() {
            let num_tokens = req.token_ids.len();
            let shape = [num_tokens, req.num_heads(), self.model.head_size];

            let mut kv = Vec::with_capacity(req.layers.len());
            for layer in req.layers.clone() {
                debug!(request = i, layer, "Receiving layer");
                let key = self.channel.recv(&shape, self.model.dtype).await?;
                let value = self.channel.recv(&shape, self.model.dtype).await?;
                kv.push((key, value));
                report.tensors += 2;
            }
            report.tokens += num_tokens;

            match self.check_ranges(&req) {
                Ok(()) => match self
                    .store
                    .store(req.token_ids, layout_of(&req), kv, false)
                    .await
                {
                    Ok(()) => report.served += 1,
                    Err(e) => {
                        warn!(request = i, error = %e, "Dropping KV store");
                        self.stats.stores_dropped += 1;
                    }
                },
                Err(e) => {
                    warn!(request = i, error = %e, "Dropping KV for out-of-range request");
                    self.stats.stores_dropped += 1;
                }
            }

            self.channel
                .recv(&[num_tokens, self.model.hidden_size], self.model.dtype)
                .await?;
        }

        info!(
            stored = report.served,
            requests = report.requests,
            tokens = report.tokens,
            "Store phase complete"
        );
        self.stats.store_phases += 1;
        self.stats.requests_stored += report.served as u64;
        self.stats.tokens_received += report.tokens as u64;
        Ok(report)
    }

    /// Resolve request `i` to the tensors to send, or `None` for a miss.
    async fn lookup(&self, i: usize, req: &RequestMeta<'_>) -> Option<Hit> {
        if let Err(e) = self.check_ranges(req) {
            warn!(request = i, error = %e, "Treating out-of-range request as a miss");
            return None;
        }

        let want = layout_of(req);
        let retrieved = match self.store.retrieve(req.token_ids, &want, self.device).await {
            Ok(retrieved) => retrieved,
            Err(e) => {
                warn!(request = i, error = %e, "KV retrieval failed, treating as a miss");
                return None;
            }
        };
        if !retrieved.is_hit() {
            return None;
        }

        match self.check_hit(&retrieved.kv, req, retrieved.num_hit_tokens) {
            Ok(()) => Some(Hit {
                tokens: retrieved.num_hit_tokens,
                kv: retrieved.kv,
            }),
            Err(e) => {
                warn!(request = i, error = %e, "Cached KV does not fit request, treating as a miss");
                None
            }
        }
    }

    /// Shapes the peer will size its receives by: one pair per requested
    /// layer, each `[hit, heads, head_size]`.
    fn check_hit(&self, kv: &[KvPair], req: &RequestMeta<'_>, hit: usize) -> Result<(), SyncError> {
        if kv.len() != req.layers.len() {
            return Err(StoreError::LayerCountMismatch {
                have: kv.len(),
                needed: req.layers.len(),
            }
            .into());
        }
        let expected = [hit, req.num_heads(), self.model.head_size];
        for (layer, (key, value)) in req.layers.clone().zip(kv) {
            for tensor in [key, value] {
                if tensor.shape() != &expected[..] || tensor.dtype() != self.model.dtype {
                    return Err(SyncError::InvalidArgument(format!(
                        "layer {layer} tensor is {:?} {}, expected {expected:?} {}",
                        tensor.shape(),
                        tensor.dtype(),
                        self.model.dtype
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_ranges(&self, req: &RequestMeta<'_>) -> Result<(), SyncError> {
        let stage = self.model.start_layer..self.model.end_layer;
        if req.layers.start < stage.start || req.layers.end > stage.end {
            return Err(SyncError::InvalidArgument(format!(
                "layers {:?} outside stage layers {stage:?}",
                req.layers
            )));
        }
        if req.heads.end > self.model.num_heads {
            return Err(SyncError::InvalidArgument(format!(
                "heads {:?} exceed {} heads",
                req.heads, self.model.num_heads
            )));
        }
        Ok(())
    }

    fn filler(&self, tokens: usize) -> Tensor {
        Tensor::zeros(vec![tokens, self.model.hidden_size], self.model.dtype)
    }
}

fn layout_of(req: &RequestMeta<'_>) -> KvLayout {
    KvLayout::new(req.layers.clone(), req.heads.clone())
}
