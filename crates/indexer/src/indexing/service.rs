// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Instant,
};

use alloy_primitives::U256;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use super::classifier::{ClassifyError, TransactionClassifier};
use crate::{
    chain::{BlockHeader, ChainError, ChainReaderObj, Transaction, ValidatorIdentity},
    db::{
        leasing::{Block, ChunkCommit, ChunkCounts, Lease},
        DbError, LeasingDbObj,
    },
};

/// Page size for the validator's transaction history
pub const TRANSACTIONS_PAGE_SIZE: usize = 1000;
/// Heights committed per database transaction
pub const BLOCKS_PER_CHUNK: u64 = 99;
/// Largest header range requested from the node at once
pub const HEADERS_PER_REQUEST: u64 = 100;

#[derive(Debug, Clone)]
pub struct IndexerServiceConfig {
    pub validator_address: String,
    /// Blocks kept between the indexed target and the chain tip
    pub confirmation_blocks: u64,
}

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Indexer already initialized from height {0}")]
    AlreadyInitialized(u64),

    #[error("Start height is not set, run init first")]
    FromBlockNotFound,

    #[error("Target height {to} is below start height {from}")]
    ToLessThanFrom { from: u64, to: u64 },

    #[error("Invalid height {0}")]
    InvalidHeight(u64),

    #[error("Reindex height {from} is above the confirmed height {target}")]
    FromAboveTarget { from: u64, target: u64 },

    #[error("Reindex height {from} would skip unindexed heights, highest allowed is {limit}")]
    FromAboveIndexed { from: u64, limit: u64 },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

impl IndexerError {
    /// Whether the request itself was rejected, as opposed to a failure talking to the node or
    /// the database.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitialized(_)
                | Self::FromBlockNotFound
                | Self::ToLessThanFrom { .. }
                | Self::InvalidHeight(_)
                | Self::FromAboveTarget { .. }
                | Self::FromAboveIndexed { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexerPhase {
    InitRequire,
    Ready,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexerStatus {
    pub status: IndexerPhase,
    pub processed_from: u64,
    pub processed_to: Option<u64>,
    pub target_to: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartResponse {
    Started,
    InProgress,
    UpToDate,
}

/// State of the single indexing slot. At most one run holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSlot {
    Idle,
    /// Claimed, target not resolved yet
    Preparing,
    Running { from: u64, target: u64 },
}

/// Totals of one indexing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub chunks: usize,
    pub blocks: usize,
    pub previous_leases: usize,
    pub leases: usize,
    pub cancel_leases: usize,
    pub payments: usize,
    pub indexed_height: Option<u64>,
}

impl SyncReport {
    fn add(&mut self, counts: ChunkCounts, end_height: u64) {
        self.chunks += 1;
        self.blocks += counts.blocks;
        self.previous_leases += counts.previous_leases;
        self.leases += counts.leases;
        self.cancel_leases += counts.cancel_leases;
        self.payments += counts.payments;
        self.indexed_height = Some(end_height);
    }
}

struct Inner {
    chain: ChainReaderObj,
    db: LeasingDbObj,
    identity: ValidatorIdentity,
    config: IndexerServiceConfig,
    slot: watch::Sender<SyncSlot>,
    /// Error that stopped the most recent run, if it failed
    last_failure: Mutex<Option<String>>,
}

/// Releases the indexing slot when dropped, including when the run fails or panics.
struct SlotGuard {
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.slot.send_replace(SyncSlot::Idle);
    }
}

#[derive(Clone)]
pub struct IndexerService {
    inner: Arc<Inner>,
}

impl IndexerService {
    /// Creates the service, resolving the validator's aliases from the node.
    pub async fn new(
        chain: ChainReaderObj,
        db: LeasingDbObj,
        config: IndexerServiceConfig,
    ) -> Result<Self, IndexerError> {
        let identity = ValidatorIdentity::load(chain.as_ref(), &config.validator_address).await?;
        Ok(Self::with_identity(chain, db, identity, config))
    }

    pub fn with_identity(
        chain: ChainReaderObj,
        db: LeasingDbObj,
        identity: ValidatorIdentity,
        config: IndexerServiceConfig,
    ) -> Self {
        let (slot, _) = watch::channel(SyncSlot::Idle);
        let last_failure = Mutex::new(None);
        Self { inner: Arc::new(Inner { chain, db, identity, config, slot, last_failure }) }
    }

    /// Sets the first height to index. Only allowed once.
    pub async fn init(&self, from_height: u64) -> Result<(), IndexerError> {
        if from_height == 0 {
            return Err(IndexerError::InvalidHeight(from_height));
        }
        if !self.inner.db.init_from_height(from_height).await? {
            let state = self.inner.db.get_indexer_state().await?;
            return Err(IndexerError::AlreadyInitialized(state.from_height));
        }
        tracing::info!("Indexer initialized from height {}", from_height);
        Ok(())
    }

    pub async fn status(&self) -> Result<IndexerStatus, IndexerError> {
        let state = self.inner.db.get_indexer_state().await?;
        let slot = self.slot();

        let status = if state.from_height == 0 {
            IndexerPhase::InitRequire
        } else if slot == SyncSlot::Idle {
            IndexerPhase::Ready
        } else {
            IndexerPhase::InProgress
        };
        let target_to = match slot {
            SyncSlot::Running { target, .. } => target,
            _ => self.inner.target_height().await?,
        };

        Ok(IndexerStatus {
            status,
            processed_from: state.from_height,
            processed_to: state.indexed_height,
            target_to,
        })
    }

    /// Starts indexing from the watermark up to `to`, capped at the confirmed tip. Returns once
    /// the run is launched; the run itself continues in the background.
    pub async fn start_indexing(&self, to: Option<u64>) -> Result<StartResponse, IndexerError> {
        let Some(guard) = self.try_claim() else {
            return Ok(StartResponse::InProgress);
        };
        self.launch(guard, to).await
    }

    /// Drops everything indexed at or above `from` and indexes again from there. `from` may not
    /// be above the confirmed tip, nor leave a gap after what is already indexed.
    pub async fn start_reindexing(
        &self,
        from: u64,
        to: Option<u64>,
    ) -> Result<StartResponse, IndexerError> {
        if from == 0 {
            return Err(IndexerError::InvalidHeight(from));
        }
        if let Some(to) = to {
            if to < from {
                return Err(IndexerError::ToLessThanFrom { from, to });
            }
        }
        let target = self.inner.target_height().await?;
        if from > target {
            return Err(IndexerError::FromAboveTarget { from, target });
        }
        let state = self.inner.db.get_indexer_state().await?;
        let limit = match state.indexed_height {
            Some(height) => Some(height + 1),
            None if state.from_height == 0 => None,
            None => Some(state.from_height),
        };
        if let Some(limit) = limit.filter(|limit| from > *limit) {
            return Err(IndexerError::FromAboveIndexed { from, limit });
        }

        let Some(guard) = self.try_claim() else {
            return Ok(StartResponse::InProgress);
        };

        let removed = self.inner.db.reset_from(from).await?;
        tracing::info!(
            "Reindexing from {}: removed {} blocks, {} leases, {} cancellations, {} payments",
            from,
            removed.blocks,
            removed.leases,
            removed.cancellations,
            removed.payments
        );
        self.launch(guard, to).await
    }

    /// Current state of the indexing slot.
    pub fn slot(&self) -> SyncSlot {
        *self.inner.slot.borrow()
    }

    /// Error of the most recent run when it stopped before reaching its target.
    pub fn last_failure(&self) -> Option<String> {
        self.inner.last_failure.lock().ok().and_then(|failure| failure.clone())
    }

    /// Waits for the running indexing run, if any, to finish.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.slot.subscribe();
        // The sender is owned by `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|slot| *slot == SyncSlot::Idle).await;
    }

    fn try_claim(&self) -> Option<SlotGuard> {
        let claimed = self.inner.slot.send_if_modified(|slot| {
            if *slot != SyncSlot::Idle {
                return false;
            }
            *slot = SyncSlot::Preparing;
            true
        });
        claimed.then(|| SlotGuard { inner: self.inner.clone() })
    }

    async fn launch(
        &self,
        guard: SlotGuard,
        to: Option<u64>,
    ) -> Result<StartResponse, IndexerError> {
        let state = self.inner.db.get_indexer_state().await?;
        let (from_block, first_run) = match state.indexed_height {
            Some(height) => (height, false),
            None if state.from_height == 0 => return Err(IndexerError::FromBlockNotFound),
            None => (state.from_height, true),
        };

        let target = self.inner.target_height().await?;
        let to_block = to.map_or(target, |to| to.min(target));
        if to_block < from_block {
            tracing::info!("Already up to date at {} (target {})", from_block, to_block);
            return Ok(StartResponse::UpToDate);
        }

        self.inner.record_failure(None);
        self.inner.slot.send_replace(SyncSlot::Running { from: from_block, target: to_block });
        tracing::info!("Indexing heights {} to {}", from_block, to_block);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let start = Instant::now();
            match inner.sync(from_block, to_block, first_run).await {
                Ok(report) => tracing::info!(
                    "Indexed {} to {} in {:.2}s: {} chunks, {} blocks, {} previous leases, \
                     {} leases, {} cancels, {} payments",
                    from_block,
                    to_block,
                    start.elapsed().as_secs_f64(),
                    report.chunks,
                    report.blocks,
                    report.previous_leases,
                    report.leases,
                    report.cancel_leases,
                    report.payments
                ),
                Err(e) => {
                    tracing::error!("Indexing {} to {} failed: {:?}", from_block, to_block, e);
                    inner.record_failure(Some(e.to_string()));
                }
            }
        });

        Ok(StartResponse::Started)
    }
}

impl Inner {
    fn record_failure(&self, failure: Option<String>) {
        if let Ok(mut last) = self.last_failure.lock() {
            *last = failure;
        }
    }

    async fn target_height(&self) -> Result<u64, IndexerError> {
        let current = self.chain.current_height().await?;
        Ok(current.saturating_sub(self.config.confirmation_blocks + 1))
    }

    async fn sync(&self, from: u64, to: u64, first_run: bool) -> Result<SyncReport, IndexerError> {
        let start = Instant::now();
        let txs = self.fetch_transactions(from, to).await?;
        tracing::debug!(
            "Fetched {} transactions for {} to {} in {:.2}s",
            txs.len(),
            from,
            to,
            start.elapsed().as_secs_f64()
        );

        let classifier = TransactionClassifier::new(&self.identity, self.chain.as_ref());
        let classified = classifier.classify(&txs).await?;
        tracing::debug!(
            "Classified {} leases, {} cancels, {} payments",
            classified.leases.len(),
            classified.cancel_leases.len(),
            classified.payments.len()
        );

        let mut previous_leases =
            if first_run { self.fetch_previous_leases(from).await? } else { Vec::new() };

        let mut report = SyncReport::default();
        let mut chunk_start = from;
        while chunk_start <= to {
            let chunk_end = (chunk_start + BLOCKS_PER_CHUNK - 1).min(to);
            let chunk_timer = Instant::now();
            let in_chunk = |height: u64| height >= chunk_start && height <= chunk_end;

            let chunk = ChunkCommit {
                end_height: chunk_end,
                blocks: self.fetch_validator_blocks(chunk_start, chunk_end).await?,
                previous_leases: std::mem::take(&mut previous_leases),
                leases: classified.leases.iter().filter(|l| in_chunk(l.height)).cloned().collect(),
                cancel_leases: classified
                    .cancel_leases
                    .iter()
                    .filter(|l| l.cancel_height.is_some_and(in_chunk))
                    .cloned()
                    .collect(),
                payments: classified
                    .payments
                    .iter()
                    .filter(|p| in_chunk(p.height))
                    .cloned()
                    .collect(),
            };
            let counts = self.db.commit_chunk(&chunk).await?;
            tracing::info!(
                "Committed {} to {} in {:.2}s: {} blocks, {} previous leases, {} leases, \
                 {} cancels, {} payments",
                chunk_start,
                chunk_end,
                chunk_timer.elapsed().as_secs_f64(),
                counts.blocks,
                counts.previous_leases,
                counts.leases,
                counts.cancel_leases,
                counts.payments
            );
            report.add(counts, chunk_end);
            chunk_start = chunk_end + 1;
        }

        Ok(report)
    }

    /// The validator's transactions with heights in `from..=to`, oldest first.
    async fn fetch_transactions(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<Transaction>, IndexerError> {
        let mut collected: Vec<Transaction> = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .chain
                .transactions_of(self.identity.address(), TRANSACTIONS_PAGE_SIZE, after.as_deref())
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let reached_start = last.height < from;
            after = Some(last.id.clone());
            collected.extend(page);
            if reached_start {
                break;
            }
        }

        let mut seen = HashSet::new();
        let mut txs: Vec<Transaction> = collected
            .into_iter()
            .filter(|tx| tx.height >= from && tx.height <= to)
            .filter(|tx| seen.insert(tx.id.clone()))
            .collect();
        txs.reverse();
        Ok(txs)
    }

    /// Leases to the validator that are still active and were opened before `from`.
    async fn fetch_previous_leases(&self, from: u64) -> Result<Vec<Lease>, IndexerError> {
        let active = self.chain.active_leases_to(self.identity.address()).await?;
        let leases: Vec<Lease> = active
            .into_iter()
            .filter(|lease| self.identity.is_validator(&lease.recipient) && lease.height < from)
            .map(|lease| Lease {
                id: lease.id,
                tx_id: lease.origin_transaction_id,
                cancel_tx_id: None,
                lease_type: None,
                sender: lease.sender,
                amount: lease.amount,
                height: lease.height,
                timestamp: None,
                cancel_height: None,
                cancel_timestamp: None,
            })
            .collect();
        tracing::info!("Found {} active leases opened before {}", leases.len(), from);
        Ok(leases)
    }

    /// Blocks in `from..=to` forged by the validator. The header just before `from` is fetched
    /// too so the first block gets its previous fee.
    async fn fetch_validator_blocks(&self, from: u64, to: u64) -> Result<Vec<Block>, IndexerError> {
        let mut headers: Vec<BlockHeader> = Vec::new();
        let mut start = from.saturating_sub(1).max(1);
        while start <= to {
            let end = (start + HEADERS_PER_REQUEST - 1).min(to);
            headers.extend(self.chain.block_headers_in_range(start, end).await?);
            start = end + 1;
        }

        let mut blocks = Vec::new();
        let mut previous: Option<&BlockHeader> = None;
        for header in &headers {
            if header.height >= from && header.generator == self.identity.address() {
                let previous_fee = previous
                    .filter(|p| p.height + 1 == header.height)
                    .map_or(U256::ZERO, |p| p.total_fee);
                blocks.push(Block {
                    height: header.height,
                    generator: header.generator.clone(),
                    fee: header.total_fee,
                    previous_fee,
                    block_reward: header
                        .reward_shares
                        .get(&header.generator)
                        .copied()
                        .unwrap_or(U256::ZERO),
                    timestamp: header.timestamp,
                });
            }
            previous = Some(header);
        }
        Ok(blocks)
    }
}
