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

use std::time::Instant;

use leasing_rewards::{
    summarize, DistributionConfig, LeaseSpan, PaidAmount, RewardBlock, RewardsSummary,
};
use thiserror::Error;

use crate::db::{DbError, LeasingDbObj};

#[derive(Error, Debug)]
pub enum RewardsError {
    #[error("No indexed blocks to distribute")]
    NoDataAvailable,

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Computes reward summaries from the indexed data.
#[derive(Clone)]
pub struct RewardsService {
    db: LeasingDbObj,
    config: DistributionConfig,
}

impl RewardsService {
    pub fn new(db: LeasingDbObj, config: DistributionConfig) -> Self {
        Self { db, config }
    }

    /// Distribution and debt over everything indexed so far.
    pub async fn summary(&self) -> Result<RewardsSummary, RewardsError> {
        let start = Instant::now();

        let blocks: Vec<RewardBlock> =
            self.db.get_blocks().await?.iter().map(RewardBlock::from).collect();
        let leases: Vec<LeaseSpan> =
            self.db.get_leases().await?.iter().map(LeaseSpan::from).collect();
        let payments: Vec<PaidAmount> =
            self.db.get_payments().await?.iter().map(PaidAmount::from).collect();
        tracing::debug!(
            "Loaded {} blocks, {} leases, {} payments in {:.2}s",
            blocks.len(),
            leases.len(),
            payments.len(),
            start.elapsed().as_secs_f64()
        );

        let summary = summarize(&blocks, &leases, &payments, &self.config)
            .ok_or(RewardsError::NoDataAvailable)?;
        tracing::info!(
            "Computed rewards over {} blocks ({} to {}) for {} addresses in {:.2}s",
            summary.indexer_info.blocks.total,
            summary.indexer_info.blocks.min_height,
            summary.indexer_info.blocks.max_height,
            summary.distribution.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(summary)
    }
}
