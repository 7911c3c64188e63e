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

//! Debt computation and the rewards summary.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{I256, U256};
use serde::Serialize;

use crate::{
    compute_distribution, Distribution, DistributionConfig, LeaseSpan, RewardBlock, RewardShare,
};

/// Reward already paid to an address by one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidAmount {
    pub address: String,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlocksInfo {
    pub total: usize,
    pub min_height: u64,
    pub max_height: u64,
}

/// Size of the indexed data set the summary was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexerInfo {
    pub blocks: BlocksInfo,
    pub leases: usize,
    pub payments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewardsSummary {
    pub distribution: BTreeMap<String, RewardShare>,
    /// Owed minus already paid; negative when overpaid
    #[serde(serialize_with = "crate::decimal::serialize_map")]
    pub debt: BTreeMap<String, I256>,
    #[serde(serialize_with = "crate::decimal::serialize")]
    pub total_reward: U256,
    #[serde(serialize_with = "crate::decimal::serialize")]
    pub distributed: U256,
    #[serde(serialize_with = "crate::decimal::serialize")]
    pub owner_residual: U256,
    pub indexer_info: IndexerInfo,
}

/// Amount still owed to every address that received a distribution.
pub fn compute_debt(
    distribution: &Distribution,
    payments: &[PaidAmount],
) -> BTreeMap<String, I256> {
    let mut paid: HashMap<&str, U256> = HashMap::new();
    for payment in payments {
        *paid.entry(payment.address.as_str()).or_insert(U256::ZERO) += payment.amount;
    }

    distribution
        .shares
        .iter()
        .map(|(address, share)| {
            let paid = paid.get(address.as_str()).copied().unwrap_or(U256::ZERO);
            (address.clone(), I256::from_raw(share.amount) - I256::from_raw(paid))
        })
        .collect()
}

/// Computes distribution and debt over the whole indexed data set.
///
/// Returns `None` when no blocks have been indexed.
pub fn summarize(
    blocks: &[RewardBlock],
    leases: &[LeaseSpan],
    payments: &[PaidAmount],
    config: &DistributionConfig,
) -> Option<RewardsSummary> {
    let min_height = blocks.iter().map(|b| b.height).min()?;
    let max_height = blocks.iter().map(|b| b.height).max()?;

    let distribution = compute_distribution(blocks, leases, config);
    let debt = compute_debt(&distribution, payments);

    Some(RewardsSummary {
        debt,
        total_reward: distribution.total_reward,
        distributed: distribution.distributed,
        owner_residual: distribution.owner_residual,
        distribution: distribution.shares,
        indexer_info: IndexerInfo {
            blocks: BlocksInfo { total: blocks.len(), min_height, max_height },
            leases: leases.len(),
            payments: payments.len(),
        },
    })
}
