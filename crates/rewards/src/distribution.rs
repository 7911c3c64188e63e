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

//! Per-block reward distribution.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::U256;
use serde::Serialize;

use crate::{
    generating::{balance_before, generating_balances_by_sender},
    LeaseSpan, GENERATING_BALANCE_WINDOW, SHARE_SCALE,
};

/// A block generated by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardBlock {
    pub height: u64,
    /// Total fee of this block
    pub fee: U256,
    /// Total fee of the block before it
    pub previous_fee: U256,
    /// The validator's share of the block reward
    pub block_reward: U256,
}

#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Integer percentage (0..=100) of each block reward shared with lessors
    pub percentage_to_distribute: u8,
    /// Address credited with everything that is not distributed
    pub node_owner_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewardShare {
    #[serde(serialize_with = "crate::decimal::serialize")]
    pub amount: U256,
    /// Share of the total reward, three decimal places
    pub percent: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub shares: BTreeMap<String, RewardShare>,
    /// Sum of all block rewards
    pub total_reward: U256,
    /// Whole units distributed to lessors, before the owner residual
    pub distributed: U256,
    /// Undistributed percentage plus rounding remainders
    pub owner_residual: U256,
}

/// Reward earned by a block: its own reward share plus 40% of its fee and 60% of the previous
/// block's fee.
pub fn block_reward_total(block: &RewardBlock) -> U256 {
    block.block_reward
        + (block.fee * U256::from(4) + block.previous_fee * U256::from(6)) / U256::from(10)
}

/// Renders `amount / total * 100` with three decimals, rounding half up.
pub fn format_percent(amount: U256, total: U256) -> String {
    if total.is_zero() {
        return "0.000".to_string();
    }
    let scaled = amount * U256::from(100_000);
    let mut thousandths = scaled / total;
    if (scaled % total) * U256::from(2) >= total {
        thousandths += U256::from(1);
    }
    let whole = thousandths / U256::from(1000);
    let frac = (thousandths % U256::from(1000)).to::<u64>();
    format!("{whole}.{frac:03}")
}

/// Distributes the rewards of `blocks` among lessors in proportion to their generating balance.
pub fn compute_distribution(
    blocks: &[RewardBlock],
    leases: &[LeaseSpan],
    config: &DistributionConfig,
) -> Distribution {
    let balances = generating_balances_by_sender(leases, GENERATING_BALANCE_WINDOW);
    let scale = U256::from(SHARE_SCALE);
    let percentage = U256::from(config.percentage_to_distribute);
    let hundred = U256::from(100);

    let mut ordered: Vec<&RewardBlock> = blocks.iter().collect();
    ordered.sort_by_key(|block| block.height);

    let mut total_reward = U256::ZERO;
    let mut scaled_shares: HashMap<&str, U256> = HashMap::new();
    for block in ordered {
        let reward = block_reward_total(block);
        total_reward += reward;

        let effective: Vec<(&str, U256)> = balances
            .iter()
            .filter_map(|(sender, points)| {
                balance_before(points, block.height).map(|balance| (sender.as_str(), balance))
            })
            .collect();
        let total_balance = effective.iter().fold(U256::ZERO, |acc, (_, balance)| acc + *balance);
        if total_balance.is_zero() {
            continue;
        }

        for (sender, balance) in effective {
            let share = balance * scale * reward * percentage / total_balance / hundred;
            *scaled_shares.entry(sender).or_insert(U256::ZERO) += share;
        }
    }

    let mut amounts: BTreeMap<String, U256> = BTreeMap::new();
    let mut distributed = U256::ZERO;
    for (sender, scaled) in scaled_shares {
        let amount = scaled / scale;
        distributed += amount;
        amounts.insert(sender.to_string(), amount);
    }

    let owner_residual = total_reward - distributed;
    *amounts.entry(config.node_owner_address.clone()).or_insert(U256::ZERO) += owner_residual;

    tracing::debug!(
        "Distributed {} of {} total reward across {} lessors, owner residual {}",
        distributed,
        total_reward,
        amounts.len(),
        owner_residual
    );

    let shares = amounts
        .into_iter()
        .map(|(address, amount)| {
            let percent = format_percent(amount, total_reward);
            (address, RewardShare { amount, percent })
        })
        .collect();

    Distribution { shares, total_reward, distributed, owner_residual }
}
