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

//! Reward distribution for stake leased to a single validator.
//!
//! Everything in this crate is a pure computation over already indexed blocks, leases and
//! payments. Amounts are exact integers; percentages are rendered from scaled integers.

pub mod distribution;
pub mod generating;
pub mod summary;

pub use distribution::{
    block_reward_total, compute_distribution, format_percent, Distribution, DistributionConfig,
    RewardBlock, RewardShare,
};

pub use generating::{
    generating_balance_points, generating_balances_by_sender, BalancePoint, LeaseSpan,
};

pub use summary::{compute_debt, summarize, BlocksInfo, IndexerInfo, PaidAmount, RewardsSummary};

/// Trailing window, in heights, over which leased stake must be held to count as generating.
pub const GENERATING_BALANCE_WINDOW: u64 = 1000;

/// Fixed-point scale applied to per-block shares before division.
pub const SHARE_SCALE: u64 = 100_000_000;

/// Serde helpers rendering integers as decimal strings.
pub mod decimal {
    use std::{collections::BTreeMap, fmt::Display};

    use serde::{ser::SerializeMap, Serializer};

    pub fn serialize<T: Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(value)
    }

    pub fn serialize_map<T: Display, S: Serializer>(
        map: &BTreeMap<String, T>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = s.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &value.to_string())?;
        }
        out.end()
    }
}
