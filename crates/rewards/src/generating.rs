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

//! Generating balance tracking.
//!
//! A sender's generating balance at height `E` is the minimum cumulative leased amount among the
//! balance change points in `[E - window, E]`. Stake that is added and withdrawn within less than
//! one window never counts.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{I256, U256};

/// A lease as seen by the reward calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSpan {
    /// Address that leased the stake
    pub sender: String,
    /// Leased amount
    pub amount: U256,
    /// Height the lease was opened at
    pub height: u64,
    /// Height the lease was cancelled at, if it was
    pub cancel_height: Option<u64>,
}

/// Balance effective from `height` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancePoint {
    pub height: u64,
    pub amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Increase,
    Decrease,
}

/// Cumulative leased balance after every non-zero net change, ascending by height.
fn change_points(leases: &[&LeaseSpan]) -> Vec<(BalancePoint, Direction)> {
    let mut deltas: BTreeMap<u64, I256> = BTreeMap::new();
    for lease in leases {
        let amount = I256::from_raw(lease.amount);
        *deltas.entry(lease.height).or_insert(I256::ZERO) += amount;
        if let Some(cancel_height) = lease.cancel_height {
            *deltas.entry(cancel_height).or_insert(I256::ZERO) -= amount;
        }
    }

    let mut balance = I256::ZERO;
    let mut points = Vec::with_capacity(deltas.len());
    for (height, delta) in deltas {
        if delta.is_zero() {
            continue;
        }
        balance += delta;
        let direction = if delta.is_positive() { Direction::Increase } else { Direction::Decrease };
        // A cancel without its opening lease would push the balance below zero.
        let amount = if balance.is_negative() { U256::ZERO } else { balance.into_raw() };
        points.push((BalancePoint { height, amount }, direction));
    }
    points
}

/// Computes the deduplicated generating balance series for one sender's leases.
///
/// Increases are evaluated one full window after they happen, decreases immediately. The returned
/// points are strictly ascending by height and no two consecutive points share an amount.
pub fn generating_balance_points(leases: &[&LeaseSpan], window: u64) -> Vec<BalancePoint> {
    let changes = change_points(leases);
    let Some((first, _)) = changes.first() else {
        return Vec::new();
    };

    // Anchor for windows that begin before the first lease.
    let mut points = Vec::with_capacity(changes.len() + 1);
    points.push(BalancePoint { height: first.height.saturating_sub(1), amount: U256::ZERO });
    points.extend(changes.iter().map(|(point, _)| *point));

    let mut evaluate_at: Vec<u64> = changes
        .iter()
        .map(|(point, direction)| match direction {
            Direction::Increase => point.height + window,
            Direction::Decrease => point.height,
        })
        .collect();
    evaluate_at.sort_unstable();

    let mut series: Vec<BalancePoint> = Vec::new();
    for end in evaluate_at {
        let start = end.saturating_sub(window);
        let Some(amount) = points
            .iter()
            .filter(|point| point.height >= start && point.height <= end)
            .map(|point| point.amount)
            .min()
        else {
            continue;
        };

        let keep = match series.last() {
            None => !amount.is_zero(),
            Some(last) => last.height != end && last.amount != amount,
        };
        if keep {
            series.push(BalancePoint { height: end, amount });
        }
    }
    series
}

/// Groups leases by sender and computes each sender's generating balance series.
///
/// Senders whose series is empty are omitted.
pub fn generating_balances_by_sender(
    leases: &[LeaseSpan],
    window: u64,
) -> HashMap<String, Vec<BalancePoint>> {
    let mut by_sender: HashMap<&str, Vec<&LeaseSpan>> = HashMap::new();
    for lease in leases {
        by_sender.entry(lease.sender.as_str()).or_default().push(lease);
    }

    by_sender
        .into_iter()
        .filter_map(|(sender, leases)| {
            let points = generating_balance_points(&leases, window);
            (!points.is_empty()).then(|| (sender.to_string(), points))
        })
        .collect()
}

/// Latest point strictly below `height`.
pub(crate) fn balance_before(points: &[BalancePoint], height: u64) -> Option<U256> {
    let idx = points.partition_point(|point| point.height < height);
    idx.checked_sub(1).map(|i| points[i].amount)
}
