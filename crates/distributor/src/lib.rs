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

//! Pays out outstanding lessor rewards in batched transfers.

pub mod keys;
pub mod settlement;
pub mod transaction;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use alloy_primitives::{I256, U256};
use async_trait::async_trait;
use leasing_indexer::rewards::{RewardsError, RewardsService};
use serde::Serialize;
use thiserror::Error;

pub use keys::{KeyError, PrivateKey, PublicKey};
pub use settlement::{NodeSettlement, Settlement, SettlementError, TxOutcome};
pub use transaction::{build_mass_transfer, PayoutTx, TransactionError, TransferItem};

/// Largest number of transfers in one payout transaction
pub const MAX_TRANSFERS_PER_TX: usize = 100;

/// How long a broadcast transaction may take to confirm
pub const TX_TIMEOUT: Duration = Duration::from_secs(180);

pub type SettlementObj = Arc<dyn Settlement + Send + Sync>;
pub type DebtSourceObj = Arc<dyn DebtSource + Send + Sync>;

#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("No signing key configured")]
    MissingCredential,

    #[error("No indexed data to pay out")]
    NoDataAvailable,

    #[error("Failed to compute debt: {0}")]
    Debt(#[source] RewardsError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub recipient: String,
    #[serde(serialize_with = "leasing_rewards::decimal::serialize")]
    pub amount: U256,
}

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub chain_id: u8,
    /// Key of the paying account
    pub signer: Option<PrivateKey>,
    pub confirmation_timeout: Duration,
}

/// A payout transaction that did not confirm successfully.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutFailure {
    pub message: String,
    pub tx: PayoutTx,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SettlementReport {
    pub sent_tx_ids: Vec<String>,
    pub failed: Vec<PayoutFailure>,
}

/// Amount still owed per address. Non-positive amounts mean nothing is owed.
#[async_trait]
pub trait DebtSource {
    async fn debt(&self) -> Result<BTreeMap<String, I256>, PayoutError>;
}

#[async_trait]
impl DebtSource for RewardsService {
    async fn debt(&self) -> Result<BTreeMap<String, I256>, PayoutError> {
        match self.summary().await {
            Ok(summary) => Ok(summary.debt),
            Err(RewardsError::NoDataAvailable) => Err(PayoutError::NoDataAvailable),
            Err(e) => Err(PayoutError::Debt(e)),
        }
    }
}

/// Positive amounts as transfers, ordered by recipient.
pub fn owed_transfers(amounts: BTreeMap<String, I256>) -> Vec<Transfer> {
    amounts
        .into_iter()
        .filter(|(_, amount)| amount.is_positive())
        .map(|(recipient, amount)| Transfer { recipient, amount: amount.into_raw() })
        .collect()
}

pub struct PayoutService {
    debt: DebtSourceObj,
    settlement: SettlementObj,
    config: PayoutConfig,
}

impl PayoutService {
    pub fn new(debt: DebtSourceObj, settlement: SettlementObj, config: PayoutConfig) -> Self {
        Self { debt, settlement, config }
    }

    fn signer(&self) -> Result<&PrivateKey, PayoutError> {
        self.config.signer.as_ref().ok_or(PayoutError::MissingCredential)
    }

    /// Builds one unsigned transaction per batch of owed transfers. Uses the current debt unless
    /// `amounts` is given.
    pub async fn create_payout_txs(
        &self,
        amounts: Option<BTreeMap<String, I256>>,
    ) -> Result<Vec<PayoutTx>, PayoutError> {
        let signer = self.signer()?;
        let amounts = match amounts {
            Some(amounts) => amounts,
            None => self.debt.debt().await?,
        };

        let sender = signer.public_key();
        let timestamp = transaction::now_millis();
        let transfers = owed_transfers(amounts);
        let txs = transfers
            .chunks(MAX_TRANSFERS_PER_TX)
            .map(|batch| build_mass_transfer(batch, &sender, self.config.chain_id, timestamp))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            "Built {} payout transactions for {} transfers from {}",
            txs.len(),
            transfers.len(),
            sender.address(self.config.chain_id)
        );
        Ok(txs)
    }

    /// Signs, broadcasts and confirms `txs` one at a time. A failed transaction is recorded and
    /// the rest are still sent.
    pub async fn sign_and_send(&self, txs: Vec<PayoutTx>) -> Result<SettlementReport, PayoutError> {
        let signer = self.signer()?;

        let mut report = SettlementReport::default();
        for tx in txs {
            match self.settle(&tx, signer).await {
                Ok(tx_id) => {
                    tracing::info!(
                        "Payout {} confirmed with {} transfers",
                        tx_id,
                        tx.transfers.len()
                    );
                    report.sent_tx_ids.push(tx_id);
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to settle payout of {} transfers: {:?}. Skipping.",
                        tx.transfers.len(),
                        e
                    );
                    report.failed.push(PayoutFailure { message: e.to_string(), tx });
                }
            }
        }

        tracing::info!(
            "Payouts done: {} confirmed, {} failed",
            report.sent_tx_ids.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn settle(&self, tx: &PayoutTx, signer: &PrivateKey) -> Result<String, SettlementError> {
        let signed = tx.sign(signer)?;
        let tx_id = self.settlement.broadcast(&signed).await?;
        tracing::debug!("Broadcast payout {}", tx_id);

        let timeout = self.config.confirmation_timeout;
        let outcome = tokio::time::timeout(timeout, self.settlement.await_confirmation(&tx_id))
            .await
            .map_err(|_| SettlementError::Timeout { tx_id: tx_id.clone(), timeout })??;

        match outcome {
            TxOutcome::Succeeded => Ok(tx_id),
            TxOutcome::Failed(reason) => Err(SettlementError::Rejected { tx_id, reason }),
        }
    }
}
