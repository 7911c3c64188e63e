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

//! Maps chain transactions to lease and payment records of the tracked validator.

use alloy_primitives::U256;
use futures_util::future::try_join_all;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    chain::{
        is_address, types::de_amount, ChainError, ChainReader, LeaseDetails, StateChanges,
        Transaction, TransactionKind, TransferEntry, ValidatorIdentity,
    },
    db::leasing::{Lease, Payment},
};

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Malformed {entry} in transaction {tx_id}: {reason}")]
    MalformedPayload { tx_id: String, entry: &'static str, reason: String },

    #[error("Failed to resolve recipient {alias} of transaction {tx_id}: {source}")]
    AliasResolution {
        tx_id: String,
        alias: String,
        #[source]
        source: ChainError,
    },
}

/// Records extracted from a chronological list of transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub leases: Vec<Lease>,
    pub cancel_leases: Vec<Lease>,
    pub payments: Vec<Payment>,
}

/// Lease opened by a script.
#[derive(Debug, Deserialize)]
struct ScriptLease {
    id: String,
    sender: String,
    recipient: String,
    #[serde(deserialize_with = "de_amount")]
    amount: U256,
}

fn strict_entry<T: DeserializeOwned>(
    tx: &Transaction,
    entry: &'static str,
    value: &Value,
) -> Result<T, ClassifyError> {
    serde_json::from_value(value.clone()).map_err(|e| ClassifyError::MalformedPayload {
        tx_id: tx.id.clone(),
        entry,
        reason: e.to_string(),
    })
}

fn require_non_empty(
    tx: &Transaction,
    entry: &'static str,
    fields: &[(&str, &str)],
) -> Result<(), ClassifyError> {
    match fields.iter().find(|(_, value)| value.is_empty()) {
        Some((name, _)) => Err(ClassifyError::MalformedPayload {
            tx_id: tx.id.clone(),
            entry,
            reason: format!("empty field `{name}`"),
        }),
        None => Ok(()),
    }
}

pub struct TransactionClassifier<'a> {
    identity: &'a ValidatorIdentity,
    chain: &'a (dyn ChainReader + Send + Sync),
}

impl<'a> TransactionClassifier<'a> {
    pub fn new(
        identity: &'a ValidatorIdentity,
        chain: &'a (dyn ChainReader + Send + Sync),
    ) -> Self {
        Self { identity, chain }
    }

    /// Classifies `txs` in order. Fails on the first malformed script payload or failed alias
    /// lookup.
    pub async fn classify(&self, txs: &[Transaction]) -> Result<Classified, ClassifyError> {
        let mut out = Classified::default();
        for tx in txs {
            match &tx.kind {
                TransactionKind::Lease { recipient, amount } => {
                    if self.identity.is_validator(recipient) {
                        out.leases.push(lease_open(tx, &tx.id, &tx.sender, *amount));
                    }
                }
                TransactionKind::LeaseCancel { lease } => {
                    if self.identity.is_validator(&lease.recipient) {
                        out.cancel_leases.push(lease_cancel(tx, lease));
                    }
                }
                TransactionKind::Invocation { state_changes: Some(changes) } => {
                    let (opens, cancels) = self.script_leases(tx, changes)?;
                    out.leases.extend(opens);
                    out.cancel_leases.extend(cancels);
                }
                TransactionKind::Transfer { recipient, amount } => {
                    if tx.sender == self.identity.address() {
                        let address = self.resolve_recipient(tx, recipient).await?;
                        out.payments.push(payment(tx, address, *amount));
                    }
                }
                TransactionKind::MassTransfer { transfers } => {
                    if tx.sender == self.identity.address() {
                        out.payments.extend(self.mass_payments(tx, transfers).await?);
                    }
                }
                TransactionKind::Invocation { state_changes: None } | TransactionKind::Other => {}
            }
        }
        Ok(out)
    }

    /// Every declared entry is validated before the recipient filter is applied.
    fn script_leases(
        &self,
        tx: &Transaction,
        changes: &StateChanges,
    ) -> Result<(Vec<Lease>, Vec<Lease>), ClassifyError> {
        let mut opens = Vec::new();
        for value in &changes.leases {
            let lease: ScriptLease = strict_entry(tx, "script lease", value)?;
            require_non_empty(
                tx,
                "script lease",
                &[
                    ("id", lease.id.as_str()),
                    ("sender", lease.sender.as_str()),
                    ("recipient", lease.recipient.as_str()),
                ],
            )?;
            if self.identity.is_validator(&lease.recipient) {
                opens.push(lease_open(tx, &lease.id, &lease.sender, lease.amount));
            }
        }

        let mut cancels = Vec::new();
        for value in &changes.lease_cancels {
            let lease: LeaseDetails = strict_entry(tx, "script lease cancel", value)?;
            require_non_empty(
                tx,
                "script lease cancel",
                &[
                    ("id", lease.id.as_str()),
                    ("originTransactionId", lease.origin_transaction_id.as_str()),
                    ("sender", lease.sender.as_str()),
                    ("recipient", lease.recipient.as_str()),
                ],
            )?;
            if self.identity.is_validator(&lease.recipient) {
                cancels.push(lease_cancel(tx, &lease));
            }
        }

        Ok((opens, cancels))
    }

    async fn resolve_recipient(
        &self,
        tx: &Transaction,
        recipient: &str,
    ) -> Result<String, ClassifyError> {
        if is_address(recipient) {
            return Ok(recipient.to_string());
        }
        self.chain.address_of_alias(recipient).await.map_err(|source| {
            ClassifyError::AliasResolution {
                tx_id: tx.id.clone(),
                alias: recipient.to_string(),
                source,
            }
        })
    }

    /// One payment per distinct recipient; repeated recipients are summed.
    async fn mass_payments(
        &self,
        tx: &Transaction,
        transfers: &[TransferEntry],
    ) -> Result<Vec<Payment>, ClassifyError> {
        let addresses = try_join_all(
            transfers.iter().map(|transfer| self.resolve_recipient(tx, &transfer.recipient)),
        )
        .await?;

        let mut payments: Vec<Payment> = Vec::with_capacity(transfers.len());
        for (address, transfer) in addresses.into_iter().zip(transfers) {
            match payments.iter_mut().find(|p| p.address == address) {
                Some(existing) => existing.amount += transfer.amount,
                None => payments.push(payment(tx, address, transfer.amount)),
            }
        }
        Ok(payments)
    }
}

fn lease_open(tx: &Transaction, id: &str, sender: &str, amount: U256) -> Lease {
    Lease {
        id: id.to_string(),
        tx_id: tx.id.clone(),
        cancel_tx_id: None,
        lease_type: Some(tx.tx_type),
        sender: sender.to_string(),
        amount,
        height: tx.height,
        timestamp: Some(tx.timestamp),
        cancel_height: None,
        cancel_timestamp: None,
    }
}

fn lease_cancel(tx: &Transaction, lease: &LeaseDetails) -> Lease {
    Lease {
        id: lease.id.clone(),
        tx_id: lease.origin_transaction_id.clone(),
        cancel_tx_id: Some(tx.id.clone()),
        lease_type: None,
        sender: lease.sender.clone(),
        amount: lease.amount,
        height: lease.height,
        timestamp: None,
        cancel_height: Some(tx.height),
        cancel_timestamp: Some(tx.timestamp),
    }
}

fn payment(tx: &Transaction, address: String, amount: U256) -> Payment {
    Payment { tx_id: tx.id.clone(), address, amount, height: tx.height, timestamp: tx.timestamp }
}
