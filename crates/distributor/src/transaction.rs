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

//! Mass transfer transactions paying out one batch.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::U256;
use serde::Serialize;
use thiserror::Error;

use crate::{
    keys::{blake2b256, PrivateKey, PublicKey},
    Transfer,
};

const MASS_TRANSFER_TYPE: u8 = 11;
const MASS_TRANSFER_VERSION: u8 = 1;
const BASE_FEE: u64 = 100_000;
/// Charged per pair of transfers
const FEE_PER_TRANSFER: u64 = 50_000;

const ADDRESS_VERSION: u8 = 1;
const ALIAS_VERSION: u8 = 2;
const ADDRESS_LENGTH: usize = 26;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Amount {amount} to {recipient} exceeds the transfer limit")]
    AmountOutOfRange { recipient: String, amount: U256 },

    #[error("Invalid recipient {0}")]
    InvalidRecipient(String),

    #[error("Too many transfers in one transaction: {0}")]
    TooManyTransfers(usize),

    #[error("Transaction {tx_id} belongs to another sender")]
    WrongSigner { tx_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferItem {
    pub recipient: String,
    pub amount: i64,
}

/// Mass transfer in the node's JSON form. Unsigned until `proofs` holds a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutTx {
    pub id: String,
    #[serde(rename = "type")]
    pub tx_type: u8,
    pub version: u8,
    pub sender_public_key: String,
    /// Always the native token
    pub asset_id: Option<String>,
    pub transfers: Vec<TransferItem>,
    pub fee: u64,
    pub timestamp: u64,
    pub attachment: String,
    pub proofs: Vec<String>,
    #[serde(skip)]
    body_bytes: Vec<u8>,
}

/// Fee of a mass transfer with `count` transfers.
pub fn mass_transfer_fee(count: usize) -> u64 {
    let rounded = count.div_ceil(2) * 2;
    BASE_FEE + FEE_PER_TRANSFER * rounded as u64
}

pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn recipient_bytes(recipient: &str, chain_id: u8) -> Result<Vec<u8>, TransactionError> {
    let invalid = || TransactionError::InvalidRecipient(recipient.to_string());

    if let Some(rest) = recipient.strip_prefix("alias:") {
        let name = rest.split_once(':').map_or(rest, |(_, name)| name);
        let length = u16::try_from(name.len()).map_err(|_| invalid())?;
        if name.is_empty() {
            return Err(invalid());
        }
        let mut bytes = vec![ALIAS_VERSION, chain_id];
        bytes.extend(length.to_be_bytes());
        bytes.extend(name.as_bytes());
        return Ok(bytes);
    }

    let bytes = bs58::decode(recipient).into_vec().map_err(|_| invalid())?;
    if bytes.len() != ADDRESS_LENGTH || bytes[0] != ADDRESS_VERSION || bytes[1] != chain_id {
        return Err(invalid());
    }
    Ok(bytes)
}

/// Builds the unsigned mass transfer of `transfers` from `sender`.
pub fn build_mass_transfer(
    transfers: &[Transfer],
    sender: &PublicKey,
    chain_id: u8,
    timestamp: u64,
) -> Result<PayoutTx, TransactionError> {
    let count = u16::try_from(transfers.len())
        .map_err(|_| TransactionError::TooManyTransfers(transfers.len()))?;
    let fee = mass_transfer_fee(transfers.len());

    let mut body = vec![MASS_TRANSFER_TYPE, MASS_TRANSFER_VERSION];
    body.extend(sender.0);
    // Native token
    body.push(0);
    body.extend(count.to_be_bytes());

    let mut items = Vec::with_capacity(transfers.len());
    for transfer in transfers {
        let amount = i64::try_from(transfer.amount).map_err(|_| {
            TransactionError::AmountOutOfRange {
                recipient: transfer.recipient.clone(),
                amount: transfer.amount,
            }
        })?;
        body.extend(recipient_bytes(&transfer.recipient, chain_id)?);
        body.extend(amount.to_be_bytes());
        items.push(TransferItem { recipient: transfer.recipient.clone(), amount });
    }
    body.extend(timestamp.to_be_bytes());
    body.extend(fee.to_be_bytes());
    // Empty attachment
    body.extend(0u16.to_be_bytes());

    Ok(PayoutTx {
        id: bs58::encode(blake2b256(&body)).into_string(),
        tx_type: MASS_TRANSFER_TYPE,
        version: MASS_TRANSFER_VERSION,
        sender_public_key: sender.to_base58(),
        asset_id: None,
        transfers: items,
        fee,
        timestamp,
        attachment: String::new(),
        proofs: Vec::new(),
        body_bytes: body,
    })
}

impl PayoutTx {
    /// Signed copy of this transaction. The id does not change.
    pub fn sign(&self, key: &PrivateKey) -> Result<PayoutTx, TransactionError> {
        if key.public_key().to_base58() != self.sender_public_key {
            return Err(TransactionError::WrongSigner { tx_id: self.id.clone() });
        }
        let signature = key.sign(&self.body_bytes);
        Ok(PayoutTx { proofs: vec![bs58::encode(signature).into_string()], ..self.clone() })
    }
}
