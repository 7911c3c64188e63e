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

//! Node response types.

use std::collections::HashMap;

use alloy_primitives::U256;
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Transaction type discriminators.
pub mod tx_type {
    pub const TRANSFER: u8 = 4;
    pub const LEASE: u8 = 8;
    pub const LEASE_CANCEL: u8 = 9;
    pub const MASS_TRANSFER: u8 = 11;
    pub const INVOKE_SCRIPT: u8 = 16;
    pub const ETHEREUM: u8 = 18;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountRepr {
    Number(u64),
    Text(String),
}

impl AmountRepr {
    fn into_u256(self) -> Result<U256, String> {
        match self {
            Self::Number(n) => Ok(U256::from(n)),
            Self::Text(s) => U256::from_str_radix(&s, 10).map_err(|e| format!("amount {s:?}: {e}")),
        }
    }
}

/// Amounts arrive as JSON numbers or decimal strings.
pub(crate) fn de_amount<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
    AmountRepr::deserialize(d)?.into_u256().map_err(D::Error::custom)
}

fn de_amount_map<'de, D: Deserializer<'de>>(d: D) -> Result<HashMap<String, U256>, D::Error> {
    HashMap::<String, AmountRepr>::deserialize(d)?
        .into_iter()
        .map(|(address, amount)| Ok((address, amount.into_u256().map_err(D::Error::custom)?)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub height: u64,
    pub generator: String,
    pub timestamp: u64,
    #[serde(deserialize_with = "de_amount")]
    pub total_fee: U256,
    /// Block reward split by recipient address
    #[serde(default, deserialize_with = "de_amount_map")]
    pub reward_shares: HashMap<String, U256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainBlock {
    #[serde(flatten)]
    pub header: BlockHeader,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// A lease as reported by the node for active leases, lease cancels and script lease cancels.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseDetails {
    pub id: String,
    pub origin_transaction_id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(deserialize_with = "de_amount")]
    pub amount: U256,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferEntry {
    pub recipient: String,
    #[serde(deserialize_with = "de_amount")]
    pub amount: U256,
}

/// Declared state changes of a script invocation. Entries are kept raw and validated by the
/// classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChanges {
    #[serde(default)]
    pub leases: Vec<Value>,
    #[serde(default)]
    pub lease_cancels: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    Lease { recipient: String, amount: U256 },
    LeaseCancel { lease: LeaseDetails },
    Transfer { recipient: String, amount: U256 },
    MassTransfer { transfers: Vec<TransferEntry> },
    /// Script invocation, directly or through an Ethereum-signed transaction
    Invocation { state_changes: Option<StateChanges> },
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    pub tx_type: u8,
    pub height: u64,
    pub timestamp: u64,
    pub sender: String,
    pub kind: TransactionKind,
}

#[derive(Deserialize)]
struct RawTransaction {
    id: String,
    #[serde(rename = "type")]
    tx_type: u8,
    height: u64,
    timestamp: u64,
    #[serde(default)]
    sender: String,
    #[serde(flatten)]
    body: Map<String, Value>,
}

#[derive(Deserialize)]
struct LeaseCancelBody {
    lease: LeaseDetails,
}

#[derive(Deserialize)]
struct MassTransferBody {
    transfers: Vec<TransferEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationBody {
    #[serde(default)]
    state_changes: Option<StateChanges>,
}

#[derive(Deserialize)]
struct EthereumBody {
    #[serde(default)]
    payload: Option<InvocationBody>,
}

impl TransactionKind {
    fn decode(tx_type: u8, body: Map<String, Value>) -> Result<Self, serde_json::Error> {
        let body = Value::Object(body);
        let kind = match tx_type {
            tx_type::LEASE => {
                let TransferEntry { recipient, amount } = serde_json::from_value(body)?;
                Self::Lease { recipient, amount }
            }
            tx_type::LEASE_CANCEL => {
                let LeaseCancelBody { lease } = serde_json::from_value(body)?;
                Self::LeaseCancel { lease }
            }
            tx_type::TRANSFER => {
                let TransferEntry { recipient, amount } = serde_json::from_value(body)?;
                Self::Transfer { recipient, amount }
            }
            tx_type::MASS_TRANSFER => {
                let MassTransferBody { transfers } = serde_json::from_value(body)?;
                Self::MassTransfer { transfers }
            }
            tx_type::INVOKE_SCRIPT => {
                let InvocationBody { state_changes } = serde_json::from_value(body)?;
                Self::Invocation { state_changes }
            }
            tx_type::ETHEREUM => {
                let EthereumBody { payload } = serde_json::from_value(body)?;
                Self::Invocation { state_changes: payload.and_then(|p| p.state_changes) }
            }
            _ => Self::Other,
        };
        Ok(kind)
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = RawTransaction::deserialize(d)?;
        let kind = TransactionKind::decode(raw.tx_type, raw.body)
            .map_err(|e| D::Error::custom(format!("transaction {}: {e}", raw.id)))?;

        Ok(Self {
            id: raw.id,
            tx_type: raw.tx_type,
            height: raw.height,
            timestamp: raw.timestamp,
            sender: raw.sender,
            kind,
        })
    }
}
