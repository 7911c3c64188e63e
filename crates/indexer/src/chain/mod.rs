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

//! Read access to the chain.

mod node;
pub mod types;

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

pub use node::NodeClient;
pub use types::{
    tx_type, BlockHeader, ChainBlock, LeaseDetails, StateChanges, Transaction, TransactionKind,
    TransferEntry,
};

pub type ChainReaderObj = Arc<dyn ChainReader + Send + Sync>;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Node request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Node returned {status} for {url}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("Unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Alias not found: {0}")]
    AliasNotFound(String),
}

#[async_trait]
pub trait ChainReader {
    async fn current_height(&self) -> Result<u64, ChainError>;

    /// Full blocks, transactions included, for the inclusive range
    async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<ChainBlock>, ChainError>;

    /// Block headers for the inclusive range
    async fn block_headers_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockHeader>, ChainError>;

    /// Aliases registered by `address`, in `alias:<chain>:<name>` form
    async fn aliases_of(&self, address: &str) -> Result<Vec<String>, ChainError>;

    async fn address_of_alias(&self, alias: &str) -> Result<String, ChainError>;

    /// Active leases involving `address`, in either direction
    async fn active_leases_to(&self, address: &str) -> Result<Vec<LeaseDetails>, ChainError>;

    /// Transactions involving `address`, newest first, starting after the transaction `after`
    async fn transactions_of(
        &self,
        address: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<Transaction>, ChainError>;
}

/// The tracked validator: its address and every alias it registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorIdentity {
    address: String,
    aliases: HashSet<String>,
}

impl ValidatorIdentity {
    pub fn new(address: impl Into<String>, aliases: impl IntoIterator<Item = String>) -> Self {
        Self { address: address.into(), aliases: aliases.into_iter().collect() }
    }

    pub async fn load(
        chain: &(dyn ChainReader + Send + Sync),
        address: &str,
    ) -> Result<Self, ChainError> {
        let aliases = chain.aliases_of(address).await?;
        tracing::info!("Validator {} has {} aliases: {:?}", address, aliases.len(), aliases);
        Ok(Self::new(address, aliases))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether `recipient` (an address or an alias) refers to the validator.
    pub fn is_validator(&self, recipient: &str) -> bool {
        recipient == self.address || self.aliases.contains(recipient)
    }
}

/// Whether `value` is a base58 address rather than an alias.
pub fn is_address(value: &str) -> bool {
    const ADDRESS_LENGTH: usize = 26;
    const ADDRESS_VERSION: u8 = 1;

    matches!(
        bs58::decode(value).into_vec(),
        Ok(bytes) if bytes.len() == ADDRESS_LENGTH && bytes[0] == ADDRESS_VERSION
    )
}
