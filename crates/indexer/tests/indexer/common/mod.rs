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

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use alloy_primitives::U256;
use async_trait::async_trait;
use leasing_indexer::{
    chain::{BlockHeader, ChainBlock, ChainError, ChainReader, LeaseDetails, Transaction},
    db::{LeasingDbObj, SqlLeasingDb},
    indexing::{IndexerService, IndexerServiceConfig},
};
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::sync::watch;

pub const VALIDATOR_ALIAS: &str = "alias:W:validator";

/// A well-formed address for `seed`.
pub fn address(seed: u8) -> String {
    let mut bytes = vec![1u8, b'W'];
    bytes.extend([seed; 24]);
    bs58::encode(bytes).into_string()
}

pub fn validator() -> String {
    address(10)
}

pub fn owner() -> String {
    address(11)
}

pub fn alice() -> String {
    address(1)
}

pub fn bob() -> String {
    address(2)
}

#[derive(Default)]
struct ChainState {
    height: u64,
    headers: BTreeMap<u64, BlockHeader>,
    /// Newest first, as the node returns them
    transactions: Vec<Transaction>,
    active_leases: Vec<LeaseDetails>,
    aliases: HashMap<String, String>,
    fail_headers_at: Option<u64>,
}

/// Scripted in-memory chain. Every height up to the tip has a header forged by someone else
/// unless [`MockChain::forge`] says otherwise.
pub struct MockChain {
    state: Mutex<ChainState>,
    /// Transaction history requests wait until this is `true`
    gate: watch::Sender<bool>,
    pub header_requests: AtomicUsize,
    pub transaction_requests: AtomicUsize,
    header_ranges: Mutex<Vec<(u64, u64)>>,
}

impl MockChain {
    pub fn new(height: u64) -> Arc<Self> {
        Self::build(height, true)
    }

    /// A chain whose transaction history blocks until [`MockChain::open_gate`].
    pub fn gated(height: u64) -> Arc<Self> {
        Self::build(height, false)
    }

    fn build(height: u64, open: bool) -> Arc<Self> {
        let (gate, _) = watch::channel(open);
        let chain = Self {
            state: Mutex::new(ChainState::default()),
            gate,
            header_requests: AtomicUsize::new(0),
            transaction_requests: AtomicUsize::new(0),
            header_ranges: Mutex::new(Vec::new()),
        };
        chain.set_height(height);
        Arc::new(chain)
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_height(&self, height: u64) {
        let mut state = self.state.lock().unwrap();
        let next = state.height + 1;
        for h in next..=height {
            state.headers.insert(
                h,
                BlockHeader {
                    height: h,
                    generator: address(99),
                    timestamp: h * 1000,
                    total_fee: U256::ZERO,
                    reward_shares: HashMap::new(),
                },
            );
        }
        state.height = height;
    }

    pub fn set_fee(&self, height: u64, fee: u64) {
        let mut state = self.state.lock().unwrap();
        state.headers.get_mut(&height).expect("header exists").total_fee = U256::from(fee);
    }

    /// Makes the validator the generator of `height`.
    pub fn forge(&self, height: u64, fee: u64, reward: u64) {
        let mut state = self.state.lock().unwrap();
        let header = state.headers.get_mut(&height).expect("header exists");
        header.generator = validator();
        header.total_fee = U256::from(fee);
        header.reward_shares = HashMap::from([
            (validator(), U256::from(reward)),
            (address(98), U256::from(reward * 2)),
        ]);
    }

    pub fn push_tx(&self, tx: Transaction) {
        let mut state = self.state.lock().unwrap();
        state.transactions.push(tx);
        state.transactions.sort_by(|a, b| b.height.cmp(&a.height));
    }

    pub fn add_active_lease(
        &self,
        id: &str,
        sender: &str,
        recipient: &str,
        amount: u64,
        height: u64,
    ) {
        self.state.lock().unwrap().active_leases.push(LeaseDetails {
            id: id.to_string(),
            origin_transaction_id: id.to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount: U256::from(amount),
            height,
        });
    }

    pub fn add_alias(&self, alias: &str, address: &str) {
        self.state.lock().unwrap().aliases.insert(alias.to_string(), address.to_string());
    }

    /// Every header range requested so far, failed requests included.
    pub fn header_ranges(&self) -> Vec<(u64, u64)> {
        self.header_ranges.lock().unwrap().clone()
    }

    /// Header requests covering `height` fail while set.
    pub fn fail_headers_at(&self, height: Option<u64>) {
        self.state.lock().unwrap().fail_headers_at = height;
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn current_height(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<ChainBlock>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .headers
            .range(from..=to)
            .map(|(height, header)| ChainBlock {
                header: header.clone(),
                transactions: state
                    .transactions
                    .iter()
                    .filter(|tx| tx.height == *height)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    async fn block_headers_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        self.header_requests.fetch_add(1, Ordering::SeqCst);
        self.header_ranges.lock().unwrap().push((from, to));
        let state = self.state.lock().unwrap();
        if state.fail_headers_at.is_some_and(|h| (from..=to).contains(&h)) {
            return Err(ChainError::Status {
                url: format!("blocks/headers/seq/{from}/{to}"),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(state.headers.range(from..=to).map(|(_, header)| header.clone()).collect())
    }

    async fn aliases_of(&self, address: &str) -> Result<Vec<String>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .aliases
            .iter()
            .filter(|(_, owner)| owner.as_str() == address)
            .map(|(alias, _)| alias.clone())
            .collect())
    }

    async fn address_of_alias(&self, alias: &str) -> Result<String, ChainError> {
        let state = self.state.lock().unwrap();
        state.aliases.get(alias).cloned().ok_or_else(|| ChainError::AliasNotFound(alias.into()))
    }

    async fn active_leases_to(&self, _address: &str) -> Result<Vec<LeaseDetails>, ChainError> {
        Ok(self.state.lock().unwrap().active_leases.clone())
    }

    async fn transactions_of(
        &self,
        _address: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<Transaction>, ChainError> {
        self.transaction_requests.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let state = self.state.lock().unwrap();
        let start = match after {
            Some(id) => state.transactions.iter().position(|tx| tx.id == id).map_or(0, |i| i + 1),
            None => 0,
        };
        Ok(state.transactions.iter().skip(start).take(limit).cloned().collect())
    }
}

fn tx(value: serde_json::Value) -> Transaction {
    serde_json::from_value(value).expect("Failed to decode transaction")
}

pub fn lease_tx(id: &str, height: u64, sender: &str, recipient: &str, amount: u64) -> Transaction {
    tx(json!({
        "id": id, "type": 8, "height": height, "timestamp": height * 1000, "sender": sender,
        "recipient": recipient, "amount": amount
    }))
}

pub fn lease_cancel_tx(
    id: &str,
    height: u64,
    lease_id: &str,
    sender: &str,
    amount: u64,
    lease_height: u64,
) -> Transaction {
    tx(json!({
        "id": id, "type": 9, "height": height, "timestamp": height * 1000, "sender": sender,
        "lease": {
            "id": lease_id, "originTransactionId": lease_id, "sender": sender,
            "recipient": validator(), "amount": amount, "height": lease_height
        }
    }))
}

pub fn transfer_tx(id: &str, height: u64, recipient: &str, amount: u64) -> Transaction {
    tx(json!({
        "id": id, "type": 4, "height": height, "timestamp": height * 1000,
        "sender": validator(), "recipient": recipient, "amount": amount
    }))
}

pub fn mass_transfer_tx(id: &str, height: u64, transfers: &[(&str, u64)]) -> Transaction {
    let transfers: Vec<_> = transfers
        .iter()
        .map(|(recipient, amount)| json!({"recipient": recipient, "amount": amount}))
        .collect();
    tx(json!({
        "id": id, "type": 11, "height": height, "timestamp": height * 1000,
        "sender": validator(), "transfers": transfers
    }))
}

/// Script invocation whose state changes declare `leases`, taken as is.
pub fn invoke_tx(id: &str, height: u64, leases: serde_json::Value) -> Transaction {
    tx(json!({
        "id": id, "type": 16, "height": height, "timestamp": height * 1000,
        "sender": address(5), "stateChanges": {"leases": leases}
    }))
}

pub async fn test_db() -> (LeasingDbObj, NamedTempFile) {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let db_url = format!("sqlite:{}", temp_file.path().display());
    let db = SqlLeasingDb::new(&db_url).await.expect("Failed to create database");
    (Arc::new(db), temp_file)
}

/// Indexer for [`validator`], with its aliases loaded from `chain`.
pub async fn indexer(
    chain: &Arc<MockChain>,
    db: &LeasingDbObj,
    confirmation_blocks: u64,
) -> IndexerService {
    IndexerService::new(
        chain.clone(),
        db.clone(),
        IndexerServiceConfig { validator_address: validator(), confirmation_blocks },
    )
    .await
    .expect("Failed to create indexer")
}
