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

use std::sync::Arc;

use alloy_primitives::U256;
use leasing_indexer::{
    db::{
        leasing::{Block, IndexerState, Lease, Payment},
        LeasingDbObj,
    },
    indexing::{IndexerError, IndexerPhase, StartResponse, SyncSlot},
};

use serde_json::json;

use super::common::{
    address, alice, bob, indexer, invoke_tx, lease_cancel_tx, lease_tx, mass_transfer_tx,
    test_db, transfer_tx, validator, MockChain, VALIDATOR_ALIAS,
};

/// Chain at height 210 with two validator blocks and a mix of leases and payouts around
/// heights 100 to 204.
fn scenario() -> Arc<MockChain> {
    let chain = MockChain::new(210);
    let (alice, bob) = (alice(), bob());
    chain.add_alias(VALIDATOR_ALIAS, &validator());
    chain.add_alias("alias:W:bob", &bob);

    chain.set_fee(149, 300_000);
    chain.forge(150, 700_000, 600_000_000);
    chain.set_fee(199, 100_000);
    chain.forge(200, 0, 600_000_000);

    chain.add_active_lease("L0", &alice, &validator(), 1_000, 50);
    chain.add_active_lease("L2", &bob, VALIDATOR_ALIAS, 500, 130);
    chain.add_active_lease("LX", &alice, &address(3), 900, 40);

    chain.push_tx(lease_tx("L8", 90, &alice, &validator(), 9));
    chain.push_tx(lease_tx("L1", 120, &bob, VALIDATOR_ALIAS, 3_000));
    chain.push_tx(lease_tx("L2", 130, &bob, VALIDATOR_ALIAS, 500));
    chain.push_tx(lease_tx("LY", 140, &bob, &address(3), 800));
    chain.push_tx(transfer_tx("P1", 160, &alice, 50));
    chain.push_tx(lease_cancel_tx("C1", 180, "L1", &bob, 3_000, 120));
    chain.push_tx(mass_transfer_tx(
        "M1",
        201,
        &[(alice.as_str(), 10), ("alias:W:bob", 20), (alice.as_str(), 5)],
    ));
    chain.push_tx(lease_tx("L9", 205, &alice, &validator(), 7));
    chain
}

async fn state(db: &LeasingDbObj) -> IndexerState {
    db.get_indexer_state().await.expect("Failed to read indexer state")
}

async fn snapshot(db: &LeasingDbObj) -> (Vec<Block>, Vec<Lease>, Vec<Payment>) {
    (
        db.get_blocks().await.expect("Failed to read blocks"),
        db.get_leases().await.expect("Failed to read leases"),
        db.get_payments().await.expect("Failed to read payments"),
    )
}

fn lease_ids(leases: &[Lease]) -> Vec<&str> {
    leases.iter().map(|l| l.id.as_str()).collect()
}

fn paid_to<'a>(payments: &'a [Payment], tx_id: &str, address: &str) -> Option<&'a Payment> {
    payments.iter().find(|p| p.tx_id == tx_id && p.address == address)
}

#[test_log::test(tokio::test)]
async fn test_index_end_to_end() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;

    let status = service.status().await.unwrap();
    assert_eq!(status.status, IndexerPhase::InitRequire);
    assert_eq!(status.target_to, 204);

    service.init(100).await.unwrap();
    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(204) });
    // 99..=198 and 198..=204
    assert_eq!(chain.header_requests.load(std::sync::atomic::Ordering::SeqCst), 2);

    let (blocks, leases, payments) = snapshot(&db).await;
    assert_eq!(
        blocks,
        vec![
            Block {
                height: 150,
                generator: validator(),
                fee: U256::from(700_000),
                previous_fee: U256::from(300_000),
                block_reward: U256::from(600_000_000),
                timestamp: 150_000,
            },
            Block {
                height: 200,
                generator: validator(),
                fee: U256::ZERO,
                previous_fee: U256::from(100_000),
                block_reward: U256::from(600_000_000),
                timestamp: 200_000,
            },
        ]
    );

    assert_eq!(lease_ids(&leases), vec!["L0", "L1", "L2"]);
    let previous = &leases[0];
    assert_eq!(previous.tx_id, "L0");
    assert_eq!(previous.lease_type, None);
    assert_eq!(previous.sender, alice());
    assert_eq!(previous.amount, U256::from(1_000));
    let cancelled = &leases[1];
    assert_eq!(cancelled.lease_type, Some(8));
    assert_eq!(cancelled.timestamp, Some(120_000));
    assert_eq!(cancelled.cancel_tx_id.as_deref(), Some("C1"));
    assert_eq!(cancelled.cancel_height, Some(180));
    assert_eq!(cancelled.cancel_timestamp, Some(180_000));
    assert_eq!(leases[2].cancel_height, None);

    assert_eq!(payments.len(), 3);
    assert_eq!(paid_to(&payments, "P1", &alice()).unwrap().amount, U256::from(50));
    assert_eq!(paid_to(&payments, "M1", &alice()).unwrap().amount, U256::from(15));
    assert_eq!(paid_to(&payments, "M1", &bob()).unwrap().amount, U256::from(20));

    let status = service.status().await.unwrap();
    assert_eq!(status.status, IndexerPhase::Ready);
    assert_eq!(status.processed_from, 100);
    assert_eq!(status.processed_to, Some(204));
    assert_eq!(status.target_to, 204);
}

#[test_log::test(tokio::test)]
async fn test_start_while_running_is_rejected() {
    let chain = MockChain::gated(210);
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;
    service.init(100).await.unwrap();

    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::Started);
    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::InProgress);
    assert_eq!(service.start_reindexing(100, None).await.unwrap(), StartResponse::InProgress);
    assert_eq!(service.slot(), SyncSlot::Running { from: 100, target: 204 });

    let status = service.status().await.unwrap();
    assert_eq!(status.status, IndexerPhase::InProgress);
    assert_eq!(status.processed_to, None);
    assert_eq!(status.target_to, 204);

    chain.open_gate();
    service.wait_until_idle().await;

    assert_eq!(service.status().await.unwrap().status, IndexerPhase::Ready);
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(204) });
    assert_eq!(chain.transaction_requests.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_failed_chunk_keeps_committed_chunks() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;
    service.init(100).await.unwrap();

    chain.fail_headers_at(Some(200));
    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    assert_eq!(service.slot(), SyncSlot::Idle);
    assert!(service.last_failure().is_some_and(|e| e.contains("503")));
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(198) });
    assert_eq!(chain.header_ranges(), vec![(99, 198), (198, 204)]);
    let (blocks, leases, payments) = snapshot(&db).await;
    assert_eq!(blocks.iter().map(|b| b.height).collect::<Vec<_>>(), vec![150]);
    assert_eq!(lease_ids(&leases), vec!["L0", "L1", "L2"]);
    assert_eq!(payments.iter().map(|p| p.tx_id.as_str()).collect::<Vec<_>>(), vec!["P1"]);

    chain.fail_headers_at(None);
    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    assert_eq!(service.last_failure(), None);
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(204) });
    // Only the uncommitted tail is fetched again, starting at the watermark.
    assert_eq!(chain.header_ranges()[2..], [(197, 204)]);
    let (blocks, leases, payments) = snapshot(&db).await;
    assert_eq!(blocks.iter().map(|b| b.height).collect::<Vec<_>>(), vec![150, 200]);
    assert_eq!(lease_ids(&leases), vec!["L0", "L1", "L2"]);
    assert_eq!(payments.len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_reindex_restores_same_state() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;
    service.init(100).await.unwrap();
    service.start_indexing(None).await.unwrap();
    service.wait_until_idle().await;
    let indexed = snapshot(&db).await;

    assert_eq!(service.start_reindexing(150, None).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(204) });
    assert_eq!(snapshot(&db).await, indexed);
}

#[test_log::test(tokio::test)]
async fn test_reindex_below_start_moves_start() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;
    service.init(100).await.unwrap();
    service.start_indexing(None).await.unwrap();
    service.wait_until_idle().await;

    assert_eq!(service.start_reindexing(80, Some(204)).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    assert_eq!(state(&db).await, IndexerState { from_height: 80, indexed_height: Some(204) });
    let (blocks, leases, payments) = snapshot(&db).await;
    assert_eq!(blocks.len(), 2);
    assert_eq!(lease_ids(&leases), vec!["L0", "L8", "L1", "L2"]);
    assert_eq!(payments.len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_malformed_script_lease_aborts_run() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;
    service.init(100).await.unwrap();
    service.start_indexing(Some(150)).await.unwrap();
    service.wait_until_idle().await;
    let indexed = snapshot(&db).await;
    let header_requests = chain.header_ranges().len();

    // Addressed elsewhere and still rejected: the entry has no amount.
    chain.push_tx(invoke_tx(
        "I1",
        170,
        json!([{"id": "SL1", "sender": address(5), "recipient": address(3)}]),
    ));
    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    assert!(service.last_failure().is_some_and(|e| e.contains("Malformed script lease")));
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(150) });
    assert_eq!(snapshot(&db).await, indexed);
    assert_eq!(chain.header_ranges().len(), header_requests);
    assert_eq!(service.status().await.unwrap().status, IndexerPhase::Ready);
}

#[test_log::test(tokio::test)]
async fn test_reindex_cannot_skip_heights() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;
    service.init(100).await.unwrap();

    let err = service.start_reindexing(150, None).await.unwrap_err();
    assert!(matches!(err, IndexerError::FromAboveIndexed { from: 150, limit: 100 }));
    assert!(err.is_validation());
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: None });

    service.start_indexing(Some(150)).await.unwrap();
    service.wait_until_idle().await;
    assert!(matches!(
        service.start_reindexing(160, None).await,
        Err(IndexerError::FromAboveIndexed { from: 160, limit: 151 })
    ));
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(150) });

    assert_eq!(service.start_reindexing(151, None).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(204) });
    assert_eq!(db.get_blocks().await.unwrap().len(), 2);
    assert_eq!(service.slot(), SyncSlot::Idle);
}

#[test_log::test(tokio::test)]
async fn test_reindex_above_confirmed_tip_is_rejected() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;
    service.init(100).await.unwrap();
    service.start_indexing(None).await.unwrap();
    service.wait_until_idle().await;

    for from in [205, 300] {
        let err = service.start_reindexing(from, None).await.unwrap_err();
        assert!(matches!(err, IndexerError::FromAboveTarget { target: 204, .. }));
    }
    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: Some(204) });
    assert_eq!(service.slot(), SyncSlot::Idle);

    chain.set_height(400);
    chain.forge(250, 0, 600_000_000);
    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    assert_eq!(state(&db).await.indexed_height, Some(394));
    let heights: Vec<u64> = db.get_blocks().await.unwrap().iter().map(|b| b.height).collect();
    assert_eq!(heights, vec![150, 200, 250]);
}

#[test_log::test(tokio::test)]
async fn test_request_validation() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;

    assert!(matches!(service.init(0).await, Err(IndexerError::InvalidHeight(0))));
    let err = service.start_indexing(None).await.unwrap_err();
    assert!(matches!(err, IndexerError::FromBlockNotFound));
    assert!(err.is_validation());
    assert_eq!(service.slot(), SyncSlot::Idle);

    service.init(100).await.unwrap();
    assert!(matches!(service.init(120).await, Err(IndexerError::AlreadyInitialized(100))));
    assert!(matches!(
        service.start_reindexing(0, None).await,
        Err(IndexerError::InvalidHeight(0))
    ));
    assert!(matches!(
        service.start_reindexing(150, Some(120)).await,
        Err(IndexerError::ToLessThanFrom { from: 150, to: 120 })
    ));

    assert_eq!(state(&db).await, IndexerState { from_height: 100, indexed_height: None });
    assert_eq!(service.slot(), SyncSlot::Idle);
}

#[test_log::test(tokio::test)]
async fn test_nothing_to_index_is_up_to_date() {
    let chain = scenario();
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 5).await;

    service.init(205).await.unwrap();
    assert_eq!(service.start_indexing(None).await.unwrap(), StartResponse::UpToDate);
    assert_eq!(service.start_indexing(Some(300)).await.unwrap(), StartResponse::UpToDate);
    assert_eq!(service.slot(), SyncSlot::Idle);
    assert_eq!(state(&db).await, IndexerState { from_height: 205, indexed_height: None });
}

#[test_log::test(tokio::test)]
async fn test_first_block_has_no_previous_fee() {
    let chain = MockChain::new(20);
    chain.forge(1, 500, 10);
    chain.forge(2, 300, 10);
    let (db, _file) = test_db().await;
    let service = indexer(&chain, &db, 0).await;

    service.init(1).await.unwrap();
    assert_eq!(service.start_indexing(Some(5)).await.unwrap(), StartResponse::Started);
    service.wait_until_idle().await;

    let blocks = db.get_blocks().await.unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].previous_fee, U256::ZERO);
    assert_eq!(blocks[1].previous_fee, U256::from(500));
    assert_eq!(state(&db).await.indexed_height, Some(5));
}
