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

use std::{str::FromStr, sync::Arc};

use alloy_primitives::U256;
use async_trait::async_trait;
use leasing_rewards::{LeaseSpan, PaidAmount, RewardBlock};
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyConnection, AnyPool, Row,
};

use super::DbError;

pub type LeasingDbObj = Arc<dyn LeasingDb + Send + Sync>;

const STATE_ID: &str = "singleton";

/// Convert a U256 to a zero-padded string for proper database sorting
/// U256 max value has 78 decimal digits (2^256 ≈ 1.15 * 10^77)
fn pad_u256(value: U256) -> String {
    format!("{:0>78}", value)
}

/// Convert a zero-padded string back to U256
fn unpad_u256(s: &str) -> Result<U256, DbError> {
    U256::from_str(s.trim_start_matches('0')).or_else(|_| {
        // If trimming all zeros, the value is 0
        if s.chars().all(|c| c == '0') {
            Ok(U256::ZERO)
        } else {
            Err(DbError::BadAmount(s.to_string()))
        }
    })
}

fn height_from_db(value: i64) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::BadHeight(value.to_string()))
}

/// A block generated by the tracked validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub generator: String,
    pub fee: U256,
    pub previous_fee: U256,
    pub block_reward: U256,
    pub timestamp: u64,
}

impl From<&Block> for RewardBlock {
    fn from(block: &Block) -> Self {
        Self {
            height: block.height,
            fee: block.fee,
            previous_fee: block.previous_fee,
            block_reward: block.block_reward,
        }
    }
}

/// A lease to the tracked validator. Cancellation fields are `None` while it is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub tx_id: String,
    pub cancel_tx_id: Option<String>,
    pub lease_type: Option<u8>,
    pub sender: String,
    pub amount: U256,
    pub height: u64,
    pub timestamp: Option<u64>,
    pub cancel_height: Option<u64>,
    pub cancel_timestamp: Option<u64>,
}

impl From<&Lease> for LeaseSpan {
    fn from(lease: &Lease) -> Self {
        Self {
            sender: lease.sender.clone(),
            amount: lease.amount,
            height: lease.height,
            cancel_height: lease.cancel_height,
        }
    }
}

/// A transfer from the validator to `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub tx_id: String,
    pub address: String,
    pub amount: U256,
    pub height: u64,
    pub timestamp: u64,
}

impl From<&Payment> for PaidAmount {
    fn from(payment: &Payment) -> Self {
        Self { address: payment.address.clone(), amount: payment.amount }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerState {
    /// First height in scope, 0 until initialized
    pub from_height: u64,
    /// Last fully committed height
    pub indexed_height: Option<u64>,
}

/// Everything written for one chunk of heights, committed atomically together with the watermark.
#[derive(Debug, Clone, Default)]
pub struct ChunkCommit {
    pub end_height: u64,
    pub blocks: Vec<Block>,
    pub previous_leases: Vec<Lease>,
    pub leases: Vec<Lease>,
    pub cancel_leases: Vec<Lease>,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounts {
    pub blocks: usize,
    pub previous_leases: usize,
    pub leases: usize,
    pub cancel_leases: usize,
    pub payments: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackCounts {
    pub blocks: u64,
    pub leases: u64,
    pub cancellations: u64,
    pub payments: u64,
}

#[async_trait]
pub trait LeasingDb {
    /// Get the indexer state, creating the row on first access
    async fn get_indexer_state(&self) -> Result<IndexerState, DbError>;

    /// Set the first height in scope. Returns false if it was already set.
    async fn init_from_height(&self, height: u64) -> Result<bool, DbError>;

    /// Write one chunk and advance the watermark to its end height in a single transaction
    async fn commit_chunk(&self, chunk: &ChunkCommit) -> Result<ChunkCounts, DbError>;

    /// Remove everything indexed at or above `height` and reset the watermark, in a single
    /// transaction.
    ///
    /// If `height` is at or below the current first height, the first height moves down to
    /// `height` and the watermark is cleared. Otherwise the watermark is set to `height`.
    async fn reset_from(&self, height: u64) -> Result<RollbackCounts, DbError>;

    /// All blocks in ascending height order
    async fn get_blocks(&self) -> Result<Vec<Block>, DbError>;

    async fn get_leases(&self) -> Result<Vec<Lease>, DbError>;

    async fn get_payments(&self) -> Result<Vec<Payment>, DbError>;
}

// Batch insert chunk size to avoid parameter limits
// PostgreSQL: 65535 max params, SQLite: 999-32766 params (configurable)
// Using conservative chunk size that works safely for both databases
const BATCH_INSERT_CHUNK_SIZE: usize = 75;

/// `($1,$2),($3,$4)` style placeholders for a multi-row insert.
fn values_clause(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|row| {
            let params: Vec<String> =
                (1..=columns).map(|col| format!("${}", row * columns + col)).collect();
            format!("({})", params.join(","))
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub struct SqlLeasingDb {
    pool: AnyPool,
}

impl SqlLeasingDb {
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(20).connect(database_url).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

async fn ensure_state(conn: &mut AnyConnection) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO indexer_state (id, from_height, indexed_height) VALUES ($1, 0, NULL)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(STATE_ID)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_state(conn: &mut AnyConnection) -> Result<IndexerState, DbError> {
    let row = sqlx::query("SELECT from_height, indexed_height FROM indexer_state WHERE id = $1")
        .bind(STATE_ID)
        .fetch_one(&mut *conn)
        .await?;

    Ok(IndexerState {
        from_height: height_from_db(row.try_get::<i64, _>("from_height")?)?,
        indexed_height: row
            .try_get::<Option<i64>, _>("indexed_height")?
            .map(height_from_db)
            .transpose()?,
    })
}

async fn insert_blocks(conn: &mut AnyConnection, blocks: &[Block]) -> Result<usize, DbError> {
    for chunk in blocks.chunks(BATCH_INSERT_CHUNK_SIZE) {
        let sql = format!(
            "INSERT INTO blocks (height, generator, fee, previous_fee, block_reward, timestamp)
             VALUES {}
             ON CONFLICT (height) DO UPDATE SET
                generator = EXCLUDED.generator,
                fee = EXCLUDED.fee,
                previous_fee = EXCLUDED.previous_fee,
                block_reward = EXCLUDED.block_reward,
                timestamp = EXCLUDED.timestamp",
            values_clause(chunk.len(), 6)
        );

        let mut query = sqlx::query(&sql);
        for block in chunk {
            query = query
                .bind(block.height as i64)
                .bind(block.generator.clone())
                .bind(pad_u256(block.fee))
                .bind(pad_u256(block.previous_fee))
                .bind(pad_u256(block.block_reward))
                .bind(block.timestamp as i64);
        }
        query.execute(&mut *conn).await?;
    }
    Ok(blocks.len())
}

// Open-side fields of an existing lease are never overwritten. Nullable ones are only filled in.
async fn upsert_leases(conn: &mut AnyConnection, leases: &[Lease]) -> Result<usize, DbError> {
    for chunk in leases.chunks(BATCH_INSERT_CHUNK_SIZE) {
        let sql = format!(
            r#"INSERT INTO leases (id, tx_id, cancel_tx_id, "type", sender, amount, height,
                                   timestamp, cancel_height, cancel_timestamp)
             VALUES {}
             ON CONFLICT (id) DO UPDATE SET
                "type" = COALESCE(leases."type", EXCLUDED."type"),
                timestamp = COALESCE(leases.timestamp, EXCLUDED.timestamp),
                cancel_tx_id = COALESCE(EXCLUDED.cancel_tx_id, leases.cancel_tx_id),
                cancel_height = COALESCE(EXCLUDED.cancel_height, leases.cancel_height),
                cancel_timestamp = COALESCE(EXCLUDED.cancel_timestamp, leases.cancel_timestamp)"#,
            values_clause(chunk.len(), 10)
        );

        let mut query = sqlx::query(&sql);
        for lease in chunk {
            query = query
                .bind(lease.id.clone())
                .bind(lease.tx_id.clone())
                .bind(lease.cancel_tx_id.clone())
                .bind(lease.lease_type.map(i64::from))
                .bind(lease.sender.clone())
                .bind(pad_u256(lease.amount))
                .bind(lease.height as i64)
                .bind(lease.timestamp.map(|t| t as i64))
                .bind(lease.cancel_height.map(|h| h as i64))
                .bind(lease.cancel_timestamp.map(|t| t as i64));
        }
        query.execute(&mut *conn).await?;
    }
    Ok(leases.len())
}

async fn insert_payments(conn: &mut AnyConnection, payments: &[Payment]) -> Result<usize, DbError> {
    for chunk in payments.chunks(BATCH_INSERT_CHUNK_SIZE) {
        let sql = format!(
            "INSERT INTO payments (tx_id, address, amount, height, timestamp)
             VALUES {}
             ON CONFLICT (tx_id, address) DO UPDATE SET
                amount = EXCLUDED.amount,
                height = EXCLUDED.height,
                timestamp = EXCLUDED.timestamp",
            values_clause(chunk.len(), 5)
        );

        let mut query = sqlx::query(&sql);
        for payment in chunk {
            query = query
                .bind(payment.tx_id.clone())
                .bind(payment.address.clone())
                .bind(pad_u256(payment.amount))
                .bind(payment.height as i64)
                .bind(payment.timestamp as i64);
        }
        query.execute(&mut *conn).await?;
    }
    Ok(payments.len())
}

fn block_from_row(row: &AnyRow) -> Result<Block, DbError> {
    Ok(Block {
        height: height_from_db(row.try_get::<i64, _>("height")?)?,
        generator: row.try_get::<String, _>("generator")?,
        fee: unpad_u256(&row.try_get::<String, _>("fee")?)?,
        previous_fee: unpad_u256(&row.try_get::<String, _>("previous_fee")?)?,
        block_reward: unpad_u256(&row.try_get::<String, _>("block_reward")?)?,
        timestamp: row.try_get::<i64, _>("timestamp")? as u64,
    })
}

fn lease_from_row(row: &AnyRow) -> Result<Lease, DbError> {
    let lease_type = row
        .try_get::<Option<i64>, _>("type")?
        .map(|t| u8::try_from(t).map_err(|_| DbError::BadAmount(format!("lease type {t}"))))
        .transpose()?;

    Ok(Lease {
        id: row.try_get::<String, _>("id")?,
        tx_id: row.try_get::<String, _>("tx_id")?,
        cancel_tx_id: row.try_get::<Option<String>, _>("cancel_tx_id")?,
        lease_type,
        sender: row.try_get::<String, _>("sender")?,
        amount: unpad_u256(&row.try_get::<String, _>("amount")?)?,
        height: height_from_db(row.try_get::<i64, _>("height")?)?,
        timestamp: row.try_get::<Option<i64>, _>("timestamp")?.map(|t| t as u64),
        cancel_height: row
            .try_get::<Option<i64>, _>("cancel_height")?
            .map(height_from_db)
            .transpose()?,
        cancel_timestamp: row.try_get::<Option<i64>, _>("cancel_timestamp")?.map(|t| t as u64),
    })
}

fn payment_from_row(row: &AnyRow) -> Result<Payment, DbError> {
    Ok(Payment {
        tx_id: row.try_get::<String, _>("tx_id")?,
        address: row.try_get::<String, _>("address")?,
        amount: unpad_u256(&row.try_get::<String, _>("amount")?)?,
        height: height_from_db(row.try_get::<i64, _>("height")?)?,
        timestamp: row.try_get::<i64, _>("timestamp")? as u64,
    })
}

#[async_trait]
impl LeasingDb for SqlLeasingDb {
    async fn get_indexer_state(&self) -> Result<IndexerState, DbError> {
        let mut conn = self.pool.acquire().await?;
        ensure_state(&mut conn).await?;
        read_state(&mut conn).await
    }

    async fn init_from_height(&self, height: u64) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;
        ensure_state(&mut tx).await?;
        let result = sqlx::query(
            "UPDATE indexer_state SET from_height = $1 WHERE id = $2 AND from_height = 0",
        )
        .bind(height as i64)
        .bind(STATE_ID)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit_chunk(&self, chunk: &ChunkCommit) -> Result<ChunkCounts, DbError> {
        let mut tx = self.pool.begin().await?;
        ensure_state(&mut tx).await?;

        let counts = ChunkCounts {
            blocks: insert_blocks(&mut tx, &chunk.blocks).await?,
            previous_leases: upsert_leases(&mut tx, &chunk.previous_leases).await?,
            leases: upsert_leases(&mut tx, &chunk.leases).await?,
            cancel_leases: upsert_leases(&mut tx, &chunk.cancel_leases).await?,
            payments: insert_payments(&mut tx, &chunk.payments).await?,
        };

        sqlx::query("UPDATE indexer_state SET indexed_height = $1 WHERE id = $2")
            .bind(chunk.end_height as i64)
            .bind(STATE_ID)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(counts)
    }

    async fn reset_from(&self, height: u64) -> Result<RollbackCounts, DbError> {
        let mut tx = self.pool.begin().await?;
        ensure_state(&mut tx).await?;
        let state = read_state(&mut tx).await?;

        if state.from_height == 0 || height <= state.from_height {
            sqlx::query(
                "UPDATE indexer_state SET from_height = $1, indexed_height = NULL WHERE id = $2",
            )
            .bind(height as i64)
            .bind(STATE_ID)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE indexer_state SET indexed_height = $1 WHERE id = $2")
                .bind(height as i64)
                .bind(STATE_ID)
                .execute(&mut *tx)
                .await?;
        }

        let blocks = sqlx::query("DELETE FROM blocks WHERE height >= $1")
            .bind(height as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let leases = sqlx::query("DELETE FROM leases WHERE height >= $1")
            .bind(height as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let cancellations = sqlx::query(
            "UPDATE leases SET cancel_tx_id = NULL, cancel_height = NULL, cancel_timestamp = NULL
             WHERE cancel_height >= $1",
        )
        .bind(height as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let payments = sqlx::query("DELETE FROM payments WHERE height >= $1")
            .bind(height as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(RollbackCounts { blocks, leases, cancellations, payments })
    }

    async fn get_blocks(&self) -> Result<Vec<Block>, DbError> {
        let rows = sqlx::query(
            "SELECT height, generator, fee, previous_fee, block_reward, timestamp
             FROM blocks ORDER BY height",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(block_from_row).collect()
    }

    async fn get_leases(&self) -> Result<Vec<Lease>, DbError> {
        let rows = sqlx::query(
            r#"SELECT id, tx_id, cancel_tx_id, "type", sender, amount, height, timestamp,
                      cancel_height, cancel_timestamp
               FROM leases ORDER BY height, id"#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(lease_from_row).collect()
    }

    async fn get_payments(&self) -> Result<Vec<Payment>, DbError> {
        let rows = sqlx::query(
            "SELECT tx_id, address, amount, height, timestamp
             FROM payments ORDER BY height, tx_id, address",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(payment_from_row).collect()
    }
}
