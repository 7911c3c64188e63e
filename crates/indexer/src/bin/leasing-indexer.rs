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

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use leasing_indexer::{
    chain::{ChainReaderObj, NodeClient},
    db::{LeasingDbObj, SqlLeasingDb},
    indexing::{IndexerService, IndexerServiceConfig, IndexerStatus, StartResponse, SyncSlot},
    rewards::RewardsService,
};
use leasing_rewards::DistributionConfig;
use serde::Serialize;
use url::Url;

/// Indexes a validator's leases, blocks and payouts and reports the rewards owed to lessors.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct IndexerArgs {
    /// DB connection string.
    #[clap(long, env = "DATABASE_URL")]
    db: String,

    /// Base URL of the node REST API.
    #[clap(long, env)]
    node_url: Url,

    /// Address of the validator whose leases are indexed.
    #[clap(long, env)]
    validator_address: String,

    /// Number of most recent blocks never indexed.
    #[clap(long, env, default_value_t = 10)]
    confirmation_blocks: u64,

    /// Address credited with the undistributed part of each block reward.
    #[clap(long, env)]
    node_owner_beneficiary_address: String,

    /// Percentage of block rewards distributed to lessors.
    #[clap(long, env, value_parser = clap::value_parser!(u8).range(0..=100))]
    percentage_to_distribute: u8,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,

    #[clap(subcommand)]
    command: IndexerCommand,
}

#[derive(Subcommand, Clone, Debug)]
enum IndexerCommand {
    /// Set the first height to index. Allowed once.
    Init {
        #[clap(long)]
        from: u64,
    },
    /// Print the indexer status.
    Status,
    /// Index from the last indexed height up to `--to` or the confirmed tip.
    Index {
        #[clap(long)]
        to: Option<u64>,
        /// Seconds between progress reports.
        #[clap(long, default_value_t = 5)]
        poll_interval: u64,
    },
    /// Drop everything indexed at or above `--from` and index it again.
    Reindex {
        #[clap(long)]
        from: u64,
        #[clap(long)]
        to: Option<u64>,
        /// Seconds between progress reports.
        #[clap(long, default_value_t = 5)]
        poll_interval: u64,
    },
    /// Print the reward distribution and outstanding debt.
    Summary,
    /// Print the effective configuration.
    Config,
}

#[derive(Serialize)]
struct EffectiveConfig<'a> {
    database_url: String,
    node_url: &'a str,
    validator_address: &'a str,
    confirmation_blocks: u64,
    node_owner_beneficiary_address: &'a str,
    percentage_to_distribute: u8,
    log_json: bool,
}

/// Hides the password of a connection string, if it has one.
fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Fails when the run reported an error or stopped short of `target`.
fn ensure_completed(
    status: &IndexerStatus,
    target: Option<u64>,
    failure: Option<String>,
) -> Result<()> {
    if let Some(e) = failure {
        bail!("Indexing stopped at {:?}: {}", status.processed_to, e);
    }
    if let Some(target) = target {
        if !status.processed_to.is_some_and(|height| height >= target) {
            bail!("Indexing stopped at {:?} of {}", status.processed_to, target);
        }
    }
    Ok(())
}

/// Reports progress until the running indexing run finishes.
async fn monitor(service: &IndexerService, poll_interval: Duration) -> Result<()> {
    // The run may already be done, in which case only its recorded failure is checked.
    let target = match service.slot() {
        SyncSlot::Running { target, .. } => Some(target),
        _ => None,
    };
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = service.wait_until_idle() => break,
            _ = ticker.tick() => {
                let status = service.status().await?;
                tracing::info!(
                    "Indexed up to {:?} of {} (started at {})",
                    status.processed_to,
                    status.target_to,
                    status.processed_from
                );
            }
        }
    }
    let status = service.status().await?;
    print_json(&status)?;
    ensure_completed(&status, target, service.last_failure())
}

async fn start(
    service: &IndexerService,
    response: StartResponse,
    poll_interval: Duration,
) -> Result<()> {
    match response {
        StartResponse::Started => monitor(service, poll_interval).await,
        other => {
            tracing::info!("Nothing started: {:?}", other);
            print_json(&service.status().await?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = IndexerArgs::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    if let IndexerCommand::Config = args.command {
        return print_json(&EffectiveConfig {
            database_url: redact_url(&args.db),
            node_url: args.node_url.as_str(),
            validator_address: &args.validator_address,
            confirmation_blocks: args.confirmation_blocks,
            node_owner_beneficiary_address: &args.node_owner_beneficiary_address,
            percentage_to_distribute: args.percentage_to_distribute,
            log_json: args.log_json,
        });
    }

    let db: LeasingDbObj = Arc::new(
        SqlLeasingDb::new(&args.db).await.context("Failed to connect to the database")?,
    );

    if let IndexerCommand::Summary = args.command {
        let rewards = RewardsService::new(
            db,
            DistributionConfig {
                percentage_to_distribute: args.percentage_to_distribute,
                node_owner_address: args.node_owner_beneficiary_address.clone(),
            },
        );
        return print_json(&rewards.summary().await?);
    }

    let chain: ChainReaderObj = Arc::new(NodeClient::new(args.node_url.clone())?);
    let service = IndexerService::new(
        chain,
        db,
        IndexerServiceConfig {
            validator_address: args.validator_address.clone(),
            confirmation_blocks: args.confirmation_blocks,
        },
    )
    .await?;

    match args.command {
        IndexerCommand::Init { from } => {
            service.init(from).await?;
            print_json(&service.status().await?)
        }
        IndexerCommand::Status => print_json(&service.status().await?),
        IndexerCommand::Index { to, poll_interval } => {
            let response = service.start_indexing(to).await?;
            start(&service, response, Duration::from_secs(poll_interval.max(1))).await
        }
        IndexerCommand::Reindex { from, to, poll_interval } => {
            let response = service.start_reindexing(from, to).await?;
            start(&service, response, Duration::from_secs(poll_interval.max(1))).await
        }
        IndexerCommand::Summary | IndexerCommand::Config => Ok(()),
    }
}
