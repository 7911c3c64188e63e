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

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, sync::Arc};

use alloy_primitives::I256;
use anyhow::{bail, Context, Result};
use clap::Parser;
use leasing_distributor::{NodeSettlement, PayoutConfig, PayoutService, PrivateKey, TX_TIMEOUT};
use leasing_indexer::{
    db::{LeasingDbObj, SqlLeasingDb},
    rewards::RewardsService,
};
use leasing_rewards::DistributionConfig;
use serde_json::Value;
use url::Url;

/// Pays out the rewards owed to lessors.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct MainArgs {
    /// DB connection string.
    #[clap(long, env = "DATABASE_URL")]
    db: String,
    /// Base URL of the node REST API used to broadcast.
    #[clap(long, env)]
    node_url: Url,
    /// Chain id byte of the network.
    #[clap(long, env, default_value = "W")]
    chain_id: char,
    /// Address credited with the undistributed part of each block reward.
    #[clap(long, env)]
    node_owner_beneficiary_address: String,
    /// Percentage of block rewards distributed to lessors.
    #[clap(long, env, value_parser = clap::value_parser!(u8).range(0..=100))]
    percentage_to_distribute: u8,
    /// Base58 private key of the paying account.
    #[clap(long, env, hide_env_values = true)]
    private_key: Option<String>,
    /// JSON file of address to amount to pay instead of the current debt.
    #[clap(long)]
    amounts: Option<PathBuf>,
    /// Print the unsigned transactions without sending them.
    #[clap(long, default_value_t = false)]
    dry_run: bool,
    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = MainArgs::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    // NOTE: Using a separate `run` function to facilitate testing below.
    let result = run(&args).await;
    if let Err(e) = &result {
        tracing::error!("FATAL: {:?}", e);
    }
    result
}

/// Reads `address -> amount` where amounts are integers or decimal strings.
fn parse_amounts(json: &str) -> Result<BTreeMap<String, I256>> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(json)?;
    raw.into_iter()
        .map(|(address, value)| {
            let amount = match &value {
                Value::Number(n) => I256::from_str(&n.to_string()),
                Value::String(s) => I256::from_str(s),
                _ => bail!("Amount for {address} must be a number or a string"),
            }
            .with_context(|| format!("Invalid amount for {address}: {value}"))?;
            Ok((address, amount))
        })
        .collect()
}

fn signer(args: &MainArgs) -> Result<Option<PrivateKey>> {
    args.private_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .map(PrivateKey::from_base58)
        .transpose()
        .context("Invalid private key")
}

async fn run(args: &MainArgs) -> Result<()> {
    let chain_id = u8::try_from(args.chain_id).context("Chain id must be a single byte")?;

    let db: LeasingDbObj = Arc::new(
        SqlLeasingDb::new(&args.db).await.context("Failed to connect to the database")?,
    );
    let rewards = RewardsService::new(
        db,
        DistributionConfig {
            percentage_to_distribute: args.percentage_to_distribute,
            node_owner_address: args.node_owner_beneficiary_address.clone(),
        },
    );
    let settlement = NodeSettlement::new(args.node_url.clone())?;
    let service = PayoutService::new(
        Arc::new(rewards),
        Arc::new(settlement),
        PayoutConfig { chain_id, signer: signer(args)?, confirmation_timeout: TX_TIMEOUT },
    );

    let amounts = match &args.amounts {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Some(parse_amounts(&json)?)
        }
        None => None,
    };

    let txs = service.create_payout_txs(amounts).await?;
    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&txs)?);
        return Ok(());
    }
    if txs.is_empty() {
        tracing::info!("Nothing to pay out");
        return Ok(());
    }

    let report = service.sign_and_send(txs).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.failed.is_empty() {
        let total = report.failed.len() + report.sent_tx_ids.len();
        bail!("{} of {} payouts failed", report.failed.len(), total);
    }
    Ok(())
}
