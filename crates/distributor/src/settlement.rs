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

//! Broadcasting payout transactions through a node and following them to confirmation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::transaction::{PayoutTx, TransactionError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SettlementError {
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

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Transaction {tx_id} failed: {reason}")]
    Rejected { tx_id: String, reason: String },

    #[error("Transaction {tx_id} not confirmed within {timeout:?}")]
    Timeout { tx_id: String, timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Succeeded,
    Failed(String),
}

/// Write side of the chain used by payouts.
#[async_trait]
pub trait Settlement {
    /// Returns the id of the broadcast transaction.
    async fn broadcast(&self, tx: &PayoutTx) -> Result<String, SettlementError>;

    /// Waits until `tx_id` reaches a terminal state. Callers bound the wait.
    async fn await_confirmation(&self, tx_id: &str) -> Result<TxOutcome, SettlementError>;
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    id: String,
    status: String,
    #[serde(default)]
    application_status: Option<String>,
}

/// Settlement through a node REST API.
#[derive(Clone)]
pub struct NodeSettlement {
    client: reqwest::Client,
    base_url: Url,
    poll_interval: Duration,
}

impl NodeSettlement {
    pub fn new(base_url: Url) -> Result<Self, SettlementError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base_url, poll_interval: STATUS_POLL_INTERVAL })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn read<T: DeserializeOwned>(
        url: String,
        response: reqwest::Response,
    ) -> Result<T, SettlementError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SettlementError::Status { url, status: status.as_u16(), body });
        }
        serde_json::from_str(&body).map_err(|source| SettlementError::Decode { url, source })
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SettlementError> {
        let url = self.endpoint(path);
        tracing::trace!("POST {}", url);

        let response = self.client.post(&url).json(body).send().await?;
        Self::read(url, response).await
    }
}

#[async_trait]
impl Settlement for NodeSettlement {
    async fn broadcast(&self, tx: &PayoutTx) -> Result<String, SettlementError> {
        let IdResponse { id } = self.post_json("transactions/broadcast", tx).await?;
        Ok(id)
    }

    async fn await_confirmation(&self, tx_id: &str) -> Result<TxOutcome, SettlementError> {
        let url = self.endpoint("transactions/status");
        loop {
            let response = self.client.get(&url).query(&[("id", tx_id)]).send().await?;
            let statuses: Vec<StatusResponse> = Self::read(url.clone(), response).await?;

            match statuses.into_iter().find(|s| s.id == tx_id) {
                Some(StatusResponse { status, application_status, .. })
                    if status == "confirmed" =>
                {
                    return Ok(match application_status.as_deref() {
                        None | Some("succeeded") => TxOutcome::Succeeded,
                        Some(other) => TxOutcome::Failed(other.to_string()),
                    });
                }
                Some(StatusResponse { status, .. }) => {
                    tracing::trace!("Transaction {} is {}", tx_id, status)
                }
                None => tracing::trace!("Transaction {} has no status yet", tx_id),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
