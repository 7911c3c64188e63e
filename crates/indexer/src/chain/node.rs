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

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use url::Url;

use super::{BlockHeader, ChainBlock, ChainError, ChainReader, LeaseDetails, Transaction};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct HeightResponse {
    height: u64,
}

#[derive(Deserialize)]
struct AliasAddressResponse {
    address: String,
}

/// Chain reader backed by a node's REST API.
#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    base_url: Url,
}

impl NodeClient {
    pub fn new(base_url: Url) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ChainError> {
        let url = self.endpoint(path);
        tracing::trace!("GET {} {:?}", url, query);

        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChainError::Status { url, status: status.as_u16(), body });
        }
        serde_json::from_str(&body).map_err(|source| ChainError::Decode { url, source })
    }
}

#[async_trait]
impl ChainReader for NodeClient {
    async fn current_height(&self) -> Result<u64, ChainError> {
        let response: HeightResponse = self.get_json("blocks/height", &[]).await?;
        Ok(response.height)
    }

    async fn blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<ChainBlock>, ChainError> {
        self.get_json(&format!("blocks/seq/{from}/{to}"), &[]).await
    }

    async fn block_headers_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        self.get_json(&format!("blocks/headers/seq/{from}/{to}"), &[]).await
    }

    async fn aliases_of(&self, address: &str) -> Result<Vec<String>, ChainError> {
        self.get_json(&format!("alias/by-address/{address}"), &[]).await
    }

    async fn address_of_alias(&self, alias: &str) -> Result<String, ChainError> {
        // Accepts both `alias:<chain>:<name>` and a bare name.
        let name = alias.rsplit(':').next().unwrap_or(alias);
        match self.get_json::<AliasAddressResponse>(&format!("alias/by-alias/{name}"), &[]).await {
            Ok(response) => Ok(response.address),
            Err(ChainError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ChainError::AliasNotFound(alias.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn active_leases_to(&self, address: &str) -> Result<Vec<LeaseDetails>, ChainError> {
        self.get_json(&format!("leasing/active/{address}"), &[]).await
    }

    async fn transactions_of(
        &self,
        address: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<Transaction>, ChainError> {
        let path = format!("transactions/address/{address}/limit/{limit}");
        let query: Vec<(&str, &str)> = after.map(|id| ("after", id)).into_iter().collect();
        let pages: Vec<Vec<Transaction>> = self.get_json(&path, &query).await?;
        Ok(pages.into_iter().next().unwrap_or_default())
    }
}
