// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::ImaMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use url::{ParseError, Url};

/// Concurrent requests allowed per chain endpoint
const MAX_CONCURRENT_REQUESTS: usize = 8;

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// HTTP JSON-RPC transport that counts and times every call per chain.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    chain: String,
    metrics: Arc<ImaMetrics>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl MeteredEthHttpProvider {
    pub fn new(url: impl Into<Url>, chain: &str, metrics: Arc<ImaMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            chain: chain.to_string(),
            metrics,
            semaphore: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_REQUESTS)),
        }
    }
}

fn is_rate_limit_error(e: &HttpClientError) -> bool {
    let error_str = format!("{:?}", e).to_lowercase();
    error_str.contains("rate limit")
        || error_str.contains("429")
        || error_str.contains("too many requests")
        || error_str.contains("-32005")
}

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        // the semaphore is never closed
        let _permit = self.semaphore.acquire().await.ok();

        self.metrics
            .chain_rpc_queries
            .with_label_values(&[&self.chain, method])
            .inc();
        let _guard = self
            .metrics
            .chain_rpc_queries_latency
            .with_label_values(&[&self.chain, method])
            .start_timer();

        let mut result = self.inner.request(method, &params).await;
        let mut retry_count = 0;
        while retry_count < MAX_RATE_LIMIT_RETRIES {
            match &result {
                Err(e) if is_rate_limit_error(e) => {}
                _ => break,
            }
            // 1s, 2s, 4s
            let backoff_duration = Duration::from_secs(1 << retry_count);
            tracing::warn!(
                chain = self.chain.as_str(),
                "Rate limit error on {}, retrying after {:?} (attempt {}/{})",
                method,
                backoff_duration,
                retry_count + 1,
                MAX_RATE_LIMIT_RETRIES
            );
            tokio::time::sleep(backoff_duration).await;
            result = self.inner.request(method, &params).await;
            retry_count += 1;
        }

        if result.is_err() {
            self.metrics
                .chain_rpc_errors
                .with_label_values(&[&self.chain, method])
                .inc();
        }
        result
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    chain: &str,
    metrics: Arc<ImaMetrics>,
) -> Result<Provider<MeteredEthHttpProvider>, ParseError> {
    let http_provider = MeteredEthHttpProvider::new(Url::parse(url)?, chain, metrics);
    Ok(Provider::new(http_provider))
}
