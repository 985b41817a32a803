// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::{ImaChainClient, ImaChainClientInner};
use crate::error::ImaResult;
use crate::metrics::ImaMetrics;
use ethers::types::{Log, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const MINUTES_PER_DAY: u64 = 24 * 60;

/// Lookback windows tried by the progressive search, in minutes.
const PROGRESSIVE_WINDOWS: [(&str, u64); 4] = [
    ("day", MINUTES_PER_DAY),
    ("week", 7 * MINUTES_PER_DAY),
    ("month", 31 * MINUTES_PER_DAY),
    ("year", 366 * MINUTES_PER_DAY),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogSearchConfig {
    pub blocks_per_step: u64,
    pub max_iterations: u64,
    /// Used to turn the progressive lookback windows into block counts
    pub assumed_blocks_per_minute: u64,
    pub progressive: bool,
}

impl Default for LogSearchConfig {
    fn default() -> Self {
        Self {
            blocks_per_step: 1000,
            max_iterations: 5000,
            assumed_blocks_per_minute: 6,
            progressive: true,
        }
    }
}

impl LogSearchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.blocks_per_step == 0 {
            anyhow::bail!("log-search.blocks-per-step must be positive");
        }
        if self.max_iterations == 0 {
            anyhow::bail!("log-search.max-iterations must be positive");
        }
        if self.progressive && self.assumed_blocks_per_minute == 0 {
            anyhow::bail!("log-search.assumed-blocks-per-minute must be positive");
        }
        Ok(())
    }
}

pub struct LogSearcher {
    config: LogSearchConfig,
    metrics: Arc<ImaMetrics>,
}

impl LogSearcher {
    pub fn new(config: LogSearchConfig, metrics: Arc<ImaMetrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &LogSearchConfig {
        &self.config
    }

    /// Searches from genesis to the latest block with the configured strategy.
    pub async fn search<C: ImaChainClientInner>(
        &self,
        client: &ImaChainClient<C>,
        topics: &[H256; 3],
    ) -> ImaResult<Vec<Log>> {
        let latest = client.latest_block_number().await?;
        if self.config.progressive {
            self.do_logs_search_progressive(client, topics, latest).await
        } else {
            self.do_logs_search_iterative(client, topics, 0, latest).await
        }
    }

    /// One `eth_getLogs` over the inclusive range with the topics ANDed.
    pub async fn do_logs_search<C: ImaChainClientInner>(
        &self,
        client: &ImaChainClient<C>,
        topics: &[H256; 3],
        from_block: u64,
        to_block: u64,
    ) -> ImaResult<Vec<Log>> {
        self.metrics
            .logs_search_queries
            .with_label_values(&["single"])
            .inc();
        debug!(
            chain = client.chain_name(),
            from_block, to_block, "Searching logs"
        );
        client.get_logs_in_range(topics, from_block, to_block).await
    }

    /// Walks `[from_block, to_block]` in steps, returning the first non-empty result.
    /// A range wider than `blocks_per_step * max_iterations` is searched in one call.
    pub async fn do_logs_search_iterative<C: ImaChainClientInner>(
        &self,
        client: &ImaChainClient<C>,
        topics: &[H256; 3],
        from_block: u64,
        to_block: u64,
    ) -> ImaResult<Vec<Log>> {
        self.metrics
            .logs_search_queries
            .with_label_values(&["iterative"])
            .inc();
        if from_block > to_block {
            return Ok(vec![]);
        }
        let step = self.config.blocks_per_step.max(1);
        let budget = step.saturating_mul(self.config.max_iterations.max(1));
        if to_block - from_block > budget {
            debug!(
                chain = client.chain_name(),
                from_block, to_block, "Range exceeds iteration budget, searching in one call"
            );
            return self.do_logs_search(client, topics, from_block, to_block).await;
        }
        let mut current = from_block;
        loop {
            let end = current.saturating_add(step - 1).min(to_block);
            let logs = self.do_logs_search(client, topics, current, end).await?;
            if !logs.is_empty() {
                return Ok(logs);
            }
            if end >= to_block {
                return Ok(vec![]);
            }
            current = end + 1;
        }
    }

    /// Tries the last day, week, month and year before falling back to genesis.
    /// Stops at the first window with any match, so an event older than a window
    /// that already matched something else is never looked for.
    pub async fn do_logs_search_progressive<C: ImaChainClientInner>(
        &self,
        client: &ImaChainClient<C>,
        topics: &[H256; 3],
        latest_block: u64,
    ) -> ImaResult<Vec<Log>> {
        self.metrics
            .logs_search_queries
            .with_label_values(&["progressive"])
            .inc();
        for (window, minutes) in PROGRESSIVE_WINDOWS {
            let blocks = minutes.saturating_mul(self.config.assumed_blocks_per_minute);
            // window reaches before genesis
            if blocks > latest_block {
                continue;
            }
            let from_block = latest_block - blocks;
            debug!(
                chain = client.chain_name(),
                window, from_block, latest_block, "Progressive log search window"
            );
            let logs = self
                .do_logs_search_iterative(client, topics, from_block, latest_block)
                .await?;
            if !logs.is_empty() {
                return Ok(logs);
            }
        }
        self.do_logs_search_iterative(client, topics, 0, latest_block)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_mock_client::ChainMockClient;
    use ethers::types::U64;

    fn topics() -> [H256; 3] {
        [
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            H256::from_low_u64_be(5),
        ]
    }

    fn log_at(block: u64, topics: &[H256; 3]) -> Log {
        Log {
            topics: topics.to_vec(),
            block_number: Some(U64::from(block)),
            transaction_hash: Some(H256::from_low_u64_be(block)),
            ..Default::default()
        }
    }

    fn searcher(config: LogSearchConfig) -> LogSearcher {
        LogSearcher::new(config, Arc::new(ImaMetrics::new_for_testing()))
    }

    fn client(mock: &ChainMockClient) -> ImaChainClient<ChainMockClient> {
        ImaChainClient::new_with_inner(mock.clone(), "Mainnet")
    }

    #[tokio::test]
    async fn test_single_search_ands_topics() {
        let mock = ChainMockClient::default();
        let t = topics();
        mock.add_log(log_at(100, &t));
        let mut other = t;
        other[2] = H256::from_low_u64_be(6);
        mock.add_log(log_at(100, &other));

        let logs = searcher(Default::default())
            .do_logs_search(&client(&mock), &t, 0, 200)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].topics[2], H256::from_low_u64_be(5));
    }

    #[tokio::test]
    async fn test_iterative_walks_forward_until_hit() {
        let mock = ChainMockClient::default();
        let t = topics();
        mock.add_log(log_at(2500, &t));
        mock.add_log(log_at(3500, &t));

        let logs = searcher(Default::default())
            .do_logs_search_iterative(&client(&mock), &t, 0, 10_000)
            .await
            .unwrap();
        // the first step containing a hit wins
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, Some(U64::from(2500)));
        assert_eq!(
            mock.log_queries(),
            vec![(0, 999), (1000, 1999), (2000, 2999)]
        );
    }

    #[tokio::test]
    async fn test_iterative_exhausts_range() {
        let mock = ChainMockClient::default();
        let t = topics();
        let logs = searcher(Default::default())
            .do_logs_search_iterative(&client(&mock), &t, 500, 2100)
            .await
            .unwrap();
        assert!(logs.is_empty());
        assert_eq!(
            mock.log_queries(),
            vec![(500, 1499), (1500, 2100)]
        );
    }

    #[tokio::test]
    async fn test_iterative_wide_range_single_call() {
        let mock = ChainMockClient::default();
        let t = topics();
        mock.add_log(log_at(90_000, &t));
        let config = LogSearchConfig {
            blocks_per_step: 10,
            max_iterations: 5,
            ..Default::default()
        };
        let logs = searcher(config)
            .do_logs_search_iterative(&client(&mock), &t, 0, 100_000)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(mock.log_queries(), vec![(0, 100_000)]);
    }

    #[tokio::test]
    async fn test_iterative_budget_boundary() {
        let mock = ChainMockClient::default();
        let t = topics();
        let config = LogSearchConfig {
            blocks_per_step: 10,
            max_iterations: 5,
            ..Default::default()
        };
        // a range exactly as wide as the budget is still walked in steps
        let logs = searcher(config.clone())
            .do_logs_search_iterative(&client(&mock), &t, 0, 50)
            .await
            .unwrap();
        assert!(logs.is_empty());
        assert_eq!(
            mock.log_queries(),
            vec![(0, 9), (10, 19), (20, 29), (30, 39), (40, 49), (50, 50)]
        );

        let mock = ChainMockClient::default();
        searcher(config)
            .do_logs_search_iterative(&client(&mock), &t, 0, 51)
            .await
            .unwrap();
        assert_eq!(mock.log_queries(), vec![(0, 51)]);
    }

    #[tokio::test]
    async fn test_iterative_empty_range() {
        let mock = ChainMockClient::default();
        let logs = searcher(Default::default())
            .do_logs_search_iterative(&client(&mock), &topics(), 10, 9)
            .await
            .unwrap();
        assert!(logs.is_empty());
        assert!(mock.log_queries().is_empty());
    }

    #[tokio::test]
    async fn test_progressive_windows() {
        let mock = ChainMockClient::default();
        let t = topics();
        let latest = 1_000_000;
        // 3 days back at 6 blocks per minute, outside the day window but inside the week
        let block = latest - 3 * 1440 * 6;
        mock.add_log(log_at(block, &t));
        let config = LogSearchConfig {
            blocks_per_step: 1_000_000,
            ..Default::default()
        };
        let logs = searcher(config)
            .do_logs_search_progressive(&client(&mock), &t, latest)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(
            mock.log_queries(),
            vec![
                (latest - 1440 * 6, latest),
                (latest - 7 * 1440 * 6, latest),
            ]
        );
    }

    #[tokio::test]
    async fn test_progressive_skips_windows_before_genesis() {
        let mock = ChainMockClient::default();
        let t = topics();
        mock.add_log(log_at(100, &t));
        mock.set_latest_block_number(5000);
        let logs = searcher(Default::default())
            .search(&client(&mock), &t)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        // every window is longer than the chain, only the genesis walk runs
        assert_eq!(mock.log_queries(), vec![(0, 999)]);
    }

    #[tokio::test]
    async fn test_progressive_stops_at_first_matching_window() {
        // the log at block 10 is never reached once the day window matches
        let mock = ChainMockClient::default();
        let t = topics();
        let latest = 600_000;
        mock.add_log(log_at(latest - 10, &t));
        mock.add_log(log_at(10, &t));
        let config = LogSearchConfig {
            blocks_per_step: 1_000_000,
            ..Default::default()
        };
        let logs = searcher(config)
            .do_logs_search_progressive(&client(&mock), &t, latest)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, Some(U64::from(latest - 10)));
    }

    #[test]
    fn test_config_validate() {
        assert!(LogSearchConfig::default().validate().is_ok());
        let config = LogSearchConfig {
            blocks_per_step: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
