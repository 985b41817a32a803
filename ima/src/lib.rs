// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod chain_client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod metered_eth_provider;
pub mod metrics;
pub mod node;
pub mod pending_txns;
pub mod server;
pub mod signer;
pub mod types;
pub mod verifier;

#[cfg(test)]
pub mod chain_mock_client;

#[cfg(test)]
pub mod test_utils;

/// Retries `$func` with exponential backoff until it succeeds or
/// `$max_elapsed_time` has passed, then yields the last error. `$target`
/// names what is being retried in the debug log.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr, $target:expr) => {{
        // jittered delays of roughly 0.4, 0.8, 1.6 ... seconds, capped at 120
        let backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            std::boxed::Box::pin(async {
                $func.await.map_err(|e| {
                    tracing::debug!(endpoint = %$target, "Retrying after error: {:?}", e);
                    backoff::Error::transient(e)
                })
            })
        })
        .await
    }};
}
