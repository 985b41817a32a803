// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::ImaNodeConfig,
    dispatch::Domain,
    metrics::ImaMetrics,
    pending_txns::{HttpBroadcastSink, PendingTxnTracker, TxnBroadcaster},
    server::{handler::ImaRequestHandler, run_server, ImaNodePublicMetadata},
    signer::ThresholdSigner,
    verifier::ImaVerifier,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{error, info};

const DISPATCH_WORKERS: usize = 4;
const BROADCAST_MAX_ELAPSED_TIME: Duration = Duration::from_secs(30);

pub async fn run_ima_node(
    config: ImaNodeConfig,
    version: &'static str,
    prometheus_registry: prometheus::Registry,
) -> anyhow::Result<JoinHandle<()>> {
    let metrics = Arc::new(ImaMetrics::new(&prometheus_registry));
    let server_config = config.validate(metrics.clone()).await?;

    let domain = Domain::new("ima", DISPATCH_WORKERS)
        .map_err(|e| anyhow::anyhow!("Failed to start dispatch domain: {}", e))?;
    let hook_metrics = metrics.clone();
    domain.set_exception_hook(Arc::new(move |queue: &str, message: &str| {
        error!(queue, "Dispatch job panicked: {}", message);
        hook_metrics
            .dispatch_job_panics
            .with_label_values(&[queue])
            .inc();
    }));
    let runtime = tokio::runtime::Handle::current();

    let tracker = if server_config.pending_txns.enabled {
        let broadcaster = match server_config.broadcast_signer {
            Some(signer) => Some(Arc::new(TxnBroadcaster::new(
                signer,
                server_config.nodes.clone(),
                Arc::new(HttpBroadcastSink::new(BROADCAST_MAX_ELAPSED_TIME)?),
                metrics.clone(),
            ))),
            None => None,
        };
        Some(PendingTxnTracker::new(
            server_config.pending_txns.clone(),
            server_config.chains.main_net().clone(),
            server_config.nodes.clone(),
            broadcaster,
            domain.handle(),
            runtime.clone(),
            metrics.clone(),
        ))
    } else {
        info!("Pending transaction tracking is disabled");
        None
    };

    let signer = Arc::new(ThresholdSigner::new(
        server_config.oracle.clone(),
        server_config.threshold.clone(),
        metrics.clone(),
    ));
    let verifier = Arc::new(ImaVerifier::new(
        server_config.chains.clone(),
        server_config.contracts,
        server_config.log_search.clone(),
        metrics.clone(),
    ));
    let handler = ImaRequestHandler::new(verifier, signer, tracker, domain.handle(), runtime);

    let metadata = ImaNodePublicMetadata {
        version,
        chain_name: server_config.chain_name.clone(),
        node_id: Some(server_config.node_id),
    };
    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        server_config.server_listen_port,
    );
    let server = run_server(&socket_address, Arc::new(handler), metrics, Arc::new(metadata));
    info!(
        chain_name = server_config.chain_name.as_str(),
        node_id = server_config.node_id,
        "IMA agent started on {}",
        socket_address
    );
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Server task failed: {}", e);
        }
        // joining the workers blocks
        let _ = tokio::task::spawn_blocking(move || domain.shutdown()).await;
    }))
}
