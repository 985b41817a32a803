// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

pub const METRICS_PATH: &str = "/metrics";

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 6.5, 7.0, 7.5, 8.0, 8.5, 9.0, 9.5,
    10., 15., 20., 25., 30., 35., 40., 45., 50., 60., 70., 80., 90., 100., 120., 140., 160., 180.,
    200., 250., 300., 350., 400.,
];

#[derive(Clone, Debug)]
pub struct ImaMetrics {
    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,

    pub(crate) chain_rpc_queries: IntCounterVec,
    pub(crate) chain_rpc_queries_latency: HistogramVec,
    pub(crate) chain_rpc_errors: IntCounterVec,

    pub(crate) logs_search_queries: IntCounterVec,
    pub(crate) messages_verified: IntCounterVec,
    pub(crate) messages_rejected: IntCounterVec,

    pub(crate) sign_requests: IntCounterVec,
    pub(crate) sign_latency: HistogramVec,

    pub(crate) pending_txns: IntGauge,
    pub(crate) pending_txns_evicted: IntCounter,
    pub(crate) pending_txns_mined: IntCounter,
    pub(crate) broadcasts_sent: IntCounterVec,
    pub(crate) broadcasts_failed: IntCounterVec,
    pub(crate) broadcasts_rejected: IntCounter,

    pub(crate) dispatch_job_panics: IntCounterVec,
}

impl ImaMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_received: register_int_counter_vec_with_registry!(
                "ima_requests_received",
                "Total number of requests received in Server, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "ima_requests_ok",
                "Total number of ok requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "ima_err_requests",
                "Total number of erred requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_inflight: register_int_gauge_vec_with_registry!(
                "ima_requests_inflight",
                "Total number of inflight requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            chain_rpc_queries: register_int_counter_vec_with_registry!(
                "ima_chain_rpc_queries",
                "Total number of queries issued to chain providers, by chain and method",
                &["chain", "method"],
                registry,
            )
            .unwrap(),
            chain_rpc_queries_latency: register_histogram_vec_with_registry!(
                "ima_chain_rpc_queries_latency",
                "Latency of queries issued to chain providers, by chain and method",
                &["chain", "method"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            chain_rpc_errors: register_int_counter_vec_with_registry!(
                "ima_chain_rpc_errors",
                "Total number of failed chain provider queries, by chain and method",
                &["chain", "method"],
                registry,
            )
            .unwrap(),
            logs_search_queries: register_int_counter_vec_with_registry!(
                "ima_logs_search_queries",
                "Total number of eth_getLogs range queries, by search strategy",
                &["strategy"],
                registry,
            )
            .unwrap(),
            messages_verified: register_int_counter_vec_with_registry!(
                "ima_messages_verified",
                "Total number of IMA messages proven by an OutgoingMessage event, by direction",
                &["direction"],
                registry,
            )
            .unwrap(),
            messages_rejected: register_int_counter_vec_with_registry!(
                "ima_messages_rejected",
                "Total number of IMA messages without a matching OutgoingMessage event, by direction",
                &["direction"],
                registry,
            )
            .unwrap(),
            sign_requests: register_int_counter_vec_with_registry!(
                "ima_sign_requests",
                "Total number of signing oracle requests, by kind and outcome",
                &["kind", "outcome"],
                registry,
            )
            .unwrap(),
            sign_latency: register_histogram_vec_with_registry!(
                "ima_sign_latency",
                "Latency of signing oracle requests, by kind",
                &["kind"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            pending_txns: register_int_gauge_with_registry!(
                "ima_pending_txns",
                "Number of tracked pending IMA transactions",
                registry,
            )
            .unwrap(),
            pending_txns_evicted: register_int_counter_with_registry!(
                "ima_pending_txns_evicted",
                "Total number of tracked transactions evicted by the capacity bound",
                registry,
            )
            .unwrap(),
            pending_txns_mined: register_int_counter_with_registry!(
                "ima_pending_txns_mined",
                "Total number of tracked transactions found mined by the periodic check",
                registry,
            )
            .unwrap(),
            broadcasts_sent: register_int_counter_vec_with_registry!(
                "ima_broadcasts_sent",
                "Total number of pending transaction broadcasts delivered, by action",
                &["action"],
                registry,
            )
            .unwrap(),
            broadcasts_failed: register_int_counter_vec_with_registry!(
                "ima_broadcasts_failed",
                "Total number of pending transaction broadcasts that could not be delivered, by action",
                &["action"],
                registry,
            )
            .unwrap(),
            broadcasts_rejected: register_int_counter_with_registry!(
                "ima_broadcasts_rejected",
                "Total number of received broadcasts rejected for a bad signature",
                registry,
            )
            .unwrap(),
            dispatch_job_panics: register_int_counter_vec_with_registry!(
                "ima_dispatch_job_panics",
                "Total number of panicking dispatch jobs, by queue",
                &["queue"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

/// Serves the registry in the prometheus text format on `/metrics`.
pub fn start_prometheus_server(address: SocketAddr) -> Registry {
    let registry = Registry::new();
    let app = Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(registry.clone());
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {}: {}", address, e);
                return;
            }
        };
        info!("Metrics server listening on {}", address);
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server stopped: {}", e);
        }
    });
    registry
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
