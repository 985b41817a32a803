// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A mock implementation for `ImaRequestHandlerTrait`
//! that answers every method with a preset result.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::error::{ImaError, ImaResult};
use crate::metrics::ImaMetrics;
use crate::pending_txns::BroadcastAction;
use crate::server::ImaNodePublicMetadata;
use crate::types::{BroadcastTxnRequest, Bsu256Request, TxnRequest, VerifyAndSignRequest};
use async_trait::async_trait;
use serde_json::Value;

use super::handler::ImaRequestHandlerTrait;
use super::make_router;
use super::{
    BROADCAST_TXN_ERASE_METHOD, BROADCAST_TXN_INSERT_METHOD, BSU256_METHOD, TXN_CLEAR_METHOD,
    TXN_ERASE_METHOD, TXN_FIND_METHOD, TXN_INSERT_METHOD, TXN_LIST_ALL_METHOD,
    VERIFY_AND_SIGN_METHOD,
};

#[derive(Clone, Default)]
pub struct ImaRequestMockHandler {
    responses: Arc<Mutex<HashMap<&'static str, ImaResult<Value>>>>,
    requested: Arc<Mutex<HashMap<&'static str, u64>>>,
}

impl ImaRequestMockHandler {
    pub fn set_response(&self, method: &'static str, response: ImaResult<Value>) {
        self.responses.lock().unwrap().insert(method, response);
    }

    pub fn calls(&self, method: &'static str) -> u64 {
        *self.requested.lock().unwrap().get(method).unwrap_or(&0)
    }

    fn respond(&self, method: &'static str) -> ImaResult<Value> {
        *self.requested.lock().unwrap().entry(method).or_default() += 1;
        self.responses
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_else(|| Err(ImaError::Internal(format!("no preset result for {}", method))))
    }
}

#[async_trait]
impl ImaRequestHandlerTrait for ImaRequestMockHandler {
    async fn handle_verify_and_sign(&self, _: VerifyAndSignRequest) -> ImaResult<Value> {
        self.respond(VERIFY_AND_SIGN_METHOD)
    }

    async fn handle_bsu256(&self, _: Bsu256Request) -> ImaResult<Value> {
        self.respond(BSU256_METHOD)
    }

    async fn handle_broadcast_txn(
        &self,
        action: BroadcastAction,
        _: BroadcastTxnRequest,
    ) -> ImaResult<Value> {
        match action {
            BroadcastAction::Insert => self.respond(BROADCAST_TXN_INSERT_METHOD),
            BroadcastAction::Erase => self.respond(BROADCAST_TXN_ERASE_METHOD),
        }
    }

    async fn handle_txn_insert(&self, _: TxnRequest) -> ImaResult<Value> {
        self.respond(TXN_INSERT_METHOD)
    }

    async fn handle_txn_erase(&self, _: TxnRequest) -> ImaResult<Value> {
        self.respond(TXN_ERASE_METHOD)
    }

    async fn handle_txn_find(&self, _: TxnRequest) -> ImaResult<Value> {
        self.respond(TXN_FIND_METHOD)
    }

    async fn handle_txn_clear(&self) -> ImaResult<Value> {
        self.respond(TXN_CLEAR_METHOD)
    }

    async fn handle_txn_list_all(&self) -> ImaResult<Value> {
        self.respond(TXN_LIST_ALL_METHOD)
    }
}

pub fn run_mock_server(
    socket_address: SocketAddr,
    mock_handler: ImaRequestMockHandler,
) -> tokio::task::JoinHandle<()> {
    tracing::info!("Starting mock server at {}", socket_address);
    let listener = std::net::TcpListener::bind(socket_address).unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
    tokio::spawn(async move {
        let router = make_router(
            Arc::new(mock_handler),
            Arc::new(ImaMetrics::new_for_testing()),
            Arc::new(ImaNodePublicMetadata::empty_for_testing()),
        );
        axum::serve(listener, router).await.unwrap()
    })
}
