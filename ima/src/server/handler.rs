// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::ImaChainClientInner;
use crate::dispatch::{priority, DispatchHandle};
use crate::error::{ImaError, ImaResult};
use crate::pending_txns::{BroadcastAction, PendingTxnTracker};
use crate::signer::ThresholdSigner;
use crate::types::{BroadcastTxnRequest, Bsu256Request, TxnRequest, VerifyAndSignRequest};
use crate::verifier::ImaVerifier;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Queue that serializes message verification, away from tracking and broadcast work
pub const VERIFY_QUEUE: &str = "ima-verify";

#[async_trait]
pub trait ImaRequestHandlerTrait {
    /// Verifies a batch and, unless `onlyVerify`, returns `{signResult}`.
    /// In verify-only mode a failed proof is `{success: false}` instead of an error.
    async fn handle_verify_and_sign(&self, request: VerifyAndSignRequest) -> ImaResult<Value>;

    async fn handle_bsu256(&self, request: Bsu256Request) -> ImaResult<Value>;

    async fn handle_broadcast_txn(
        &self,
        action: BroadcastAction,
        request: BroadcastTxnRequest,
    ) -> ImaResult<Value>;

    async fn handle_txn_insert(&self, request: TxnRequest) -> ImaResult<Value>;

    async fn handle_txn_erase(&self, request: TxnRequest) -> ImaResult<Value>;

    async fn handle_txn_find(&self, request: TxnRequest) -> ImaResult<Value>;

    async fn handle_txn_clear(&self) -> ImaResult<Value>;

    async fn handle_txn_list_all(&self) -> ImaResult<Value>;
}

pub struct ImaRequestHandler<C> {
    verifier: Arc<ImaVerifier<C>>,
    signer: Arc<ThresholdSigner>,
    tracker: Option<Arc<PendingTxnTracker<C>>>,
    dispatch: DispatchHandle,
    runtime: tokio::runtime::Handle,
}

impl<C> ImaRequestHandler<C>
where
    C: ImaChainClientInner + 'static,
{
    pub fn new(
        verifier: Arc<ImaVerifier<C>>,
        signer: Arc<ThresholdSigner>,
        tracker: Option<Arc<PendingTxnTracker<C>>>,
        dispatch: DispatchHandle,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        dispatch.add(VERIFY_QUEUE, Some(priority::NORMAL));
        Self {
            verifier,
            signer,
            tracker,
            dispatch,
            runtime,
        }
    }

    fn tracker(&self) -> ImaResult<&Arc<PendingTxnTracker<C>>> {
        self.tracker.as_ref().ok_or_else(|| {
            ImaError::InvalidRequest("pending transaction tracking is disabled".to_string())
        })
    }

    /// Runs the verification on the verify queue from a blocking thread.
    async fn verify_on_queue(
        &self,
        request: Arc<VerifyAndSignRequest>,
    ) -> ImaResult<Vec<crate::verifier::VerifiedMessage>> {
        let verifier = self.verifier.clone();
        let dispatch = self.dispatch.clone();
        let runtime = self.runtime.clone();
        tokio::task::spawn_blocking(move || {
            dispatch.sync(VERIFY_QUEUE, || {
                runtime.block_on(verifier.verify_batch(&request))
            })
        })
        .await
        .map_err(|e| ImaError::Internal(format!("verification task failed: {}", e)))?
        .map_err(|e| ImaError::Dispatch(e.to_string()))?
    }
}

#[async_trait]
impl<C> ImaRequestHandlerTrait for ImaRequestHandler<C>
where
    C: ImaChainClientInner + 'static,
{
    async fn handle_verify_and_sign(&self, request: VerifyAndSignRequest) -> ImaResult<Value> {
        let only_verify = request.only_verify;
        let verified = self.verify_on_queue(Arc::new(request)).await;
        if only_verify {
            return match verified {
                Ok(messages) => {
                    info!(count = messages.len(), "IMA messages verified, signing skipped");
                    Ok(json!({ "success": true }))
                }
                Err(ImaError::VerificationFailed(reason)) => {
                    Ok(json!({ "success": false, "errorMessage": reason }))
                }
                Err(e) => Err(e),
            };
        }
        let verified = verified?;
        let sign_result = self.signer.sign_messages(&verified).await?;
        Ok(json!({ "signResult": sign_result }))
    }

    async fn handle_bsu256(&self, request: Bsu256Request) -> ImaResult<Value> {
        let sign_result = self
            .signer
            .sign_u256(request.value_to_sign, request.reason.as_deref())
            .await?;
        Ok(json!({ "signResult": sign_result }))
    }

    async fn handle_broadcast_txn(
        &self,
        action: BroadcastAction,
        request: BroadcastTxnRequest,
    ) -> ImaResult<Value> {
        match self.tracker()?.apply_broadcast(action, &request) {
            Ok(applied) => Ok(json!({ "success": applied })),
            Err(e @ (ImaError::BroadcastSignatureInvalid { .. } | ImaError::UnknownNode(_))) => {
                warn!(from_node = request.broadcast_from_node, "{}", e);
                Ok(json!({ "success": false, "errorMessage": e.to_string() }))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_txn_insert(&self, request: TxnRequest) -> ImaResult<Value> {
        let inserted = self
            .tracker()?
            .insert(request.hash, request.timestamp, true)?;
        Ok(json!({ "success": inserted }))
    }

    async fn handle_txn_erase(&self, request: TxnRequest) -> ImaResult<Value> {
        let erased = self.tracker()?.erase(request.hash, true)?;
        Ok(json!({ "success": erased }))
    }

    async fn handle_txn_find(&self, request: TxnRequest) -> ImaResult<Value> {
        let found = self.tracker()?.find(request.hash)?;
        Ok(json!({ "success": found }))
    }

    async fn handle_txn_clear(&self) -> ImaResult<Value> {
        self.tracker()?.clear();
        Ok(json!({ "success": true }))
    }

    async fn handle_txn_list_all(&self) -> ImaResult<Value> {
        let all: Vec<Value> = self
            .tracker()?
            .list_all()
            .iter()
            .map(|entry| entry.to_json())
            .collect();
        Ok(json!({ "success": true, "allTrackedTXNs": all }))
    }
}
