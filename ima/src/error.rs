// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::message::DecodeError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImaError {
    // Missing or mistyped request field, empty required string, zero hash
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    // Malformed binary message inside a batch
    #[error("failed to decode IMA message {message_index}: {source}")]
    Decode {
        message_index: u64,
        #[source]
        source: DecodeError,
    },
    // No matching log or receipt for a message
    #[error("{0}")]
    VerificationFailed(String),
    // The signing oracle answered with an error or an empty result
    #[error("signing oracle error: {0}")]
    OracleError(String),
    // The signing oracle could not be reached
    #[error("signing oracle transport error: {0}")]
    OracleTransport(String),
    #[error("invalid broadcast signature from node {node_id} for {action}:{hash}")]
    BroadcastSignatureInvalid {
        node_id: u64,
        action: String,
        hash: String,
    },
    #[error("unknown node id {0}")]
    UnknownNode(u64),
    #[error("unknown source chain {0:?}")]
    UnknownChain(String),
    #[error("chain rpc error: {0}")]
    ChainRpcError(String),
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ImaError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            ImaError::InvalidRequest(_) => "invalid_request",
            ImaError::Decode { .. } => "decode_error",
            ImaError::VerificationFailed(_) => "verification_failed",
            ImaError::OracleError(_) => "oracle_error",
            ImaError::OracleTransport(_) => "oracle_transport",
            ImaError::BroadcastSignatureInvalid { .. } => "broadcast_signature_invalid",
            ImaError::UnknownNode(_) => "unknown_node",
            ImaError::UnknownChain(_) => "unknown_chain",
            ImaError::ChainRpcError(_) => "chain_rpc_error",
            ImaError::Dispatch(_) => "dispatch_error",
            ImaError::Internal(_) => "internal_error",
        }
    }

    /// Errors caused by the caller's input rather than by this node.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ImaError::InvalidRequest(_) | ImaError::Decode { .. } | ImaError::UnknownChain(_)
        )
    }
}

pub type ImaResult<T> = Result<T, ImaError>;
