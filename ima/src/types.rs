// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ImaError, ImaResult};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Which way a message travels, and therefore which chain proves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Main net to side-chain
    M2S,
    /// Side-chain to main net
    S2M,
    /// Side-chain to side-chain
    S2S,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::M2S => "M2S",
            Direction::S2M => "S2M",
            Direction::S2S => "S2S",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ImaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M2S" => Ok(Direction::M2S),
            "S2M" => Ok(Direction::S2M),
            "S2S" => Ok(Direction::S2S),
            other => Err(ImaError::InvalidRequest(format!(
                "unknown direction {:?}, expected M2S, S2M or S2S",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Direction::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Parses a 256-bit value given as 0x-prefixed hex, decimal string or JSON number.
pub fn parse_u256(value: &serde_json::Value) -> ImaResult<U256> {
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) if !hex.is_empty() => U256::from_str_radix(hex, 16).ok(),
                Some(_) => None,
                None => U256::from_dec_str(s).ok(),
            };
            parsed.ok_or_else(|| ImaError::InvalidRequest(format!("invalid 256-bit value {:?}", s)))
        }
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| ImaError::InvalidRequest(format!("invalid 256-bit value {}", n))),
        other => Err(ImaError::InvalidRequest(format!(
            "expected a hex or decimal value, got {}",
            other
        ))),
    }
}

fn deserialize_flexible_u256<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    parse_u256(&value).map_err(serde::de::Error::custom)
}

fn deserialize_non_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let s = String::deserialize(deserializer)?;
    if s.trim().is_empty() {
        return Err(serde::de::Error::custom("required string is empty"));
    }
    Ok(s)
}

/// Canonical text form of a transaction hash used in broadcasts and listings.
pub fn format_txn_hash(hash: &U256) -> String {
    format!("0x{:064x}", hash)
}

/// One element of the `messages` array of a verify-and-sign call.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImaMessageInput {
    pub sender: Address,
    pub destination_contract: Address,
    pub data: Bytes,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyAndSignRequest {
    pub direction: Direction,
    #[serde(deserialize_with = "deserialize_non_empty")]
    pub src_chain_name: String,
    #[serde(deserialize_with = "deserialize_non_empty")]
    pub dst_chain_name: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub start_message_idx: u64,
    #[serde(rename = "srcChainID", deserialize_with = "deserialize_non_empty")]
    pub src_chain_id: String,
    #[serde(rename = "dstChainID", deserialize_with = "deserialize_non_empty")]
    pub dst_chain_id: String,
    pub messages: Vec<ImaMessageInput>,
    #[serde(default)]
    pub only_verify: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bsu256Request {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(deserialize_with = "deserialize_flexible_u256")]
    pub value_to_sign: U256,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxnRequest {
    #[serde(deserialize_with = "deserialize_flexible_u256")]
    pub hash: U256,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastTxnRequest {
    #[serde(deserialize_with = "deserialize_flexible_u256")]
    pub hash: U256,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub timestamp: u64,
    pub broadcast_signature: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub broadcast_from_node: u64,
}
