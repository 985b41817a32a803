// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Binary layout of IMA message payloads.
//!
//! Every message starts with a 32-byte big-endian type code followed by
//! 32-byte words. Addresses and integers are right-aligned in their word.
//! Strings are a length word followed by the bytes right-padded to a word
//! boundary. Batch ERC1155 messages carry byte offsets to a count-prefixed
//! array of ids and a count-prefixed array of amounts.

use ethers::types::{Address, U256};

mod decode;
mod encode;

pub use decode::{DecodeError, DecodeErrorKind};

pub const WORD_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImaMessageType {
    TransferEth = 1,
    TransferErc20 = 2,
    TransferErc20AndTotalSupply = 3,
    TransferErc20AndTokenInfo = 4,
    TransferErc721 = 5,
    TransferErc721AndTokenInfo = 6,
    UserStatus = 7,
    InterchainConnection = 8,
    TransferErc1155 = 9,
    TransferErc1155AndTokenInfo = 10,
    TransferErc1155Batch = 11,
    TransferErc1155BatchAndTokenInfo = 12,
}

impl ImaMessageType {
    pub const ALL: [ImaMessageType; 12] = [
        ImaMessageType::TransferEth,
        ImaMessageType::TransferErc20,
        ImaMessageType::TransferErc20AndTotalSupply,
        ImaMessageType::TransferErc20AndTokenInfo,
        ImaMessageType::TransferErc721,
        ImaMessageType::TransferErc721AndTokenInfo,
        ImaMessageType::UserStatus,
        ImaMessageType::InterchainConnection,
        ImaMessageType::TransferErc1155,
        ImaMessageType::TransferErc1155AndTokenInfo,
        ImaMessageType::TransferErc1155Batch,
        ImaMessageType::TransferErc1155BatchAndTokenInfo,
    ];

    pub fn from_code(code: U256) -> Option<Self> {
        if code > U256::from(u8::MAX) {
            return None;
        }
        let code = code.low_u64();
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn name(self) -> &'static str {
        match self {
            ImaMessageType::TransferEth => "TRANSFER_ETH",
            ImaMessageType::TransferErc20 => "TRANSFER_ERC20",
            ImaMessageType::TransferErc20AndTotalSupply => "TRANSFER_ERC20_AND_TOTAL_SUPPLY",
            ImaMessageType::TransferErc20AndTokenInfo => "TRANSFER_ERC20_AND_TOKEN_INFO",
            ImaMessageType::TransferErc721 => "TRANSFER_ERC721",
            ImaMessageType::TransferErc721AndTokenInfo => "TRANSFER_ERC721_AND_TOKEN_INFO",
            ImaMessageType::UserStatus => "USER_STATUS",
            ImaMessageType::InterchainConnection => "INTERCHAIN_CONNECTION",
            ImaMessageType::TransferErc1155 => "TRANSFER_ERC1155",
            ImaMessageType::TransferErc1155AndTokenInfo => "TRANSFER_ERC1155_AND_TOKEN_INFO",
            ImaMessageType::TransferErc1155Batch => "TRANSFER_ERC1155_BATCH",
            ImaMessageType::TransferErc1155BatchAndTokenInfo => {
                "TRANSFER_ERC1155_BATCH_AND_TOKEN_INFO"
            }
        }
    }

    /// Number of fixed 32-byte fields after the type code word.
    pub fn fixed_field_count(self) -> usize {
        match self {
            ImaMessageType::InterchainConnection => 1,
            ImaMessageType::TransferEth | ImaMessageType::UserStatus => 2,
            ImaMessageType::TransferErc20
            | ImaMessageType::TransferErc721
            | ImaMessageType::TransferErc721AndTokenInfo => 3,
            ImaMessageType::TransferErc20AndTotalSupply
            | ImaMessageType::TransferErc1155
            | ImaMessageType::TransferErc1155AndTokenInfo
            | ImaMessageType::TransferErc1155Batch
            | ImaMessageType::TransferErc1155BatchAndTokenInfo => 4,
            ImaMessageType::TransferErc20AndTokenInfo => 5,
        }
    }

    /// Byte size of the type code word plus the fixed fields.
    pub fn header_size(self) -> usize {
        WORD_SIZE * (1 + self.fixed_field_count())
    }
}

impl std::fmt::Display for ImaMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Erc20Transfer {
    pub token: Address,
    pub receiver: Address,
    pub amount: U256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Erc721Transfer {
    pub token: Address,
    pub receiver: Address,
    pub token_id: U256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Erc1155Transfer {
    pub token: Address,
    pub receiver: Address,
    pub id: U256,
    pub amount: U256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Erc1155BatchTransfer {
    pub token: Address,
    pub receiver: Address,
    pub ids: Vec<U256>,
    pub amounts: Vec<U256>,
}

/// Token metadata carried by the `*_AND_TOKEN_INFO` ERC20/ERC721 variants.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TokenInfo {
    pub name: String,
    pub symbol: String,
}

/// A decoded IMA message payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImaMessage {
    TransferEth {
        receiver: Address,
        amount: U256,
    },
    TransferErc20(Erc20Transfer),
    TransferErc20AndTotalSupply {
        transfer: Erc20Transfer,
        total_supply: U256,
    },
    TransferErc20AndTokenInfo {
        transfer: Erc20Transfer,
        total_supply: U256,
        decimals: u8,
        info: TokenInfo,
    },
    TransferErc721(Erc721Transfer),
    TransferErc721AndTokenInfo {
        transfer: Erc721Transfer,
        info: TokenInfo,
    },
    /// Freezes (`is_active == false`) or unfreezes a user on the target chain.
    UserStatus {
        account: Address,
        is_active: bool,
    },
    InterchainConnection {
        is_allowed: bool,
    },
    TransferErc1155(Erc1155Transfer),
    TransferErc1155AndTokenInfo {
        transfer: Erc1155Transfer,
        uri: String,
    },
    TransferErc1155Batch(Erc1155BatchTransfer),
    TransferErc1155BatchAndTokenInfo {
        transfer: Erc1155BatchTransfer,
        uri: String,
    },
}

impl ImaMessage {
    pub fn message_type(&self) -> ImaMessageType {
        match self {
            ImaMessage::TransferEth { .. } => ImaMessageType::TransferEth,
            ImaMessage::TransferErc20(_) => ImaMessageType::TransferErc20,
            ImaMessage::TransferErc20AndTotalSupply { .. } => {
                ImaMessageType::TransferErc20AndTotalSupply
            }
            ImaMessage::TransferErc20AndTokenInfo { .. } => {
                ImaMessageType::TransferErc20AndTokenInfo
            }
            ImaMessage::TransferErc721(_) => ImaMessageType::TransferErc721,
            ImaMessage::TransferErc721AndTokenInfo { .. } => {
                ImaMessageType::TransferErc721AndTokenInfo
            }
            ImaMessage::UserStatus { .. } => ImaMessageType::UserStatus,
            ImaMessage::InterchainConnection { .. } => ImaMessageType::InterchainConnection,
            ImaMessage::TransferErc1155(_) => ImaMessageType::TransferErc1155,
            ImaMessage::TransferErc1155AndTokenInfo { .. } => {
                ImaMessageType::TransferErc1155AndTokenInfo
            }
            ImaMessage::TransferErc1155Batch(_) => ImaMessageType::TransferErc1155Batch,
            ImaMessage::TransferErc1155BatchAndTokenInfo { .. } => {
                ImaMessageType::TransferErc1155BatchAndTokenInfo
            }
        }
    }

    /// Decodes one message payload, checking every field against the buffer bounds.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode::decode_message(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode::encode_message(self)
    }
}
