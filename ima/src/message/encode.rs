// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{
    Erc1155BatchTransfer, Erc1155Transfer, Erc20Transfer, Erc721Transfer, ImaMessage, TokenInfo,
    WORD_SIZE,
};
use ethers::types::{Address, U256};

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u256(&mut self, value: U256) {
        let mut word = [0u8; WORD_SIZE];
        value.to_big_endian(&mut word);
        self.buf.extend_from_slice(&word);
    }

    fn usize(&mut self, value: usize) {
        self.u256(U256::from(value));
    }

    fn address(&mut self, address: Address) {
        self.buf.extend_from_slice(&[0u8; 12]);
        self.buf.extend_from_slice(address.as_bytes());
    }

    fn boolean(&mut self, value: bool) {
        self.u256(U256::from(value as u8));
    }

    fn string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        self.usize(bytes.len());
        self.buf.extend_from_slice(bytes);
        let padding = (WORD_SIZE - bytes.len() % WORD_SIZE) % WORD_SIZE;
        self.buf.extend(std::iter::repeat(0u8).take(padding));
    }

    fn array(&mut self, values: &[U256]) {
        self.usize(values.len());
        for value in values {
            self.u256(*value);
        }
    }

    fn erc20(&mut self, t: &Erc20Transfer) {
        self.address(t.token);
        self.address(t.receiver);
        self.u256(t.amount);
    }

    fn erc721(&mut self, t: &Erc721Transfer) {
        self.address(t.token);
        self.address(t.receiver);
        self.u256(t.token_id);
    }

    fn erc1155(&mut self, t: &Erc1155Transfer) {
        self.address(t.token);
        self.address(t.receiver);
        self.u256(t.id);
        self.u256(t.amount);
    }

    fn token_info(&mut self, info: &TokenInfo) {
        self.string(&info.name);
        self.string(&info.symbol);
    }

    // Header words first, then the ids array right after the header and the
    // amounts array right after the ids.
    fn erc1155_batch(&mut self, t: &Erc1155BatchTransfer, header_size: usize) {
        self.address(t.token);
        self.address(t.receiver);
        let ids_offset = header_size;
        let amounts_offset = ids_offset + WORD_SIZE * (1 + t.ids.len());
        self.usize(ids_offset);
        self.usize(amounts_offset);
        self.array(&t.ids);
        self.array(&t.amounts);
    }
}

pub(super) fn encode_message(message: &ImaMessage) -> Vec<u8> {
    let message_type = message.message_type();
    let mut w = Writer::default();
    w.u256(U256::from(message_type.code()));
    match message {
        ImaMessage::TransferEth { receiver, amount } => {
            w.address(*receiver);
            w.u256(*amount);
        }
        ImaMessage::TransferErc20(t) => w.erc20(t),
        ImaMessage::TransferErc20AndTotalSupply {
            transfer,
            total_supply,
        } => {
            w.erc20(transfer);
            w.u256(*total_supply);
        }
        ImaMessage::TransferErc20AndTokenInfo {
            transfer,
            total_supply,
            decimals,
            info,
        } => {
            w.erc20(transfer);
            w.u256(*total_supply);
            w.u256(U256::from(*decimals));
            w.token_info(info);
        }
        ImaMessage::TransferErc721(t) => w.erc721(t),
        ImaMessage::TransferErc721AndTokenInfo { transfer, info } => {
            w.erc721(transfer);
            w.token_info(info);
        }
        ImaMessage::UserStatus { account, is_active } => {
            w.address(*account);
            w.boolean(*is_active);
        }
        ImaMessage::InterchainConnection { is_allowed } => w.boolean(*is_allowed),
        ImaMessage::TransferErc1155(t) => w.erc1155(t),
        ImaMessage::TransferErc1155AndTokenInfo { transfer, uri } => {
            w.erc1155(transfer);
            w.string(uri);
        }
        ImaMessage::TransferErc1155Batch(t) => w.erc1155_batch(t, message_type.header_size()),
        ImaMessage::TransferErc1155BatchAndTokenInfo { transfer, uri } => {
            w.erc1155_batch(transfer, message_type.header_size());
            w.string(uri);
        }
    }
    w.buf
}
