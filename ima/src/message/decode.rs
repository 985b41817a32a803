// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{
    Erc1155BatchTransfer, Erc1155Transfer, Erc20Transfer, Erc721Transfer, ImaMessage,
    ImaMessageType, TokenInfo, WORD_SIZE,
};
use ethers::types::{Address, U256};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    Truncated,
    UnknownTypeCode(U256),
    // the 12 high bytes of an address word are not zero
    DirtyAddress,
    BadBool(U256),
    ValueOutOfRange(U256),
    // a batch offset points back into the fixed header
    BadOffset(usize),
    LengthOverflow(U256),
    InvalidUtf8,
    BatchLengthMismatch { ids: usize, amounts: usize },
}

/// Where in the buffer a decode failure happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldLocation {
    pub message_type: Option<ImaMessageType>,
    /// 0 is the type code word, fixed and variable fields follow in layout order.
    pub field_index: usize,
    pub field_name: &'static str,
    pub offset: usize,
    pub field_size: usize,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{}", render(.kind, .location))]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub location: FieldLocation,
}

fn render(kind: &DecodeErrorKind, loc: &FieldLocation) -> String {
    let type_name = loc.message_type.map(|t| t.name()).unwrap_or("<unknown>");
    let at = format!(
        "IMA message {} field {} ({}) at offset {}",
        type_name, loc.field_index, loc.field_name, loc.offset
    );
    match kind {
        DecodeErrorKind::UnknownTypeCode(code) => format!("bad IMA message type code {}", code),
        DecodeErrorKind::Truncated => format!(
            "{} needs {} bytes, reading up to offset {} but message length is {}",
            at,
            loc.field_size,
            loc.offset.saturating_add(loc.field_size),
            loc.total
        ),
        DecodeErrorKind::DirtyAddress => format!("{}: address word has non-zero high bytes", at),
        DecodeErrorKind::BadBool(v) => format!("{}: boolean word holds {}", at, v),
        DecodeErrorKind::ValueOutOfRange(v) => format!("{}: value {} is out of range", at, v),
        DecodeErrorKind::BadOffset(o) => format!(
            "{}: offset {} points inside the fixed header of {} bytes",
            at,
            o,
            loc.message_type.map(|t| t.header_size()).unwrap_or(WORD_SIZE)
        ),
        DecodeErrorKind::LengthOverflow(v) => format!("{}: length {} overflows", at, v),
        DecodeErrorKind::InvalidUtf8 => format!("{}: string is not valid UTF-8", at),
        DecodeErrorKind::BatchLengthMismatch { ids, amounts } => format!(
            "{}: batch has {} ids but {} amounts",
            at, ids, amounts
        ),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    message_type: Option<ImaMessageType>,
    field_index: usize,
    // cursor for sequential reads
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            message_type: None,
            field_index: 0,
            pos: 0,
        }
    }

    fn error(
        &self,
        kind: DecodeErrorKind,
        field_name: &'static str,
        offset: usize,
        field_size: usize,
    ) -> DecodeError {
        DecodeError {
            kind,
            location: FieldLocation {
                message_type: self.message_type,
                field_index: self.field_index,
                field_name,
                offset,
                field_size,
                total: self.buf.len(),
            },
        }
    }

    fn slice(&self, name: &'static str, offset: usize, size: usize) -> Result<&'a [u8], DecodeError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.buf.len() => Ok(&self.buf[offset..end]),
            _ => Err(self.error(DecodeErrorKind::Truncated, name, offset, size)),
        }
    }

    fn word_at(&self, name: &'static str, offset: usize) -> Result<U256, DecodeError> {
        Ok(U256::from_big_endian(self.slice(name, offset, WORD_SIZE)?))
    }

    fn usize_at(&self, name: &'static str, offset: usize) -> Result<usize, DecodeError> {
        let value = self.word_at(name, offset)?;
        if value > U256::from(u32::MAX) {
            return Err(self.error(
                DecodeErrorKind::LengthOverflow(value),
                name,
                offset,
                WORD_SIZE,
            ));
        }
        Ok(value.as_usize())
    }

    // Sequential reads advance the cursor and the field index.

    fn next_u256(&mut self, name: &'static str) -> Result<U256, DecodeError> {
        self.field_index += 1;
        let value = self.word_at(name, self.pos)?;
        self.pos += WORD_SIZE;
        Ok(value)
    }

    fn next_address(&mut self, name: &'static str) -> Result<Address, DecodeError> {
        self.field_index += 1;
        let word = self.slice(name, self.pos, WORD_SIZE)?;
        if word[..12].iter().any(|b| *b != 0) {
            return Err(self.error(DecodeErrorKind::DirtyAddress, name, self.pos, WORD_SIZE));
        }
        let address = Address::from_slice(&word[12..]);
        self.pos += WORD_SIZE;
        Ok(address)
    }

    fn next_bool(&mut self, name: &'static str) -> Result<bool, DecodeError> {
        let offset = self.pos;
        let value = self.next_u256(name)?;
        if value > U256::one() {
            return Err(self.error(DecodeErrorKind::BadBool(value), name, offset, WORD_SIZE));
        }
        Ok(!value.is_zero())
    }

    fn next_u8(&mut self, name: &'static str) -> Result<u8, DecodeError> {
        let offset = self.pos;
        let value = self.next_u256(name)?;
        if value > U256::from(u8::MAX) {
            return Err(self.error(
                DecodeErrorKind::ValueOutOfRange(value),
                name,
                offset,
                WORD_SIZE,
            ));
        }
        Ok(value.low_u32() as u8)
    }

    fn next_offset(&mut self, name: &'static str) -> Result<usize, DecodeError> {
        self.field_index += 1;
        let offset = self.pos;
        let target = self.usize_at(name, offset)?;
        let header_size = self.message_type.map(|t| t.header_size()).unwrap_or(WORD_SIZE);
        if target < header_size {
            return Err(self.error(DecodeErrorKind::BadOffset(target), name, offset, WORD_SIZE));
        }
        self.pos += WORD_SIZE;
        Ok(target)
    }

    /// Length-prefixed, word-padded string. Returns the string and the offset just past it.
    fn string_at(&mut self, name: &'static str, offset: usize) -> Result<(String, usize), DecodeError> {
        self.field_index += 1;
        let len = self.usize_at(name, offset)?;
        let data_offset = offset + WORD_SIZE;
        let padded = padded_len(len);
        self.slice(name, data_offset, padded)?;
        let data = &self.buf[data_offset..data_offset + len];
        let s = std::str::from_utf8(data)
            .map_err(|_| self.error(DecodeErrorKind::InvalidUtf8, name, data_offset, len))?;
        Ok((s.to_string(), data_offset + padded))
    }

    fn next_string(&mut self, name: &'static str) -> Result<String, DecodeError> {
        let (s, end) = self.string_at(name, self.pos)?;
        self.pos = end;
        Ok(s)
    }

    /// Count-prefixed array of words. Returns the values and the offset just past them.
    fn u256_array_at(
        &mut self,
        name: &'static str,
        offset: usize,
    ) -> Result<(Vec<U256>, usize), DecodeError> {
        self.field_index += 1;
        let count = self.usize_at(name, offset)?;
        let data_offset = offset + WORD_SIZE;
        let size = count.checked_mul(WORD_SIZE).ok_or_else(|| {
            self.error(
                DecodeErrorKind::LengthOverflow(U256::from(count)),
                name,
                offset,
                WORD_SIZE,
            )
        })?;
        let data = self.slice(name, data_offset, size)?;
        let values = data.chunks(WORD_SIZE).map(U256::from_big_endian).collect();
        Ok((values, data_offset + size))
    }
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD_SIZE) * WORD_SIZE
}

fn erc20(r: &mut Reader<'_>) -> Result<Erc20Transfer, DecodeError> {
    Ok(Erc20Transfer {
        token: r.next_address("token")?,
        receiver: r.next_address("receiver")?,
        amount: r.next_u256("amount")?,
    })
}

fn erc721(r: &mut Reader<'_>) -> Result<Erc721Transfer, DecodeError> {
    Ok(Erc721Transfer {
        token: r.next_address("token")?,
        receiver: r.next_address("receiver")?,
        token_id: r.next_u256("tokenId")?,
    })
}

fn erc1155(r: &mut Reader<'_>) -> Result<Erc1155Transfer, DecodeError> {
    Ok(Erc1155Transfer {
        token: r.next_address("token")?,
        receiver: r.next_address("receiver")?,
        id: r.next_u256("id")?,
        amount: r.next_u256("amount")?,
    })
}

fn token_info(r: &mut Reader<'_>) -> Result<TokenInfo, DecodeError> {
    Ok(TokenInfo {
        name: r.next_string("name")?,
        symbol: r.next_string("symbol")?,
    })
}

// Returns the batch and the offset just past the amounts array.
fn erc1155_batch(r: &mut Reader<'_>) -> Result<(Erc1155BatchTransfer, usize), DecodeError> {
    let token = r.next_address("token")?;
    let receiver = r.next_address("receiver")?;
    let ids_offset = r.next_offset("idsOffset")?;
    let amounts_offset = r.next_offset("amountsOffset")?;
    let (ids, _) = r.u256_array_at("ids", ids_offset)?;
    let (amounts, amounts_end) = r.u256_array_at("amounts", amounts_offset)?;
    if ids.len() != amounts.len() {
        return Err(r.error(
            DecodeErrorKind::BatchLengthMismatch {
                ids: ids.len(),
                amounts: amounts.len(),
            },
            "amounts",
            amounts_offset,
            WORD_SIZE,
        ));
    }
    Ok((
        Erc1155BatchTransfer {
            token,
            receiver,
            ids,
            amounts,
        },
        amounts_end,
    ))
}

pub(super) fn decode_message(bytes: &[u8]) -> Result<ImaMessage, DecodeError> {
    let mut r = Reader::new(bytes);
    let code = r.word_at("type code", 0)?;
    let message_type = ImaMessageType::from_code(code)
        .ok_or_else(|| r.error(DecodeErrorKind::UnknownTypeCode(code), "type code", 0, WORD_SIZE))?;
    r.message_type = Some(message_type);
    r.pos = WORD_SIZE;

    let message = match message_type {
        ImaMessageType::TransferEth => ImaMessage::TransferEth {
            receiver: r.next_address("receiver")?,
            amount: r.next_u256("amount")?,
        },
        ImaMessageType::TransferErc20 => ImaMessage::TransferErc20(erc20(&mut r)?),
        ImaMessageType::TransferErc20AndTotalSupply => ImaMessage::TransferErc20AndTotalSupply {
            transfer: erc20(&mut r)?,
            total_supply: r.next_u256("totalSupply")?,
        },
        ImaMessageType::TransferErc20AndTokenInfo => {
            let transfer = erc20(&mut r)?;
            let total_supply = r.next_u256("totalSupply")?;
            let decimals = r.next_u8("decimals")?;
            ImaMessage::TransferErc20AndTokenInfo {
                transfer,
                total_supply,
                decimals,
                info: token_info(&mut r)?,
            }
        }
        ImaMessageType::TransferErc721 => ImaMessage::TransferErc721(erc721(&mut r)?),
        ImaMessageType::TransferErc721AndTokenInfo => ImaMessage::TransferErc721AndTokenInfo {
            transfer: erc721(&mut r)?,
            info: token_info(&mut r)?,
        },
        ImaMessageType::UserStatus => ImaMessage::UserStatus {
            account: r.next_address("account")?,
            is_active: r.next_bool("isActive")?,
        },
        ImaMessageType::InterchainConnection => ImaMessage::InterchainConnection {
            is_allowed: r.next_bool("isAllowed")?,
        },
        ImaMessageType::TransferErc1155 => ImaMessage::TransferErc1155(erc1155(&mut r)?),
        ImaMessageType::TransferErc1155AndTokenInfo => ImaMessage::TransferErc1155AndTokenInfo {
            transfer: erc1155(&mut r)?,
            uri: r.next_string("uri")?,
        },
        ImaMessageType::TransferErc1155Batch => {
            ImaMessage::TransferErc1155Batch(erc1155_batch(&mut r)?.0)
        }
        ImaMessageType::TransferErc1155BatchAndTokenInfo => {
            let (transfer, amounts_end) = erc1155_batch(&mut r)?;
            let (uri, _) = r.string_at("uri", amounts_end)?;
            ImaMessage::TransferErc1155BatchAndTokenInfo { transfer, uri }
        }
    };
    Ok(message)
}
