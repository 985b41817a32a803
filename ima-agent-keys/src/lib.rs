// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Broadcast key management for IMA agent nodes.
//!
//! Every node signs its pending-transaction broadcasts with a secp256k1 key.
//! The key file holds the base64 encoded private key.

use anyhow::{anyhow, Result};
use ethers::core::k256::ecdsa::VerifyingKey;
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::types::Address as EthAddress;
use fastcrypto::secp256k1::{Secp256k1KeyPair, Secp256k1PublicKey};
use fastcrypto::traits::ToFromBytes;
use std::path::Path;

pub type BroadcastKeyPair = Secp256k1KeyPair;
pub type BroadcastPublicKey = Secp256k1PublicKey;

/// Ethereum style address of a compressed secp256k1 public key.
pub fn to_eth_address(pubkey: &BroadcastPublicKey) -> Result<EthAddress> {
    let verifying_key = VerifyingKey::from_sec1_bytes(pubkey.as_bytes())
        .map_err(|e| anyhow!("Invalid secp256k1 public key: {}", e))?;
    let affine: &ethers::core::k256::AffinePoint = verifying_key.as_ref();
    let encoded = affine.to_encoded_point(false);
    // skip the 0x04 prefix
    let hash = ethers::utils::keccak256(&encoded.as_bytes()[1..]);
    Ok(EthAddress::from_slice(&hash[12..]))
}

/// Parses a hex (optionally 0x-prefixed) compressed public key.
pub fn public_key_from_hex(s: &str) -> Result<BroadcastPublicKey> {
    let bytes = hex::decode(s.trim().trim_start_matches("0x"))
        .map_err(|e| anyhow!("Invalid public key hex {:?}: {}", s, e))?;
    BroadcastPublicKey::from_bytes(&bytes)
        .map_err(|e| anyhow!("Invalid secp256k1 public key {:?}: {}", s, e))
}

pub mod keygen {
    use super::*;
    use fastcrypto::traits::{EncodeDecodeBase64, KeyPair};

    pub fn generate_broadcast_key() -> BroadcastKeyPair {
        BroadcastKeyPair::generate(&mut rand::thread_rng())
    }

    /// Generates a new broadcast key and writes it to `path`.
    /// Returns the hex encoded compressed public key for the peers' config.
    pub fn generate_broadcast_key_and_write_to_file(path: &Path) -> Result<String> {
        let kp = generate_broadcast_key();
        let public_hex = hex::encode(kp.public().as_bytes());
        tracing::debug!("Generated broadcast key, public key {}", public_hex);

        std::fs::write(path, kp.encode_base64())
            .map_err(|err| anyhow!("Failed to write key to {:?}: {}", path, err))?;
        tracing::debug!("Key written to: {:?}", path);
        Ok(public_hex)
    }
}

pub mod keypair_file {
    use super::*;
    use fastcrypto::secp256k1::Secp256k1PrivateKey;
    use fastcrypto::traits::EncodeDecodeBase64;

    /// Reads a broadcast key. Accepts a base64 key pair, a base64 private key,
    /// or a hex private key.
    pub fn read_key(path: &Path) -> Result<BroadcastKeyPair> {
        if !path.exists() {
            return Err(anyhow!("Key file not found at path: {:?}", path));
        }
        let file_contents = std::fs::read_to_string(path)?;
        let contents = file_contents.trim();

        if let Ok(key) = BroadcastKeyPair::decode_base64(contents) {
            return Ok(key);
        }
        if let Ok(sk) = Secp256k1PrivateKey::decode_base64(contents) {
            return Ok(BroadcastKeyPair::from(sk));
        }
        if let Ok(bytes) = hex::decode(contents.trim_start_matches("0x")) {
            if let Ok(sk) = Secp256k1PrivateKey::from_bytes(&bytes) {
                return Ok(BroadcastKeyPair::from(sk));
            }
        }

        Err(anyhow!(
            "Invalid key file format. Expected a base64 or hex encoded secp256k1 key at {:?}",
            path
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcrypto::traits::KeyPair;

    #[test]
    fn test_generate_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broadcast.key");
        let public_hex = keygen::generate_broadcast_key_and_write_to_file(&path).unwrap();

        let kp = keypair_file::read_key(&path).unwrap();
        assert_eq!(hex::encode(kp.public().as_bytes()), public_hex);
        assert_eq!(&public_key_from_hex(&public_hex).unwrap(), kp.public());
    }

    #[test]
    fn test_read_hex_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hex.key");
        std::fs::write(
            &path,
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318\n",
        )
        .unwrap();
        let kp = keypair_file::read_key(&path).unwrap();
        // well known test vector
        assert_eq!(
            to_eth_address(kp.public()).unwrap(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
                .parse::<EthAddress>()
                .unwrap()
        );
    }

    #[test]
    fn test_read_missing_or_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.key");
        assert!(keypair_file::read_key(&path).is_err());

        std::fs::write(&path, "not a key").unwrap();
        let err = keypair_file::read_key(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid key file format"));
    }

    #[test]
    fn test_public_key_from_bad_hex() {
        assert!(public_key_from_hex("0x1234").is_err());
        assert!(public_key_from_hex("zz").is_err());
    }
}
