// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Account keys and curve25519 transaction signatures.
//!
//! Accounts hold an X25519 key. Signatures are Ed25519 signatures made with the same scalar,
//! with the sign bit of the Edwards public key carried in the top bit of the signature so a
//! verifier can recover the Edwards point from the Montgomery public key.

use std::fmt;

use alloy_primitives::keccak256;
use blake2::{digest::consts::U32, Blake2b, Digest};
use curve25519_dalek::{edwards::EdwardsPoint, scalar::Scalar};
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

const ADDRESS_VERSION: u8 = 1;
const KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Private key is not valid base58")]
    Encoding,

    #[error("Private key must be {KEY_LENGTH} bytes, got {0}")]
    Length(usize),
}

pub fn blake2b256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2b256::digest(data));
    out
}

/// Keccak-256 of Blake2b-256, as used for addresses.
fn secure_hash(data: &[u8]) -> [u8; 32] {
    keccak256(blake2b256(data)).0
}

fn sha512(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Signing key of the payout account.
#[derive(Clone)]
pub struct PrivateKey {
    bytes: [u8; KEY_LENGTH],
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey").field("public_key", &self.public_key()).finish()
    }
}

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        let mut bytes = bytes;
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self { bytes }
    }

    pub fn from_base58(encoded: &str) -> Result<Self, KeyError> {
        let decoded = bs58::decode(encoded.trim()).into_vec().map_err(|_| KeyError::Encoding)?;
        let bytes: [u8; KEY_LENGTH] =
            decoded.as_slice().try_into().map_err(|_| KeyError::Length(decoded.len()))?;
        Ok(Self::from_bytes(bytes))
    }

    fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.bytes)
    }

    fn edwards_public(&self) -> EdwardsPoint {
        EdwardsPoint::mul_base(&self.scalar())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.edwards_public().to_montgomery().to_bytes())
    }

    /// Signs `message` with fresh randomness.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        let mut random = [0u8; 64];
        rand::rng().fill_bytes(&mut random);
        self.sign_with_random(message, &random)
    }

    fn sign_with_random(&self, message: &[u8], random: &[u8; 64]) -> [u8; SIGNATURE_LENGTH] {
        let public = self.edwards_public().compress().to_bytes();
        let mut prefix = [0xffu8; 32];
        prefix[0] = 0xfe;

        let nonce =
            Scalar::from_bytes_mod_order_wide(&sha512(&[&prefix, &self.bytes, message, random]));
        let r = EdwardsPoint::mul_base(&nonce).compress().to_bytes();
        let challenge = Scalar::from_bytes_mod_order_wide(&sha512(&[&r, &public, message]));
        let s = nonce + challenge * self.scalar();

        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature[..32].copy_from_slice(&r);
        signature[32..].copy_from_slice(s.as_bytes());
        signature[63] |= public[31] & 0x80;
        signature
    }
}

/// Montgomery-form public key of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; KEY_LENGTH]);

impl PublicKey {
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Address of this key on the chain `chain_id`.
    pub fn address(&self, chain_id: u8) -> String {
        let mut bytes = Vec::with_capacity(26);
        bytes.push(ADDRESS_VERSION);
        bytes.push(chain_id);
        bytes.extend_from_slice(&secure_hash(&self.0)[..20]);
        let checksum = secure_hash(&bytes);
        bytes.extend_from_slice(&checksum[..4]);
        bs58::encode(bytes).into_string()
    }
}
