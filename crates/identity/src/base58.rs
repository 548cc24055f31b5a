use sha2::{Digest, Sha256};
use thiserror::Error;

const CHECKSUM_LEN: usize = 4;

/// Errors produced while decoding Base58Check strings.
#[derive(Debug, Error)]
pub enum Base58Error {
    /// Input contained a character outside the Base58 alphabet.
    #[error("invalid base58 character: {0}")]
    Alphabet(#[from] bs58::decode::Error),
    /// Decoded payload was shorter than version byte + checksum.
    #[error("base58check payload too short: {0} bytes")]
    TooShort(usize),
    /// Trailing checksum did not match the payload digest.
    #[error("base58check checksum mismatch")]
    Checksum,
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(body);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

/// Encodes `payload` as Base58Check with the given version byte.
#[must_use]
pub fn encode_check(version: u8, payload: &[u8]) -> String {
    let mut body = Vec::with_capacity(1 + payload.len() + CHECKSUM_LEN);
    body.push(version);
    body.extend_from_slice(payload);
    let digest = checksum(&body);
    body.extend_from_slice(&digest);
    bs58::encode(body).into_string()
}

/// Decodes a Base58Check string, returning the version byte and payload.
pub fn decode_check(input: &str) -> Result<(u8, Vec<u8>), Base58Error> {
    let body = bs58::decode(input).into_vec()?;
    if body.len() < 1 + CHECKSUM_LEN {
        return Err(Base58Error::TooShort(body.len()));
    }

    let (data, tail) = body.split_at(body.len() - CHECKSUM_LEN);
    if checksum(data) != tail {
        return Err(Base58Error::Checksum);
    }
    Ok((data[0], data[1..].to_vec()))
}
