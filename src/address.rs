//! Ethereum address derivation: Keccak-256 over the public key body
//! plus EIP-55 mixed-case checksum encoding.

use sha3::{Digest, Keccak256};

use crate::error::{Error, Result};

/// Derive the EIP-55 checksummed address from an uncompressed
/// secp256k1 public key (`0x04 || X(32) || Y(32)`, 65 bytes).
pub fn address_from_uncompressed_public_key(public_key: &[u8]) -> Result<String> {
    if public_key.len() != 65 || public_key[0] != 0x04 {
        return Err(Error::Internal(
            "expected a 65-byte uncompressed public key".to_string(),
        ));
    }

    let body = &public_key[1..];
    let mut hasher = Keccak256::new();
    hasher.update(body);
    let digest = hasher.finalize();

    let address_bytes = &digest[12..];
    Ok(to_checksum_address(address_bytes))
}

fn to_checksum_address(address_bytes: &[u8]) -> String {
    let hex_addr = hex::encode(address_bytes);

    let mut hasher = Keccak256::new();
    hasher.update(hex_addr.as_bytes());
    let hash = hasher.finalize();

    let mut checksummed = String::with_capacity(hex_addr.len() + 2);
    checksummed.push_str("0x");

    for (i, c) in hex_addr.chars().enumerate() {
        if c.is_ascii_digit() {
            checksummed.push(c);
            continue;
        }
        let nibble = hash[i / 2];
        let hash_bit = if i % 2 == 0 { nibble >> 4 } else { nibble & 0x0F };
        if hash_bit >= 8 {
            checksummed.push(c.to_ascii_uppercase());
        } else {
            checksummed.push(c);
        }
    }

    checksummed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_public_key() {
        let bad = [0x02u8; 33]; // compressed form, wrong tag for this function
        assert!(address_from_uncompressed_public_key(&bad).is_err());
    }

    #[test]
    fn produces_eip55_mixed_case_address() {
        let mut pubkey = vec![0x04u8];
        pubkey.extend_from_slice(&[0x11u8; 64]);
        let addr = address_from_uncompressed_public_key(&pubkey).unwrap();
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
        // Not all-lowercase or all-uppercase hex digits: checksum casing applied.
        let body = &addr[2..];
        assert!(body.chars().any(|c| c.is_ascii_uppercase()) || body.chars().all(|c| !c.is_alphabetic()));
    }

    #[test]
    fn is_deterministic() {
        let mut pubkey = vec![0x04u8];
        pubkey.extend_from_slice(&[0x42u8; 64]);
        let a1 = address_from_uncompressed_public_key(&pubkey).unwrap();
        let a2 = address_from_uncompressed_public_key(&pubkey).unwrap();
        assert_eq!(a1, a2);
    }
}
