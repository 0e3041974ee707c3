//! Secure-channel cryptography: ECDH session-key derivation, AES-CBC
//! encrypt/decrypt, IV-chained MAC, and the PBKDF2-based pairing token
//! derivation. BIP39 mnemonic/seed handling lives in the `bip39` crate
//! and is used directly from the command surface.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use hmac::Hmac;
use k256::{ecdh::diffie_hellman, PublicKey, SecretKey};
use pbkdf2::pbkdf2;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{Error, Result};

type Aes256CbcEnc = Encryptor<aes::Aes256>;
type Aes256CbcDec = Decryptor<aes::Aes256>;

pub const BLOCK_SIZE: usize = 16;

/// Session keys derived for a secure channel. Zeroized on drop since
/// they are the only secret material this crate holds in memory.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SessionKeys {
    pub enc: [u8; 32],
    pub mac: [u8; 32],
}

/// Derive the ECDH shared secret between the host's ephemeral key and
/// the card's static public key, as the x-coordinate of the shared
/// point (matches the Keycard applet's convention).
pub fn generate_ecdh_shared_secret(host_private: &SecretKey, card_public: &PublicKey) -> [u8; 32] {
    let shared = diffie_hellman(host_private.to_nonzero_scalar(), card_public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    out
}

/// Derive the AES encryption/MAC session keys from the ECDH shared
/// secret, the pairing key and the card's 32-byte OPEN SECURE CHANNEL
/// challenge.
pub fn derive_session_keys(
    shared_secret: [u8; 32],
    pairing_key: &[u8; 32],
    card_challenge: &[u8; 32],
) -> SessionKeys {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(pairing_key);
    hasher.update(card_challenge);
    let digest = hasher.finalize();

    let mut enc = [0u8; 32];
    let mut mac = [0u8; 32];
    enc.copy_from_slice(&digest[..32]);

    // The encryption and MAC keys come from two independent hashes so
    // that leaking one does not leak the other.
    let mut mac_hasher = Sha256::new();
    mac_hasher.update(digest);
    mac_hasher.update(b"keycard-mac");
    mac.copy_from_slice(&mac_hasher.finalize()[..32]);

    SessionKeys { enc, mac }
}

/// Pairing-token derivation: PBKDF2-HMAC-SHA256 over the pairing
/// password, matching the Keycard applet's pairing-token scheme.
pub fn generate_pairing_token(pairing_password: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(
        pairing_password.as_bytes(),
        b"Keycard Pairing Password Salt",
        50_000,
        &mut out,
    )
    .expect("pbkdf2 output length is valid");
    out
}

/// Cryptogram used in both directions of the PAIR handshake:
/// SHA-256(shared_secret || challenge).
pub fn calculate_cryptogram(shared_secret: &[u8; 32], challenge: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(challenge);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Compute the next chained IV/MAC for a secure-channel APDU: AES-CBC
/// encrypt a single all-zero-IV block built from (meta || padded data),
/// keeping only the last ciphertext block. This mirrors the
/// IV-becomes-next-MAC chaining the Keycard applet uses.
pub fn calculate_mac(meta: &[u8; 5], data: &[u8], mac_key: &[u8; 32]) -> [u8; 16] {
    let mut buf = Vec::with_capacity(BLOCK_SIZE + data.len() + BLOCK_SIZE);
    buf.extend_from_slice(meta);
    buf.extend_from_slice(&[0u8; BLOCK_SIZE - meta.len()]);
    buf.extend_from_slice(data);
    pad_iso7816(&mut buf);

    let mut mac = [0u8; 16];
    let zero_iv = [0u8; 16];
    let enc = Aes256CbcEnc::new(mac_key.into(), &zero_iv.into());
    let mut blocks = buf.clone();
    encrypt_in_place(enc, &mut blocks);
    mac.copy_from_slice(&blocks[blocks.len() - BLOCK_SIZE..]);
    mac
}

/// Encrypt command data under the session's encryption key and current
/// IV, ISO7816-4 padded to a block boundary.
pub fn encrypt_data(data: &[u8], enc_key: &[u8; 32], iv: &[u8; 16]) -> Vec<u8> {
    let mut buf = data.to_vec();
    pad_iso7816(&mut buf);
    let enc = Aes256CbcEnc::new(enc_key.into(), iv.into());
    encrypt_in_place(enc, &mut buf);
    buf
}

/// Decrypt and un-pad response data under the session's encryption key
/// and current IV.
pub fn decrypt_data(data: &[u8], enc_key: &[u8; 32], iv: &[u8; 16]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(Error::Protocol { sw: 0 });
    }
    let dec = Aes256CbcDec::new(enc_key.into(), iv.into());
    let mut buf = data.to_vec();
    decrypt_in_place(dec, &mut buf);
    unpad_iso7816(&mut buf)?;
    Ok(buf)
}

fn encrypt_in_place(mut enc: Aes256CbcEnc, buf: &mut [u8]) {
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        let block = generic_array_from_mut(chunk);
        enc.encrypt_block_mut(block);
    }
}

fn decrypt_in_place(mut dec: Aes256CbcDec, buf: &mut [u8]) {
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        let block = generic_array_from_mut(chunk);
        dec.decrypt_block_mut(block);
    }
}

fn generic_array_from_mut(chunk: &mut [u8]) -> &mut aes::cipher::generic_array::GenericArray<u8, aes::cipher::consts::U16> {
    aes::cipher::generic_array::GenericArray::from_mut_slice(chunk)
}

fn pad_iso7816(buf: &mut Vec<u8>) {
    buf.push(0x80);
    while buf.len() % BLOCK_SIZE != 0 {
        buf.push(0x00);
    }
}

fn unpad_iso7816(buf: &mut Vec<u8>) -> Result<()> {
    while let Some(&last) = buf.last() {
        if last == 0x00 {
            buf.pop();
            continue;
        }
        if last == 0x80 {
            buf.pop();
            return Ok(());
        }
        return Err(Error::Protocol { sw: 0 });
    }
    Err(Error::Protocol { sw: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        let plaintext = b"OPEN SECURE CHANNEL payload";

        let encrypted = encrypt_data(plaintext, &key, &iv);
        assert_eq!(encrypted.len() % BLOCK_SIZE, 0);

        let decrypted = decrypt_data(&encrypted, &key, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn mac_is_deterministic_and_block_sized() {
        let meta = [0x80, 0x11, 0x00, 0x00, 0x10];
        let mac_key = [9u8; 32];
        let data = vec![0xAAu8; 16];

        let mac1 = calculate_mac(&meta, &data, &mac_key);
        let mac2 = calculate_mac(&meta, &data, &mac_key);
        assert_eq!(mac1, mac2);
        assert_eq!(mac1.len(), 16);
    }

    #[test]
    fn pairing_token_is_deterministic() {
        let t1 = generate_pairing_token("KeycardDefaultPairing");
        let t2 = generate_pairing_token("KeycardDefaultPairing");
        assert_eq!(t1, t2);

        let t3 = generate_pairing_token("SomethingElse");
        assert_ne!(t1, t3);
    }
}
