//! Authorization-gated command surface: one request/response struct per
//! operation (§4.E), replacing the original flow engine's dynamically
//! typed parameter maps with explicit fields validated up front via
//! `validator`, grounded in the `session.validate` package referenced by
//! the original driver.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::address;
use crate::commands;
use crate::crypto;
use crate::error::{Error, Result};
use crate::error_classifier;
use crate::session::Engine;
use crate::types::{
    Metadata, State, ENCRYPTION_PATH, EIP1581_PATH, KeyPair, MASTER_PATH, WALLET_PATH,
    WALLET_ROOT_PATH, WHISPER_PATH,
};

/// Thin facade over `Engine` exposing one method per operation in §4.E.
/// Every method validates its request, checks the authorization gate
/// against the engine's current state, and dispatches APDUs.
pub struct CommandSurface {
    engine: Arc<Engine>,
}

impl CommandSurface {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn initialize(&self, req: InitializeRequest) -> Result<()> {
        req.validate().map_err(validation_error)?;
        self.require_connected()?;

        self.engine.send_secure(&commands::initialize(
            &req.pin,
            &req.puk,
            &req.pairing_password,
        ))?;

        self.engine.force_rescan();
        Ok(())
    }

    pub fn verify_pin(&self, req: VerifyPinRequest) -> Result<()> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::Ready, State::Authorized])?;

        match self.engine.send_secure(&commands::verify_pin(&req.pin)) {
            Ok(_) => {
                self.engine.set_state_after_operation(State::Authorized);
                self.engine.refresh_status_and_resolve_state().ok();
                Ok(())
            }
            Err(err) => Err(self.handle_wrong_credential(err)?),
        }
    }

    pub fn change_pin(&self, req: ChangePinRequest) -> Result<()> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::Authorized])?;

        self.engine.send_secure(&commands::change_pin(&req.new_pin))?;
        self.engine.refresh_status_and_resolve_state()?;
        Ok(())
    }

    pub fn change_puk(&self, req: ChangePukRequest) -> Result<()> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::Authorized])?;

        self.engine.send_secure(&commands::change_puk(&req.new_puk))?;
        self.engine.refresh_status_and_resolve_state()?;
        Ok(())
    }

    pub fn unblock_pin(&self, req: UnblockPinRequest) -> Result<()> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::BlockedPIN])?;

        match self
            .engine
            .send_secure(&commands::unblock_pin(&req.puk, &req.new_pin))
        {
            Ok(_) => {
                self.engine.set_state_after_operation(State::Authorized);
                self.engine.refresh_status_and_resolve_state().ok();
                Ok(())
            }
            Err(err) => Err(self.handle_wrong_credential(err)?),
        }
    }

    pub fn change_pairing(&self, req: ChangePairingRequest) -> Result<()> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::Authorized])?;

        let new_token = crypto::generate_pairing_token(&req.new_pairing_password);
        self.engine
            .send_secure(&commands::change_pairing_secret(&new_token))?;

        // The locally stored pairing key is now stale; evicting it
        // forces a re-pair with the new password on the next connect.
        if let Ok(instance_uid_hex) = self.engine.instance_uid_hex() {
            self.engine.evict_pairing(&instance_uid_hex)?;
        }
        self.engine.set_state_after_operation(State::Ready);
        Ok(())
    }

    pub fn generate_mnemonic(&self, req: GenerateMnemonicRequest) -> Result<Vec<u16>> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::Ready, State::Authorized])?;

        let checksum_words = req.length_words / 3;
        let response = self
            .engine
            .send_secure(&commands::generate_mnemonic(checksum_words))?;

        if response.len() % 2 != 0 {
            return Err(Error::Internal(
                "malformed mnemonic index response".to_string(),
            ));
        }
        Ok(response
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    pub fn load_mnemonic(&self, req: LoadMnemonicRequest) -> Result<()> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::Authorized])?;

        let mnemonic = bip39::Mnemonic::parse_in(bip39::Language::English, &req.mnemonic)
            .map_err(|e| Error::Validation(format!("invalid mnemonic: {e}")))?;
        let seed = mnemonic.to_seed(&req.passphrase);
        self.engine.send_secure(&commands::load_seed(&seed))?;

        self.engine.set_state_after_operation(State::Ready);
        self.engine.refresh_status_and_resolve_state().ok();
        Ok(())
    }

    pub fn factory_reset(&self) -> Result<()> {
        self.require_connected()?;
        self.engine.set_state_after_operation(State::FactoryResetting);

        let capabilities = self
            .engine
            .current_app_info()
            .map(|info| info.capabilities)
            .unwrap_or(0);
        let supports_native = capabilities & crate::types::Capabilities::FACTORY_RESET.bits() != 0;

        if supports_native {
            self.engine.send_secure(&commands::factory_reset())?;
        } else {
            self.factory_reset_via_global_platform()?;
        }

        self.engine.force_rescan();
        Ok(())
    }

    fn factory_reset_via_global_platform(&self) -> Result<()> {
        self.engine.send_secure(&commands::select_isd())?;

        let first_attempt = self.engine.send_secure(&commands::gp_delete_keycard_app());
        if first_attempt.is_err() {
            // One retry: some cards need the ISD re-selected between a
            // failed delete and a retry.
            self.engine.send_secure(&commands::select_isd())?;
            self.engine.send_secure(&commands::gp_delete_keycard_app())?;
        }

        self.engine.send_secure(&commands::gp_install_keycard_app())?;
        Ok(())
    }

    pub fn get_metadata(&self) -> Result<Metadata> {
        self.require_connected()?;
        self.engine.current_metadata()
    }

    pub fn store_metadata(&self, req: StoreMetadataRequest) -> Result<Metadata> {
        req.validate().map_err(validation_error)?;
        self.require_state_in(&[State::Authorized])?;

        let mut wallet_indices = Vec::with_capacity(req.wallet_paths.len());
        for path in &req.wallet_paths {
            wallet_indices.push(parse_wallet_index(path)?);
        }

        let metadata = Metadata {
            name: req.name,
            wallet_indices,
        };
        self.engine.store_metadata(&metadata)?;
        Ok(metadata)
    }

    pub fn export_login_keys(&self) -> Result<(KeyPair, KeyPair)> {
        self.require_state_in(&[State::Authorized])?;
        self.require_key_loaded()?;

        let whisper = self.export_path(WHISPER_PATH, true)?;
        let encryption = self.export_path(ENCRYPTION_PATH, true)?;
        Ok((whisper, encryption))
    }

    pub fn export_recover_keys(&self) -> Result<RecoverKeys> {
        self.require_state_in(&[State::Authorized])?;
        self.require_key_loaded()?;

        let (whisper, encryption) = self.export_login_keys()?;
        let eip1581 = self.export_path(EIP1581_PATH, false)?;

        let extended_wallet_root = self
            .engine
            .current_app_info()
            .and_then(|info| info.version)
            .map(|v| v.supports_extended_public_export())
            .unwrap_or(false);
        let wallet_root = self.export_path(WALLET_ROOT_PATH, extended_wallet_root)?;

        let wallet = self.export_path(WALLET_PATH, false)?;
        let master = self.export_path(MASTER_PATH, false)?;

        Ok(RecoverKeys {
            whisper,
            encryption,
            eip1581,
            wallet_root,
            wallet,
            master,
        })
    }

    fn export_path(&self, path: &str, with_private: bool) -> Result<KeyPair> {
        let components = parse_full_path(path)?;
        let encoded = commands::encode_derivation_path(&components);

        self.engine.send_secure(&commands::derive_key(&encoded))?;

        let p2 = if with_private {
            commands::P2_EXPORT_CURRENT_PRIVATE
        } else {
            commands::P2_EXPORT_CURRENT_PUBLIC
        };
        let response = self
            .engine
            .send_secure(&commands::export_key(p2, &encoded))?;

        parse_exported_key(&response)
    }

    fn handle_wrong_credential(&self, err: Error) -> Result<Error> {
        if let Error::Protocol { sw } = err {
            if let Some(remaining) = error_classifier::remaining_attempts_from_status_word(sw) {
                self.engine.refresh_status_and_resolve_state().ok();
                return Ok(Error::WrongCredential { remaining });
            }
        }
        Ok(err)
    }

    fn require_connected(&self) -> Result<()> {
        match self.engine.current_state() {
            State::Unknown
            | State::NoPCSC
            | State::WaitingForReader
            | State::WaitingForCard
            | State::NotKeycard
            | State::ConnectionError => Err(Error::NotConnected),
            _ => Ok(()),
        }
    }

    /// Check the state gate, returning `on_mismatch` verbatim when the
    /// current state is not in `allowed` (§4.D "Authorization gate").
    fn require_state_in(&self, allowed: &[State]) -> Result<()> {
        self.require_connected()?;
        let current = self.engine.current_state();
        if current == State::EmptyKeycard && !allowed.contains(&State::EmptyKeycard) {
            return Err(Error::NotInitialized);
        }
        if allowed.contains(&current) {
            return Ok(());
        }
        Err(self.mismatch_error(allowed, current))
    }

    fn mismatch_error(&self, allowed: &[State], current: State) -> Error {
        if allowed.len() == 1 && allowed[0] == State::BlockedPIN {
            return Error::NotBlocked;
        }
        if current == State::BlockedPIN || current == State::BlockedPUK {
            return Error::NotAuthorized;
        }
        if allowed.contains(&State::Authorized) && current == State::Ready {
            return Error::NotAuthorized;
        }
        Error::NotReady
    }

    fn require_key_loaded(&self) -> Result<()> {
        match self.engine.current_app_info() {
            Some(info) if info.has_key() => Ok(()),
            _ => Err(Error::NotReady),
        }
    }
}

fn parse_wallet_index(path: &str) -> Result<u32> {
    let suffix = path
        .strip_prefix(WALLET_ROOT_PATH)
        .and_then(|s| s.strip_prefix('/'))
        .ok_or_else(|| {
            Error::Validation(format!("wallet path must start with {WALLET_ROOT_PATH}"))
        })?;
    suffix
        .parse::<u32>()
        .map_err(|_| Error::Validation(format!("malformed wallet index in path {path}")))
}

fn parse_full_path(path: &str) -> Result<Vec<u32>> {
    if path == MASTER_PATH {
        return Ok(vec![]);
    }
    let mut components = Vec::new();
    for segment in path.trim_start_matches("m/").split('/') {
        let hardened = segment.ends_with('\'');
        let raw = segment.trim_end_matches('\'');
        let value: u32 = raw
            .parse()
            .map_err(|_| Error::Internal(format!("malformed derivation path component: {segment}")))?;
        components.push(if hardened { value | 0x8000_0000 } else { value });
    }
    Ok(components)
}

/// Parse an EXPORT KEY response: `[pubLen][pubkey][hasPriv][priv(32)?]
/// [hasChainCode][chainCode(32)?]`, the convention this crate's
/// command/crypto layer uses since it does not target a specific
/// applet build's exact encoding (§1).
fn parse_exported_key(response: &[u8]) -> Result<KeyPair> {
    if response.is_empty() {
        return Ok(KeyPair::default());
    }
    let mut offset = 0usize;
    let pub_len = *response.get(offset).ok_or(Error::Protocol { sw: 0 })? as usize;
    offset += 1;
    let public_key = response
        .get(offset..offset + pub_len)
        .ok_or(Error::Protocol { sw: 0 })?
        .to_vec();
    offset += pub_len;

    let has_priv = response.get(offset).copied().unwrap_or(0) != 0;
    offset += 1;
    let private_key = if has_priv {
        let bytes = response
            .get(offset..offset + 32)
            .ok_or(Error::Protocol { sw: 0 })?
            .to_vec();
        offset += 32;
        Some(bytes)
    } else {
        None
    };

    let has_chain_code = response.get(offset).copied().unwrap_or(0) != 0;
    offset += 1;
    let chain_code = if has_chain_code {
        response.get(offset..offset + 32).map(|s| s.to_vec())
    } else {
        None
    };

    let address = if public_key.len() == 65 {
        address::address_from_uncompressed_public_key(&public_key).ok()
    } else {
        None
    };

    Ok(KeyPair {
        address,
        public_key,
        private_key,
        chain_code,
    })
}

fn validation_error(errors: validator::ValidationErrors) -> Error {
    Error::Validation(errors.to_string())
}

fn validate_mnemonic_word_count(mnemonic: &str) -> std::result::Result<(), ValidationError> {
    let word_count = mnemonic.split_whitespace().count();
    if matches!(word_count, 12 | 15 | 18 | 21 | 24) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_mnemonic_word_count"))
    }
}

fn validate_mnemonic_length_words(length_words: &u8) -> std::result::Result<(), ValidationError> {
    if matches!(length_words, 12 | 15 | 18 | 21 | 24) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_mnemonic_word_count"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InitializeRequest {
    #[validate(length(equal = 6))]
    pub pin: String,
    #[validate(length(equal = 12))]
    pub puk: String,
    #[validate(length(min = 1))]
    pub pairing_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VerifyPinRequest {
    #[validate(length(equal = 6))]
    pub pin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChangePinRequest {
    #[validate(length(equal = 6))]
    pub new_pin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChangePukRequest {
    #[validate(length(equal = 12))]
    pub new_puk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UnblockPinRequest {
    #[validate(length(equal = 12))]
    pub puk: String,
    #[validate(length(equal = 6))]
    pub new_pin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChangePairingRequest {
    #[validate(length(min = 1))]
    pub new_pairing_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GenerateMnemonicRequest {
    #[validate(custom(function = "validate_mnemonic_length_words"))]
    pub length_words: u8,
}

impl Default for GenerateMnemonicRequest {
    fn default() -> Self {
        Self {
            length_words: crate::types::DEFAULT_MNEMONIC_WORDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoadMnemonicRequest {
    #[validate(custom(function = "validate_mnemonic_word_count"))]
    pub mnemonic: String,
    pub passphrase: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct StoreMetadataRequest {
    pub name: String,
    pub wallet_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverKeys {
    pub whisper: KeyPair,
    pub encryption: KeyPair,
    pub eip1581: KeyPair,
    pub wallet_root: KeyPair,
    pub wallet: KeyPair,
    pub master: KeyPair,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_request_rejects_short_pin() {
        let req = InitializeRequest {
            pin: "123".to_string(),
            puk: "123456123456".to_string(),
            pairing_password: "x".to_string(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn load_mnemonic_request_accepts_12_words_rejects_11() {
        let ok = LoadMnemonicRequest {
            mnemonic: "receive fan copper bracket end train again sustain wet siren throw cigar"
                .to_string(),
            passphrase: String::new(),
        };
        assert!(ok.validate().is_ok());

        let bad = LoadMnemonicRequest {
            mnemonic: "one two three four five six seven eight nine ten eleven".to_string(),
            passphrase: String::new(),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn generate_mnemonic_request_rejects_non_bip39_word_counts() {
        assert!(GenerateMnemonicRequest { length_words: 12 }.validate().is_ok());
        assert!(GenerateMnemonicRequest { length_words: 24 }.validate().is_ok());
        assert!(GenerateMnemonicRequest { length_words: 13 }.validate().is_err());
        assert!(GenerateMnemonicRequest { length_words: 20 }.validate().is_err());
    }

    #[test]
    fn parse_wallet_index_extracts_last_component() {
        assert_eq!(parse_wallet_index("m/44'/60'/0'/0/3").unwrap(), 3);
        assert!(parse_wallet_index("m/43'/60'/1581'/0'/0").is_err());
    }

    #[test]
    fn parse_full_path_encodes_hardened_components() {
        let components = parse_full_path(WALLET_ROOT_PATH).unwrap();
        assert_eq!(components, vec![0x8000002C, 0x8000003C, 0x80000000, 0]);
    }

    #[test]
    fn parse_exported_key_handles_public_only_response() {
        let mut response = vec![65u8];
        response.push(0x04);
        response.extend_from_slice(&[0x11u8; 64]);
        response.push(0); // no private key
        response.push(0); // no chain code

        let key = parse_exported_key(&response).unwrap();
        assert!(key.private_key.is_none());
        assert!(key.address.is_some());
    }
}
