use serde::{Deserialize, Serialize};

/// Wallet-path prefix every stored wallet index is relative to.
pub const WALLET_ROOT_PATH: &str = "m/44'/60'/0'/0";
pub const MASTER_PATH: &str = "m";
pub const WALLET_PATH: &str = "m/44'/60'/0'/0/0";
pub const EIP1581_PATH: &str = "m/43'/60'/1581'";
pub const WHISPER_PATH: &str = "m/43'/60'/1581'/0'/0";
pub const ENCRYPTION_PATH: &str = "m/43'/60'/1581'/1'/0";

pub const DEFAULT_PAIRING_PASSWORD: &str = "KeycardDefaultPairing";
pub const MAX_PIN_RETRIES: u8 = 3;
pub const MAX_PUK_RETRIES: u8 = 5;
pub const MAX_PAIRING_SLOTS: u8 = 5;
pub const DEFAULT_MNEMONIC_WORDS: u8 = 12;
pub const DEFAULT_PIN_LEN: usize = 6;
pub const DEFAULT_PUK_LEN: usize = 12;

bitflags::bitflags! {
    /// Capability bits reported by SELECT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        const SECURE_CHANNEL          = 0b0000_0001;
        const KEY_MANAGEMENT          = 0b0000_0010;
        const CREDENTIALS_MANAGEMENT  = 0b0000_0100;
        const NDEF                    = 0b0000_1000;
        const FACTORY_RESET           = 0b0001_0000;
    }
}

/// Parsed 2-byte applet version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub fn from_raw(raw: [u8; 2]) -> Self {
        Self {
            major: raw[0],
            minor: raw[1],
        }
    }

    /// Best-effort approximation of the applet's "extended public key
    /// export supported" gate: `>= 3.1`. The raw version field cannot
    /// distinguish build-specific deltas within a minor release.
    pub fn supports_extended_public_export(&self) -> bool {
        (self.major, self.minor) >= (3, 1)
    }
}

/// Information returned by SELECT.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub installed: bool,
    pub initialized: bool,
    pub instance_uid: Vec<u8>,
    pub key_uid: Vec<u8>,
    /// The card's static secp256k1 public key, used as the other half
    /// of the OPEN SECURE CHANNEL ECDH exchange.
    pub card_public_key: Vec<u8>,
    pub version: Option<Version>,
    pub available_pairing_slots: u8,
    pub capabilities: u8,
}

impl ApplicationInfo {
    pub fn has_key(&self) -> bool {
        !self.key_uid.is_empty()
    }

    pub fn instance_uid_hex(&self) -> String {
        hex::encode(&self.instance_uid)
    }
}

/// Information returned by GET STATUS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub pin_retries: u8,
    pub puk_retries: u8,
    pub key_initialized: bool,
    pub current_derivation_path: Option<String>,
}

/// A pairing handshake's non-secret-enough-to-persist result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRecord {
    pub index: u8,
    #[serde(with = "hex_key")]
    pub key: [u8; 32],
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("pairing key must be 32 bytes"))
    }
}

/// Public metadata blob stored on-card.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    /// Last BIP-32 index of each wallet path, relative to `WALLET_ROOT_PATH`.
    pub wallet_indices: Vec<u32>,
}

impl Metadata {
    pub fn wallet_paths(&self) -> Vec<String> {
        self.wallet_indices
            .iter()
            .map(|i| format!("{WALLET_ROOT_PATH}/{i}"))
            .collect()
    }
}

/// A derived or exported key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyPair {
    pub address: Option<String>,
    pub public_key: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_code: Option<Vec<u8>>,
}

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Unknown,
    NoPCSC,
    InternalError,
    WaitingForReader,
    WaitingForCard,
    ConnectingCard,
    ConnectionError,
    NotKeycard,
    EmptyKeycard,
    NoAvailablePairingSlots,
    PairingError,
    BlockedPIN,
    BlockedPUK,
    Ready,
    Authorized,
    FactoryResetting,
}

impl Default for State {
    fn default() -> Self {
        State::Unknown
    }
}

/// The single observable record published to subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub state: State,
    pub app_info: Option<ApplicationInfo>,
    pub app_status: Option<ApplicationStatus>,
    pub metadata: Option<Metadata>,
}

// PartialEq for ApplicationInfo/ApplicationStatus/Version derived via
// field-by-field comparison; needed so Status comparisons (used to
// decide whether to publish) are structural, matching the Go original's
// reflect.DeepEqual diff-before-publish idiom.
impl PartialEq for ApplicationInfo {
    fn eq(&self, other: &Self) -> bool {
        self.installed == other.installed
            && self.initialized == other.initialized
            && self.instance_uid == other.instance_uid
            && self.key_uid == other.key_uid
            && self.card_public_key == other.card_public_key
            && self.version == other.version
            && self.available_pairing_slots == other.available_pairing_slots
            && self.capabilities == other.capabilities
    }
}
impl Eq for ApplicationInfo {}

impl PartialEq for ApplicationStatus {
    fn eq(&self, other: &Self) -> bool {
        self.pin_retries == other.pin_retries
            && self.puk_retries == other.puk_retries
            && self.key_initialized == other.key_initialized
            && self.current_derivation_path == other.current_derivation_path
    }
}
impl Eq for ApplicationStatus {}
