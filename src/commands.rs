//! Keycard APDU command builders. This is the host-side half of the
//! published Keycard command set; it does not attempt byte-exact
//! interoperability with a specific applet build, only the contract
//! this crate's session engine and command surface rely on.

pub const CLA_GP: u8 = 0x80;
pub const CLA_ISO: u8 = 0x00;

pub const INS_SELECT: u8 = 0xA4;
pub const INS_INIT: u8 = 0xFE;
pub const INS_PAIR: u8 = 0x12;
pub const INS_OPEN_SECURE_CHANNEL: u8 = 0x10;
pub const INS_MUTUALLY_AUTHENTICATE: u8 = 0x11;
pub const INS_GET_STATUS: u8 = 0xF2;
pub const INS_VERIFY_PIN: u8 = 0x20;
pub const INS_CHANGE_CREDENTIAL: u8 = 0x21;
pub const INS_UNBLOCK_PIN: u8 = 0x22;
pub const INS_GENERATE_MNEMONIC: u8 = 0xD2;
pub const INS_LOAD_SEED: u8 = 0xD0;
pub const INS_DERIVE_KEY: u8 = 0xD1;
pub const INS_EXPORT_KEY: u8 = 0xC2;
pub const INS_SIGN: u8 = 0xC0;
pub const INS_STORE_DATA: u8 = 0xE2;
pub const INS_GET_DATA: u8 = 0xCA;
pub const INS_FACTORY_RESET: u8 = 0xFD;
pub const INS_DELETE: u8 = 0xE4;
pub const INS_INSTALL: u8 = 0xE6;

pub const P1_CHANGE_PIN: u8 = 0x00;
pub const P1_CHANGE_PUK: u8 = 0x01;
pub const P1_CHANGE_PAIRING: u8 = 0x02;

pub const P1_PAIR_FIRST_STAGE: u8 = 0x00;
pub const P1_PAIR_FINAL_STAGE: u8 = 0x01;

pub const P1_DATA_PUBLIC: u8 = 0x00;

pub const P2_DERIVE_MAKE_CURRENT: u8 = 0x00;
pub const P2_EXPORT_CURRENT_PRIVATE: u8 = 0x00;
pub const P2_EXPORT_CURRENT_PUBLIC: u8 = 0x01;
pub const P2_EXPORT_DERIVE_PRIVATE: u8 = 0x02;
pub const P2_EXPORT_DERIVE_PUBLIC: u8 = 0x03;

/// A single APDU command ready for transmission.
#[derive(Debug, Clone)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl Apdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self { cla, ins, p1, p2, data }
    }

    /// Serialize as a standard ISO 7816-4 extended-or-short command
    /// APDU (short form; this crate's payloads never exceed 255 bytes
    /// once inside a single secure-channel frame).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.data.len() + 1);
        out.push(self.cla);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        out.push(0x00); // Le
        out
    }
}

pub const KEYCARD_AID: &[u8] = &[0xA0, 0x00, 0x00, 0x08, 0x04, 0x00, 0x01];
pub const ISD_AID: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00];

pub fn select(aid: &[u8]) -> Apdu {
    Apdu::new(CLA_ISO, INS_SELECT, 0x04, 0x00, aid.to_vec())
}

pub fn select_keycard() -> Apdu {
    select(KEYCARD_AID)
}

/// INIT: loads the initial PIN, PUK and pairing password on a blank,
/// selected-but-uninitialized applet.
pub fn initialize(pin: &str, puk: &str, pairing_password: &str) -> Apdu {
    let mut data = Vec::with_capacity(pin.len() + puk.len() + pairing_password.len());
    data.extend_from_slice(pin.as_bytes());
    data.extend_from_slice(puk.as_bytes());
    data.extend_from_slice(pairing_password.as_bytes());
    Apdu::new(CLA_GP, INS_INIT, 0x00, 0x00, data)
}

pub fn pair_first_stage(host_challenge: &[u8; 32]) -> Apdu {
    Apdu::new(CLA_GP, INS_PAIR, P1_PAIR_FIRST_STAGE, 0x00, host_challenge.to_vec())
}

pub fn pair_final_stage(client_cryptogram: &[u8; 32]) -> Apdu {
    Apdu::new(CLA_GP, INS_PAIR, P1_PAIR_FINAL_STAGE, 0x00, client_cryptogram.to_vec())
}

pub fn open_secure_channel(pairing_index: u8, host_public_key: &[u8]) -> Apdu {
    Apdu::new(CLA_GP, INS_OPEN_SECURE_CHANNEL, pairing_index, 0x00, host_public_key.to_vec())
}

pub fn mutually_authenticate(host_challenge: &[u8; 32]) -> Apdu {
    Apdu::new(CLA_GP, INS_MUTUALLY_AUTHENTICATE, 0x00, 0x00, host_challenge.to_vec())
}

pub fn get_status_application() -> Apdu {
    Apdu::new(CLA_GP, INS_GET_STATUS, 0x00, 0x00, vec![])
}

pub fn verify_pin(pin: &str) -> Apdu {
    Apdu::new(CLA_GP, INS_VERIFY_PIN, 0x00, 0x00, pin.as_bytes().to_vec())
}

pub fn change_pin(new_pin: &str) -> Apdu {
    Apdu::new(CLA_GP, INS_CHANGE_CREDENTIAL, P1_CHANGE_PIN, 0x00, new_pin.as_bytes().to_vec())
}

pub fn change_puk(new_puk: &str) -> Apdu {
    Apdu::new(CLA_GP, INS_CHANGE_CREDENTIAL, P1_CHANGE_PUK, 0x00, new_puk.as_bytes().to_vec())
}

pub fn change_pairing_secret(pairing_token: &[u8; 32]) -> Apdu {
    Apdu::new(CLA_GP, INS_CHANGE_CREDENTIAL, P1_CHANGE_PAIRING, 0x00, pairing_token.to_vec())
}

pub fn unblock_pin(puk: &str, new_pin: &str) -> Apdu {
    let mut data = Vec::with_capacity(puk.len() + new_pin.len());
    data.extend_from_slice(puk.as_bytes());
    data.extend_from_slice(new_pin.as_bytes());
    Apdu::new(CLA_GP, INS_UNBLOCK_PIN, 0x00, 0x00, data)
}

pub fn generate_mnemonic(checksum_words: u8) -> Apdu {
    Apdu::new(CLA_GP, INS_GENERATE_MNEMONIC, 0x00, 0x00, vec![checksum_words])
}

pub fn load_seed(seed: &[u8; 64]) -> Apdu {
    Apdu::new(CLA_GP, INS_LOAD_SEED, 0x01, 0x00, seed.to_vec())
}

pub fn derive_key(encoded_path: &[u8]) -> Apdu {
    Apdu::new(CLA_GP, INS_DERIVE_KEY, 0x00, P2_DERIVE_MAKE_CURRENT, encoded_path.to_vec())
}

pub fn export_key(p2: u8, encoded_path: &[u8]) -> Apdu {
    Apdu::new(CLA_GP, INS_EXPORT_KEY, 0x00, p2, encoded_path.to_vec())
}

pub fn sign(data_hash: &[u8; 32]) -> Apdu {
    Apdu::new(CLA_GP, INS_SIGN, 0x00, 0x00, data_hash.to_vec())
}

pub fn store_data_public(data: &[u8]) -> Apdu {
    Apdu::new(CLA_GP, INS_STORE_DATA, P1_DATA_PUBLIC, 0x00, data.to_vec())
}

pub fn get_data_public() -> Apdu {
    Apdu::new(CLA_GP, INS_GET_DATA, P1_DATA_PUBLIC, 0x00, vec![])
}

pub fn factory_reset() -> Apdu {
    Apdu::new(CLA_GP, INS_FACTORY_RESET, 0xAA, 0x55, vec![])
}

pub fn select_isd() -> Apdu {
    select(ISD_AID)
}

pub fn gp_delete_keycard_app() -> Apdu {
    Apdu::new(CLA_GP, INS_DELETE, 0x00, 0x00, KEYCARD_AID.to_vec())
}

pub fn gp_install_keycard_app() -> Apdu {
    Apdu::new(CLA_GP, INS_INSTALL, 0x0C, 0x00, KEYCARD_AID.to_vec())
}

/// Encode a BIP-32 path as the Keycard applet expects: 4 bytes per
/// component, big-endian, hardened components with bit 31 set.
pub fn encode_derivation_path(components: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(components.len() * 4);
    for component in components {
        out.extend_from_slice(&component.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_keycard_carries_the_keycard_aid() {
        let apdu = select_keycard();
        assert_eq!(apdu.ins, INS_SELECT);
        assert_eq!(apdu.data, KEYCARD_AID.to_vec());
    }

    #[test]
    fn unblock_pin_concatenates_puk_and_new_pin() {
        let apdu = unblock_pin("123456123456", "234567");
        assert_eq!(apdu.data, b"123456123456234567".to_vec());
    }

    #[test]
    fn derivation_path_encodes_hardened_components() {
        let encoded = encode_derivation_path(&[0x8000002C, 0x8000003C, 0x80000000, 0, 0]);
        assert_eq!(encoded.len(), 20);
        assert_eq!(&encoded[0..4], &[0x80, 0x00, 0x00, 0x2C]);
    }

    #[test]
    fn to_bytes_includes_le_even_with_no_data() {
        let apdu = get_status_application();
        let bytes = apdu.to_bytes();
        assert_eq!(bytes, vec![CLA_GP, INS_GET_STATUS, 0x00, 0x00, 0x00]);
    }
}
