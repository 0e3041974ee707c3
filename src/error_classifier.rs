//! Distinguishes transport-loss errors (PC/SC failures, secure-channel
//! MAC failures) from logical applet errors, and extracts wrong-PIN/PUK
//! remaining-attempts counters from applet status words.

use crate::error::Error;

/// Status words the Keycard applet returns for a wrong PIN/PUK: the
/// low nibble of 0x63Cx carries the remaining-attempts count.
const SW_WRONG_PIN_PREFIX: u16 = 0x63C0;
const SW_SECURITY_NOT_SATISFIED: u16 = 0x6982;
const SW_AUTHENTICATION_FAILED: u16 = 0x6A88;

/// Is this error a transport loss that should trigger a reset-and-rescan?
pub fn is_transport_loss(err: &Error) -> bool {
    matches!(err, Error::TransportLoss(_))
}

/// Whether the applet returned a rejected-authentication status word
/// that should demote `Authorized` back to `Ready` (invariant 5).
pub fn is_authentication_requirement(sw: u16) -> bool {
    matches!(sw, SW_SECURITY_NOT_SATISFIED | SW_AUTHENTICATION_FAILED)
}

/// Extract remaining PIN/PUK attempts from a wrong-credential status
/// word, if it is one. Mirrors the Go original's `GetRetries`, which
/// inspects the error type rather than a raw status word because the Go
/// command library already parses it into typed errors; here we work
/// directly off the status word since this crate implements its own
/// command layer.
pub fn remaining_attempts_from_status_word(sw: u16) -> Option<u8> {
    if sw & 0xFFF0 == SW_WRONG_PIN_PREFIX {
        Some((sw & 0x000F) as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_remaining_attempts() {
        assert_eq!(remaining_attempts_from_status_word(0x63C2), Some(2));
        assert_eq!(remaining_attempts_from_status_word(0x63C0), Some(0));
        assert_eq!(remaining_attempts_from_status_word(0x9000), None);
    }

    #[test]
    fn classifies_transport_loss() {
        assert!(is_transport_loss(&Error::TransportLoss("card removed".into())));
        assert!(!is_transport_loss(&Error::Protocol { sw: 0x6A88 }));
    }

    #[test]
    fn recognizes_authentication_requirement_status_words() {
        assert!(is_authentication_requirement(SW_SECURITY_NOT_SATISFIED));
        assert!(is_authentication_requirement(SW_AUTHENTICATION_FAILED));
        assert!(!is_authentication_requirement(0x9000));
    }
}
