use thiserror::Error;

/// The full error taxonomy surfaced by the engine and the command surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no PC/SC provider available")]
    NoProvider,

    #[error("no card connected")]
    NotConnected,

    #[error("card is not ready for this operation")]
    NotReady,

    #[error("card is not authorized (PIN not verified)")]
    NotAuthorized,

    #[error("card has no credentials set")]
    NotInitialized,

    #[error("card is not blocked")]
    NotBlocked,

    #[error("wrong credential, {remaining} attempt(s) remaining")]
    WrongCredential { remaining: u8 },

    #[error("unexpected applet status word: {sw:04X}")]
    Protocol { sw: u16 },

    #[error("transport lost: {0}")]
    TransportLoss(String),

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("no available pairing slots")]
    NoSlots,

    #[error("request failed validation: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<pcsc::Error> for Error {
    /// PC/SC provider failures are always transport losses; the
    /// recovery path (reset-and-rescan) is the same regardless of which
    /// specific provider call failed.
    fn from(err: pcsc::Error) -> Self {
        Error::TransportLoss(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("pairing store corrupt: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
