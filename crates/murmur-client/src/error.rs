use murmur_shared::CryptoError;
use murmur_store::StoreError;
use thiserror::Error;

/// Everything the messaging core can report to the view. None of these are
/// fatal; the view shows [`ClientError::user_message`] and carries on.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Wrong or garbled key for an encrypted message. Never retried.
    #[error("Invalid key")]
    CryptoMismatch,

    /// Sealing an outgoing message failed.
    #[error("Encryption failed")]
    Encryption,

    /// The store, channel or blob backend failed.
    #[error("Transport error: {0}")]
    Transport(#[from] StoreError),

    /// The identity provider refused a sensitive operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Microphone (or another capture device) is not available.
    #[error("Device unavailable: {0}")]
    DeviceCapability(String),

    #[error("Not signed in")]
    NotSignedIn,
}

impl From<CryptoError> for ClientError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::EncryptionFailed => Self::Encryption,
            CryptoError::DecryptionFailed | CryptoError::MalformedCiphertext => {
                Self::CryptoMismatch
            }
        }
    }
}

impl ClientError {
    /// Short text for the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::CryptoMismatch => "Invalid key".to_string(),
            Self::Encryption => "Could not encrypt the message. Please try again.".to_string(),
            Self::Transport(_) => "Something went wrong. Please try again.".to_string(),
            Self::Permission(_) => {
                "Failed to delete account. You may need to re-login.".to_string()
            }
            Self::DeviceCapability(_) => {
                "Microphone access denied or not available.".to_string()
            }
            Self::NotSignedIn => "Please sign in to continue.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_errors_collapse_to_mismatch() {
        for e in [CryptoError::DecryptionFailed, CryptoError::MalformedCiphertext] {
            let err: ClientError = e.into();
            assert!(matches!(err, ClientError::CryptoMismatch));
            assert_eq!(err.user_message(), "Invalid key");
        }
    }

    #[test]
    fn encryption_failure_is_not_a_bad_key() {
        let err: ClientError = CryptoError::EncryptionFailed.into();
        assert!(matches!(err, ClientError::Encryption));
        assert_ne!(err.user_message(), "Invalid key");
        assert!(err.user_message().contains("encrypt"));
    }

    #[test]
    fn transport_wraps_store_errors() {
        let err: ClientError = StoreError::Unavailable.into();
        assert!(matches!(err, ClientError::Transport(StoreError::Unavailable)));
        assert!(err.to_string().contains("Backend unavailable"));
    }

    #[test]
    fn permission_asks_for_reauthentication() {
        let err = ClientError::Permission("requires recent login".into());
        assert!(err.user_message().contains("re-login"));
    }
}
