//! At-rest protection for relay policy keys.
//!
//! [`Base64Protector`] is an encoding, not encryption: it keeps keys out of
//! casual view in config files. Platform key stores can implement
//! [`CredentialProtector`] instead.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

#[derive(Debug)]
pub enum CredentialError {
    /// The sealed value is not in the expected format.
    Malformed(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "sealed credential is malformed: {msg}"),
        }
    }
}

impl std::error::Error for CredentialError {}

pub trait CredentialProtector: Send + Sync {
    fn protect(&self, plain: &str) -> String;
    fn unprotect(&self, sealed: &str) -> Result<String, CredentialError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Protector;

impl CredentialProtector for Base64Protector {
    fn protect(&self, plain: &str) -> String {
        STANDARD.encode(plain.as_bytes())
    }

    fn unprotect(&self, sealed: &str) -> Result<String, CredentialError> {
        let bytes = STANDARD
            .decode(sealed.trim())
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| CredentialError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_unseal() {
        let p = Base64Protector;
        let sealed = p.protect("s3cr3t/key=");
        assert_ne!(sealed, "s3cr3t/key=");
        assert_eq!(p.unprotect(&sealed).unwrap(), "s3cr3t/key=");
    }

    #[test]
    fn test_unseal_garbage_fails() {
        let err = Base64Protector.unprotect("not base64!!").unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }
}
