//! Out-of-band approval tokens for REQUIRE_APPROVAL rules.
//!
//! A token is an HMAC-SHA256 over the request id and the exact command
//! text, so it cannot be replayed for another request or a modified
//! command.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::domain::RequestId;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_DOMAIN: &[u8] = b"claimgate-approval-v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no approval key configured")]
    NoKey,

    #[error("approval key must not be empty")]
    EmptyKey,

    #[error("approval token is not valid hex")]
    Malformed,

    #[error("approval token does not match this request and command")]
    Mismatch,
}

/// Issues and verifies approval tokens
#[derive(Clone, Default)]
pub struct ApprovalAuthority {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for ApprovalAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalAuthority")
            .field("configured", &self.key.is_some())
            .finish()
    }
}

impl ApprovalAuthority {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, ApprovalError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(ApprovalError::EmptyKey);
        }
        Ok(Self {
            key: Some(key.to_vec()),
        })
    }

    /// Authority that rejects every token
    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    fn mac(&self, request_id: RequestId, command: &str) -> Result<HmacSha256, ApprovalError> {
        let key = self.key.as_deref().ok_or(ApprovalError::NoKey)?;
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ApprovalError::EmptyKey)?;
        mac.update(TOKEN_DOMAIN);
        mac.update(request_id.as_uuid().as_bytes());
        mac.update(&(command.len() as u64).to_be_bytes());
        mac.update(command.as_bytes());
        Ok(mac)
    }

    /// Hex token approving `command` for `request_id`
    pub fn issue(&self, request_id: RequestId, command: &str) -> Result<String, ApprovalError> {
        let mac = self.mac(request_id, command)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a token
    pub fn verify(&self, request_id: RequestId, command: &str, token: &str) -> Result<(), ApprovalError> {
        let mac = self.mac(request_id, command)?;
        let bytes = hex::decode(token.trim()).map_err(|_| ApprovalError::Malformed)?;
        mac.verify_slice(&bytes).map_err(|_| ApprovalError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let authority = ApprovalAuthority::new("secret").unwrap();
        let id = RequestId::new();
        let token = authority.issue(id, "npm install x").unwrap();
        assert!(authority.verify(id, "npm install x", &token).is_ok());
    }

    #[test]
    fn test_token_bound_to_request_and_command() {
        let authority = ApprovalAuthority::new("secret").unwrap();
        let id = RequestId::new();
        let token = authority.issue(id, "npm install x").unwrap();

        assert_eq!(
            authority.verify(RequestId::new(), "npm install x", &token),
            Err(ApprovalError::Mismatch)
        );
        assert_eq!(
            authority.verify(id, "npm install y", &token),
            Err(ApprovalError::Mismatch)
        );
        assert_eq!(authority.verify(id, "npm install x", "zz"), Err(ApprovalError::Malformed));
    }

    #[test]
    fn test_disabled_rejects_everything() {
        let authority = ApprovalAuthority::disabled();
        assert_eq!(
            authority.verify(RequestId::new(), "ls", "00"),
            Err(ApprovalError::NoKey)
        );
        assert!(ApprovalAuthority::new("").is_err());
    }
}
