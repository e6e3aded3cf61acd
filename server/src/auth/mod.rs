//! Connection authentication.
//!
//! Tokens are issued elsewhere; this server only verifies them and turns
//! the claims into an [`Identity`].

pub mod jwt;
pub mod middleware;

use serde::{Deserialize, Serialize};

/// Who a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
}

/// Turns a bearer credential into an identity.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, VerifyError>;
}
