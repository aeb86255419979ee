//! Identity contract and the in-process stand-in for the auth collaborator.
//!
//! The core trusts whatever identity the provider hands back for a token;
//! credential verification and token issuance live outside this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::model::UserId;

/// Authenticated identity attached to a request or connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub is_driver: bool,
    pub is_staff: bool,
}

/// Resolves bearer tokens to identities. Implemented in-process here; a
/// deployment would back this with its real session or token service.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Token table used by the server binary and the tests.
#[derive(Default)]
pub struct InMemoryAuth {
    tokens: Mutex<HashMap<String, Identity>>,
}

impl InMemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, identity: Identity) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.insert(token.to_string(), identity);
    }
}

impl AuthProvider for InMemoryAuth {
    fn authenticate(&self, token: &str) -> Option<Identity> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.get(token).cloned()
    }
}

/// One entry of the JSON seed file loaded at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub token: String,
    pub username: String,
    #[serde(default)]
    pub is_driver: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub taxi: Option<SeedTaxi>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedTaxi {
    pub license_plate: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tokens_resolve_to_nothing() {
        let auth = InMemoryAuth::new();
        assert!(auth.authenticate("missing").is_none());
    }

    #[test]
    fn inserted_tokens_resolve_to_their_identity() {
        let auth = InMemoryAuth::new();
        let identity = Identity {
            id: UserId(4),
            username: "rita".into(),
            is_driver: false,
            is_staff: false,
        };
        auth.insert("t-rita", identity.clone());
        assert_eq!(auth.authenticate("t-rita"), Some(identity));
    }

    #[test]
    fn seed_entries_parse_with_defaults() {
        let seed: Vec<SeedUser> = serde_json::from_str(
            r#"[
                {"token": "t-rita", "username": "rita"},
                {"token": "t-dave", "username": "dave", "is_driver": true,
                 "taxi": {"license_plate": "TN-100", "lat": 36.8, "lng": 10.18}}
            ]"#,
        )
        .expect("parse seed");
        assert_eq!(seed.len(), 2);
        assert!(!seed[0].is_driver);
        assert!(seed[0].taxi.is_none());
        let taxi = seed[1].taxi.as_ref().expect("dave's taxi");
        assert_eq!(taxi.license_plate, "TN-100");
    }
}
