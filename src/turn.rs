#![forbid(unsafe_code)]

// TURN REST credentials (coturn --use-auth-secret), attached to every transport
// the server hands out.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// e.g. `turn:example.com:3478`, `turns:example.com:5349`
    pub urls: Vec<String>,
    pub secret: String,
    pub ttl_secs: u64,
}

/// ICE server entry sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// `None` unless both TURN_URLS and TURN_SECRET are set
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let urls_str = lookup("TURN_URLS")?;
        let secret = lookup("TURN_SECRET")?;
        let ttl_secs = match lookup("TURN_TTL") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Invalid TURN_TTL {:?}, using {}", raw, DEFAULT_TTL_SECS);
                DEFAULT_TTL_SECS
            }),
            None => DEFAULT_TTL_SECS,
        };

        let urls: Vec<String> = urls_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if urls.is_empty() {
            warn!("TURN_URLS is set but empty, TURN disabled");
            return None;
        }

        Some(Self { urls, secret, ttl_secs })
    }

    /// Time-limited credentials for one participant, valid for `ttl_secs` from now
    pub fn credentials_for(&self, participant_id: &str) -> Option<IceServer> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.credentials_at(participant_id, now)
    }

    /// username = "<expiry>:<participant>", credential = base64(HMAC-SHA1(secret, username))
    fn credentials_at(&self, participant_id: &str, now_secs: u64) -> Option<IceServer> {
        let username = format!("{}:{participant_id}", now_secs.saturating_add(self.ttl_secs));

        let mut mac = match HmacSha1::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(e) => {
                warn!("Cannot key TURN credential HMAC: {}", e);
                return None;
            }
        };
        mac.update(username.as_bytes());
        let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Some(IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TurnConfig {
        TurnConfig {
            urls: vec!["turn:turn.example.com:3478".into()],
            secret: "s3cret".into(),
            ttl_secs: 86_400,
        }
    }

    #[test]
    fn credentials_follow_the_coturn_rest_format() {
        let server = config().credentials_at("p1", 1_700_000_000).unwrap();

        assert_eq!(server.username.as_deref(), Some("1700086400:p1"));
        assert_eq!(server.credential.as_deref(), Some("TgBBooiX3GxIywJ/Cutt61bZBac="));
        assert_eq!(server.urls, vec!["turn:turn.example.com:3478".to_string()]);
    }

    #[test]
    fn ice_server_omits_missing_credentials() {
        let stun = IceServer { urls: vec!["stun:stun.example.com".into()], username: None, credential: None };
        assert_eq!(
            serde_json::to_value(&stun).unwrap(),
            serde_json::json!({ "urls": ["stun:stun.example.com"] })
        );
    }
}
