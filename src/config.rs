//! Operating configuration decoded from the integration token.
//!
//! Callers receive one opaque app-key token from the backend operator: a
//! base64-encoded JSON object carrying the API key, the default and dynamic
//! endpoint URLs, and the peripheral service UUID to scan for. A malformed
//! or incomplete token is fatal to `start`; nothing proceeds without a
//! valid configuration.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Configuration slot shared across components.
///
/// Empty until a `start` call installs a validated [`LinkEnv`]; replaced
/// wholesale on every subsequent `start`.
pub type SharedEnv = std::sync::Arc<std::sync::RwLock<Option<LinkEnv>>>;

/// Validated operating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEnv {
    /// Integration API key, sent as the `X-API-Key` header.
    #[serde(rename = "appKey")]
    pub app_key: String,

    /// Default device-management-server base URL (telemetry reports).
    #[serde(rename = "defaultDMS")]
    pub default_dms: String,

    /// Default message-relay endpoint.
    #[serde(rename = "defaultBtAPI")]
    pub default_bt_api: String,

    /// Gist URL resolving to a replacement DMS base URL.
    #[serde(rename = "gistDMS")]
    pub gist_dms: String,

    /// Gist URL resolving to a replacement relay endpoint.
    #[serde(rename = "gistServer")]
    pub gist_server: String,

    /// Service UUID advertised by the peripheral.
    #[serde(rename = "gwServerUUID")]
    pub gw_server_uuid: String,
}

impl LinkEnv {
    /// Decode and validate a configuration token.
    pub fn from_token(token: &str) -> Result<Self> {
        let json = BASE64.decode(token.trim()).map_err(|_| SyncError::InvalidAppKey)?;
        let env: LinkEnv = serde_json::from_slice(&json).map_err(|_| SyncError::InvalidAppKey)?;
        env.validate()?;
        Ok(env)
    }

    /// Re-encode into token form. Decoding the result yields `self` again.
    pub fn to_token(&self) -> String {
        // LinkEnv serialization cannot fail: all fields are plain strings.
        let json = serde_json::to_vec(self).expect("LinkEnv serializes");
        BASE64.encode(json)
    }

    fn validate(&self) -> Result<()> {
        let urls_ok = [&self.default_dms, &self.default_bt_api, &self.gist_dms, &self.gist_server]
            .iter()
            .all(|url| url.contains("http"));
        if self.app_key.is_empty() || !urls_ok || self.gw_server_uuid.len() <= 30 {
            return Err(SyncError::InvalidAppKey);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_env() -> LinkEnv {
        LinkEnv {
            app_key: "k-0123456789".into(),
            default_dms: "https://dms.example.com/api/".into(),
            default_bt_api: "https://sync.example.com/bt".into(),
            gist_dms: "https://gist.example.com/dms.txt".into(),
            gist_server: "https://gist.example.com/server.txt".into(),
            gw_server_uuid: "31333333-2222-2222-1111-1111FFFFFFFF".into(),
        }
    }

    #[test]
    fn token_round_trip_is_idempotent() {
        let env = valid_env();
        let token = env.to_token();
        let decoded = LinkEnv::from_token(&token).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(LinkEnv::from_token(&decoded.to_token()).unwrap(), env);
    }

    #[test]
    fn rejects_garbage_token() {
        assert!(matches!(LinkEnv::from_token("not base64 at all!"), Err(SyncError::InvalidAppKey)));
        // Valid base64, invalid JSON
        let token = BASE64.encode(b"hello world");
        assert!(matches!(LinkEnv::from_token(&token), Err(SyncError::InvalidAppKey)));
    }

    #[test]
    fn rejects_empty_app_key() {
        let mut env = valid_env();
        env.app_key = String::new();
        assert!(matches!(LinkEnv::from_token(&env.to_token()), Err(SyncError::InvalidAppKey)));
    }

    #[test]
    fn rejects_non_http_urls() {
        for field in 0..4 {
            let mut env = valid_env();
            let target = match field {
                0 => &mut env.default_dms,
                1 => &mut env.default_bt_api,
                2 => &mut env.gist_dms,
                _ => &mut env.gist_server,
            };
            *target = "ftp://example.com".into();
            assert!(
                matches!(LinkEnv::from_token(&env.to_token()), Err(SyncError::InvalidAppKey)),
                "field {field} should have failed validation"
            );
        }
    }

    #[test]
    fn rejects_short_service_uuid() {
        let mut env = valid_env();
        env.gw_server_uuid = "too-short".into();
        assert!(matches!(LinkEnv::from_token(&env.to_token()), Err(SyncError::InvalidAppKey)));
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        let env = valid_env();
        let token = format!("  {}\n", env.to_token());
        assert_eq!(LinkEnv::from_token(&token).unwrap(), env);
    }
}
