// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Project-level knobs consumed by the session runtime

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default grace period before a silently disconnected session is torn down.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

/// Project configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProjectConfig {
    /// Environment variable names every client must supply on connect
    pub user_env: Vec<String>,

    /// Grace period (seconds) after an implicit disconnect
    pub session_timeout: u64,

    /// Resolve an identity from the authorization header on connect
    pub require_login: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            user_env: Vec::new(),
            session_timeout: DEFAULT_SESSION_TIMEOUT_SECS,
            require_login: false,
        }
    }
}

impl ProjectConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }

    /// Parse and validate the user-environment payload sent on connect.
    ///
    /// The payload is a JSON object of string values. Every required key must
    /// be present; extra keys are kept.
    pub fn load_user_env(&self, payload: Option<&str>) -> SessionResult<HashMap<String, String>> {
        let user_env = match payload {
            Some(raw) if !raw.trim().is_empty() => {
                serde_json::from_str::<HashMap<String, String>>(raw).map_err(|err| {
                    SessionError::ConnectionRefused(format!(
                        "Invalid user environment payload: {err}"
                    ))
                })?
            }
            _ if self.user_env.is_empty() => return Ok(HashMap::new()),
            _ => {
                return Err(SessionError::ConnectionRefused(
                    "Missing user environment variables".to_string(),
                ));
            }
        };

        if let Some(missing) = self.user_env.iter().find(|key| !user_env.contains_key(*key)) {
            return Err(SessionError::ConnectionRefused(format!(
                "Missing user environment variable: {missing}"
            )));
        }

        Ok(user_env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requiring(keys: &[&str]) -> ProjectConfig {
        ProjectConfig {
            user_env: keys.iter().map(|k| k.to_string()).collect(),
            ..ProjectConfig::default()
        }
    }

    #[test]
    fn defaults() {
        let config = ProjectConfig::default();
        assert!(config.user_env.is_empty());
        assert_eq!(config.session_timeout(), Duration::from_secs(3600));
        assert!(!config.require_login);
    }

    #[test]
    fn missing_key_is_refused() {
        let err = requiring(&["API_KEY"]).load_user_env(Some("{}")).unwrap_err();
        assert_eq!(
            err,
            SessionError::ConnectionRefused("Missing user environment variable: API_KEY".into())
        );
    }

    #[test]
    fn absent_payload_is_refused_when_keys_required() {
        let err = requiring(&["API_KEY"]).load_user_env(None).unwrap_err();
        assert_eq!(
            err,
            SessionError::ConnectionRefused("Missing user environment variables".into())
        );
    }

    #[test]
    fn extra_keys_are_allowed() {
        let env = requiring(&["API_KEY"])
            .load_user_env(Some(r#"{"API_KEY":"x","REGION":"eu"}"#))
            .expect("accepted");
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("x"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn nothing_required_accepts_absent_payload() {
        assert!(ProjectConfig::default().load_user_env(None).unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_is_refused() {
        let err = ProjectConfig::default().load_user_env(Some("not json")).unwrap_err();
        let SessionError::ConnectionRefused(msg) = &err else {
            panic!("expected a refusal, got {err:?}");
        };
        assert!(msg.starts_with("Invalid user environment payload"));
    }

    #[test]
    fn deserializes_kebab_case() {
        let config: ProjectConfig = serde_json::from_value(serde_json::json!({
            "user-env": ["OPENAI_API_KEY"],
            "session-timeout": 2
        }))
        .unwrap();
        assert_eq!(config.user_env, vec!["OPENAI_API_KEY".to_string()]);
        assert_eq!(config.session_timeout(), Duration::from_secs(2));
        assert!(!config.require_login);
    }
}
