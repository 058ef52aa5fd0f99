// Client and endpoint policy checks
// All path decisions run on normalized paths so `/api//v1/messages/` and
// `/api/v1/messages` gate identically.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::config::GatewaySettings;
use crate::models::KeyRecord;
use crate::utils::gateway_error::GatewayError;

pub const CLAUDE_CODE_CLIENT_ID: &str = "claude_code";

/// Known API clients, identified by User-Agent shape
static CLIENT_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            CLAUDE_CODE_CLIENT_ID,
            Regex::new(r"^claude-cli/\d+\.\d+\.\d+").expect("static regex"),
        ),
        ("gemini_cli", Regex::new(r"^GeminiCLI/").expect("static regex")),
        ("codex_cli", Regex::new(r"^codex(-cli)?/").expect("static regex")),
        ("droid_cli", Regex::new(r"(?i)^droid/").expect("static regex")),
    ]
});

const CLAUDE_MESSAGES_PATHS: [&str; 2] = ["/api/v1/messages", "/claude/v1/messages"];

const TOKEN_COUNT_PATHS: [&str; 3] = [
    "/api/v1/messages/count_tokens",
    "/claude/v1/messages/count_tokens",
    "/v1/messages/count_tokens",
];

#[derive(Debug, Error)]
pub enum PolicyViolation {
    #[error("client not allowed for this API key")]
    ClientDenied { user_agent: String },

    #[error("{message}")]
    EndpointGated { message: String },

    #[error("model not enabled for this API key")]
    ModelDenied { model: String },
}

impl From<PolicyViolation> for GatewayError {
    fn from(violation: PolicyViolation) -> Self {
        match violation {
            PolicyViolation::ClientDenied { user_agent } => {
                GatewayError::ClientDenied { user_agent }
            },
            PolicyViolation::EndpointGated { message } => GatewayError::EndpointGated { message },
            PolicyViolation::ModelDenied { model } => GatewayError::ModelDenied { model },
        }
    }
}

/// Collapse duplicate slashes and strip the trailing one
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !last_was_slash {
                normalized.push(c);
            }
            last_was_slash = true;
        } else {
            normalized.push(c);
            last_was_slash = false;
        }
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Claude messages endpoints subject to the Claude-Code-only gate
pub fn is_claude_messages_path(path: &str) -> bool {
    let normalized = normalize_path(path);
    CLAUDE_MESSAGES_PATHS.contains(&normalized.as_str())
}

/// Token-counting endpoints bypass policy, concurrency and rate checks
pub fn is_token_count_path(path: &str) -> bool {
    let normalized = normalize_path(path);
    TOKEN_COUNT_PATHS.contains(&normalized.as_str())
}

fn user_agent_matches(client_id: &str, user_agent: &str) -> bool {
    CLIENT_PATTERNS
        .iter()
        .any(|(id, pattern)| *id == client_id && pattern.is_match(user_agent))
}

/// Client-allowlist check.
///
/// A key without a restriction (or with an empty allowlist) accepts any
/// client; otherwise the User-Agent must match one allowed client.
pub fn evaluate_client(record: &KeyRecord, user_agent: Option<&str>) -> Result<(), PolicyViolation> {
    if !record.client_restriction_enabled || record.allowed_clients.is_empty() {
        return Ok(());
    }

    let ua = user_agent.unwrap_or("");
    if record
        .allowed_clients
        .iter()
        .any(|client_id| user_agent_matches(client_id, ua))
    {
        Ok(())
    } else {
        Err(PolicyViolation::ClientDenied {
            user_agent: ua.to_string(),
        })
    }
}

/// Whether the Claude-Code-only rule is in force for this key:
/// globally enabled, or the key restricts clients to exactly claude_code.
pub fn claude_code_only_applies(settings: &GatewaySettings, record: &KeyRecord) -> bool {
    settings.claude_code_only_enabled
        || (record.client_restriction_enabled
            && record.allowed_clients.len() == 1
            && record.allowed_clients[0] == CLAUDE_CODE_CLIENT_ID)
}

/// Claude-Code-only gate, enforced only on Claude messages endpoints.
pub fn evaluate_claude_code_only(
    path: &str,
    user_agent: Option<&str>,
    settings: &GatewaySettings,
    record: &KeyRecord,
) -> Result<(), PolicyViolation> {
    if !is_claude_messages_path(path) {
        return Ok(());
    }
    if !claude_code_only_applies(settings, record) {
        return Ok(());
    }

    let ua = user_agent.unwrap_or("");
    if user_agent_matches(CLAUDE_CODE_CLIENT_ID, ua) {
        Ok(())
    } else {
        Err(PolicyViolation::EndpointGated {
            message: "This endpoint only accepts Claude Code clients".to_string(),
        })
    }
}

/// Model restriction: an empty list allows everything.
pub fn evaluate_model(record: &KeyRecord, model: Option<&str>) -> Result<(), PolicyViolation> {
    if record.enabled_models.is_empty() {
        return Ok(());
    }
    match model {
        Some(model) if record.enabled_models.iter().any(|m| m == model) => Ok(()),
        Some(model) => Err(PolicyViolation::ModelDenied {
            model: model.to_string(),
        }),
        // No model in the request: nothing to gate on
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record_with(fields: &[(&str, &str)]) -> KeyRecord {
        let mut hash: HashMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        hash.insert("key_hash".to_string(), "h".to_string());
        KeyRecord::from_hash("key-1", &hash).unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api//v1/messages/"), "/api/v1/messages");
        assert_eq!(normalize_path("/api/v1/messages"), "/api/v1/messages");
        assert_eq!(normalize_path("///"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_path_classification() {
        assert!(is_claude_messages_path("/api/v1/messages"));
        assert!(is_claude_messages_path("/claude/v1/messages/"));
        assert!(!is_claude_messages_path("/v1/messages"));
        assert!(!is_claude_messages_path("/api/v1/messages/count_tokens"));

        assert!(is_token_count_path("/api/v1/messages/count_tokens"));
        assert!(is_token_count_path("/v1//messages/count_tokens"));
        assert!(is_token_count_path("/claude/v1/messages/count_tokens"));
        assert!(!is_token_count_path("/api/v1/messages"));
    }

    #[test]
    fn test_client_allowlist() {
        let record = record_with(&[
            ("client_restriction_enabled", "true"),
            ("allowed_clients", "claude_code"),
        ]);

        assert!(evaluate_client(&record, Some("claude-cli/1.0.44 (external)")).is_ok());
        assert!(evaluate_client(&record, Some("GeminiCLI/0.5")).is_err());
        assert!(evaluate_client(&record, Some("curl/8.4")).is_err());
        assert!(evaluate_client(&record, None).is_err());
    }

    #[test]
    fn test_client_allowlist_disabled() {
        let unrestricted = record_with(&[]);
        assert!(evaluate_client(&unrestricted, Some("curl/8.4")).is_ok());

        let empty_list = record_with(&[("client_restriction_enabled", "true")]);
        assert!(evaluate_client(&empty_list, Some("curl/8.4")).is_ok());
    }

    #[test]
    fn test_claude_code_only_rule() {
        let mut settings = GatewaySettings::default();
        let plain = record_with(&[]);
        let pinned = record_with(&[
            ("client_restriction_enabled", "true"),
            ("allowed_clients", "claude_code"),
        ]);
        let multi = record_with(&[
            ("client_restriction_enabled", "true"),
            ("allowed_clients", "claude_code,gemini_cli"),
        ]);

        assert!(!claude_code_only_applies(&settings, &plain));
        assert!(claude_code_only_applies(&settings, &pinned));
        assert!(!claude_code_only_applies(&settings, &multi));

        settings.claude_code_only_enabled = true;
        assert!(claude_code_only_applies(&settings, &plain));
    }

    #[test]
    fn test_claude_code_only_gate_scoped_to_claude_paths() {
        let settings = GatewaySettings {
            claude_code_only_enabled: true,
            ..Default::default()
        };
        let record = record_with(&[]);

        // Gated path with a non-Claude-Code client
        assert!(evaluate_claude_code_only(
            "/api/v1/messages",
            Some("curl/8.4"),
            &settings,
            &record
        )
        .is_err());

        // Same client on a non-gated path passes
        assert!(evaluate_claude_code_only(
            "/gemini/v1/generate",
            Some("curl/8.4"),
            &settings,
            &record
        )
        .is_ok());

        // Claude Code client passes the gate
        assert!(evaluate_claude_code_only(
            "/claude/v1/messages",
            Some("claude-cli/1.2.3 (cli)"),
            &settings,
            &record
        )
        .is_ok());
    }

    #[test]
    fn test_model_restriction() {
        let record = record_with(&[("enabled_models", "claude-sonnet-4,claude-haiku-3")]);

        assert!(evaluate_model(&record, Some("claude-sonnet-4")).is_ok());
        assert!(evaluate_model(&record, Some("claude-opus-4")).is_err());
        assert!(evaluate_model(&record, None).is_ok());

        let open = record_with(&[]);
        assert!(evaluate_model(&open, Some("anything")).is_ok());
    }
}
