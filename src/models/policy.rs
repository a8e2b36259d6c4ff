use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Validated caller policy metadata, required on every mutating call.
///
/// Describes the calling automation's identity and safety posture so the
/// recorded history can answer "what ran this, under which guardrails".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDescriptor {
    pub automation: String,
    pub automation_version: String,
    pub agent_family: String,
    pub approval_mode: String,
    pub sandbox_mode: String,
    pub network_mode: String,
    pub dangerous_flags: Vec<String>,
}

/// Wire-side policy descriptor before validation. Every field is optional so
/// a missing field is reported as `POLICY_METADATA_REQUIRED` (naming the
/// field) instead of a generic deserialization failure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyInput {
    #[serde(default)]
    pub automation: Option<String>,
    #[serde(default)]
    pub automation_version: Option<String>,
    #[serde(default)]
    pub agent_family: Option<String>,
    #[serde(default)]
    pub approval_mode: Option<String>,
    #[serde(default)]
    pub sandbox_mode: Option<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    /// Must be a JSON list of strings, not a scalar.
    #[serde(default)]
    pub dangerous_flags: Option<serde_json::Value>,
}

impl PolicyInput {
    /// Validate the descriptor: all fields present, `dangerous_flags` a list,
    /// and no value carrying what looks like a credential.
    pub fn validate(self) -> Result<PolicyDescriptor, EngineError> {
        let mut missing = Vec::new();
        let mut require = |name: &'static str, value: &Option<String>| {
            if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                missing.push(name);
            }
        };
        require("automation", &self.automation);
        require("automation_version", &self.automation_version);
        require("agent_family", &self.agent_family);
        require("approval_mode", &self.approval_mode);
        require("sandbox_mode", &self.sandbox_mode);
        require("network_mode", &self.network_mode);
        if self.dangerous_flags.is_none() {
            missing.push("dangerous_flags");
        }
        if !missing.is_empty() {
            return Err(EngineError::PolicyMetadataRequired {
                missing: missing.iter().map(|m| (*m).to_string()).collect(),
            });
        }

        let flags = match self.dangerous_flags {
            Some(serde_json::Value::Array(items)) => {
                let mut flags = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        serde_json::Value::String(s) => flags.push(s),
                        other => {
                            return Err(EngineError::PolicyValidationFailed {
                                reason: format!(
                                    "dangerous_flags entries must be strings, got {other}"
                                ),
                            })
                        }
                    }
                }
                flags
            }
            Some(other) => {
                return Err(EngineError::PolicyValidationFailed {
                    reason: format!("dangerous_flags must be a list, got {other}"),
                })
            }
            None => unreachable!("presence checked above"),
        };

        let descriptor = PolicyDescriptor {
            automation: self.automation.unwrap_or_default(),
            automation_version: self.automation_version.unwrap_or_default(),
            agent_family: self.agent_family.unwrap_or_default(),
            approval_mode: self.approval_mode.unwrap_or_default(),
            sandbox_mode: self.sandbox_mode.unwrap_or_default(),
            network_mode: self.network_mode.unwrap_or_default(),
            dangerous_flags: flags,
        };

        for value in descriptor
            .dangerous_flags
            .iter()
            .map(String::as_str)
            .chain([
                descriptor.automation.as_str(),
                descriptor.automation_version.as_str(),
                descriptor.agent_family.as_str(),
                descriptor.approval_mode.as_str(),
                descriptor.sandbox_mode.as_str(),
                descriptor.network_mode.as_str(),
            ])
        {
            if let Some(key) = credential_key(value) {
                return Err(EngineError::PolicyValidationFailed {
                    reason: format!(
                        "value looks like a credential (matches key name '{key}'); \
                         secrets must never enter recorded history"
                    ),
                });
            }
        }

        Ok(descriptor)
    }
}

/// Key names that commonly carry credentials. A value containing one of
/// these followed by `=` or `:` is rejected outright rather than recorded.
const CREDENTIAL_KEYS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "api_key",
    "api-key",
    "apikey",
    "credential",
    "private_key",
    "private-key",
    "access_key",
    "auth",
];

fn credential_key(value: &str) -> Option<&'static str> {
    let lower = value.to_ascii_lowercase();
    for key in CREDENTIAL_KEYS {
        let mut search = lower.as_str();
        while let Some(pos) = search.find(key) {
            let after = &search[pos + key.len()..];
            if matches!(after.as_bytes().first(), Some(b'=') | Some(b':')) {
                return Some(key);
            }
            search = &search[pos + key.len()..];
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_input() -> PolicyInput {
        PolicyInput {
            automation: Some("worksmith-agent".into()),
            automation_version: Some("1.4.0".into()),
            agent_family: Some("acme".into()),
            approval_mode: Some("on-request".into()),
            sandbox_mode: Some("workspace-write".into()),
            network_mode: Some("restricted".into()),
            dangerous_flags: Some(serde_json::json!([])),
        }
    }

    #[test]
    fn complete_descriptor_validates() {
        let descriptor = complete_input().validate().expect("should validate");
        assert_eq!(descriptor.agent_family, "acme");
        assert!(descriptor.dangerous_flags.is_empty());
    }

    #[test]
    fn missing_fields_are_named() {
        let mut input = complete_input();
        input.sandbox_mode = None;
        input.network_mode = Some("  ".into());
        let err = input.validate().unwrap_err();
        match err {
            EngineError::PolicyMetadataRequired { missing } => {
                assert!(missing.contains(&"sandbox_mode".to_string()));
                assert!(missing.contains(&"network_mode".to_string()));
            }
            other => panic!("expected PolicyMetadataRequired, got {other:?}"),
        }
    }

    #[test]
    fn scalar_dangerous_flags_rejected() {
        let mut input = complete_input();
        input.dangerous_flags = Some(serde_json::json!("--allow-destructive"));
        assert!(matches!(
            input.validate(),
            Err(EngineError::PolicyValidationFailed { .. })
        ));
    }

    #[test]
    fn credential_bearing_flag_rejected() {
        let mut input = complete_input();
        input.dangerous_flags = Some(serde_json::json!(["api_key=sk-abc123"]));
        assert!(matches!(
            input.validate(),
            Err(EngineError::PolicyValidationFailed { .. })
        ));
    }

    #[test]
    fn plain_flag_names_pass() {
        let mut input = complete_input();
        input.dangerous_flags = Some(serde_json::json!(["--force", "--no-sandbox"]));
        assert!(input.validate().is_ok());
    }
}
