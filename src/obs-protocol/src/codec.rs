// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Line framing for gateway messages.

use serde_json::Value;

use crate::types::{GatewayEnvelope, GatewayEvent, GatewayMessage};

/// Result of parsing one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(GatewayEnvelope),
    /// Well-formed JSON whose `kind` is missing or not one we handle.
    Unrecognized(String),
}

/// Parse one line. Malformed JSON, and known kinds with bad fields, are
/// errors; unknown kinds are not.
pub fn parse_line(line: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(line.trim())?;
    match value.get("kind").and_then(Value::as_str) {
        Some(kind) if GatewayMessage::KINDS.contains(&kind) => {}
        Some(kind) => return Ok(Inbound::Unrecognized(kind.to_string())),
        None => return Ok(Inbound::Unrecognized(String::new())),
    }
    serde_json::from_value::<GatewayEnvelope>(value).map(Inbound::Message)
}

/// Serialize an event as one newline-terminated line.
pub fn encode_event(event: &GatewayEvent) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use obs_core::controller::ObservationState;
    use obs_core::{OverrideAction, SafetyKind};

    fn message(line: &str) -> GatewayEnvelope {
        match parse_line(line).unwrap() {
            Inbound::Message(envelope) => envelope,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_safety() {
        let envelope = message(r#"{"kind":"safety","signal":"weather","safe":false}"#);
        assert_eq!(envelope.token, None);
        assert_eq!(
            envelope.message,
            GatewayMessage::Safety {
                signal: SafetyKind::Weather,
                safe: false
            }
        );
    }

    #[test]
    fn test_parse_override_with_token() {
        let envelope = message(r#"{"token":"s3cret","kind":"override","action":"skip"}"#);
        assert_eq!(envelope.token.as_deref(), Some("s3cret"));
        assert_eq!(
            envelope.message,
            GatewayMessage::Override {
                action: OverrideAction::Skip
            }
        );
    }

    #[test]
    fn test_parse_bare_kinds() {
        assert_eq!(message(r#"{"kind":"shutdown"}"#).message, GatewayMessage::Shutdown);
        assert_eq!(
            message(" {\"kind\":\"get_state\"}\r\n").message,
            GatewayMessage::GetState
        );
    }

    #[test]
    fn test_unknown_kind_is_unrecognized() {
        assert_eq!(
            parse_line(r#"{"kind":"focus","steps":120}"#).unwrap(),
            Inbound::Unrecognized("focus".into())
        );
        assert_eq!(
            parse_line(r#"{"hello":"world"}"#).unwrap(),
            Inbound::Unrecognized(String::new())
        );
    }

    #[test]
    fn test_malformed_lines_are_errors() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line(r#"{"kind":"safety","signal":"rain","safe":false}"#).is_err());
        assert!(parse_line(r#"{"kind":"override"}"#).is_err());
    }

    #[test]
    fn test_encode_state_change() {
        let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339("2024-03-20T01:02:03Z")
            .unwrap()
            .with_timezone(&Utc);
        let line = encode_event(&GatewayEvent::StateChange {
            previous: ObservationState::Scheduling,
            current: ObservationState::Slewing,
            timestamp,
            target: Some("M42".into()),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "state_change");
        assert_eq!(value["previous"], "Scheduling");
        assert_eq!(value["current"], "Slewing");
        assert_eq!(value["target"], "M42");
        assert_eq!(value["timestamp"], "2024-03-20T01:02:03Z");
    }

    #[test]
    fn test_encode_omits_missing_target() {
        let line = encode_event(&GatewayEvent::StateChange {
            previous: ObservationState::Parking,
            current: ObservationState::Parked,
            timestamp: Utc::now(),
            target: None,
        })
        .unwrap();
        assert!(!line.contains("target"));
    }
}
