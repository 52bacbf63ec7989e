/// Translates between JSON tool payloads, the bridge's internal
/// `OutboundMessage`/`ReceivedEvent` records, and XMPP stanza text.
/// Pure functions, no state — mirrors the teacher's manual stanza-building
/// idiom (`xmpp::stanzas`) but closes the XML-escaping gap those builders
/// never had to worry about, since component-mode `from` attributes were
/// always trusted config values rather than arbitrary tool-call input.
use serde_json::Value;

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to_jid: String,
    pub body: String,
    pub message_type: String,
    pub priority: Priority,
    pub attempts_so_far: u32,
}

#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub from_jid: String,
    pub body: String,
    pub message_type: String,
    pub ts: u64,
}

const RECOGNIZED_MESSAGE_TYPES: &[&str] = &["chat", "normal", "groupchat", "headline"];

/// Returns the bare JID (strips any `/resource` suffix). Pure string op —
/// no validation of the localpart/domain shape is performed here.
pub fn bare_jid(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

/// Builds an `OutboundMessage` from a tool-call payload. Requires `jid` and
/// `body` as non-empty strings; `message_type` defaults to `chat` and must be
/// one of the recognized values if present.
pub fn mcp_send_to_outbound(payload: &Value) -> Result<OutboundMessage, BridgeError> {
    let to_jid = payload
        .get("jid")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::InvalidParams {
            message: "jid must be a non-empty string".into(),
        })?
        .to_string();

    let body = payload
        .get("body")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::InvalidParams {
            message: "body must be a non-empty string".into(),
        })?
        .to_string();

    let message_type = match payload.get("message_type").and_then(Value::as_str) {
        None => "chat".to_string(),
        Some(t) if RECOGNIZED_MESSAGE_TYPES.contains(&t) => t.to_string(),
        Some(t) => {
            return Err(BridgeError::InvalidParams {
                message: format!("unrecognized message_type: {t}"),
            })
        }
    };

    let priority = match payload.get("priority").and_then(Value::as_str) {
        None => Priority::Medium,
        Some("high") => Priority::High,
        Some("medium") => Priority::Medium,
        Some("low") => Priority::Low,
        Some(p) => {
            return Err(BridgeError::InvalidParams {
                message: format!("unrecognized priority: {p}"),
            })
        }
    };

    Ok(OutboundMessage {
        to_jid,
        body,
        message_type,
        priority,
        attempts_so_far: 0,
    })
}

/// Escapes `&<>"'` and replaces raw control characters below 0x20 (other
/// than tab/newline/CR) with a space, so arbitrary tool-call input can never
/// break out of an attribute or text node.
pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if (c as u32) < 0x20 => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Reverses `xml_escape` for the five named entities. Unknown `&...;`
/// sequences are left as-is rather than raising — decoding issues never
/// fail this function.
pub fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Constructs the wire-format stanza for an outbound message.
pub fn outbound_to_stanza(msg: &OutboundMessage) -> String {
    format!(
        "<message to=\"{}\" type=\"{}\"><body>{}</body></message>",
        xml_escape(&msg.to_jid),
        xml_escape(&msg.message_type),
        xml_escape(&msg.body)
    )
}

/// Builds a `ReceivedEvent` from decoded stanza fields. Coerces a missing or
/// non-string body to an empty string rather than failing.
pub fn stanza_to_received(from_jid: &str, body_raw: &str, message_type: &str, ts: u64) -> ReceivedEvent {
    ReceivedEvent {
        from_jid: from_jid.to_string(),
        body: xml_unescape(body_raw),
        message_type: message_type.to_string(),
        ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_jid_strips_resource() {
        assert_eq!(bare_jid("alice@example.com/phone"), "alice@example.com");
        assert_eq!(bare_jid("alice@example.com"), "alice@example.com");
    }

    #[test]
    fn test_mcp_send_to_outbound_defaults_chat() {
        let payload = json!({"jid": "alice@example.com", "body": "hi"});
        let msg = mcp_send_to_outbound(&payload).unwrap();
        assert_eq!(msg.to_jid, "alice@example.com");
        assert_eq!(msg.body, "hi");
        assert_eq!(msg.message_type, "chat");
        assert_eq!(msg.attempts_so_far, 0);
    }

    #[test]
    fn test_mcp_send_to_outbound_rejects_empty_body() {
        let payload = json!({"jid": "alice@example.com", "body": ""});
        assert!(mcp_send_to_outbound(&payload).is_err());
    }

    #[test]
    fn test_mcp_send_to_outbound_rejects_missing_jid() {
        let payload = json!({"body": "hi"});
        assert!(mcp_send_to_outbound(&payload).is_err());
    }

    #[test]
    fn test_mcp_send_to_outbound_honors_explicit_priority() {
        let payload = json!({"jid": "a@b.com", "body": "hi", "priority": "high"});
        let msg = mcp_send_to_outbound(&payload).unwrap();
        assert_eq!(msg.priority, Priority::High);
    }

    #[test]
    fn test_mcp_send_to_outbound_rejects_bad_priority() {
        let payload = json!({"jid": "a@b.com", "body": "hi", "priority": "urgent"});
        assert!(mcp_send_to_outbound(&payload).is_err());
    }

    #[test]
    fn test_mcp_send_to_outbound_rejects_bad_message_type() {
        let payload = json!({"jid": "a@b.com", "body": "hi", "message_type": "bogus"});
        let err = mcp_send_to_outbound(&payload).unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }

    #[test]
    fn test_xml_escape_entities() {
        assert_eq!(xml_escape("<a> & \"b\" 'c'"), "&lt;a&gt; &amp; &quot;b&quot; &apos;c&apos;");
    }

    #[test]
    fn test_xml_escape_replaces_control_chars() {
        let input = "a\x01b\x07c\td\ne\rf";
        let escaped = xml_escape(input);
        assert_eq!(escaped, "a b c\td\ne\rf");
    }

    #[test]
    fn test_outbound_to_stanza_shape() {
        let msg = OutboundMessage {
            to_jid: "alice@example.com".into(),
            body: "Hi!".into(),
            message_type: "chat".into(),
            priority: Priority::Medium,
            attempts_so_far: 0,
        };
        let xml = outbound_to_stanza(&msg);
        assert!(xml.contains("to=\"alice@example.com\""));
        assert!(xml.contains("type=\"chat\""));
        assert!(xml.contains("<body>Hi!</body>"));
    }

    #[test]
    fn test_outbound_to_stanza_escapes_body() {
        let msg = OutboundMessage {
            to_jid: "alice@example.com".into(),
            body: "<script>&\"'</script>".into(),
            message_type: "chat".into(),
            priority: Priority::Medium,
            attempts_so_far: 0,
        };
        let xml = outbound_to_stanza(&msg);
        assert!(!xml.contains("<script>"));
        assert!(xml.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_stanza_to_received_unescapes() {
        let event = stanza_to_received("alice@example.com", "&lt;b&gt;hi&lt;/b&gt;", "chat", 42);
        assert_eq!(event.body, "<b>hi</b>");
        assert_eq!(event.ts, 42);
    }

    #[test]
    fn test_round_trip_preserves_to_jid_and_body() {
        let msg = OutboundMessage {
            to_jid: "bob@example.com".into(),
            body: "Tom & Jerry <3".into(),
            message_type: "chat".into(),
            priority: Priority::Medium,
            attempts_so_far: 0,
        };
        let stanza = outbound_to_stanza(&msg);
        // Round-trip through the same extraction helper stanzas.rs uses.
        let body_raw = crate::xmpp::stanzas::extract_element_text(&stanza, "body").unwrap();
        let event = stanza_to_received(&msg.to_jid, &body_raw, &msg.message_type, 0);
        assert_eq!(event.from_jid, msg.to_jid);
        assert_eq!(event.body, msg.body);
    }

    #[test]
    fn test_empty_body_round_trips_as_empty() {
        let escaped = xml_escape("");
        assert_eq!(escaped, "");
        let event = stanza_to_received("a@b.com", "", "chat", 0);
        assert_eq!(event.body, "");
    }
}
