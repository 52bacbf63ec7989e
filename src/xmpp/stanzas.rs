/// XMPP stanza building and parsing.
/// Manual XML handling — we only need a subset for both
/// component (XEP-0114) and C2S client protocols.

/// Message type — distinguishes 1:1 chat from MUC groupchat
#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    Chat,
    GroupChat,
}

/// Parsed incoming message
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub id: Option<String>,
    pub message_type: MessageType,
}

// ── Message stanzas (shared) ─────────────────────────────

/// Builds an outgoing XMPP message.
/// `from` is Some for component mode, None for C2S (server adds it).
/// `msg_type` is the `type` attribute (`chat`, `normal`, ...); callers are
/// expected to have already escaped `to`, `body` and `id`.
/// Includes `<active/>` chat state (XEP-0085) to signal we've stopped typing.
pub fn build_message(
    from: Option<&str>,
    to: &str,
    body: &str,
    id: Option<&str>,
    msg_type: &str,
) -> String {
    let from_attr = from
        .map(|f| format!(" from='{f}'"))
        .unwrap_or_default();
    let id_attr = id
        .map(|i| format!(" id='{i}'"))
        .unwrap_or_default();
    format!(
        "<message{from_attr} to='{to}' type='{msg_type}'{id_attr}>\
         <body>{body}</body>\
         <active xmlns='http://jabber.org/protocol/chatstates'/>\
         </message>"
    )
}

// ── Component protocol (XEP-0114) ────────────────────────

/// Builds the stream opening for component protocol
pub fn build_stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
         <stream:stream \
         xmlns='jabber:component:accept' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         to='{domain}'>"
    )
}

/// Builds the handshake response with SHA-1 hash
pub fn build_handshake(hash: &str) -> String {
    format!("<handshake>{hash}</handshake>")
}

/// Detects if XML contains a successful handshake (empty response)
pub fn is_handshake_success(data: &str) -> bool {
    data.contains("<handshake/>") || data.contains("<handshake></handshake>")
}

// ── C2S client protocol ──────────────────────────────────

/// Builds the stream opening for C2S client protocol
pub fn build_client_stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
         <stream:stream \
         xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         to='{domain}' \
         version='1.0'>"
    )
}

/// STARTTLS request
pub fn build_starttls() -> String {
    "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".to_string()
}

/// Checks if server responded with STARTTLS proceed
pub fn is_starttls_proceed(data: &str) -> bool {
    data.contains("<proceed")
}

/// Checks if stream features advertise STARTTLS
pub fn has_starttls(data: &str) -> bool {
    data.contains("<starttls")
}

/// SASL auth with PLAIN mechanism
pub fn build_sasl_auth_plain(username: &str, password: &str) -> String {
    use base64::Engine;
    // PLAIN format: \0username\0password
    let payload = format!("\0{username}\0{password}");
    let encoded = base64::engine::general_purpose::STANDARD.encode(payload.as_bytes());
    format!("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{encoded}</auth>")
}

/// SASL auth initiation with SCRAM-SHA-1 mechanism
pub fn build_sasl_auth_scram_sha1(initial_message_b64: &str) -> String {
    format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='SCRAM-SHA-1'>{initial_message_b64}</auth>"
    )
}

/// SASL challenge response
pub fn build_sasl_response(payload_b64: &str) -> String {
    format!("<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{payload_b64}</response>")
}

/// Checks for SASL success
pub fn is_sasl_success(data: &str) -> bool {
    data.contains("<success")
}

/// Checks for SASL challenge
pub fn is_sasl_challenge(data: &str) -> bool {
    data.contains("<challenge")
}

/// Extracts SASL challenge payload (base64 content between tags)
pub fn extract_sasl_challenge(data: &str) -> Option<String> {
    // Handle <challenge xmlns='...'>payload</challenge>
    let start_tag = "<challenge";
    let start_pos = data.find(start_tag)?;
    let after_tag = &data[start_pos..];
    // Find the closing > of the opening tag
    let content_start = after_tag.find('>')? + 1;
    let content = &after_tag[content_start..];
    let end = content.find("</challenge>")?;
    let payload = &content[..end];
    if payload.is_empty() {
        None
    } else {
        Some(payload.to_string())
    }
}

/// Extracts available SASL mechanisms from stream features
pub fn extract_sasl_mechanisms(data: &str) -> Vec<String> {
    let mut mechs = Vec::new();
    let mut search_from = 0;
    while let Some(start) = data[search_from..].find("<mechanism>") {
        let content_start = search_from + start + "<mechanism>".len();
        if let Some(end) = data[content_start..].find("</mechanism>") {
            mechs.push(data[content_start..content_start + end].to_string());
            search_from = content_start + end + "</mechanism>".len();
        } else {
            break;
        }
    }
    mechs
}

/// Resource binding request
pub fn build_bind_request(resource: &str) -> String {
    format!(
        "<iq type='set' id='bind1'>\
         <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
         <resource>{resource}</resource>\
         </bind></iq>"
    )
}

/// Extracts bound JID from bind response
pub fn extract_bound_jid(data: &str) -> Option<String> {
    extract_element_text(data, "jid")
}

/// Initial presence stanza
pub fn build_initial_presence() -> String {
    "<presence/>".to_string()
}

/// Presence subscription request — ask to see the contact's presence
pub fn build_subscribe(to: &str) -> String {
    format!("<presence to='{to}' type='subscribe'/>")
}

/// Accept an incoming subscription request — allow the contact to see our presence
pub fn build_subscribed(to: &str) -> String {
    format!("<presence to='{to}' type='subscribed'/>")
}

// ── Presence parsing ────────────────────────────────────

/// The type of an incoming presence stanza
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceType {
    /// Contact wants to subscribe to our presence
    Subscribe,
    /// Contact approved our subscription request
    Subscribed,
    /// Contact is unsubscribing from our presence
    Unsubscribe,
    /// Contact revoked our subscription
    Unsubscribed,
    /// Contact went offline
    Unavailable,
    /// Contact is available, with no `<show/>` element
    Available,
    /// Contact is available but away (`<show>away</show>`)
    Away,
    /// Contact is available but does not want to be disturbed (`<show>dnd</show>`)
    Dnd,
}

impl PresenceType {
    /// Renders the presence state the way `received_event`s and `ping` responses
    /// name it: `available`, `unavailable`, `away`, `dnd`. Subscription-management
    /// types fall back to `available` since they carry no availability state.
    pub fn as_state_str(&self) -> &'static str {
        match self {
            PresenceType::Unavailable => "unavailable",
            PresenceType::Away => "away",
            PresenceType::Dnd => "dnd",
            _ => "available",
        }
    }
}

/// Parsed incoming presence stanza
#[derive(Debug, Clone)]
pub struct IncomingPresence {
    pub from: String,
    pub presence_type: PresenceType,
}

/// Parses an incoming presence stanza from XML.
/// Returns None if the stanza is not a presence stanza.
pub fn parse_presence(data: &str) -> Option<IncomingPresence> {
    if !data.contains("<presence") {
        return None;
    }

    let from = extract_attr(data, "from")?;
    let type_str = extract_attr(data, "type");
    let show = extract_element_text(data, "show");

    let presence_type = match type_str.as_deref() {
        Some("subscribe") => PresenceType::Subscribe,
        Some("subscribed") => PresenceType::Subscribed,
        Some("unsubscribe") => PresenceType::Unsubscribe,
        Some("unsubscribed") => PresenceType::Unsubscribed,
        Some("unavailable") => PresenceType::Unavailable,
        _ => match show.as_deref() {
            Some("away") | Some("xa") => PresenceType::Away,
            Some("dnd") => PresenceType::Dnd,
            _ => PresenceType::Available,
        },
    };

    Some(IncomingPresence {
        from,
        presence_type,
    })
}

// ── Roster (RFC 6121) ───────────────────────────────────

/// Roster query request — fetch the bot's contact list
pub fn build_roster_get() -> String {
    "<iq type='get' id='roster1'><query xmlns='jabber:iq:roster'/></iq>".to_string()
}

/// A single roster item, JID plus optional display name.
#[derive(Debug, Clone)]
pub struct RosterItem {
    pub jid: String,
    pub name: Option<String>,
}

/// Extracts `(jid, name)` pairs from a roster result, skipping items in
/// `subscription='remove'` state. Used for `roster_update`/`sync_roster`,
/// where a display name (if the server knows one) seeds the candidate alias.
pub fn extract_roster_entries(data: &str) -> Vec<RosterItem> {
    let mut items = Vec::new();
    let mut search_from = 0;

    while let Some(pos) = data[search_from..].find("<item ") {
        let item_start = search_from + pos;
        let item_data = &data[item_start..];

        if let Some(jid) = extract_attr(item_data, "jid") {
            let subscription = extract_attr(item_data, "subscription");
            if subscription.as_deref() != Some("remove") {
                let name = extract_attr(item_data, "name");
                items.push(RosterItem { jid, name });
            }
        }

        search_from = item_start + "<item ".len();
    }

    items
}

// ── Shared parsing helpers ───────────────────────────────

/// Extracts stream id from server response
pub fn extract_stream_id(data: &str) -> Option<String> {
    extract_attr(data, "id")
}

/// Checks if a message stanza is a chat state notification (XEP-0085)
/// that should be ignored (typing indicators, etc.).
pub fn is_chat_state_notification(data: &str) -> bool {
    // XEP-0085 chat states: composing, paused, active, inactive, gone
    let chat_states = [
        "<composing",
        "<paused",
        "<active",
        "<inactive",
        "<gone",
    ];
    let has_chat_state = chat_states.iter().any(|s| data.contains(s));
    let has_body = data.contains("<body>") || data.contains("<body ");
    // It's a pure chat state notification if it has a chat state but no body
    has_chat_state && !has_body
}

/// Extracts an incoming message from XML.
/// Returns None for stanzas without a body (including chat state notifications).
pub fn parse_message(data: &str) -> Option<IncomingMessage> {
    if !data.contains("<message") {
        return None;
    }

    // Skip chat state notifications (XEP-0085: composing, paused, active, etc.)
    if is_chat_state_notification(data) {
        return None;
    }

    let from = extract_attr(data, "from")?;
    let to = extract_attr(data, "to");
    let id = extract_attr(data, "id");
    let body = extract_element_text(data, "body")?;

    // Extra guard: skip messages with empty or whitespace-only bodies
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let message_type = match extract_attr(data, "type").as_deref() {
        Some("groupchat") => MessageType::GroupChat,
        _ => MessageType::Chat,
    };

    Some(IncomingMessage {
        from,
        to: to.unwrap_or_default(),
        body: trimmed.to_string(),
        id,
        message_type,
    })
}

/// Extracts an attribute value from an XML tag
pub fn extract_attr(xml: &str, attr: &str) -> Option<String> {
    let patterns = [format!("{attr}='"), format!("{attr}=\"")];
    for pattern in &patterns {
        if let Some(start) = xml.find(pattern.as_str()) {
            let after = &xml[start + pattern.len()..];
            let quote = pattern.chars().last().unwrap();
            if let Some(end) = after.find(quote) {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}

/// Extracts text between <tag> and </tag>
pub fn extract_element_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)?;
    let after = &xml[start + open.len()..];
    let end = after.find(&close)?;
    let text = &after[..end];
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
