use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::stanzas;
use super::{SendOutcome, XmppCommand, XmppEvent};
use crate::config::{ConnectionMode, ServerConfig};

/// Extracts a complete presence stanza from the buffer.
/// Handles both self-closing `<presence ... />` and `<presence>...</presence>`.
/// Returns (stanza_text, end_position) or None.
fn extract_presence_stanza(buffer: &str) -> Option<(String, usize)> {
    let start = buffer.find("<presence")?;
    let after_tag = &buffer[start..];

    // Check for self-closing first: <presence ... />
    // A self-closing tag has /> before any > that opens the tag body.
    if let Some(close_pos) = after_tag.find("/>") {
        let before_close = &after_tag[..close_pos];
        let tag_opened = before_close
            .find('>')
            .map(|pos| !before_close[..pos + 1].ends_with("/>"))
            .unwrap_or(false);
        if !tag_opened {
            let stanza_end = start + close_pos + "/>".len();
            return Some((buffer[start..stanza_end].to_string(), stanza_end));
        }
    }

    if let Some(close_pos) = after_tag.find("</presence>") {
        let stanza_end = start + close_pos + "</presence>".len();
        return Some((buffer[start..stanza_end].to_string(), stanza_end));
    }

    None // incomplete stanza
}

/// Extracts a complete `<iq>...</iq>` stanza from the buffer, used to pick up
/// roster push results. Components rarely own a roster, but some deployments
/// route roster-query results through the component connection anyway.
fn extract_iq_stanza(buffer: &str) -> Option<(String, usize)> {
    let start = buffer.find("<iq ")?;
    let after_tag = &buffer[start..];
    if let Some(close_pos) = after_tag.find("/>") {
        let before_close = &after_tag[..close_pos];
        let tag_opened = before_close
            .find('>')
            .map(|pos| !before_close[..pos + 1].ends_with("/>"))
            .unwrap_or(false);
        if !tag_opened {
            let stanza_end = start + close_pos + "/>".len();
            return Some((buffer[start..stanza_end].to_string(), stanza_end));
        }
    }
    if let Some(close_pos) = after_tag.find("</iq>") {
        let stanza_end = start + close_pos + "</iq>".len();
        return Some((buffer[start..stanza_end].to_string(), stanza_end));
    }
    None
}

/// XMPP Component (XEP-0114).
///
/// Connects to an XMPP server as an external component, receives stanzas
/// addressed to the component's subdomain, and writes back outbound ones.
pub struct XmppComponent {
    config: ServerConfig,
}

impl XmppComponent {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    async fn run(
        &self,
        event_tx: mpsc::Sender<XmppEvent>,
        mut cmd_rx: mpsc::Receiver<XmppCommand>,
    ) -> anyhow::Result<()> {
        let (domain, secret) = match &self.config.mode {
            ConnectionMode::Component {
                component_domain,
                component_secret,
            } => (component_domain.clone(), component_secret.clone()),
            _ => return Err(anyhow::anyhow!("XmppComponent requires component mode config")),
        };

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to XMPP server at {addr}...");

        let mut stream = TcpStream::connect(&addr).await?;
        info!("TCP connected to {addr}");

        let stream_open = stanzas::build_stream_open(&domain);
        stream.write_all(stream_open.as_bytes()).await?;
        debug!("Sent stream open");

        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await?;
        let response = String::from_utf8_lossy(&buf[..n]).to_string();
        debug!("Server response: {response}");

        let stream_id = stanzas::extract_stream_id(&response)
            .ok_or_else(|| anyhow::anyhow!("No stream ID in server response"))?;
        info!("Got stream ID: {stream_id}");

        let hash_input = format!("{stream_id}{secret}");
        let hash = hex::encode(Sha1::digest(hash_input.as_bytes()));
        let handshake = stanzas::build_handshake(&hash);
        stream.write_all(handshake.as_bytes()).await?;
        debug!("Sent handshake");

        let n = stream.read(&mut buf).await?;
        let response = String::from_utf8_lossy(&buf[..n]).to_string();

        if !stanzas::is_handshake_success(&response) {
            return Err(anyhow::anyhow!("Handshake failed: {response}"));
        }

        info!("Connected as component: {domain}");
        let _ = event_tx.send(XmppEvent::Connected).await;

        let (mut reader, mut writer) = stream.into_split();

        let event_tx_clone = event_tx.clone();
        let read_handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            let mut xml_buffer = String::new();

            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        warn!("XMPP connection closed by server");
                        let _ = event_tx_clone
                            .send(XmppEvent::Disconnected {
                                reason: "connection_closed".into(),
                                fatal: false,
                            })
                            .await;
                        break;
                    }
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        xml_buffer.push_str(&chunk);

                        while let Some(end) = xml_buffer.find("</message>") {
                            let stanza_end = end + "</message>".len();
                            let stanza = &xml_buffer[..stanza_end];

                            if let Some(msg) = stanzas::parse_message(stanza) {
                                debug!("Received message from {}: {}", msg.from, msg.body);
                                let _ = event_tx_clone.send(XmppEvent::Message(msg)).await;
                            } else {
                                debug!("Skipping non-message stanza (chat state or no body)");
                            }

                            xml_buffer = xml_buffer[stanza_end..].to_string();
                        }

                        while let Some((stanza, stanza_end)) = extract_presence_stanza(&xml_buffer)
                        {
                            if let Some(pres) = stanzas::parse_presence(&stanza) {
                                debug!(
                                    "Received presence from {}: {:?}",
                                    pres.from, pres.presence_type
                                );
                                let _ = event_tx_clone.send(XmppEvent::Presence(pres)).await;
                            }
                            xml_buffer = xml_buffer[stanza_end..].to_string();
                        }

                        while let Some((stanza, stanza_end)) = extract_iq_stanza(&xml_buffer) {
                            let entries = stanzas::extract_roster_entries(&stanza);
                            if !entries.is_empty() {
                                let _ = event_tx_clone
                                    .send(XmppEvent::RosterUpdate(entries))
                                    .await;
                            }
                            xml_buffer = xml_buffer[stanza_end..].to_string();
                        }
                    }
                    Err(e) => {
                        error!("Read error: {e}");
                        let _ = event_tx_clone
                            .send(XmppEvent::Disconnected {
                                reason: e.to_string(),
                                fatal: false,
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        let write_handle = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let XmppCommand::Send(stanza, resp) = cmd;
                match writer.write_all(stanza.as_bytes()).await {
                    Ok(()) => {
                        debug!("Sent: {stanza}");
                        let _ = resp.send(SendOutcome::Success);
                    }
                    Err(e) => {
                        error!("Write error: {e}");
                        let _ = resp.send(SendOutcome::Transient);
                        break;
                    }
                }
            }
        });

        tokio::select! {
            _ = read_handle => {},
            _ = write_handle => {},
        }

        Ok(())
    }
}

#[async_trait]
impl super::XmppClient for XmppComponent {
    async fn connect(
        self: Box<Self>,
    ) -> anyhow::Result<(mpsc::Receiver<XmppEvent>, mpsc::Sender<XmppCommand>)> {
        let (event_tx, event_rx) = mpsc::channel::<XmppEvent>(100);
        let (cmd_tx, cmd_rx) = mpsc::channel::<XmppCommand>(100);

        tokio::spawn(async move {
            if let Err(e) = self.run(event_tx, cmd_rx).await {
                error!("XMPP component error: {e}");
            }
        });

        Ok((event_rx, cmd_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── extract_presence_stanza tests ──────────────────

    #[test]
    fn test_extract_presence_self_closing() {
        let buf = "<presence from='room@conf/nick' type='available'/>";
        let (stanza, end) = extract_presence_stanza(buf).unwrap();
        assert_eq!(stanza, buf);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn test_extract_presence_full_closing() {
        let buf = "<presence from='room@conf/nick'><show>away</show></presence>";
        let (stanza, end) = extract_presence_stanza(buf).unwrap();
        assert_eq!(stanza, buf);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn test_extract_presence_incomplete() {
        let buf = "<presence from='room@conf/nick' type='avail";
        assert!(extract_presence_stanza(buf).is_none());
    }

    #[test]
    fn test_extract_presence_with_trailing_data() {
        let buf = "<presence from='u@l' type='available'/><message from='u@l'><body>Hi</body></message>";
        let (stanza, end) = extract_presence_stanza(buf).unwrap();
        assert_eq!(stanza, "<presence from='u@l' type='available'/>");
        assert!(end < buf.len());
    }

    #[test]
    fn test_extract_presence_no_presence() {
        let buf = "<message from='user@localhost'><body>Hi</body></message>";
        assert!(extract_presence_stanza(buf).is_none());
    }

    #[test]
    fn test_extract_presence_empty() {
        assert!(extract_presence_stanza("").is_none());
    }

    // ── extract_iq_stanza tests ─────────────────────────

    #[test]
    fn test_extract_iq_self_closing() {
        let buf = "<iq type='result' id='r1'/>";
        let (stanza, end) = extract_iq_stanza(buf).unwrap();
        assert_eq!(stanza, buf);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn test_extract_iq_full_closing() {
        let buf = "<iq type='result' id='roster1'><query xmlns='jabber:iq:roster'><item jid='a@b'/></query></iq>";
        let (stanza, end) = extract_iq_stanza(buf).unwrap();
        assert_eq!(stanza, buf);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn test_extract_iq_incomplete() {
        let buf = "<iq type='result' id='roster1'><query";
        assert!(extract_iq_stanza(buf).is_none());
    }
}
