/// JSON-RPC 2.0 line-delimited stdio tool dispatcher (§4.F).
///
/// Grounded on the skill-registry method-table pattern (name -> handler,
/// built once at startup) kept from the teacher's agent runtime, reworked
/// from in-process LLM tool calls to line-delimited stdio requests, since
/// that is how this bridge's JSON-RPC surface is actually consumed.
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{error, warn};

use crate::address_book::AddressBook;
use crate::bridge::Bridge;
use crate::connection::ConnectionStateReader;
use crate::converters::mcp_send_to_outbound;
use crate::error::BridgeError;
use crate::inbox::Inbox;

const JSONRPC_VERSION: &str = "2.0";

/// One entry in the method table: a boxed async closure taking `(params,
/// handlers)` and returning a JSON result or a `BridgeError`.
type Handler = Arc<
    dyn Fn(Value, Arc<Handlers>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, BridgeError>> + Send>>
        + Send
        + Sync,
>;

/// Shared state every handler closure needs.
pub struct Handlers {
    pub address_book: Arc<AddressBook>,
    pub inbox: Arc<Inbox>,
    pub bridge: Arc<Bridge>,
    pub connection: ConnectionStateReader,
}

pub struct Dispatcher {
    methods: HashMap<&'static str, Handler>,
    handlers: Arc<Handlers>,
}

impl Dispatcher {
    pub fn new(handlers: Handlers) -> Self {
        let mut methods: HashMap<&'static str, Handler> = HashMap::new();
        methods.insert("initialize", Arc::new(|params, h| Box::pin(handle_initialize(params, h))));
        methods.insert("tools/list", Arc::new(|params, h| Box::pin(handle_tools_list(params, h))));
        methods.insert("ping", Arc::new(|params, h| Box::pin(handle_ping(params, h))));
        methods.insert(
            "send_xmpp_message",
            Arc::new(|params, h| Box::pin(handle_send_xmpp_message(params, h))),
        );
        methods.insert("inbox/list", Arc::new(|params, h| Box::pin(handle_inbox_list(params, h))));
        methods.insert("inbox/get", Arc::new(|params, h| Box::pin(handle_inbox_get(params, h))));
        methods.insert("inbox/clear", Arc::new(|params, h| Box::pin(handle_inbox_clear(params, h))));
        methods.insert(
            "address_book/save",
            Arc::new(|params, h| Box::pin(handle_address_book_save(params, h))),
        );
        methods.insert(
            "address_book/query",
            Arc::new(|params, h| Box::pin(handle_address_book_query(params, h))),
        );

        Self { methods, handlers: Arc::new(handlers) }
    }

    /// Dispatches one already-parsed JSON-RPC request, returning the
    /// response object (never `None` — every request gets a response,
    /// including parse/protocol failures per §4.F).
    pub async fn dispatch(&self, request: Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);

        let method = match request.get("method").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => {
                return error_response(
                    id,
                    &BridgeError::InvalidRequest { message: "missing method".into() },
                )
            }
        };

        if request.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return error_response(
                id,
                &BridgeError::InvalidRequest { message: "missing or wrong jsonrpc version".into() },
            );
        }

        let params = request.get("params").cloned().unwrap_or(json!({}));

        let Some(handler) = self.methods.get(method.as_str()) else {
            return error_response(id, &BridgeError::MethodNotFound { method });
        };

        match handler(params, self.handlers.clone()).await {
            Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
            Err(e) => error_response(id, &e),
        }
    }

    /// Runs the line-delimited stdio loop: one JSON-RPC request per line in,
    /// one response per line out. A line that fails to parse as JSON gets a
    /// `parse_error` response rather than killing the loop.
    pub async fn run_stdio<R, W>(&self, reader: R, mut writer: W)
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    error!("stdio read error: {e}");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Value>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => error_response(Value::Null, &BridgeError::ParseError { message: e.to_string() }),
            };

            let Ok(mut text) = serde_json::to_string(&response) else {
                warn!("failed to serialize response");
                continue;
            };
            text.push('\n');
            if writer.write_all(text.as_bytes()).await.is_err() {
                return;
            }
            let _ = writer.flush().await;
        }
    }
}

fn error_response(id: Value, err: &BridgeError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": err.rpc_code(),
            "message": err.to_string(),
            "data": { "kind": err.kind() },
        }
    })
}

/// The tool surface announced to JSON-RPC callers by both `initialize`'s
/// `capabilities.tools` and `tools/list`, kept as one definition so the two
/// can never drift apart.
fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "send_xmpp_message",
            "description": "Sends a chat message to an XMPP address or a saved alias.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "recipient": { "type": "string", "description": "A bare/full JID or an address book alias." },
                    "message": { "type": "string", "description": "The message body." },
                },
                "required": ["recipient", "message"],
            },
        }),
        json!({
            "name": "ping",
            "description": "Liveness check; reports the current connection state.",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": "inbox/list",
            "description": "Lists recently received messages, newest first.",
            "inputSchema": {
                "type": "object",
                "properties": { "limit": { "type": "integer", "minimum": 1 } },
            },
        }),
        json!({
            "name": "inbox/get",
            "description": "Fetches a single received message by id.",
            "inputSchema": {
                "type": "object",
                "properties": { "messageId": { "type": "string" } },
                "required": ["messageId"],
            },
        }),
        json!({
            "name": "inbox/clear",
            "description": "Clears the inbox, returning the number of messages removed.",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": "address_book/save",
            "description": "Saves or updates an alias -> JID mapping.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "alias": { "type": "string" },
                    "jid": { "type": "string" },
                },
                "required": ["alias", "jid"],
            },
        }),
        json!({
            "name": "address_book/query",
            "description": "Fuzzy-searches saved aliases by a search term.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "term": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1 },
                },
                "required": ["term"],
            },
        }),
    ]
}

async fn handle_initialize(_params: Value, _handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    Ok(json!({
        "protocolVersion": JSONRPC_VERSION,
        "capabilities": { "tools": tool_definitions() },
    }))
}

async fn handle_tools_list(_params: Value, _handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    Ok(json!({ "tools": tool_definitions() }))
}

async fn handle_ping(_params: Value, handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    Ok(json!({
        "pong": true,
        "connection_state": handlers.connection.snapshot().as_str(),
    }))
}

/// Resolves `recipient` to a bare/full JID: used verbatim if it already
/// contains `@`, otherwise looked up as an address book alias, mapping
/// lookup failures to the JSON-RPC error kinds the spec names
/// (`unknown_alias`, `ambiguous_alias`).
async fn resolve_target(recipient: &str, address_book: &AddressBook) -> Result<String, BridgeError> {
    if recipient.contains('@') {
        return Ok(recipient.to_string());
    }
    address_book.resolve(recipient).await
}

async fn handle_send_xmpp_message(params: Value, handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    let recipient = params
        .get("recipient")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidParams { message: "recipient is required".into() })?;
    let message = params
        .get("message")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidParams { message: "message is required".into() })?;

    let target_jid = resolve_target(recipient, &handlers.address_book).await?;

    let mut payload = json!({ "jid": target_jid, "body": message });
    if let Some(message_type) = params.get("message_type") {
        payload["message_type"] = message_type.clone();
    }
    if let Some(priority) = params.get("priority") {
        payload["priority"] = priority.clone();
    }

    let outbound = mcp_send_to_outbound(&payload)?;
    let outbound_id = handlers.bridge.enqueue_outbound(outbound).await?;
    Ok(json!({ "queued": true, "outbound_id": outbound_id, "jid": target_jid }))
}

async fn handle_inbox_list(params: Value, handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    let limit = params.get("limit").and_then(Value::as_u64).map(|n| n as usize);
    let records = handlers.inbox.list(limit).await;
    Ok(json!({ "messages": records.iter().map(record_to_preview_json).collect::<Vec<_>>() }))
}

async fn handle_inbox_get(params: Value, handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    let message_id = params
        .get("messageId")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidParams { message: "messageId is required".into() })?;
    let record = handlers.inbox.get(message_id).await?;
    Ok(record_to_full_json(&record))
}

async fn handle_inbox_clear(_params: Value, handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    let cleared = handlers.inbox.clear().await;
    Ok(json!({ "cleared": cleared }))
}

async fn handle_address_book_save(params: Value, handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    let alias = params
        .get("alias")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidParams { message: "alias is required".into() })?;
    let jid = params
        .get("jid")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidParams { message: "jid is required".into() })?;
    let outcome = handlers.address_book.save(alias, jid).await?;
    Ok(json!({ "updated": outcome == crate::address_book::SaveOutcome::Updated }))
}

async fn handle_address_book_query(params: Value, handlers: Arc<Handlers>) -> Result<Value, BridgeError> {
    let term = params
        .get("term")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::InvalidParams { message: "term is required".into() })?;
    let limit = params.get("limit").and_then(Value::as_u64).map(|n| n as usize);
    let matches = handlers.address_book.query(term, limit).await;
    Ok(json!({
        "matches": matches.iter().map(|m| json!({
            "alias": m.alias, "jid": m.jid, "score": m.score,
        })).collect::<Vec<_>>()
    }))
}

/// Truncates `body` to at most `max_chars` Unicode scalar values (never a
/// partial multi-byte character, unlike a byte-offset slice).
fn truncate_chars(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

fn record_to_preview_json(record: &crate::inbox::InboxRecord) -> Value {
    json!({
        "id": record.uuid,
        "from": record.from_jid,
        "preview": truncate_chars(&record.body, 50),
        "timestamp": record.ts,
    })
}

fn record_to_full_json(record: &crate::inbox::InboxRecord) -> Value {
    json!({
        "id": record.uuid,
        "from": record.from_jid,
        "body": record.body,
        "timestamp": record.ts,
    })
}
