use serde::Serialize;

/// The bridge's error taxonomy (§7). Each variant carries exactly the payload
/// its kind needs; `kind()` and `is_retriable()` are what callers (the
/// dispatcher, the reconnect loop, the outgoing worker) actually branch on.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeError {
    ParseError { message: String },
    InvalidRequest { message: String },
    MethodNotFound { method: String },
    InvalidParams { message: String },
    InvalidJid { jid: String },
    InvalidAlias { alias: String },
    UnknownAlias { alias: String },
    AmbiguousAlias { candidates: Vec<String> },
    Overloaded,
    Disconnected,
    FatalAuth { message: String },
    Timeout,
    Shutdown,
    NotFound { id: String },
    InternalError { message: String },
}

impl BridgeError {
    /// The taxonomy name, used verbatim as `data.kind` in JSON-RPC error
    /// responses and as the tag branched on by the reconnect loop.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::ParseError { .. } => "parse_error",
            BridgeError::InvalidRequest { .. } => "invalid_request",
            BridgeError::MethodNotFound { .. } => "method_not_found",
            BridgeError::InvalidParams { .. } => "invalid_params",
            BridgeError::InvalidJid { .. } => "invalid_jid",
            BridgeError::InvalidAlias { .. } => "invalid_alias",
            BridgeError::UnknownAlias { .. } => "unknown_alias",
            BridgeError::AmbiguousAlias { .. } => "ambiguous_alias",
            BridgeError::Overloaded => "overloaded",
            BridgeError::Disconnected => "disconnected",
            BridgeError::FatalAuth { .. } => "fatal_auth",
            BridgeError::Timeout => "timeout",
            BridgeError::Shutdown => "shutdown",
            BridgeError::NotFound { .. } => "not_found",
            BridgeError::InternalError { .. } => "internal_error",
        }
    }

    /// True only for the transient kinds the reconnect loop and outgoing
    /// worker retry on.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::Overloaded | BridgeError::Disconnected | BridgeError::Timeout
        )
    }

    /// The JSON-RPC 2.0 error code this kind maps to (§4.F, §7).
    pub fn rpc_code(&self) -> i64 {
        match self {
            BridgeError::ParseError { .. } => -32700,
            BridgeError::InvalidRequest { .. } => -32600,
            BridgeError::MethodNotFound { .. } => -32601,
            BridgeError::InvalidParams { .. } => -32602,
            _ => -32603,
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::ParseError { message } => write!(f, "parse error: {message}"),
            BridgeError::InvalidRequest { message } => write!(f, "invalid request: {message}"),
            BridgeError::MethodNotFound { method } => write!(f, "method not found: {method}"),
            BridgeError::InvalidParams { message } => write!(f, "invalid params: {message}"),
            BridgeError::InvalidJid { jid } => write!(f, "invalid JID: {jid}"),
            BridgeError::InvalidAlias { alias } => write!(f, "invalid alias: {alias}"),
            BridgeError::UnknownAlias { alias } => write!(f, "unknown alias: {alias}"),
            BridgeError::AmbiguousAlias { candidates } => {
                write!(f, "ambiguous alias, candidates: {candidates:?}")
            }
            BridgeError::Overloaded => write!(f, "overloaded"),
            BridgeError::Disconnected => write!(f, "disconnected"),
            BridgeError::FatalAuth { message } => write!(f, "fatal auth error: {message}"),
            BridgeError::Timeout => write!(f, "timeout"),
            BridgeError::Shutdown => write!(f, "shutdown"),
            BridgeError::NotFound { id } => write!(f, "not found: {id}"),
            BridgeError::InternalError { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for BridgeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_kinds() {
        assert!(BridgeError::Overloaded.is_retriable());
        assert!(BridgeError::Disconnected.is_retriable());
        assert!(BridgeError::Timeout.is_retriable());
    }

    #[test]
    fn test_non_retriable_kinds() {
        assert!(!BridgeError::Shutdown.is_retriable());
        assert!(!BridgeError::InvalidJid { jid: "x".into() }.is_retriable());
        assert!(!BridgeError::FatalAuth { message: "bad creds".into() }.is_retriable());
    }

    #[test]
    fn test_kind_names_match_taxonomy() {
        assert_eq!(BridgeError::Overloaded.kind(), "overloaded");
        assert_eq!(BridgeError::UnknownAlias { alias: "x".into() }.kind(), "unknown_alias");
        assert_eq!(
            BridgeError::AmbiguousAlias { candidates: vec![] }.kind(),
            "ambiguous_alias"
        );
    }

    #[test]
    fn test_rpc_code_mapping() {
        assert_eq!(BridgeError::ParseError { message: "x".into() }.rpc_code(), -32700);
        assert_eq!(BridgeError::InvalidParams { message: "x".into() }.rpc_code(), -32602);
        assert_eq!(BridgeError::Overloaded.rpc_code(), -32603);
    }
}
