use serde::Deserialize;
use std::path::PathBuf;

use crate::converters::bare_jid;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub address_book: AddressBookConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub mode: ConnectionMode,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConnectionMode {
    Component {
        component_domain: String,
        /// Supports ${ENV_VAR} substitution
        component_secret: String,
    },
    Client {
        /// Bot JID, e.g. "bot@example.com"
        jid: String,
        /// Supports ${ENV_VAR} substitution
        password: String,
        #[serde(default = "default_resource")]
        resource: String,
        /// Set to false for self-signed certs (dev servers)
        #[serde(default = "default_tls_verify")]
        tls_verify: bool,
    },
}

fn default_resource() -> String {
    "tool-bridge".to_string()
}

fn default_tls_verify() -> bool {
    true
}

/// Sizing knobs for the two-queue bridge (§4.E) and the inbox (§4.C).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeConfig {
    pub incoming_capacity: usize,
    pub outgoing_capacity: usize,
    pub priority_capacity: usize,
    pub inbox_maxlen: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            incoming_capacity: 1000,
            outgoing_capacity: 1000,
            priority_capacity: 100,
            inbox_maxlen: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AddressBookConfig {
    pub path: PathBuf,
}

impl Default for AddressBookConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/address_book.json"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "xmpp_tool_bridge=debug,tokio=warn".
    /// Overridden at runtime by `RUST_LOG` when that env var is set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Human-readable description of the connection mode
    pub fn mode_description(&self) -> String {
        match &self.mode {
            ConnectionMode::Component { component_domain, .. } => {
                format!("component ({component_domain})")
            }
            ConnectionMode::Client { jid, .. } => {
                format!("C2S client ({jid})")
            }
        }
    }

    /// Whether TLS certificate verification is enabled.
    ///
    /// Returns the `tls_verify` setting from client mode, or `true` (default)
    /// for component mode.
    pub fn tls_verify(&self) -> bool {
        match &self.mode {
            ConnectionMode::Client { tls_verify, .. } => *tls_verify,
            ConnectionMode::Component { .. } => true,
        }
    }

    /// Returns the bridge's own XMPP domain.
    ///
    /// - Component mode: the component domain (e.g. "bridge.localhost")
    /// - Client mode: the domain part of the JID (e.g. "localhost" from "bot@localhost")
    pub fn domain(&self) -> &str {
        match &self.mode {
            ConnectionMode::Component {
                component_domain, ..
            } => component_domain.as_str(),
            ConnectionMode::Client { jid, .. } => {
                jid.split('@').nth(1).unwrap_or(jid.as_str())
            }
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${XMPP_PASSWORD}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Checks whether `jid`'s bare domain matches the bridge's own domain.
    /// Used to decide whether an inbound stanza originates from the bridge's
    /// own server, the one case the Non-goals still require distinguishing
    /// (everything else is left to the address book / allowlist at the
    /// dispatcher layer, not this config).
    pub fn is_own_domain(&self, jid: &str) -> bool {
        let bare = bare_jid(jid);
        let domain = bare.split('@').nth(1).unwrap_or(bare);
        domain == self.server.domain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_config() -> Config {
        Config {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 5222,
                mode: ConnectionMode::Client {
                    jid: "bot@localhost".to_string(),
                    password: "pass".to_string(),
                    resource: "tool-bridge".to_string(),
                    tls_verify: false,
                },
            },
            bridge: BridgeConfig::default(),
            address_book: AddressBookConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    // ── mode_description tests ──────────────────────────

    #[test]
    fn test_mode_description_client() {
        let config = client_config();
        assert_eq!(
            config.server.mode_description(),
            "C2S client (bot@localhost)"
        );
    }

    #[test]
    fn test_mode_description_component() {
        let server = ServerConfig {
            host: "localhost".to_string(),
            port: 5275,
            mode: ConnectionMode::Component {
                component_domain: "bridge.localhost".to_string(),
                component_secret: "secret".to_string(),
            },
        };
        assert_eq!(server.mode_description(), "component (bridge.localhost)");
    }

    // ── domain() tests ──────────────────────────────────

    #[test]
    fn test_domain_client_mode() {
        let config = client_config();
        assert_eq!(config.server.domain(), "localhost");
    }

    #[test]
    fn test_domain_component_mode() {
        let server = ServerConfig {
            host: "localhost".to_string(),
            port: 5275,
            mode: ConnectionMode::Component {
                component_domain: "bridge.example.com".to_string(),
                component_secret: "secret".to_string(),
            },
        };
        assert_eq!(server.domain(), "bridge.example.com");
    }

    // ── is_own_domain() tests ───────────────────────────

    #[test]
    fn test_is_own_domain_matches() {
        let config = client_config();
        assert!(config.is_own_domain("alice@localhost"));
        assert!(config.is_own_domain("alice@localhost/mobile"));
    }

    #[test]
    fn test_is_own_domain_rejects_foreign() {
        let config = client_config();
        assert!(!config.is_own_domain("hacker@evil.com"));
        assert!(!config.is_own_domain("user@other.org/res"));
    }

    #[test]
    fn test_is_own_domain_component_mode() {
        let mut config = client_config();
        config.server = ServerConfig {
            host: "localhost".to_string(),
            port: 5275,
            mode: ConnectionMode::Component {
                component_domain: "bridge.localhost".to_string(),
                component_secret: "secret".to_string(),
            },
        };
        assert!(config.is_own_domain("user@bridge.localhost"));
        assert!(!config.is_own_domain("user@localhost"));
    }

    // ── BridgeConfig/AddressBookConfig/LoggingConfig defaults ──

    #[test]
    fn test_bridge_config_defaults() {
        let b = BridgeConfig::default();
        assert_eq!(b.incoming_capacity, 1000);
        assert_eq!(b.outgoing_capacity, 1000);
        assert_eq!(b.priority_capacity, 100);
        assert_eq!(b.inbox_maxlen, 500);
    }

    #[test]
    fn test_logging_config_default_filter() {
        assert_eq!(LoggingConfig::default().filter, "info");
    }

    #[test]
    fn test_load_expands_env_and_parses_bridge_section() {
        std::env::set_var("TEST_TOOL_BRIDGE_SECRET", "s3cr3t");
        let dir = std::env::temp_dir();
        let path = dir.join("tool_bridge_test_config.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            host = "localhost"
            port = 5275
            mode = "component"
            component_domain = "bridge.localhost"
            component_secret = "${TEST_TOOL_BRIDGE_SECRET}"

            [bridge]
            incoming_capacity = 50
            outgoing_capacity = 50
            priority_capacity = 10
            inbox_maxlen = 20
            "#,
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.bridge.incoming_capacity, 50);
        assert_eq!(config.bridge.inbox_maxlen, 20);
        match config.server.mode {
            ConnectionMode::Component { component_secret, .. } => {
                assert_eq!(component_secret, "s3cr3t");
            }
            _ => panic!("expected component mode"),
        }

        std::fs::remove_file(&path).ok();
    }
}
