mod address_book;
mod backoff;
mod bridge;
mod config;
mod connection;
mod converters;
mod dispatcher;
mod error;
mod inbox;
mod xmpp;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::address_book::AddressBook;
use crate::bridge::{Bridge, BridgeConfig};
use crate::config::Config;
use crate::connection::ConnectionStateMachine;
use crate::dispatcher::{Dispatcher, Handlers};
use crate::inbox::Inbox;

/// Maximum consecutive transient reconnection failures before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 20;

/// Drain deadline for `stop()`: how long the shutdown path waits for
/// in-flight queue work before forcing background tasks down (§5).
const STOP_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

fn print_help() {
    println!(
        "\
xmpp-tool-bridge v{}

A bidirectional bridge between an XMPP session and a JSON-RPC
tool-invocation transport.

USAGE:
    xmpp-tool-bridge [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/bridge.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG          Log level filter for tracing
                      (e.g. debug, xmpp_tool_bridge=debug,warn)
    XMPP_USER         XMPP account JID for client-mode connection
    XMPP_PASSWORD     XMPP account password (C2S mode) or component secret
    XMPP_SERVER       XMPP server hostname, overrides config if set
    XMPP_PORT         XMPP server port, overrides config if set

EXIT CODES:
    0    Clean shutdown (Ctrl-C)
    1    Configuration or fatal connection error
    2    Reconnection attempts exhausted

EXAMPLES:
    xmpp-tool-bridge                          # uses config/bridge.toml
    xmpp-tool-bridge /etc/bridge/config.toml  # custom config path
    RUST_LOG=debug xmpp-tool-bridge           # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("xmpp-tool-bridge v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // 1. Load configuration (§4.G step 1).
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config/bridge.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {config_path}: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone())),
        )
        .init();

    info!("xmpp-tool-bridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("XMPP mode: {}", config.server.mode_description());

    // 2. Load the address book (§4.G step 2).
    let address_book = Arc::new(AddressBook::load(config.address_book.path.clone()).await);
    let known_jids = address_book.known_jids().await;
    info!("Address book loaded, {} known JID(s)", known_jids.len());

    // 3. Construct the inbox and bridge queues (§4.G step 3).
    let inbox = Arc::new(Inbox::new(config.bridge.inbox_maxlen));
    let connection = Arc::new(ConnectionStateMachine::new());
    let bridge = Arc::new(Bridge::new(
        BridgeConfig {
            incoming_capacity: config.bridge.incoming_capacity,
            outgoing_capacity: config.bridge.outgoing_capacity,
            priority_capacity: config.bridge.priority_capacity,
        },
        inbox.clone(),
        connection.clone(),
    ));

    // 4. Wire the connection state machine to the bridge's worker loops
    //    (§4.G step 4).
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(config.bridge.incoming_capacity);
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(config.bridge.outgoing_capacity);

    let server_config = config.server.clone();
    let client_factory = move || xmpp::client_for(server_config.clone(), known_jids.clone());

    let mut connection_task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection.run(client_factory, event_tx, cmd_rx, MAX_RECONNECT_ATTEMPTS).await;
        })
    };

    let incoming_task = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge.run_incoming(event_rx).await;
        })
    };

    let outgoing_task = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge.run_outgoing(cmd_tx).await;
        })
    };

    // 5. Start the JSON-RPC stdio dispatcher (§4.G step 5).
    let dispatcher = Arc::new(Dispatcher::new(Handlers {
        address_book: address_book.clone(),
        inbox: inbox.clone(),
        bridge: bridge.clone(),
        connection: connection.reader(),
    }));
    let mut dispatcher_task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.run_stdio(tokio::io::stdin(), tokio::io::stdout()).await;
        })
    };

    // 6. Run until shutdown is requested, then drain cooperatively
    //    (§4.G step 6, §5: 5s stop() drain deadline).
    let exhausted = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, draining...");
            false
        }
        _ = &mut dispatcher_task => {
            info!("Stdio transport closed, shutting down");
            false
        }
        _ = &mut connection_task => {
            warn!("Connection state machine reached a terminal state");
            true
        }
    };

    dispatcher_task.abort();
    connection.cancel();
    bridge.cancel();

    let drain = tokio::time::timeout(STOP_DRAIN_DEADLINE, async {
        let _ = connection_task.await;
        let _ = incoming_task.await;
        let _ = outgoing_task.await;
    });

    if drain.await.is_err() {
        warn!("Drain deadline exceeded, exiting anyway");
    }

    if exhausted {
        std::process::exit(2);
    }

    Ok(())
}
