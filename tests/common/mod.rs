//! Shared harness for integration and load testing: a real relay on an
//! ephemeral port plus real agents connected over WebSocket.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hub_relay::agent::{handler_fn, Agent, HandlerError};
use hub_relay::config::RelayConfig;
use hub_relay::directory::{ChannelRecord, Directory, IdentityRecord, MemoryIdentityStore};
use hub_relay::http::RelayServer;
use hub_relay::lifecycle::Shutdown;
use hub_relay::protocol::{HttpRequestContent, HttpResponseContent};
use hub_relay::session::{Session, SessionId, SessionRegistry};
use tokio::net::TcpListener;

pub const PASSWORD: &str = "correct horse";

pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<MemoryIdentityStore>,
    pub shutdown: Shutdown,
    pub connector_path: String,
}

impl TestRelay {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn connector_url(&self) -> String {
        format!("ws://{}{}", self.addr, self.connector_path)
    }
}

/// Identity `alice` with default channel `home`, which `bob` may address,
/// plus a `garage` channel reachable by access token.
pub fn default_identities() -> MemoryIdentityStore {
    let store = MemoryIdentityStore::new();
    store.insert(
        "alice",
        IdentityRecord::with_password(PASSWORD)
            .with_channel("home", ChannelRecord::default_channel().allow("bob"))
            .with_channel("garage", ChannelRecord::default().with_access_token("garage-token")),
    );
    store.insert("bob", IdentityRecord::with_password(PASSWORD));
    store.insert("carol", IdentityRecord::with_password(PASSWORD));
    store.insert(
        "mallory",
        IdentityRecord::with_password(PASSWORD)
            .with_channel("home", ChannelRecord::default_channel())
            .locked(),
    );
    store
}

/// Start a relay with the default identities. `tweak` adjusts the config.
pub async fn start_relay(tweak: impl FnOnce(&mut RelayConfig)) -> TestRelay {
    let mut config = RelayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    tweak(&mut config);

    let store = Arc::new(default_identities());
    let directory = Arc::new(Directory::new(store.clone()).with_cache(false));
    let connector_path = config.listener.connector_path.clone();

    let server = RelayServer::with_directory(config, directory);
    let registry = server.registry();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    TestRelay {
        addr,
        registry,
        store,
        shutdown,
        connector_path,
    }
}

/// Connect an agent for `identity` / `channel` served by `f`. Trigger the
/// returned shutdown to disconnect it.
pub fn spawn_agent<F, Fut>(relay: &TestRelay, identity: &str, password: &str, channel: Option<&str>, f: F) -> Shutdown
where
    F: Fn(HttpRequestContent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponseContent, HandlerError>> + Send + 'static,
{
    let mut config = RelayConfig::default().agent;
    config.relay_url = relay.connector_url();
    config.identity = identity.to_string();
    config.password = password.to_string();
    config.channel = channel.map(str::to_string);
    config.reconnect_base_ms = 50;
    config.reconnect_max_ms = 200;

    let agent = Agent::new(config, handler_fn(f));
    let shutdown = Shutdown::new();
    let agent_shutdown = shutdown.subscribe();
    tokio::spawn(async move { agent.run(agent_shutdown).await });
    shutdown
}

/// Wait until a session other than `previous` serves `identity/channel`.
pub async fn wait_for_session(
    registry: &SessionRegistry,
    identity: &str,
    channel: &str,
    previous: Option<SessionId>,
) -> Arc<Session> {
    for _ in 0..200 {
        if let Ok(session) = registry.lookup(identity, Some(channel)).await {
            if Some(session.id()) != previous {
                return session;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no session for {identity}/{channel}");
}

/// Wait until `session` has `count` calls in flight.
pub async fn wait_for_pending(session: &Session, count: usize) {
    for _ in 0..200 {
        if session.pending().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} pending calls, found {}", session.pending().len());
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn ok(body: impl Into<Vec<u8>>) -> Result<HttpResponseContent, HandlerError> {
    Ok(HttpResponseContent::new(200).with_body(body))
}
