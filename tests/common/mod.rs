//! Shared helpers for the integration tests: scripted plugins with
//! observable call counts, and a thin TCP client for the policy protocol.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use postguard::config::{Config, ConfigVar};
use postguard::controller::ActivePool;
use postguard::plugins::Plugin;
use postguard::server::PolicyServer;
use postguard::stats::StatsKeeper;
use postguard::suspect::{Action, Suspect, Verdict};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A plugin whose answer is scripted by the test. Counts invocations so
/// short-circuit behavior is observable.
pub struct Scripted {
    name: String,
    raw_action: Option<&'static str>,
    argument: Option<&'static str>,
    fail: bool,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl Scripted {
    pub fn answering(name: &str, raw_action: &'static str) -> Arc<Self> {
        Arc::new(Scripted {
            name: name.to_string(),
            raw_action: Some(raw_action),
            argument: None,
            fail: false,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn answering_with(
        name: &str,
        raw_action: &'static str,
        argument: &'static str,
    ) -> Arc<Self> {
        Arc::new(Scripted {
            name: name.to_string(),
            raw_action: Some(raw_action),
            argument: Some(argument),
            fail: false,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Scripted {
            name: name.to_string(),
            raw_action: None,
            argument: None,
            fail: true,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn slow(name: &str, raw_action: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Scripted {
            name: name.to_string(),
            raw_action: Some(raw_action),
            argument: None,
            fail: false,
            delay: Some(delay),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait::async_trait]
impl Plugin for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn section(&self) -> &str {
        &self.name
    }

    fn required_vars(&self) -> &[ConfigVar] {
        &[]
    }

    async fn examine(&self, _suspect: &mut Suspect, _config: &Config) -> anyhow::Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("scripted failure in {}", self.name);
        }
        let action = Action::normalize(self.raw_action);
        Ok(match self.argument {
            Some(argument) => Verdict::with_argument(action, argument),
            None => Verdict::new(action),
        })
    }
}

/// Start a policy server on an ephemeral port that runs sessions inline
/// with the given chain.
pub async fn spawn_server(config: Config, plugins: Vec<Arc<dyn Plugin>>) -> PolicyServer {
    let stats = Arc::new(StatsKeeper::new());
    let pool = Arc::new(ActivePool::new(stats));
    PolicyServer::start("127.0.0.1", 0, Arc::new(config), Arc::new(plugins), pool)
        .await
        .expect("server should bind an ephemeral port")
}

/// Send one policy request and collect the full response (the server
/// closes the connection after answering).
pub async fn query(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("send request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    response
}

/// A connected client/server socket pair for driving sessions directly.
pub async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (server, _) = accepted.expect("accept");
    (connected.expect("connect"), server)
}
