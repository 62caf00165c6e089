//! One policy session: request parsing, the address-compliance gate, chain
//! execution and the wire response.
//!
//! Postfix sends a block of `key=value` lines terminated by an empty line
//! and expects exactly one `action=<verdict>` line back. Whatever happens
//! inside the session (protocol error, plugin panic path, bad addresses),
//! an answer is always written before the connection is closed; the
//! fallback answer is `dunno`.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::addrcheck::{self, AddressChecker};
use crate::config::Config;
use crate::plugins::Plugin;
use crate::suspect::{strip_address, Action, Decision, Suspect, Verdict};

/// Message used when queued sessions are answered during pool shutdown.
pub const UNAVAILABLE_MESSAGE: &str = "Temporarily unavailable... Please try again later.";

const DEFAULT_COMPLIANCE_MESSAGE: &str = "invalid sender or recipient address";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid protocol line: '{0}'")]
    MalformedLine(String),
    #[error("connection closed before request was complete")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a finished session reports back to its worker for statistics.
#[derive(Debug, Clone, Copy)]
pub struct SessionOutcome {
    pub action: Action,
    pub scantime: f64,
}

/// Handles a single accepted connection.
pub struct SessionHandler {
    stream: TcpStream,
    config: Arc<Config>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    checker: AddressChecker,
}

impl SessionHandler {
    pub fn new(
        stream: TcpStream,
        config: Arc<Config>,
        plugins: Arc<Vec<Arc<dyn Plugin>>>,
    ) -> Self {
        SessionHandler {
            stream,
            config,
            plugins,
            checker: addrcheck::installed(),
        }
    }

    /// Like [`SessionHandler::new`], with an explicit address checker
    /// instead of the process-wide one.
    pub fn with_checker(
        stream: TcpStream,
        config: Arc<Config>,
        plugins: Arc<Vec<Arc<dyn Plugin>>>,
        checker: AddressChecker,
    ) -> Self {
        SessionHandler {
            stream,
            config,
            plugins,
            checker,
        }
    }

    pub async fn handle(mut self) -> SessionOutcome {
        let peer = self.stream.peer_addr().ok();
        let local_port = self.stream.local_addr().ok().map(|addr| addr.port());
        tracing::debug!(?peer, "incoming policy connection");

        let start = Instant::now();
        let (read_half, mut write_half) = self.stream.split();
        let mut reader = BufReader::new(read_half);

        let verdict = match read_request(&mut reader).await {
            Ok(values) => {
                let mut suspect = Suspect::new(values);
                suspect.tags.incomingport = local_port;
                match check_address_compliance(&suspect, self.checker) {
                    Some((attribute, address)) => {
                        tracing::warn!(attribute, address, "address validation check failed");
                        compliance_verdict(&self.config)
                    }
                    None => {
                        let verdict = run_plugins(&mut suspect, &self.plugins, &self.config).await;
                        tracing::debug!(%suspect, "checks done");
                        verdict
                    }
                }
            }
            Err(err) => {
                tracing::error!(%err, "incoming request did not finish");
                Verdict::new(Action::Dunno)
            }
        };

        end_session(&mut write_half, &verdict).await;
        tracing::debug!(action = %verdict.action, "session finished");
        SessionOutcome {
            action: verdict.action,
            scantime: start.elapsed().as_secs_f64(),
        }
    }
}

/// Read one policy request: `key=value` lines up to the first empty line.
/// The first `=` splits key from value, so values may contain `=`.
pub async fn read_request<R>(reader: &mut R) -> Result<IndexMap<String, String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut values = IndexMap::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let stripped = line.trim_end();
        if stripped.is_empty() {
            return Ok(values);
        }
        match stripped.split_once('=') {
            Some((key, value)) => {
                values.insert(key.to_string(), value.to_string());
            }
            None => return Err(ProtocolError::MalformedLine(stripped.to_string())),
        }
    }
}

/// Run the plugin chain: strictly in order, stopping at the first answer
/// other than `dunno`. A failing plugin is logged and skipped. Records the
/// total chain duration in the suspect's `scantime` tag.
pub async fn run_plugins(
    suspect: &mut Suspect,
    plugins: &[Arc<dyn Plugin>],
    config: &Config,
) -> Verdict {
    let start = Instant::now();
    let mut verdict = Verdict::new(Action::Dunno);
    for plugin in plugins {
        let name = plugin.name().to_string();
        tracing::debug!(plugin = %name, "running plugin");
        match plugin.examine(suspect, config).await {
            Ok(result) => {
                suspect.tags.decisions.push(Decision {
                    plugin: name.clone(),
                    action: result.action,
                });
                tracing::debug!(plugin = %name, action = %result.action, argument = ?result.argument, "plugin answered");
                let decided = result.action != Action::Dunno;
                verdict = result;
                if decided {
                    tracing::debug!(
                        plugin = %name,
                        "plugin made a decision, not running any other plugins"
                    );
                    break;
                }
            }
            Err(err) => {
                tracing::error!(plugin = %name, error = ?err, "plugin failed");
            }
        }
    }
    suspect.tags.scantime = Some(format!("{:.4}", start.elapsed().as_secs_f64()));
    verdict
}

/// Validate `sender` and `recipient` attributes, if present. Empty
/// addresses (bounce sender `<>`) are not checked. Returns the first
/// offending attribute and its stripped address.
fn check_address_compliance(
    suspect: &Suspect,
    checker: AddressChecker,
) -> Option<(&'static str, String)> {
    for attribute in ["sender", "recipient"] {
        if let Some(raw) = suspect.get_value(attribute) {
            let address = strip_address(raw);
            if !address.is_empty() && !checker.valid(address) {
                return Some((attribute, address.to_string()));
            }
        }
    }
    None
}

/// The configured answer for an address-compliance failure. Anything other
/// than `defer`/`reject`/`discard` falls back to `defer`.
fn compliance_verdict(config: &Config) -> Verdict {
    let action = match config
        .get_opt("main", "address_compliance_fail_action")
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("reject") => Action::Reject,
        Some("discard") => Action::Discard,
        _ => Action::Defer,
    };
    let message = config
        .get_opt("main", "address_compliance_fail_message")
        .unwrap_or(DEFAULT_COMPLIANCE_MESSAGE);
    Verdict::with_argument(action, message)
}

/// Write the response line and half-close. Transport failures are logged;
/// the MTA retries the query on its own schedule.
pub async fn end_session<W>(writer: &mut W, verdict: &Verdict)
where
    W: AsyncWrite + Unpin,
{
    let payload = format!("action={}\n\n", verdict);
    if let Err(err) = writer.write_all(payload.as_bytes()).await {
        tracing::warn!(%err, "could not send policy response");
        return;
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

/// Defer a connection that will not get a full session, e.g. one drained
/// from the task queue during pool shutdown.
pub async fn defer_unavailable(stream: &mut TcpStream) {
    let verdict = Verdict::with_argument(Action::Defer, UNAVAILABLE_MESSAGE);
    end_session(stream, &verdict).await;
}
