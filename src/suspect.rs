//! Per-request context and verdict types.
//!
//! A `Suspect` carries everything the daemon knows about one policy query:
//! the attribute map exactly as Postfix sent it, plus tags written by
//! plugins while the chain runs. The attribute map is never modified after
//! construction; tags are where plugins leave their traces, most
//! importantly the append-only decision log.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use thiserror::Error;

/// Policy actions understood by Postfix, see `man 5 access`. `Dunno` means
/// "no opinion, ask the next plugin".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    Reject,
    Defer,
    DeferIfReject,
    DeferIfPermit,
    Ok,
    #[default]
    Dunno,
    Discard,
    Filter,
    Hold,
    Prepend,
    Redirect,
    Warn,
}

#[derive(Debug, Error)]
#[error("unknown policy action '{0}'")]
pub struct UnknownAction(pub String);

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Reject => "reject",
            Action::Defer => "defer",
            Action::DeferIfReject => "defer_if_reject",
            Action::DeferIfPermit => "defer_if_permit",
            Action::Ok => "ok",
            Action::Dunno => "dunno",
            Action::Discard => "discard",
            Action::Filter => "filter",
            Action::Hold => "hold",
            Action::Prepend => "prepend",
            Action::Redirect => "redirect",
            Action::Warn => "warn",
        }
    }

    /// Normalize a raw plugin return value: trim, lowercase, and map
    /// anything outside the action set (including absent values) to
    /// `Dunno`.
    pub fn normalize(raw: Option<&str>) -> Action {
        let Some(raw) = raw else {
            return Action::Dunno;
        };
        match raw.parse() {
            Ok(action) => action,
            Err(UnknownAction(value)) => {
                tracing::warn!(value, "unknown action value, treating as dunno");
                Action::Dunno
            }
        }
    }
}

impl std::str::FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Action::Reject),
            "defer" => Ok(Action::Defer),
            "defer_if_reject" => Ok(Action::DeferIfReject),
            "defer_if_permit" => Ok(Action::DeferIfPermit),
            "ok" => Ok(Action::Ok),
            "dunno" => Ok(Action::Dunno),
            "discard" => Ok(Action::Discard),
            "filter" => Ok(Action::Filter),
            "hold" => Ok(Action::Hold),
            "prepend" => Ok(Action::Prepend),
            "redirect" => Ok(Action::Redirect),
            "warn" => Ok(Action::Warn),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final answer for one session: an action plus an optional free-form
/// argument appended after it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Verdict {
    pub action: Action,
    pub argument: Option<String>,
}

impl Verdict {
    pub fn new(action: Action) -> Self {
        Verdict {
            action,
            argument: None,
        }
    }

    pub fn with_argument(action: Action, argument: impl Into<String>) -> Self {
        Verdict {
            action,
            argument: Some(argument.into()),
        }
    }
}

/// Renders the wire form: `action` alone, or `action argument` when the
/// argument is non-blank.
impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.argument.as_deref().map(str::trim) {
            Some(arg) if !arg.is_empty() => write!(f, "{} {}", self.action, arg),
            _ => write!(f, "{}", self.action),
        }
    }
}

/// One chain step: which plugin answered, and what it said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub plugin: String,
    pub action: Action,
}

/// Tags attached to a suspect while the chain runs. Well-known tags are
/// typed fields; anything plugin-specific goes into `extra`.
#[derive(Debug, Default)]
pub struct Tags {
    /// Append-only log of plugin decisions, in chain order.
    pub decisions: Vec<Decision>,
    /// Total chain wall-clock time, formatted `%.4f` seconds.
    pub scantime: Option<String>,
    /// Local port the query arrived on.
    pub incomingport: Option<u16>,
    pub extra: HashMap<String, serde_json::Value>,
}

/// The suspect represents one policy query. Plugins get a mutable borrow
/// during `examine` and may record tags; the attribute map itself stays as
/// delivered by the MTA.
#[derive(Debug)]
pub struct Suspect {
    values: IndexMap<String, String>,
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,
}

impl Suspect {
    pub fn new(values: IndexMap<String, String>) -> Self {
        Suspect {
            values,
            tags: Tags::default(),
            timestamp: Utc::now(),
        }
    }

    /// One of the Postfix-supplied attribute values.
    pub fn get_value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    /// Shorthand for the protocol stage (`RCPT`, `DATA`, ...).
    pub fn get_stage(&self) -> Option<&str> {
        self.get_value("protocol_state")
    }

    pub fn get_tag(&self, key: &str) -> Option<&serde_json::Value> {
        self.tags.extra.get(key)
    }

    pub fn set_tag(&mut self, key: &str, value: serde_json::Value) {
        self.tags.extra.insert(key.to_string(), value);
    }

    pub fn values(&self) -> &IndexMap<String, String> {
        &self.values
    }
}

impl fmt::Display for Suspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Suspect stage={} decisions={}",
            self.get_stage().unwrap_or("-"),
            self.tags.decisions.len()
        )
    }
}

/// Strip the `<...>` brackets (or a `scheme:` prefix) from an envelope
/// address literal.
pub fn strip_address(address: &str) -> &str {
    if let Some(start) = address.find('<') {
        let inner = &address[start + 1..];
        let end = inner.find('>').unwrap_or(inner.len());
        inner[..end].trim()
    } else if let Some(colon) = address.find(':') {
        address[colon + 1..].trim()
    } else {
        address.trim()
    }
}

#[derive(Debug, Error)]
#[error("invalid email address: '{0}'")]
pub struct InvalidAddress(pub String);

/// The domain part of an address: everything right of the last `@`.
pub fn extract_domain(address: &str) -> Result<&str, InvalidAddress> {
    match address.rsplit_once('@') {
        Some((_, domain)) => Ok(domain),
        None => Err(InvalidAddress(address.to_string())),
    }
}
