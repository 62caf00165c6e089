//! Envelope address validation.
//!
//! Postfix hands over unquoted envelope addresses; before any plugin runs,
//! sender and recipient are checked against one of two predicates. The
//! `Default` checker allows exactly one `@`. `LazyLocalPart` tolerates `@`
//! inside the local part, which shows up with historic or broken senders.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::RwLock;

static DEFAULT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@]+@[^@]+$").unwrap());
static LAZY_LOCAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\x00-\x7f]+@[^@]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressChecker {
    #[default]
    Default,
    LazyLocalPart,
}

impl AddressChecker {
    /// Resolve a configured checker name. Unknown names fall back to
    /// `Default` with a warning.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Default" => AddressChecker::Default,
            "LazyLocalPart" => AddressChecker::LazyLocalPart,
            other => {
                tracing::warn!(
                    checker = other,
                    "unknown address_compliance_checker, using Default"
                );
                AddressChecker::Default
            }
        }
    }

    pub fn valid(&self, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        match self {
            AddressChecker::Default => DEFAULT_RE.is_match(address),
            AddressChecker::LazyLocalPart => LAZY_LOCAL_RE.is_match(address),
        }
    }
}

static INSTALLED: Lazy<RwLock<AddressChecker>> =
    Lazy::new(|| RwLock::new(AddressChecker::Default));

/// Select the process-wide checker. Called once at startup and again inside
/// each worker process before it serves sessions.
pub fn install(name: &str) {
    let checker = AddressChecker::from_name(name);
    tracing::info!(?checker, "address compliance checker selected");
    if let Ok(mut guard) = INSTALLED.write() {
        *guard = checker;
    }
}

/// The currently installed checker. Sessions copy this once at construction
/// so tests can inject a checker without touching process state.
pub fn installed() -> AddressChecker {
    INSTALLED.read().map(|g| *g).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_requires_single_at() {
        let c = AddressChecker::Default;
        assert!(c.valid("user@example.com"));
        assert!(c.valid("a@b"));
        assert!(!c.valid(""));
        assert!(!c.valid("a@@b"));
        assert!(!c.valid("user@foo@example.com"));
        assert!(!c.valid("no-at-sign"));
        assert!(!c.valid("@example.com"));
        assert!(!c.valid("user@"));
    }

    #[test]
    fn lazy_local_part_allows_inner_at() {
        let c = AddressChecker::LazyLocalPart;
        assert!(c.valid("user@example.com"));
        assert!(c.valid("foo@bar@example.com"));
        assert!(c.valid("\"odd\"@example.com"));
        assert!(!c.valid(""));
        assert!(!c.valid("user@"));
        // local part must stay 7-bit
        assert!(!c.valid("usér@example.com"));
    }

    #[test]
    fn unknown_name_falls_back_to_default() {
        assert_eq!(
            AddressChecker::from_name("NoSuchChecker"),
            AddressChecker::Default
        );
        assert_eq!(
            AddressChecker::from_name("LazyLocalPart"),
            AddressChecker::LazyLocalPart
        );
    }
}
