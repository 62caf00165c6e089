//! Plugin infrastructure for postguard.
//!
//! A plugin examines one suspect and returns a verdict; `dunno` passes the
//! decision on to the next plugin in the chain. Plugins are addressed by
//! structured names (`postguard.plugins.StaticResponse`) resolved through a
//! static registry, with short aliases supplied by the `[PluginAlias]`
//! configuration section.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::config::{Config, ConfigVar};
use crate::suspect::{Suspect, Verdict};

pub mod static_response;

use self::static_response::StaticResponse;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid plugin syntax: '{0}'")]
    InvalidSpec(String),
    #[error("no such plugin: '{0}'")]
    UnknownPlugin(String),
    #[error("cannot set config section '{section}': plugin {plugin} does not support config override")]
    SectionOverrideUnsupported { plugin: String, section: String },
    #[error("could not load plugin {plugin}: {source}")]
    Construct {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Capability set every plugin provides. There is no shared state between
/// invocations; `examine` may be called from any worker concurrently.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Short name recorded in the suspect's decision log.
    fn name(&self) -> &str;

    /// Configuration section this instance reads from.
    fn section(&self) -> &str;

    /// Options this plugin understands; defaults are propagated into the
    /// configuration after loading.
    fn required_vars(&self) -> &[ConfigVar] {
        &[]
    }

    /// Inspect the suspect and answer. Errors are caught by the chain
    /// runner, logged, and treated as `dunno`.
    async fn examine(&self, suspect: &mut Suspect, config: &Config) -> anyhow::Result<Verdict>;

    /// Self-test for `lint`: by default, verify the declared options.
    fn lint(&self, config: &Config) -> bool {
        config.check_vars(self.required_vars(), self.section())
    }
}

type Constructor = fn(&Config, Option<&str>) -> anyhow::Result<Arc<dyn Plugin>>;

struct PluginEntry {
    construct: Constructor,
    /// Whether the constructor honors a `name(section)` override.
    accepts_section: bool,
}

static REGISTRY: Lazy<HashMap<&'static str, PluginEntry>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, PluginEntry> = HashMap::new();
    map.insert(
        "postguard.plugins.StaticResponse",
        PluginEntry {
            construct: StaticResponse::construct,
            accepts_section: true,
        },
    );
    map
});

static PLUGIN_SPEC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z0-9._-]+)(?:\((?P<section>[A-Za-z0-9._]+)\))?$").unwrap()
});

/// Split one plugin spec entry into its name and optional section override.
pub fn parse_plugin_spec(entry: &str) -> Result<(&str, Option<&str>), PluginError> {
    let caps = PLUGIN_SPEC_RE
        .captures(entry)
        .ok_or_else(|| PluginError::InvalidSpec(entry.to_string()))?;
    let name = caps.name("name").map(|m| m.as_str()).unwrap_or_default();
    let section = caps.name("section").map(|m| m.as_str());
    Ok((name, section))
}

/// Resolve a short name through `[PluginAlias]`; names without an alias are
/// returned unchanged.
pub fn resolve_alias<'a>(config: &'a Config, name: &'a str) -> &'a str {
    config.get_opt("PluginAlias", name).unwrap_or(name)
}

/// Instantiate a single plugin by structured name.
pub fn load_plugin(
    config: &Config,
    structured_name: &str,
    section: Option<&str>,
) -> Result<Arc<dyn Plugin>, PluginError> {
    let entry = REGISTRY
        .get(structured_name)
        .ok_or_else(|| PluginError::UnknownPlugin(structured_name.to_string()))?;
    if section.is_some() && !entry.accepts_section {
        return Err(PluginError::SectionOverrideUnsupported {
            plugin: structured_name.to_string(),
            section: section.unwrap_or_default().to_string(),
        });
    }
    (entry.construct)(config, section).map_err(|source| PluginError::Construct {
        plugin: structured_name.to_string(),
        source,
    })
}

/// Load every plugin named in a comma-separated spec string. Failures are
/// logged and collected; the boolean reports whether all entries loaded.
pub fn load_all(config: &Config, spec: &str) -> (Vec<Arc<dyn Plugin>>, bool) {
    let mut loaded = Vec::new();
    let mut all_ok = true;
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, section) = match parse_plugin_spec(entry) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::error!(%err, "invalid plugin syntax");
                all_ok = false;
                continue;
            }
        };
        let structured_name = resolve_alias(config, name);
        match load_plugin(config, structured_name, section) {
            Ok(plugin) => {
                tracing::debug!(plugin = structured_name, "loaded plugin");
                loaded.push(plugin);
            }
            Err(err) => {
                tracing::error!(plugin = structured_name, %err, "could not load plugin");
                all_ok = false;
            }
        }
    }
    (loaded, all_ok)
}

/// Propagate every loaded plugin's declared defaults into the
/// configuration, keyed by the plugin's (possibly overridden) section.
pub fn propagate_plugin_defaults(config: &mut Config, plugins: &[Arc<dyn Plugin>]) {
    for plugin in plugins {
        config.propagate_defaults(plugin.required_vars(), plugin.section());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspect::Action;

    #[test]
    fn parses_plain_and_sectioned_specs() {
        assert_eq!(
            parse_plugin_spec("postguard.plugins.StaticResponse").unwrap(),
            ("postguard.plugins.StaticResponse", None)
        );
        assert_eq!(
            parse_plugin_spec("static(Greylist)").unwrap(),
            ("static", Some("Greylist"))
        );
        assert!(parse_plugin_spec("bad name").is_err());
        assert!(parse_plugin_spec("name(sec)x").is_err());
    }

    #[test]
    fn alias_resolution_prefers_alias_table() {
        let mut cfg = Config::new();
        cfg.set("PluginAlias", "static", "postguard.plugins.StaticResponse");
        assert_eq!(
            resolve_alias(&cfg, "static"),
            "postguard.plugins.StaticResponse"
        );
        assert_eq!(resolve_alias(&cfg, "other"), "other");
    }

    #[test]
    fn load_all_collects_failures() {
        let mut cfg = Config::new();
        cfg.set("PluginAlias", "static", "postguard.plugins.StaticResponse");
        let (plugins, all_ok) = load_all(&cfg, "static, no.such.Plugin");
        assert_eq!(plugins.len(), 1);
        assert!(!all_ok);

        let (plugins, all_ok) = load_all(&cfg, "static,static(Custom)");
        assert_eq!(plugins.len(), 2);
        assert!(all_ok);
        assert_eq!(plugins[1].section(), "Custom");
    }

    #[test]
    fn empty_spec_loads_nothing() {
        let cfg = Config::new();
        let (plugins, all_ok) = load_all(&cfg, "");
        assert!(plugins.is_empty());
        assert!(all_ok);
    }

    #[test]
    fn plugin_defaults_land_in_override_section() {
        let mut cfg = Config::new();
        cfg.set("PluginAlias", "static", "postguard.plugins.StaticResponse");
        let (plugins, all_ok) = load_all(&cfg, "static(Custom)");
        assert!(all_ok);
        propagate_plugin_defaults(&mut cfg, &plugins);
        assert_eq!(cfg.get("Custom", "action").unwrap(), "dunno");
        assert!(!cfg.has_section("StaticResponse"));
    }

    #[tokio::test]
    async fn loaded_plugin_examines_with_config() {
        let mut cfg = Config::new();
        cfg.set("StaticResponse", "action", "reject");
        cfg.set("StaticResponse", "message", "no thanks");
        let plugin = load_plugin(&cfg, "postguard.plugins.StaticResponse", None).unwrap();
        let mut suspect = Suspect::new(Default::default());
        let verdict = plugin.examine(&mut suspect, &cfg).await.unwrap();
        assert_eq!(verdict.action, Action::Reject);
        assert_eq!(verdict.argument.as_deref(), Some("no thanks"));
    }
}
