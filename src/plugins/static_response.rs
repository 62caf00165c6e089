use std::sync::Arc;

use crate::config::{Config, ConfigVar};
use crate::suspect::{Action, Suspect, Verdict};

use super::Plugin;

static REQUIRED_VARS: &[ConfigVar] = &[
    ConfigVar {
        name: "action",
        section: None,
        description: "action returned for every suspect (any policy action, e.g. dunno, reject, defer)",
        default: "dunno",
        validator: Some(|v| v.parse::<Action>().is_ok()),
    },
    ConfigVar {
        name: "message",
        section: None,
        description: "optional text appended to the action",
        default: "",
        validator: None,
    },
];

/// Answers every query with a configured action. Useful as a chain
/// terminator (`ok`/`reject` catch-all) and for exercising per-port chains.
pub struct StaticResponse {
    section: String,
}

impl StaticResponse {
    pub fn construct(
        _config: &Config,
        section: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Plugin>> {
        Ok(Arc::new(StaticResponse {
            section: section.unwrap_or("StaticResponse").to_string(),
        }))
    }
}

#[async_trait::async_trait]
impl Plugin for StaticResponse {
    fn name(&self) -> &str {
        "StaticResponse"
    }

    fn section(&self) -> &str {
        &self.section
    }

    fn required_vars(&self) -> &[ConfigVar] {
        REQUIRED_VARS
    }

    async fn examine(&self, _suspect: &mut Suspect, config: &Config) -> anyhow::Result<Verdict> {
        let action = Action::normalize(config.get_opt(&self.section, "action"));
        let message = config.get_opt(&self.section, "message").unwrap_or("");
        if message.trim().is_empty() {
            Ok(Verdict::new(action))
        } else {
            Ok(Verdict::with_argument(action, message))
        }
    }
}
