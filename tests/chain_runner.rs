//! Chain runner properties: short-circuit, decision log, action
//! normalization and per-plugin failure isolation.

mod common;

use std::sync::Arc;

use common::Scripted;
use postguard::config::Config;
use postguard::plugins::Plugin;
use postguard::session::run_plugins;
use postguard::suspect::{Action, Suspect};

fn suspect() -> Suspect {
    let mut values = indexmap::IndexMap::new();
    values.insert("sender".to_string(), "a@b".to_string());
    values.insert("recipient".to_string(), "c@d".to_string());
    Suspect::new(values)
}

#[tokio::test]
async fn decision_log_matches_invocations_in_order() {
    let p1 = Scripted::answering("first", "dunno");
    let p2 = Scripted::answering("second", "dunno");
    let p3 = Scripted::answering("third", "dunno");
    let chain: Vec<Arc<dyn Plugin>> = vec![p1, p2, p3];
    let mut suspect = suspect();

    let verdict = run_plugins(&mut suspect, &chain, &Config::new()).await;
    assert_eq!(verdict.action, Action::Dunno);

    let log: Vec<(&str, Action)> = suspect
        .tags
        .decisions
        .iter()
        .map(|d| (d.plugin.as_str(), d.action))
        .collect();
    assert_eq!(
        log,
        vec![
            ("first", Action::Dunno),
            ("second", Action::Dunno),
            ("third", Action::Dunno)
        ]
    );
}

#[tokio::test]
async fn short_circuit_leaves_later_plugins_out_of_the_log() {
    let deciding = Scripted::answering("deciding", "DEFER");
    let never = Scripted::answering("never", "reject");
    let chain: Vec<Arc<dyn Plugin>> =
        vec![Scripted::answering("quiet", "dunno"), deciding, never.clone()];
    let mut suspect = suspect();

    let verdict = run_plugins(&mut suspect, &chain, &Config::new()).await;
    assert_eq!(verdict.action, Action::Defer);
    assert_eq!(suspect.tags.decisions.len(), 2);
    assert_eq!(never.calls(), 0);
}

#[tokio::test]
async fn raw_actions_are_normalized() {
    let chain: Vec<Arc<dyn Plugin>> = vec![Scripted::answering("shouty", "  REJECT  ")];
    let mut suspect = suspect();
    let verdict = run_plugins(&mut suspect, &chain, &Config::new()).await;
    assert_eq!(verdict.action, Action::Reject);
    assert_eq!(suspect.tags.decisions[0].action, Action::Reject);
}

#[tokio::test]
async fn unknown_action_value_becomes_dunno_and_chain_continues() {
    let next = Scripted::answering("next", "hold");
    let chain: Vec<Arc<dyn Plugin>> =
        vec![Scripted::answering("weird", "bounce-it"), next.clone()];
    let mut suspect = suspect();
    let verdict = run_plugins(&mut suspect, &chain, &Config::new()).await;
    assert_eq!(verdict.action, Action::Hold);
    assert_eq!(next.calls(), 1);
    assert_eq!(suspect.tags.decisions[0].action, Action::Dunno);
}

#[tokio::test]
async fn failing_plugin_is_skipped_and_logged_out_of_the_decisions() {
    let broken = Scripted::failing("broken");
    let after = Scripted::answering("after", "ok");
    let chain: Vec<Arc<dyn Plugin>> = vec![broken.clone(), after.clone()];
    let mut suspect = suspect();

    let verdict = run_plugins(&mut suspect, &chain, &Config::new()).await;
    assert_eq!(verdict.action, Action::Ok);
    assert_eq!(broken.calls(), 1);
    // only the successful invocation shows up in the log
    assert_eq!(suspect.tags.decisions.len(), 1);
    assert_eq!(suspect.tags.decisions[0].plugin, "after");
}

#[tokio::test]
async fn chain_records_scantime_tag() {
    let chain: Vec<Arc<dyn Plugin>> = vec![Scripted::answering("quick", "dunno")];
    let mut suspect = suspect();
    run_plugins(&mut suspect, &chain, &Config::new()).await;

    let scantime = suspect.tags.scantime.as_deref().expect("scantime set");
    let parsed: f64 = scantime.parse().expect("scantime parses as float");
    assert!(parsed >= 0.0);
    // formatted with four decimal places
    assert_eq!(scantime.split('.').nth(1).map(|d| d.len()), Some(4));
}

#[tokio::test]
async fn empty_chain_returns_dunno() {
    let chain: Vec<Arc<dyn Plugin>> = Vec::new();
    let mut suspect = suspect();
    let verdict = run_plugins(&mut suspect, &chain, &Config::new()).await;
    assert_eq!(verdict.action, Action::Dunno);
    assert!(verdict.argument.is_none());
    assert!(suspect.tags.decisions.is_empty());
}
