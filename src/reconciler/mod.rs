//! Reconciliation core.
//!
//! Three loops drive the kernel towards the declared configuration: the
//! applier installs sets and rules, cleanup retracts resources the
//! configuration no longer references, and the rechecker detects external
//! drift and re-arms the applier. They coordinate through the repository,
//! the kernel state itself, and a shared LiveSets snapshot.

mod applier;
mod cleanup;
mod recheck;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::exec::Exec;
use crate::firewall::Firewall;
use crate::ipset::{IpSet, SetSpec};
use crate::repository::Repository;
use crate::shutdown::ShutdownToken;

pub(crate) use applier::Applier;
pub(crate) use cleanup::Cleanup;
pub(crate) use recheck::Recheck;

/// Every kernel object the daemon owns carries this prefix.
pub(crate) const SET_PREFIX: &str = "fc";

/// Set backing the configured allow networks. Not tracked as a bucket.
pub(crate) const ALLOW_NETWORKS_SET: &str = "fc-allow-networks";

pub(crate) const FILTER_TABLE: &str = "filter";
pub(crate) const FILTER_CHAIN: &str = "ipset-filter";
pub(crate) const CHAIN_POLICY: &str = "DROP";

pub(crate) const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Names reported by the last `ipset list -n`, shared across the loops.
/// Refreshing takes the write half; guards before set operations read.
pub(crate) type LiveSets = Arc<RwLock<HashSet<String>>>;

/// Kernel set name for a country bucket.
pub(crate) fn set_name(code: &str) -> String {
    format!("{SET_PREFIX}-{code}")
}

/// Rule matching a source against a named set.
pub(crate) fn match_set_rule(set: &str, verb: &str) -> Vec<String> {
    ["-m", "set", "--match-set", set, "src", "-j", verb]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Rebuild the LiveSets snapshot from the kernel.
pub(crate) fn refresh_live_sets(set: &IpSet, live: &RwLock<HashSet<String>>) -> Result<()> {
    let names = set.list_sets()?;
    let mut guard = live.write().unwrap_or_else(|e| e.into_inner());
    guard.clear();
    guard.extend(names);
    Ok(())
}

pub(crate) fn live_contains(live: &RwLock<HashSet<String>>, name: &str) -> bool {
    live.read().unwrap_or_else(|e| e.into_inner()).contains(name)
}

/// Create a set or atomically replace its contents.
///
/// When the name is already live the new contents are restored into a temp
/// set and swapped in, so the set never disappears from the kernel and any
/// in-flight packet match sees either the old or the new contents.
pub(crate) fn sync_set(
    set: &IpSet,
    live: &RwLock<HashSet<String>>,
    name: &str,
    entries: &[String],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    if live_contains(live, name) {
        let temp = format!("{name}-temp");
        set.restore_set(entries, &SetSpec::new(temp.as_str()), true)?;
        set.swap_sets(&temp, name)?;
        set.flush_set(&temp)?;
        set.destroy_set(&temp)?;
    } else {
        set.restore_set(entries, &SetSpec::new(name), true)?;
    }
    Ok(())
}

/// Owns the three loop tasks.
pub struct Reconciler {
    applier: Applier,
    cleanup: Cleanup,
    recheck: Recheck,
}

impl Reconciler {
    pub fn new(config: Config, storage: Arc<dyn Repository>, exec: Arc<dyn Exec>) -> Self {
        let fw = Arc::new(Firewall::new(exec.clone()));
        let set = Arc::new(IpSet::new(exec));
        let live_sets: LiveSets = Arc::new(RwLock::new(HashSet::new()));

        Self {
            applier: Applier::new(
                config.clone(),
                storage.clone(),
                fw.clone(),
                set.clone(),
                live_sets.clone(),
            ),
            cleanup: Cleanup::new(
                config,
                storage.clone(),
                fw.clone(),
                set.clone(),
                live_sets.clone(),
            ),
            recheck: Recheck::new(storage, fw, set, live_sets),
        }
    }

    /// Run all loops until the token is cancelled. A fatal applier or
    /// cleanup error cancels the token itself and is returned so the
    /// process exits nonzero for its supervisor.
    pub async fn run(self, token: ShutdownToken) -> Result<()> {
        let applier = tokio::spawn(self.applier.run(token.clone()));
        let cleanup = tokio::spawn(self.cleanup.run(token.clone()));
        let recheck = tokio::spawn(self.recheck.run(token));

        let (applier, cleanup, recheck) = tokio::join!(applier, cleanup, recheck);
        recheck.context("recheck task panicked")?;
        cleanup.context("cleanup task panicked")??;
        applier.context("applier task panicked")??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_names_carry_prefix() {
        assert_eq!(set_name("US"), "fc-US");
        assert_eq!(set_name("de"), "fc-de");
    }

    #[test]
    fn match_set_rule_shape() {
        assert_eq!(
            match_set_rule("fc-US", "RETURN"),
            vec!["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"]
        );
    }

    #[test]
    fn allow_networks_set_is_prefixed() {
        assert!(ALLOW_NETWORKS_SET.starts_with(SET_PREFIX));
        // ipset names are limited to 31 characters, temp names add 5.
        assert!(ALLOW_NETWORKS_SET.len() + "-temp".len() <= 31);
    }
}
