//! Cleanup loop: mark and tear down resources the configuration no longer
//! references.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::firewall::Firewall;
use crate::ipset::IpSet;
use crate::repository::{self, Repository};
use crate::shutdown::ShutdownToken;

use super::{
    live_contains, match_set_rule, refresh_live_sets, LiveSets, ALLOW_NETWORKS_SET, FILTER_CHAIN,
    FILTER_TABLE, RECONCILE_INTERVAL,
};

pub(crate) struct Cleanup {
    config: Config,
    storage: Arc<dyn Repository>,
    fw: Arc<Firewall>,
    set: Arc<IpSet>,
    live_sets: LiveSets,
}

impl Cleanup {
    pub(crate) fn new(
        config: Config,
        storage: Arc<dyn Repository>,
        fw: Arc<Firewall>,
        set: Arc<IpSet>,
        live_sets: LiveSets,
    ) -> Self {
        Self {
            config,
            storage,
            fw,
            set,
            live_sets,
        }
    }

    /// Sweep every interval until cancelled. Errors are fatal, like the
    /// applier's: a chain or set that cannot be retracted means the policy
    /// no longer matches the configuration.
    pub(crate) async fn run(self, token: ShutdownToken) -> Result<()> {
        debug!("cleanup started");
        let start = tokio::time::Instant::now() + RECONCILE_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("cleanup stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("cleanup failed: {e:#}");
                        token.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }

    /// One sweep: mark orphans, then retract everything marked.
    pub(crate) async fn tick(&self) -> Result<()> {
        refresh_live_sets(&self.set, &self.live_sets)?;
        self.mark_orphans()?;
        self.remove_marked().await?;
        self.remove_allow_networks().await?;
        self.remove_append_drop().await?;
        Ok(())
    }

    /// Tombstone every bucket whose country is no longer configured.
    /// Comparison is case-insensitive; the allow-networks set is not a
    /// bucket and never appears here.
    fn mark_orphans(&self) -> Result<()> {
        let configured: HashSet<String> = self
            .config
            .country_allow_list
            .iter()
            .chain(self.config.country_deny_list.iter())
            .map(|code| code.to_ascii_uppercase())
            .collect();

        for bucket in self.storage.list_buckets()? {
            if configured.contains(&bucket.to_ascii_uppercase()) {
                continue;
            }
            if self.storage.get_bool(&bucket, repository::DELETION_MARK)? {
                continue;
            }
            info!("bucket {bucket} is no longer configured, marking for deletion");
            self.storage
                .set_bool(&bucket, repository::DELETION_MARK, true)?;
        }
        Ok(())
    }

    /// Retract kernel resources of marked buckets, then drop the buckets.
    ///
    /// The rule goes first so the set loses its kernel reference before the
    /// destroy; the firewall adapter's settle delay covers the gap. A marked
    /// bucket that never recorded a set has nothing in the kernel and is
    /// deleted directly.
    async fn remove_marked(&self) -> Result<()> {
        for bucket in self.storage.list_buckets_for_deletion()? {
            let name = self.storage.get_string(&bucket, repository::IPSET)?;
            let rule = self.storage.rule(&bucket)?;

            if name.is_empty() {
                warn!("bucket {bucket} was marked before anything was installed, deleting it");
                self.storage.delete_bucket(&bucket)?;
                continue;
            }

            if live_contains(&self.live_sets, &name) {
                if rule.is_empty() {
                    warn!("bucket {bucket} has live set {name} but no recorded rule");
                } else {
                    self.fw.delete_rule(FILTER_TABLE, FILTER_CHAIN, &rule).await?;
                }
                self.set.flush_set(&name)?;
                self.set.destroy_set(&name)?;
            } else {
                debug!("set {name} is not live, skipping kernel teardown");
            }

            self.storage.delete_bucket(&bucket)?;
            info!("removed bucket {bucket} and its kernel resources");
        }
        Ok(())
    }

    /// Retract the allow-networks set once the configured list is empty.
    async fn remove_allow_networks(&self) -> Result<()> {
        if !self.config.allow_network_list.is_empty() {
            return Ok(());
        }
        if !live_contains(&self.live_sets, ALLOW_NETWORKS_SET) {
            return Ok(());
        }
        info!("allow network list is empty, removing {ALLOW_NETWORKS_SET}");
        let rule = match_set_rule(ALLOW_NETWORKS_SET, "RETURN");
        self.fw.delete_rule(FILTER_TABLE, FILTER_CHAIN, &rule).await?;
        self.set.flush_set(ALLOW_NETWORKS_SET)?;
        self.set.destroy_set(ALLOW_NETWORKS_SET)?;
        Ok(())
    }

    /// Retract the terminal drop when it is no longer configured.
    async fn remove_append_drop(&self) -> Result<()> {
        if self.config.append_drop || !self.config.allow_network_list.is_empty() {
            return Ok(());
        }
        let rule = vec!["-j".to_string(), "DROP".to_string()];
        self.fw.delete_rule(FILTER_TABLE, FILTER_CHAIN, &rule).await?;
        Ok(())
    }
}
