//! Recheck loop: detect external drift and re-arm the applier.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::firewall::Firewall;
use crate::ipset::IpSet;
use crate::repository::{self, Repository};
use crate::shutdown::ShutdownToken;

use super::{live_contains, refresh_live_sets, LiveSets, FILTER_CHAIN, FILTER_TABLE, RECHECK_INTERVAL};

pub(crate) struct Recheck {
    storage: Arc<dyn Repository>,
    fw: Arc<Firewall>,
    set: Arc<IpSet>,
    live_sets: LiveSets,
}

impl Recheck {
    pub(crate) fn new(
        storage: Arc<dyn Repository>,
        fw: Arc<Firewall>,
        set: Arc<IpSet>,
        live_sets: LiveSets,
    ) -> Self {
        Self {
            storage,
            fw,
            set,
            live_sets,
        }
    }

    /// Verify installed buckets every interval until cancelled. Failures
    /// are logged only; the next tick tries again.
    pub(crate) async fn run(self, token: ShutdownToken) {
        debug!("recheck started");
        let start = tokio::time::Instant::now() + RECHECK_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, RECHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("recheck stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("recheck failed: {e:#}");
                    }
                }
            }
        }
    }

    /// Clear `applied` on every bucket whose set or rule has gone missing;
    /// the applier reinstalls on its next tick.
    pub(crate) async fn tick(&self) -> Result<()> {
        refresh_live_sets(&self.set, &self.live_sets)?;

        for bucket in self.storage.list_buckets()? {
            if self.storage.get_bool(&bucket, repository::DELETION_MARK)? {
                continue;
            }
            let name = self.storage.get_string(&bucket, repository::IPSET)?;
            let rule = self.storage.rule(&bucket)?;
            if name.is_empty() || rule.is_empty() {
                continue;
            }

            if !live_contains(&self.live_sets, &name) {
                warn!("set {name} backing bucket {bucket} is gone, scheduling reinstall");
                self.storage.set_bool(&bucket, repository::APPLIED, false)?;
                continue;
            }
            if !self.fw.check_rule(FILTER_TABLE, FILTER_CHAIN, &rule).await? {
                warn!("rule for bucket {bucket} is missing from the chain, scheduling reinstall");
                self.storage.set_bool(&bucket, repository::APPLIED, false)?;
            }
        }
        Ok(())
    }
}
