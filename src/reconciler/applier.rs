//! Applier loop: materialise sets and install the rule sequence.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::Config;
use crate::firewall::Firewall;
use crate::ipset::IpSet;
use crate::repository::{self, Repository, RepositoryError};
use crate::shutdown::ShutdownToken;

use super::{
    live_contains, match_set_rule, refresh_live_sets, set_name, sync_set, LiveSets,
    ALLOW_NETWORKS_SET, CHAIN_POLICY, FILTER_CHAIN, FILTER_TABLE, RECONCILE_INTERVAL,
};

pub(crate) struct Applier {
    config: Config,
    storage: Arc<dyn Repository>,
    fw: Arc<Firewall>,
    set: Arc<IpSet>,
    live_sets: LiveSets,
    /// The allow-networks set only needs one rebuild per process: the
    /// configuration is immutable at runtime, so later ticks skip the
    /// restore unless the set has vanished from the kernel.
    allow_networks_synced: bool,
}

impl Applier {
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
            allow_networks_synced: false,
        }
    }

    /// Reconcile every interval until cancelled. Any tick error is fatal:
    /// it cancels the shared token so the daemon dies and its supervisor
    /// restarts it rather than run with partial enforcement.
    pub(crate) async fn run(mut self, token: ShutdownToken) -> Result<()> {
        debug!("applier started");
        let start = tokio::time::Instant::now() + RECONCILE_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("applier stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("applier failed: {e:#}");
                        token.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }

    /// One reconciliation pass.
    pub(crate) async fn tick(&mut self) -> Result<()> {
        refresh_live_sets(&self.set, &self.live_sets)?;
        self.reconcile().await
    }

    /// Rules are inserted with a monotonically increasing position so the
    /// chain reads in exactly the order emitted here: allow networks,
    /// country allows, country denies, terminal drop. `pos` advances once
    /// per logical rule, including rules whose installation is skipped
    /// because the bucket is already applied.
    async fn reconcile(&mut self) -> Result<()> {
        self.fw
            .ensure_chain(FILTER_TABLE, FILTER_CHAIN, CHAIN_POLICY)
            .await?;

        let mut pos: usize = 1;

        if !self.config.allow_network_list.is_empty() {
            if !self.allow_networks_synced || !live_contains(&self.live_sets, ALLOW_NETWORKS_SET) {
                sync_set(
                    &self.set,
                    &self.live_sets,
                    ALLOW_NETWORKS_SET,
                    &self.config.allow_network_list,
                )?;
                self.allow_networks_synced = true;
            }
            let rule = match_set_rule(ALLOW_NETWORKS_SET, "RETURN");
            self.fw
                .ensure_rule(pos, FILTER_TABLE, FILTER_CHAIN, &rule)
                .await?;
            pos += 1;
        }

        for code in &self.config.country_allow_list {
            self.apply_country(&mut pos, code, "RETURN").await?;
        }

        for code in &self.config.country_deny_list {
            self.apply_country(&mut pos, code, "DROP").await?;
        }

        if self.config.append_drop {
            let rule = vec!["-j".to_string(), "DROP".to_string()];
            self.fw
                .ensure_rule(pos, FILTER_TABLE, FILTER_CHAIN, &rule)
                .await?;
        }

        Ok(())
    }

    /// Install one country: set first, then the rule, then the bookkeeping
    /// that lets the next tick short-circuit.
    async fn apply_country(&self, pos: &mut usize, code: &str, verb: &str) -> Result<()> {
        if self.storage.get_bool(code, repository::APPLIED)? {
            debug!("bucket {code} already applied");
            *pos += 1;
            return Ok(());
        }

        let resources = match self.storage.resources(code) {
            Ok(resources) => resources,
            Err(RepositoryError::MissingBucket(_)) | Err(RepositoryError::MissingKey { .. }) => {
                debug!("no data for {code} yet");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if resources.ipv4.is_empty() {
            debug!("bucket {code} has no IPv4 prefixes, nothing to install");
            return Ok(());
        }

        let name = set_name(code);
        sync_set(&self.set, &self.live_sets, &name, &resources.ipv4)?;

        let rule = match_set_rule(&name, verb);
        self.fw
            .ensure_rule(*pos, FILTER_TABLE, FILTER_CHAIN, &rule)
            .await?;

        self.storage.set_string(code, repository::IPSET, &name)?;
        self.storage.store_rule(code, &rule)?;
        self.storage.set_bool(code, repository::APPLIED, true)?;
        debug!("bucket {code} applied at position {pos}");

        *pos += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Harness;
    use super::*;
    use crate::repository::Repository as _;

    fn new_applier(harness: &Harness, config: Config) -> Applier {
        Applier::new(
            config,
            harness.storage.clone(),
            harness.fw.clone(),
            harness.set.clone(),
            harness.live_sets.clone(),
        )
    }

    fn spec(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn fresh_install_single_country() {
        let harness = Harness::new();
        harness.seed_country("US", &["1.2.3.0/24"]);

        let config = Config {
            country_allow_list: vec!["US".to_string()],
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();

        assert_eq!(
            harness.kernel.rule_specs(),
            vec![spec(&["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"])]
        );
        assert_eq!(
            harness.kernel.set_entries("fc-US").unwrap(),
            vec!["1.2.3.0/24"]
        );
        assert!(harness.storage.get_bool("US", repository::APPLIED).unwrap());
        assert_eq!(harness.storage.get_string("US", repository::IPSET).unwrap(), "fc-US");
        assert_eq!(
            harness.storage.rule("US").unwrap(),
            spec(&["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"])
        );
    }

    #[tokio::test]
    async fn full_ordering() {
        let harness = Harness::new();
        harness.seed_country("US", &["1.0.0.0/8"]);
        harness.seed_country("DE", &["2.0.0.0/8"]);
        harness.seed_country("RU", &["3.0.0.0/8"]);

        let config = Config {
            allow_network_list: vec!["10.0.0.0/8".to_string()],
            country_allow_list: vec!["US".to_string(), "DE".to_string()],
            country_deny_list: vec!["RU".to_string()],
            append_drop: true,
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();

        assert_eq!(
            harness.kernel.rule_specs(),
            vec![
                spec(&["-m", "set", "--match-set", "fc-allow-networks", "src", "-j", "RETURN"]),
                spec(&["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"]),
                spec(&["-m", "set", "--match-set", "fc-DE", "src", "-j", "RETURN"]),
                spec(&["-m", "set", "--match-set", "fc-RU", "src", "-j", "DROP"]),
                spec(&["-j", "DROP"]),
            ]
        );
        assert_eq!(
            harness.kernel.set_entries("fc-allow-networks").unwrap(),
            vec!["10.0.0.0/8"]
        );
    }

    #[tokio::test]
    async fn second_tick_makes_no_kernel_mutations() {
        let harness = Harness::new();
        harness.seed_country("US", &["1.2.3.0/24"]);

        let config = Config {
            allow_network_list: vec!["10.0.0.0/8".to_string()],
            country_allow_list: vec!["US".to_string()],
            append_drop: true,
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();
        let rules_after_first = harness.kernel.rule_specs();
        let commands_after_first = harness.kernel.commands().len();

        applier.tick().await.unwrap();

        assert_eq!(harness.kernel.rule_specs(), rules_after_first);
        // The second tick may only observe: list sets, check the chain,
        // check rules. No inserts, restores or swaps.
        let second_tick: Vec<String> = harness.kernel.commands()[commands_after_first..].to_vec();
        for command in &second_tick {
            let read_only = command.contains("list")
                || command.contains("-nL")
                || command.contains("-C");
            assert!(read_only, "unexpected mutation: {command}");
        }
    }

    #[tokio::test]
    async fn refresh_swaps_existing_set() {
        let harness = Harness::new();
        harness.seed_country("US", &["1.2.3.0/24"]);

        let config = Config {
            country_allow_list: vec!["US".to_string()],
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();

        // A fetch refresh rewrites the data and clears the applied mark.
        harness.seed_country("US", &["9.9.9.0/24"]);
        applier.tick().await.unwrap();

        assert_eq!(
            harness.kernel.set_entries("fc-US").unwrap(),
            vec!["9.9.9.0/24"]
        );
        // The swap path ran: the temp set was created and destroyed again,
        // and the live set itself was never destroyed.
        let commands = harness.kernel.commands();
        assert!(commands.iter().any(|c| c.contains("swap fc-US-temp fc-US")));
        assert!(!commands.iter().any(|c| c == "ipset destroy fc-US"));
        assert!(harness.kernel.set_entries("fc-US-temp").is_none());
        // Only one rule, still.
        assert_eq!(harness.kernel.rule_specs().len(), 1);
    }

    #[tokio::test]
    async fn skipped_bucket_still_advances_position() {
        let harness = Harness::new();
        harness.seed_country("US", &["1.0.0.0/8"]);
        harness.seed_country("DE", &["2.0.0.0/8"]);

        let config = Config {
            country_allow_list: vec!["US".to_string(), "DE".to_string()],
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config.clone());
        applier.tick().await.unwrap();

        // Drop DE's rule out-of-band and clear its applied mark; US stays
        // applied. The reinstall must land DE back at position 2, after US.
        let de_rule = harness.storage.rule("DE").unwrap();
        {
            let mut rules = harness.kernel.rules.lock().unwrap();
            rules.retain(|rule| rule != &de_rule);
        }
        harness
            .storage
            .set_bool("DE", repository::APPLIED, false)
            .unwrap();

        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();

        assert_eq!(
            harness.kernel.rule_specs(),
            vec![
                spec(&["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"]),
                spec(&["-m", "set", "--match-set", "fc-DE", "src", "-j", "RETURN"]),
            ]
        );
    }

    #[tokio::test]
    async fn missing_data_is_not_fatal() {
        let harness = Harness::new();
        // DE configured but never fetched; US has data.
        harness.seed_country("US", &["1.0.0.0/8"]);

        let config = Config {
            country_allow_list: vec!["DE".to_string(), "US".to_string()],
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();

        // Only the US rule exists, at the head of the chain; DE neither
        // consumed a position nor produced a set.
        assert_eq!(
            harness.kernel.rule_specs(),
            vec![spec(&["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"])]
        );
        assert!(harness.kernel.set_entries("fc-DE").is_none());
        assert!(!harness.storage.get_bool("DE", repository::APPLIED).unwrap());
    }

    #[tokio::test]
    async fn empty_prefix_list_is_not_installable() {
        let harness = Harness::new();
        harness.seed_country("US", &[]);

        let config = Config {
            country_allow_list: vec!["US".to_string()],
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();

        assert!(harness.kernel.rule_specs().is_empty());
        assert!(!harness.storage.get_bool("US", repository::APPLIED).unwrap());
    }

    #[tokio::test]
    async fn universal_prefix_materialises_as_halves() {
        let harness = Harness::new();
        harness.seed_country("US", &["0.0.0.0/0", "192.168.1.0/24"]);

        let config = Config {
            country_allow_list: vec!["US".to_string()],
            ..Default::default()
        };
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();

        let entries = harness.kernel.set_entries("fc-US").unwrap();
        assert_eq!(entries, vec!["0.0.0.0/1", "128.0.0.0/1", "192.168.1.0/24"]);
    }

    #[tokio::test]
    async fn chain_is_created_once() {
        let harness = Harness::new();
        let config = Config::default();
        let mut applier = new_applier(&harness, config);
        applier.tick().await.unwrap();
        applier.tick().await.unwrap();

        let creates = harness
            .kernel
            .commands()
            .iter()
            .filter(|c| c.contains("-N ipset-filter"))
            .count();
        assert_eq!(creates, 1);
        assert!(harness.kernel.rule_specs().is_empty());
    }
}
