//! Periodic refresh of per-country prefix lists from RIPEstat.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::repository::{CountryResources, Repository};
use crate::shutdown::ShutdownToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Country data older than this is fetched again.
const STALE_AFTER_HOURS: i64 = 24;

/// Concurrent requests towards RIPEstat per tick.
const MAX_CONCURRENT_FETCHES: usize = 6;

const RIPESTAT_URL: &str = "https://stat.ripe.net/data/country-resource-list/data.json";

/// Wire shape of the RIPEstat country-resource-list endpoint.
#[derive(Debug, Deserialize)]
struct CountryResourceList {
    data: ResourceData,
}

#[derive(Debug, Deserialize)]
struct ResourceData {
    resources: ResourceSet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResourceSet {
    asn: Vec<String>,
    ipv4: Vec<String>,
    ipv6: Vec<String>,
}

/// Keeps the repository stocked with fresh country data.
pub struct Fetcher {
    client: Client,
    storage: Arc<dyn Repository>,
    targets: Vec<String>,
    period: Duration,
}

impl Fetcher {
    pub fn new(
        targets: Vec<String>,
        period: Duration,
        storage: Arc<dyn Repository>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("filter-chain/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            storage,
            targets,
            period,
        })
    }

    /// Refresh immediately, then on every period tick until cancelled.
    pub async fn run(self, token: ShutdownToken) {
        debug!("fetcher started");
        self.refresh_all().await;

        let start = tokio::time::Instant::now() + self.period;
        let mut ticker = tokio::time::interval_at(start, self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("fetcher stopped");
                    return;
                }
                _ = ticker.tick() => self.refresh_all().await,
            }
        }
    }

    /// One fetch pass over every configured country. Failures are logged per
    /// country and never abort the pass.
    async fn refresh_all(&self) {
        let mut pending = stream::FuturesUnordered::new();
        let mut remaining = self.targets.iter();

        for code in remaining.by_ref().take(MAX_CONCURRENT_FETCHES) {
            pending.push(self.refresh_one(code));
        }

        while let Some((code, result)) = pending.next().await {
            if let Err(e) = result {
                error!("refresh of {code} failed: {e:#}");
            }
            if let Some(code) = remaining.next() {
                pending.push(self.refresh_one(code));
            }
        }
    }

    async fn refresh_one(&self, code: &str) -> (String, Result<()>) {
        (code.to_string(), self.refresh_country(code).await)
    }

    async fn refresh_country(&self, code: &str) -> Result<()> {
        if !self.needs_refresh(code)? {
            debug!("country {code} is fresh, skipping");
            return Ok(());
        }

        let url = format!("{RIPESTAT_URL}?resource={code}&v4_format=prefix");
        debug!(%url, "fetching country data");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("RIPEstat returned status {} for {url}", response.status());
        }

        let list: CountryResourceList = response
            .json()
            .await
            .with_context(|| format!("could not decode RIPEstat response for {code}"))?;

        let resources = CountryResources {
            country: code.to_string(),
            updated_at: Utc::now(),
            asn: list.data.resources.asn,
            ipv4: list.data.resources.ipv4,
            ipv6: list.data.resources.ipv6,
        };
        self.storage
            .create_or_update(&resources)
            .with_context(|| format!("could not store resources for {code}"))?;

        info!(
            country = code,
            ipv4 = resources.ipv4.len(),
            ipv6 = resources.ipv6.len(),
            "refreshed country data"
        );
        Ok(())
    }

    /// A country must be refreshed when its stored timestamp is older than
    /// 24 h; the repository's sentinel makes never-fetched countries stale.
    fn needs_refresh(&self, code: &str) -> Result<bool> {
        let last = self.storage.timestamp(code)?;
        Ok(last < Utc::now() - chrono::Duration::hours(STALE_AFTER_HOURS))
    }
}
