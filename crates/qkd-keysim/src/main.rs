//! Runs several key relay sites in one process
//!
//! Sites, simulated key links and key requests come from a scenario file, or
//! from a built-in three site line where the outer sites only share keys by
//! relaying through the middle one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use qkd_keystore::{
    KeyFactoryService, KeyLink, KeyRequest, KeyStoreFactory, LocalNetwork, ScenarioConfig,
    SiteConfig, StatsSnapshot,
};
use qkd_keystore::config::{LinkConfig, RequestConfig};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "qkd-keysim")]
#[command(about = "Simulate QKD key distribution and XOR key relay between sites")]
struct Args {
    /// Scenario file (TOML). Uses a built-in scenario when omitted.
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "qkd_keystore=trace"
    #[arg(long)]
    log: Option<String>,

    /// Print the built-in scenario and exit
    #[arg(long)]
    print_default: bool,

    /// Print the final statistics as JSON instead of a table
    #[arg(long)]
    json: bool,
}

fn default_scenario() -> ScenarioConfig {
    let (a, b, c) = ("127.0.0.1:7000", "127.0.0.1:7001", "127.0.0.1:7002");
    let site_config = |address: &str, neighbours: &[&str], paths: &[(&str, &str)]| SiteConfig {
        site_address: address.to_string(),
        neighbours: neighbours.iter().map(|n| n.to_string()).collect(),
        paths: paths
            .iter()
            .map(|(dest, hop)| (dest.to_string(), vec![hop.to_string()]))
            .collect(),
        ..SiteConfig::default()
    };
    let link = |x: &str, y: &str| LinkConfig {
        a: x.to_string(),
        b: y.to_string(),
        key_length: 32,
        key_count: 16,
    };
    let request = |from: &str, to: &str, count| RequestConfig {
        from: from.to_string(),
        to: to.to_string(),
        count,
    };

    ScenarioConfig {
        sites: vec![
            site_config(a, &[b], &[(c, b)]),
            site_config(b, &[a, c], &[]),
            site_config(c, &[b], &[(a, b)]),
        ],
        links: vec![link(a, b), link(b, c)],
        requests: vec![request(a, b, 2), request(a, c, 2), request(c, a, 1)],
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => tracing_subscriber::EnvFilter::new(filter),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into()),
    };
    // stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// One row of the final report
#[derive(Debug, Serialize)]
struct StoreReport {
    site: String,
    destination: String,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

struct Simulation {
    sites: BTreeMap<String, Arc<KeyStoreFactory>>,
    /// Kept so the key stores at both ends stay reachable for the run
    _links: Vec<KeyLink>,
}

impl Simulation {
    fn build(scenario: &ScenarioConfig) -> Result<Self> {
        let network = LocalNetwork::new();
        let mut sites = BTreeMap::new();

        for config in &scenario.sites {
            let factory = KeyStoreFactory::from_config(config, Arc::new(network.clone()))
                .with_context(|| format!("Failed to start site {}", config.site_address))?;
            network.register(config.site_address.clone(), &factory);
            sites.insert(config.site_address.clone(), factory);
        }

        let mut links = Vec::new();
        for link in &scenario.links {
            let (a, b) = (site(&sites, &link.a)?, site(&sites, &link.b)?);
            let key_link = KeyLink::between(a, b, link.key_length)?;
            key_link.generate(link.key_count);
            info!(a = %link.a, b = %link.b, keys = link.key_count, "Link delivered keys");
            links.push(key_link);
        }

        Ok(Self {
            sites,
            _links: links,
        })
    }

    /// Fetch a new key at `from` and the same key at `to`, checking they
    /// agree. Returns a one line summary of the exchange.
    async fn exchange(&self, from: &str, to: &str) -> Result<String> {
        let shared = site(&self.sites, from)?
            .get_shared_key(KeyRequest {
                site_to: to.to_string(),
                key_id: None,
            })
            .await
            .with_context(|| format!("{} could not get a key for {}", from, to))?;

        let other_end = site(&self.sites, to)?
            .get_shared_key(KeyRequest {
                site_to: from.to_string(),
                key_id: Some(shared.key_id),
            })
            .await
            .with_context(|| format!("{} could not collect key {}", to, shared.key_id))?;

        let digest = shared.key_value.digest();
        if digest != other_end.key_value.digest() {
            bail!("Key {} differs between {} and {}", shared.key_id, from, to);
        }

        Ok(format!(
            "{} -> {}  key {:>3}  {}  digest {}",
            from,
            to,
            shared.key_id,
            shared.url,
            digest.short()
        ))
    }

    async fn report(&self) -> Result<Vec<StoreReport>> {
        let mut rows = Vec::new();
        for (address, factory) in &self.sites {
            for name in factory.get_key_stores().await? {
                let Some(store) = factory.get_key_store(&name) else {
                    continue;
                };
                rows.push(StoreReport {
                    site: address.clone(),
                    destination: name,
                    stats: store.stats_snapshot(),
                });
            }
        }
        Ok(rows)
    }

    fn shutdown(&self) {
        for factory in self.sites.values() {
            factory.shutdown();
        }
    }
}

fn print_table(rows: &[StoreReport]) {
    println!();
    println!(
        "{:<16} {:<16} {:>9} {:>5} {:>7} {:>9} {:>9}",
        "site", "destination", "generated", "used", "unused", "reserved", "discarded"
    );
    for row in rows {
        println!(
            "{:<16} {:<16} {:>9} {:>5} {:>7} {:>9} {:>9}",
            row.site,
            row.destination,
            row.stats.key_generated,
            row.stats.key_used,
            row.stats.unused_keys_available,
            row.stats.reserved_keys,
            row.stats.keys_discarded
        );
    }
}

fn site<'a>(
    sites: &'a BTreeMap<String, Arc<KeyStoreFactory>>,
    address: &str,
) -> Result<&'a KeyStoreFactory> {
    sites
        .get(address)
        .map(|factory| factory.as_ref())
        .ok_or_else(|| anyhow!("Unknown site {}", address))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default {
        print!("{}", toml::to_string_pretty(&default_scenario())?);
        return Ok(());
    }

    init_logging(args.log.as_deref());

    let scenario = match &args.scenario {
        Some(path) => ScenarioConfig::load(path)
            .with_context(|| format!("Failed to load scenario {}", path.display()))?,
        None => default_scenario(),
    };
    info!(
        sites = scenario.sites.len(),
        links = scenario.links.len(),
        "Starting simulation"
    );

    let simulation = Simulation::build(&scenario)?;

    let mut failures = 0;
    for request in &scenario.requests {
        for _ in 0..request.count {
            match simulation.exchange(&request.from, &request.to).await {
                Ok(line) if !args.json => println!("{}", line),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        from = %request.from,
                        to = %request.to,
                        error = %format!("{:#}", e),
                        "Key exchange failed"
                    );
                    failures += 1;
                }
            }
        }
    }

    let rows = simulation.report().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_table(&rows);
    }
    simulation.shutdown();

    if failures > 0 {
        bail!("{} key exchange(s) failed", failures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scenario_is_valid() {
        let text = toml::to_string_pretty(&default_scenario()).unwrap();
        let parsed = ScenarioConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, default_scenario());
    }

    #[tokio::test]
    async fn test_json_report_rows() {
        let simulation = Simulation::build(&default_scenario()).unwrap();
        simulation
            .exchange("127.0.0.1:7000", "127.0.0.1:7002")
            .await
            .unwrap();

        let rows = simulation.report().await.unwrap();
        let json = serde_json::to_value(&rows).unwrap();
        let relayed = json
            .as_array()
            .unwrap()
            .iter()
            .find(|row| row["site"] == "127.0.0.1:7000" && row["destination"] == "127.0.0.1:7002")
            .unwrap();
        assert_eq!(relayed["key_used"], 1);
        assert_eq!(relayed["key_generated"], 1);
        simulation.shutdown();
    }
}
