// src/services/proxy.rs
use async_trait::async_trait;
use futures::future::join_all;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::error::{DataError, Result};

/// A proxy URI used for both HTTP and HTTPS traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyEndpoint(String);

impl ProxyEndpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        ProxyEndpoint(uri.into())
    }

    pub fn from_host_port(host: &str, port: &str) -> Self {
        ProxyEndpoint(format!("http://{}:{}", host.trim(), port.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anything that can hand back a list of free proxies.
#[async_trait]
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, client: &Client) -> Result<Vec<ProxyEndpoint>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProvider {
    ProxyScrape,
    Geonode,
    PubProxy,
    ProxyListDownload,
    SpysOne,
}

impl ProxyProvider {
    pub const ALL: [ProxyProvider; 5] = [
        ProxyProvider::ProxyScrape,
        ProxyProvider::Geonode,
        ProxyProvider::PubProxy,
        ProxyProvider::ProxyListDownload,
        ProxyProvider::SpysOne,
    ];

    fn url(&self) -> &'static str {
        match self {
            ProxyProvider::ProxyScrape => "https://api.proxyscrape.com/v2/?request=displayproxies&protocol=http&timeout=10000&country=all&ssl=all&anonymity=all",
            ProxyProvider::Geonode => "https://proxylist.geonode.com/api/proxy-list?limit=100&page=1&sort_by=lastChecked&sort_type=desc&protocols=http&anonymityLevel=elite&anonymityLevel=anonymous",
            ProxyProvider::PubProxy => "http://pubproxy.com/api/proxy?limit=20&format=json&type=http",
            ProxyProvider::ProxyListDownload => "https://www.proxy-list.download/api/v1/get?type=http",
            ProxyProvider::SpysOne => "https://spys.one/free-proxy-list/ALL/",
        }
    }

    pub fn parse(&self, body: &str) -> Result<Vec<ProxyEndpoint>> {
        match self {
            ProxyProvider::ProxyScrape | ProxyProvider::ProxyListDownload => parse_plain_list(body),
            ProxyProvider::Geonode | ProxyProvider::PubProxy => parse_json_list(body),
            ProxyProvider::SpysOne => parse_spys_table(body),
        }
    }
}

#[async_trait]
impl ProxySource for ProxyProvider {
    fn name(&self) -> &str {
        match self {
            ProxyProvider::ProxyScrape => "Proxyscrape",
            ProxyProvider::Geonode => "Geonode",
            ProxyProvider::PubProxy => "PubProxy",
            ProxyProvider::ProxyListDownload => "ProxyList.download",
            ProxyProvider::SpysOne => "Spys.one",
        }
    }

    async fn fetch(&self, client: &Client) -> Result<Vec<ProxyEndpoint>> {
        let resp = client
            .get(self.url())
            .header("User-Agent", "Mozilla/5.0")
            .send()
            .await?;

        if !resp.status().is_success() {
            warn!("{} answered with HTTP {}", self.name(), resp.status());
            return Ok(Vec::new());
        }

        let body = resp.text().await?;
        self.parse(&body)
    }
}

/// `ip:port` per line.
fn parse_plain_list(body: &str) -> Result<Vec<ProxyEndpoint>> {
    let re = Regex::new(r"^[\w.\-]+:\d{1,5}$").map_err(|e| DataError::Parse(e.to_string()))?;
    Ok(body
        .lines()
        .map(str::trim)
        .filter(|line| re.is_match(line))
        .map(|line| ProxyEndpoint::new(format!("http://{}", line)))
        .collect())
}

/// `{"data": [{"ip": "...", "port": "..."}]}`; the port may be a string or a number.
fn parse_json_list(body: &str) -> Result<Vec<ProxyEndpoint>> {
    let json: Value = serde_json::from_str(body)?;
    let entries = match json.get("data").and_then(Value::as_array) {
        Some(entries) => entries,
        None => return Ok(Vec::new()),
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let ip = entry.get("ip")?.as_str()?;
            let port = match entry.get("port")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some(ProxyEndpoint::from_host_port(ip, &port))
        })
        .collect())
}

/// HTML table rows `tr.spy1x` / `tr.spy1xx`, host in the first cell and port in the second.
fn parse_spys_table(body: &str) -> Result<Vec<ProxyEndpoint>> {
    let document = Html::parse_document(body);
    let row_selector = Selector::parse("tr.spy1x, tr.spy1xx")
        .map_err(|e| DataError::Parse(format!("{:?}", e)))?;
    let cell_selector = Selector::parse("td").map_err(|e| DataError::Parse(format!("{:?}", e)))?;

    let mut proxies = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() >= 2 && !cells[0].is_empty() && !cells[1].is_empty() {
            proxies.push(ProxyEndpoint::from_host_port(&cells[0], &cells[1]));
        }
    }
    Ok(proxies)
}

#[derive(Debug, Default)]
struct PoolState {
    endpoints: Vec<ProxyEndpoint>,
    current: Option<ProxyEndpoint>,
}

/// Deduplicated set of proxies gathered from several providers, with a
/// random current selection.
pub struct ProxyPool {
    enabled: AtomicBool,
    sources: Vec<Box<dyn ProxySource>>,
    state: Mutex<PoolState>,
    fetch_timeout: Duration,
}

impl ProxyPool {
    pub fn new(enabled: bool) -> Self {
        let sources = ProxyProvider::ALL
            .iter()
            .map(|p| Box::new(*p) as Box<dyn ProxySource>)
            .collect();
        Self::with_sources(enabled, sources)
    }

    pub fn with_sources(enabled: bool, sources: Vec<Box<dyn ProxySource>>) -> Self {
        ProxyPool {
            enabled: AtomicBool::new(enabled),
            sources,
            state: Mutex::new(PoolState::default()),
            fetch_timeout: Duration::from_secs(15),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!("Proxying {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn len(&self) -> usize {
        self.state().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.state().endpoints.clone()
    }

    pub fn current(&self) -> Option<ProxyEndpoint> {
        self.state().current.clone()
    }

    /// Query every source concurrently and swap in the merged, deduplicated set.
    /// A failing source contributes nothing; it never aborts the refresh.
    pub async fn refresh(&self) -> usize {
        let client = match Client::builder().timeout(self.fetch_timeout).build() {
            Ok(client) => client,
            Err(e) => {
                error!("Could not build client for proxy refresh: {}", e);
                return self.len();
            }
        };

        let fetches = self.sources.iter().map(|source| {
            let client = &client;
            async move { (source.name().to_string(), source.fetch(client).await) }
        });

        let mut collected = Vec::new();
        for (name, outcome) in join_all(fetches).await {
            match outcome {
                Ok(found) => {
                    info!("Fetched {} from {}", found.len(), name);
                    collected.extend(found);
                }
                Err(e) => error!("Error from {}: {}", name, e),
            }
        }

        let total = self.replace(collected);
        info!("Total unique proxies: {}", total);
        total
    }

    /// Replace the pool wholesale with `endpoints`, dropping duplicates but
    /// keeping first-seen order.
    pub fn replace(&self, endpoints: Vec<ProxyEndpoint>) -> usize {
        let mut seen = HashSet::new();
        let unique: Vec<ProxyEndpoint> = endpoints
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect();

        let mut state = self.state();
        if let Some(current) = &state.current {
            if !unique.contains(current) {
                state.current = None;
            }
        }
        state.endpoints = unique;
        state.endpoints.len()
    }

    /// A random endpoint, or `None` for a direct connection.
    pub fn acquire(&self) -> Option<ProxyEndpoint> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state();
        let chosen = state.endpoints.choose(&mut rand::thread_rng()).cloned()?;
        state.current = Some(chosen.clone());
        Some(chosen)
    }

    /// Switch to a random endpoint other than the current one.
    pub fn rotate(&self) -> Option<ProxyEndpoint> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state();
        if state.endpoints.len() <= 1 {
            return None;
        }
        let candidates: Vec<&ProxyEndpoint> = state
            .endpoints
            .iter()
            .filter(|p| Some(*p) != state.current.as_ref())
            .collect();
        let chosen = (*candidates.choose(&mut rand::thread_rng())?).clone();
        state.current = Some(chosen.clone());
        Some(chosen)
    }
}
