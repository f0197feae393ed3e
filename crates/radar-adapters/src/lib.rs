//! Source adapter contracts + feed-file and explorer-scan implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use radar_chain::{
    is_valid_contract_address, ExplorerClient, ExplorerError, ExplorerTx, JsonFetcher,
};
use radar_core::{Chain, ContractSignals, DangerSignal, RawRecord, SourceCategory};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-adapters";

/// Shared per-cycle context handed to every adapter. Adapters must not
/// assume anything about each other's success and never touch the cache.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub cycle_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub enabled_chains: Vec<Chain>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Explorer(#[from] ExplorerError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable registry key, e.g. `confirmed` or `ethereum-scan`.
    fn source_id(&self) -> String;

    fn source_category(&self) -> SourceCategory;

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, AdapterError>;
}

// ---------------------------------------------------------------------------
// Curated feed adapters
// ---------------------------------------------------------------------------

/// On-disk feed file: a small curated list of leads maintained alongside the
/// workspace, one file per source category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratedFeed {
    pub feed_version: u32,
    pub category: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone)]
pub struct CuratedFeedAdapter {
    category: SourceCategory,
    feed_path: PathBuf,
}

impl CuratedFeedAdapter {
    pub fn new(category: SourceCategory, feed_path: impl Into<PathBuf>) -> Self {
        Self {
            category,
            feed_path: feed_path.into(),
        }
    }
}

fn parse_curated_feed(path: &Path, text: &str) -> Result<CuratedFeed, AdapterError> {
    serde_json::from_str(text)
        .map_err(|e| AdapterError::Message(format!("parsing {}: {e}", path.display())))
}

pub fn load_curated_feed(path: impl AsRef<Path>) -> Result<CuratedFeed, AdapterError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| AdapterError::Message(format!("reading {}: {e}", path.display())))?;
    parse_curated_feed(path, &text)
}

#[async_trait]
impl SourceAdapter for CuratedFeedAdapter {
    fn source_id(&self) -> String {
        self.category.label()
    }

    fn source_category(&self) -> SourceCategory {
        self.category
    }

    async fn fetch(&self, _ctx: &AdapterContext) -> Result<Vec<RawRecord>, AdapterError> {
        let path = self.feed_path.clone();
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AdapterError::Message(format!("reading {}: {e}", path.display())))?;
        let feed = parse_curated_feed(&path, &text)?;

        if feed.category != self.source_id() {
            return Err(AdapterError::Message(format!(
                "feed category {} does not match adapter source_id {}",
                feed.category,
                self.source_id()
            )));
        }
        Ok(feed.records)
    }
}

// ---------------------------------------------------------------------------
// Contract inspection port
// ---------------------------------------------------------------------------

/// External security-scan collaborator. Implementations wrap third-party
/// report APIs; the engine only consumes the resulting signal set.
#[async_trait]
pub trait ContractInspector: Send + Sync {
    async fn inspect(
        &self,
        cycle_id: Uuid,
        chain: Chain,
        address: &str,
    ) -> Result<ContractSignals, AdapterError>;
}

/// Inspector used when no scan credential is configured: reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInspector;

#[async_trait]
impl ContractInspector for NullInspector {
    async fn inspect(
        &self,
        _cycle_id: Uuid,
        _chain: Chain,
        _address: &str,
    ) -> Result<ContractSignals, AdapterError> {
        Ok(ContractSignals::default())
    }
}

/// Raw report shape from the token-scan API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnifferReport {
    pub honeypot: bool,
    pub renounced: bool,
    pub audit: bool,
    #[serde(rename = "mintFunction")]
    pub mint_function: bool,
    pub proxy: bool,
    #[serde(rename = "lpLocked")]
    pub lp_locked: bool,
}

pub fn signals_from_report(report: &SnifferReport) -> ContractSignals {
    let mut danger = Vec::new();
    if report.honeypot {
        danger.push(DangerSignal::Honeypot);
    }
    if !report.lp_locked {
        danger.push(DangerSignal::UnlockedLiquidity);
    }
    if report.mint_function {
        danger.push(DangerSignal::MintAuthorityRetained);
    }
    if report.proxy {
        danger.push(DangerSignal::UnverifiedProxy);
    }
    ContractSignals {
        audited: report.audit,
        renounced: report.renounced,
        liquidity_locked: report.lp_locked,
        danger,
    }
}

pub struct TokenSnifferInspector {
    api_key: String,
    fetcher: Arc<JsonFetcher>,
}

impl TokenSnifferInspector {
    pub fn new(api_key: impl Into<String>, fetcher: Arc<JsonFetcher>) -> Self {
        Self {
            api_key: api_key.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl ContractInspector for TokenSnifferInspector {
    async fn inspect(
        &self,
        cycle_id: Uuid,
        chain: Chain,
        address: &str,
    ) -> Result<ContractSignals, AdapterError> {
        let url = format!(
            "https://tokensniffer.com/api/v2/tokens/{}/{}?apikey={}",
            chain.as_str(),
            address,
            self.api_key
        );
        let report: SnifferReport = self
            .fetcher
            .get_json(cycle_id, "tokensniffer.com", &url)
            .await
            .map_err(|e| AdapterError::Message(e.to_string()))?;
        Ok(signals_from_report(&report))
    }
}

// ---------------------------------------------------------------------------
// Explorer scan adapter
// ---------------------------------------------------------------------------

/// How many fresh contracts to analyze per cycle on each chain; busier
/// chains get deeper scans.
pub fn default_scan_depth(chain: Chain) -> usize {
    match chain {
        Chain::Ethereum => 50,
        Chain::Bsc => 30,
        _ => 20,
    }
}

/// Newest-first unique contract addresses from a transfer listing, capped.
pub fn unique_contracts(rows: &[ExplorerTx], limit: usize) -> Vec<&ExplorerTx> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        if !is_valid_contract_address(&row.contract_address) {
            continue;
        }
        if seen.insert(row.contract_address.to_ascii_lowercase()) {
            out.push(row);
            if out.len() == limit {
                break;
            }
        }
    }
    out
}

pub struct ExplorerScanAdapter {
    explorer: ExplorerClient,
    inspector: Arc<dyn ContractInspector>,
    scan_depth: usize,
}

impl ExplorerScanAdapter {
    pub fn new(explorer: ExplorerClient, inspector: Arc<dyn ContractInspector>) -> Self {
        let scan_depth = default_scan_depth(explorer.chain());
        Self {
            explorer,
            inspector,
            scan_depth,
        }
    }

    pub fn with_scan_depth(mut self, scan_depth: usize) -> Self {
        self.scan_depth = scan_depth.max(1);
        self
    }

    fn record_for(&self, tx: &ExplorerTx, signals: ContractSignals) -> RawRecord {
        let chain = self.explorer.chain();
        let address = tx.contract_address.to_ascii_lowercase();
        let name = if tx.token_name.trim().is_empty() {
            format!("Token {}", &address[..10.min(address.len())])
        } else {
            tx.token_name.trim().to_string()
        };
        let symbol = if tx.token_symbol.trim().is_empty() {
            None
        } else {
            Some(tx.token_symbol.trim().to_string())
        };
        let launched_at = tx
            .unix_timestamp()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        RawRecord {
            name: Some(name),
            symbol,
            contract_address: Some(address),
            chain: Some(chain.as_str().to_string()),
            status: Some("active".to_string()),
            sources: vec![format!("{} explorer", chain.as_str())],
            contract_signals: Some(signals),
            launched_at,
            ..RawRecord::default()
        }
    }
}

#[async_trait]
impl SourceAdapter for ExplorerScanAdapter {
    fn source_id(&self) -> String {
        self.source_category().label()
    }

    fn source_category(&self) -> SourceCategory {
        SourceCategory::ChainScan(self.explorer.chain())
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, AdapterError> {
        let chain = self.explorer.chain();
        if !ctx.enabled_chains.contains(&chain) {
            debug!(chain = chain.as_str(), "chain disabled, skipping scan");
            return Ok(Vec::new());
        }

        let rows = self.explorer.recent_token_transfers(ctx.cycle_id).await?;
        let fresh = unique_contracts(&rows, self.scan_depth);

        let mut records = Vec::with_capacity(fresh.len());
        for tx in fresh {
            // Inspection failures degrade to an unsignaled record rather
            // than dropping the lead or the cycle.
            let signals = match self
                .inspector
                .inspect(ctx.cycle_id, chain, &tx.contract_address)
                .await
            {
                Ok(signals) => signals,
                Err(err) => {
                    warn!(
                        chain = chain.as_str(),
                        contract = %tx.contract_address,
                        error = %err,
                        "contract inspection failed"
                    );
                    ContractSignals::default()
                }
            };
            records.push(self.record_for(tx, signals));
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Opaque upstream credentials, resolved from the environment and passed
/// through to clients without interpretation.
#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub etherscan: String,
    pub bscscan: String,
    pub polygonscan: String,
    pub arbiscan: String,
    pub optimistic_etherscan: String,
    pub tokensniffer: String,
}

impl ApiCredentials {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        Self {
            etherscan: var("RADAR_ETHERSCAN_API_KEY"),
            bscscan: var("RADAR_BSCSCAN_API_KEY"),
            polygonscan: var("RADAR_POLYGONSCAN_API_KEY"),
            arbiscan: var("RADAR_ARBISCAN_API_KEY"),
            optimistic_etherscan: var("RADAR_OPTIMISTIC_ETHERSCAN_API_KEY"),
            tokensniffer: var("RADAR_TOKENSNIFFER_API_KEY"),
        }
    }

    pub fn explorer_key(&self, chain: Chain) -> &str {
        match chain {
            Chain::Ethereum => &self.etherscan,
            Chain::Bsc => &self.bscscan,
            Chain::Polygon => &self.polygonscan,
            Chain::Arbitrum => &self.arbiscan,
            Chain::Optimism => &self.optimistic_etherscan,
            Chain::Solana => "",
        }
    }
}

pub struct AdapterDeps {
    pub fetcher: Arc<JsonFetcher>,
    pub feeds_dir: PathBuf,
    pub credentials: ApiCredentials,
}

impl AdapterDeps {
    pub fn inspector(&self) -> Arc<dyn ContractInspector> {
        if self.credentials.tokensniffer.is_empty() {
            Arc::new(NullInspector)
        } else {
            Arc::new(TokenSnifferInspector::new(
                self.credentials.tokensniffer.clone(),
                self.fetcher.clone(),
            ))
        }
    }
}

/// Maps a registry source id to a constructed adapter. Chain scans without a
/// configured explorer credential resolve to `None` and contribute nothing.
pub fn adapter_for_source(source_id: &str, deps: &AdapterDeps) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "confirmed" => Some(Box::new(CuratedFeedAdapter::new(
            SourceCategory::Confirmed,
            deps.feeds_dir.join("confirmed.json"),
        ))),
        "potential" => Some(Box::new(CuratedFeedAdapter::new(
            SourceCategory::Potential,
            deps.feeds_dir.join("potential.json"),
        ))),
        "retroactive" => Some(Box::new(CuratedFeedAdapter::new(
            SourceCategory::Retroactive,
            deps.feeds_dir.join("retroactive.json"),
        ))),
        other => {
            let chain = other.strip_suffix("-scan").and_then(Chain::parse)?;
            let key = deps.credentials.explorer_key(chain);
            if key.is_empty() {
                return None;
            }
            let explorer = ExplorerClient::new(chain, key, deps.fetcher.clone()).ok()?;
            Some(Box::new(ExplorerScanAdapter::new(explorer, deps.inspector())))
        }
    }
}
