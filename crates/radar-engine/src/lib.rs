//! Aggregation engine: fan-in over source adapters, normalize + score,
//! merge into the cache, filter/rank, and publish on a polling cadence.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_adapters::{
    adapter_for_source, AdapterContext, AdapterDeps, ApiCredentials, SourceAdapter,
};
use radar_chain::{ExplorerClient, HttpClientConfig, JsonFetcher};
use radar_core::{
    rank, risk_level_for, verification_score, Category, Chain, Currency, EligibilityCheck,
    EstimatedValue, FilterSpec, Opportunity, OpportunityKind, RankKey, RawRecord, Requirement,
    RequirementKind, SourceCategory, Status,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-engine";

pub const DEFAULT_AIRDROP_POLL_INTERVAL: Duration = Duration::from_millis(300_000);
pub const DEFAULT_SCAN_POLL_INTERVAL: Duration = Duration::from_millis(60_000);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Evict ended/claimed entries once they have gone unobserved for this many
/// cycles. Absence alone never removes an entry.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    pub after_unobserved_cycles: u32,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub feeds_dir: PathBuf,
    pub enabled_chains: Vec<Chain>,
    pub poll_interval: Duration,
    pub adapter_timeout: Duration,
    pub broadcast_capacity: usize,
    pub near_duplicate_threshold: f64,
    pub eviction: Option<EvictionPolicy>,
    pub scheduler_enabled: bool,
    pub rescan_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub credentials: ApiCredentials,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("RADAR_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            feeds_dir: std::env::var("RADAR_FEEDS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("feeds")),
            enabled_chains: std::env::var("RADAR_ENABLED_CHAINS")
                .map(|v| v.split(',').filter_map(Chain::parse).collect())
                .unwrap_or_else(|_| Chain::ALL.to_vec()),
            poll_interval: std::env::var("RADAR_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_AIRDROP_POLL_INTERVAL),
            adapter_timeout: std::env::var("RADAR_ADAPTER_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_secs(30)),
            broadcast_capacity: std::env::var("RADAR_BROADCAST_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
            near_duplicate_threshold: 0.92,
            eviction: std::env::var("RADAR_EVICT_AFTER_CYCLES")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(|after_unobserved_cycles| EvictionPolicy {
                    after_unobserved_cycles,
                }),
            scheduler_enabled: std::env::var("RADAR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            rescan_cron: std::env::var("RADAR_RESCAN_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("RADAR_USER_AGENT")
                .unwrap_or_else(|_| "alpha-radar/0.1".to_string()),
            http_timeout_secs: std::env::var("RADAR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            credentials: ApiCredentials::from_env(),
            workspace_root,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("record {ordinal} from {feed}: missing identity key")]
    MissingIdentity { feed: String, ordinal: usize },
    #[error("record {ordinal} from {feed}: unrecognized {field} {value:?}")]
    InvalidField {
        feed: String,
        ordinal: usize,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("opportunity {0} not found")]
    NotFound(String),
    #[error("no wallet connected")]
    NotConnected,
    #[error("claim requires active status, not {0}")]
    InvalidTransition(&'static str),
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

fn tokenize(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Keyword classification for records whose source reports no category.
pub fn infer_category(name: &str, description: Option<&str>) -> Category {
    let text = format!("{} {}", name, description.unwrap_or_default());
    let tokens = tokenize(&text);
    let has = |needle: &str| tokens.iter().any(|t| t == needle);

    if has("dex") {
        Category::Dex
    } else if has("bridge") {
        Category::Bridge
    } else if has("defi") || has("swap") {
        Category::Defi
    } else if has("game") || has("gaming") || has("play") {
        Category::Gaming
    } else if has("nft") || has("collectible") {
        Category::Nft
    } else if has("ai") || has("artificial") {
        Category::Ai
    } else if has("social") || has("community") {
        Category::Social
    } else if has("meme") || has("dog") || has("cat") || has("inu") {
        Category::Meme
    } else if has("layer2") || has("rollup") {
        Category::Layer2
    } else {
        Category::Infrastructure
    }
}

fn parse_field<T>(
    value: &Option<String>,
    source: &str,
    ordinal: usize,
    field: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, NormalizationError> {
    match value {
        None => Ok(None),
        Some(raw) => parse(raw).map(Some).ok_or_else(|| {
            NormalizationError::InvalidField {
                feed: source.to_string(),
                ordinal,
                field,
                value: raw.clone(),
            }
        }),
    }
}

/// Converts one raw record into a canonical entity with documented defaults:
/// value range `{0, 0, USD}`, confidence 50, status active, kind from the
/// source category, chain from the scanned network (ethereum otherwise). A
/// record with no identity key is rejected rather than silently dropped.
pub fn normalize(
    raw: &RawRecord,
    source: SourceCategory,
    ordinal: usize,
    now: DateTime<Utc>,
) -> Result<Opportunity, NormalizationError> {
    let source_label = source.label();
    if !raw.has_identity() {
        return Err(NormalizationError::MissingIdentity {
            feed: source_label,
            ordinal,
        });
    }

    let chain = match parse_field(&raw.chain, &source_label, ordinal, "chain", Chain::parse)? {
        Some(chain) => chain,
        None => match source {
            SourceCategory::ChainScan(chain) => chain,
            _ => Chain::Ethereum,
        },
    };

    let contract_address = raw.contract_address.as_ref().map(|a| a.to_ascii_lowercase());
    let id = match (&raw.id, &contract_address) {
        (Some(id), _) => id.clone(),
        (None, Some(address)) => format!("{}-{}", chain.as_str(), address),
        (None, None) => format!("{source_label}-{ordinal}"),
    };

    let name = raw.name.clone().unwrap_or_else(|| id.clone());
    let description = raw.extra.get("description").and_then(|v| v.as_str());

    let category = match parse_field(
        &raw.category,
        &source_label,
        ordinal,
        "category",
        Category::parse,
    )? {
        Some(category) => category,
        None => infer_category(&name, description),
    };
    let kind = parse_field(&raw.kind, &source_label, ordinal, "kind", OpportunityKind::parse)?
        .unwrap_or_else(|| source.default_kind());
    let status = parse_field(&raw.status, &source_label, ordinal, "status", Status::parse)?
        .unwrap_or(Status::Active);

    let estimated_value = raw
        .estimated_value
        .as_ref()
        .map(|range| {
            let min = range.min.unwrap_or(0.0);
            EstimatedValue {
                min,
                max: range.max.unwrap_or(min),
                currency: range
                    .currency
                    .as_deref()
                    .and_then(Currency::parse)
                    .unwrap_or(Currency::Usd),
            }
            .normalized()
        })
        .unwrap_or_default();

    let requirements = raw
        .requirements
        .iter()
        .map(|req| {
            let kind = match &req.kind {
                // Unlabelled tasks default to the manual bucket.
                None => RequirementKind::SocialTask,
                Some(raw_kind) => RequirementKind::parse(raw_kind).ok_or_else(|| {
                    NormalizationError::InvalidField {
                        feed: source_label.clone(),
                        ordinal,
                        field: "requirement kind",
                        value: raw_kind.clone(),
                    }
                })?,
            };
            Ok(Requirement {
                kind,
                description: req.description.clone(),
                completed: req.completed.unwrap_or(false),
            })
        })
        .collect::<Result<Vec<_>, NormalizationError>>()?;

    let contract_signals = raw.contract_signals.clone().unwrap_or_default();
    let verified_by = raw.verified_by.clone();
    let score = verification_score(raw.base_score, &verified_by, &contract_signals);

    Ok(Opportunity {
        id,
        name,
        symbol: raw.symbol.clone(),
        contract_address,
        chain,
        category,
        kind,
        status,
        confidence: raw.confidence.unwrap_or(50).min(100),
        verification_score: score,
        risk_level: risk_level_for(score),
        estimated_value,
        requirements,
        eligibility_check: EligibilityCheck::disconnected(),
        social_metrics: raw.social_metrics.unwrap_or_default(),
        contract_signals,
        verified_by,
        sources: raw.sources.clone(),
        created_at: raw.launched_at.unwrap_or(now),
        last_updated: now,
    })
}

// ---------------------------------------------------------------------------
// In-cycle merge
// ---------------------------------------------------------------------------

fn union_preserving_order(into: &mut Vec<String>, from: &[String]) {
    for value in from {
        if !into.iter().any(|existing| existing == value) {
            into.push(value.clone());
        }
    }
}

/// Two adapters reporting the same id in one cycle: the higher-scoring
/// observation wins and the corroboration lists are unioned.
fn merge_observation(merged: &mut HashMap<String, Opportunity>, incoming: Opportunity) {
    match merged.remove(&incoming.id) {
        None => {
            merged.insert(incoming.id.clone(), incoming);
        }
        Some(existing) => {
            let (mut winner, loser) = if incoming.verification_score > existing.verification_score
            {
                (incoming, existing)
            } else {
                (existing, incoming)
            };
            union_preserving_order(&mut winner.verified_by, &loser.verified_by);
            union_preserving_order(&mut winner.sources, &loser.sources);
            merged.insert(winner.id.clone(), winner);
        }
    }
}

fn normalize_name_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Distinct ids whose display names look like the same subject. Flagged for
/// review in diagnostics, never auto-merged.
fn near_duplicates(items: &[&Opportunity], threshold: f64) -> Vec<String> {
    let mut flagged = Vec::new();
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let a = normalize_name_fragment(&items[i].name);
            let b = normalize_name_fragment(&items[j].name);
            let score = jaro_winkler(&a, &b);
            if score >= threshold {
                flagged.push(format!(
                    "{} ~ {} (name similarity {:.2})",
                    items[i].id, items[j].id, score
                ));
            }
        }
    }
    flagged
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedEntry {
    opportunity: Opportunity,
    unobserved_cycles: u32,
}

#[derive(Debug, Default)]
struct CycleMergeOutcome {
    inserted: usize,
    updated: usize,
    evicted: usize,
    anomalies: Vec<String>,
}

/// Identity-keyed store of the most recently seen entity per id. The whole
/// cycle batch is applied under one write guard so concurrent readers never
/// observe a partially merged cycle.
#[derive(Debug, Default)]
struct OpportunityCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl OpportunityCache {
    async fn apply_cycle(
        &self,
        observed: Vec<Opportunity>,
        eviction: Option<EvictionPolicy>,
        now: DateTime<Utc>,
    ) -> CycleMergeOutcome {
        let mut outcome = CycleMergeOutcome::default();
        let observed_ids: HashSet<String> = observed.iter().map(|o| o.id.clone()).collect();
        let mut entries = self.entries.write().await;

        for mut incoming in observed {
            match entries.get_mut(&incoming.id) {
                None => {
                    incoming.last_updated = now;
                    entries.insert(
                        incoming.id.clone(),
                        CachedEntry {
                            opportunity: incoming,
                            unobserved_cycles: 0,
                        },
                    );
                    outcome.inserted += 1;
                }
                Some(entry) => {
                    let existing = &entry.opportunity;
                    incoming.created_at = existing.created_at;
                    if !existing.status.can_transition_to(incoming.status) {
                        outcome.anomalies.push(format!(
                            "{}: status regression {} -> {} ignored",
                            incoming.id,
                            existing.status.as_str(),
                            incoming.status.as_str()
                        ));
                        incoming.status = existing.status;
                    }
                    // Wallet-specific state survives re-observation; a fresh
                    // fetch knows nothing about the connected wallet.
                    if incoming.eligibility_check.is_unchecked()
                        && !existing.eligibility_check.is_unchecked()
                    {
                        incoming.eligibility_check = existing.eligibility_check.clone();
                        for req in &mut incoming.requirements {
                            if let Some(prev) = existing
                                .requirements
                                .iter()
                                .find(|r| r.description == req.description)
                            {
                                req.completed = req.completed || prev.completed;
                            }
                        }
                    }
                    incoming.last_updated = now;
                    entry.opportunity = incoming;
                    entry.unobserved_cycles = 0;
                    outcome.updated += 1;
                }
            }
        }

        for (id, entry) in entries.iter_mut() {
            if !observed_ids.contains(id) {
                entry.unobserved_cycles = entry.unobserved_cycles.saturating_add(1);
            }
        }

        if let Some(policy) = eviction {
            let before = entries.len();
            entries.retain(|_, entry| {
                let done = matches!(entry.opportunity.status, Status::Ended | Status::Claimed);
                !(done && entry.unobserved_cycles >= policy.after_unobserved_cycles)
            });
            outcome.evicted = before - entries.len();
        }

        outcome
    }

    async fn get(&self, id: &str) -> Option<Opportunity> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.opportunity.clone())
    }

    async fn snapshot(&self) -> Vec<Opportunity> {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| entry.opportunity.clone())
            .collect()
    }

    async fn by_category(&self, category: Category) -> Vec<Opportunity> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.opportunity.category == category)
            .map(|entry| entry.opportunity.clone())
            .collect()
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn modify<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Opportunity) -> T,
    ) -> Option<(T, Opportunity)> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id)?;
        let result = apply(&mut entry.opportunity);
        Some((result, entry.opportunity.clone()))
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub error: String,
}

/// Per-cycle summary: what was fetched, what failed, and how the cache
/// changed. Errors recovered during the cycle surface here, not as results.
#[derive(Debug, Clone, Serialize)]
pub struct CycleDiagnostics {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_total: usize,
    pub sources_failed: Vec<SourceFailure>,
    pub records_fetched: usize,
    pub records_normalized: usize,
    pub normalization_errors: Vec<String>,
    pub near_duplicates: Vec<String>,
    pub status_anomalies: Vec<String>,
    pub inserted: usize,
    pub updated: usize,
    pub evicted: usize,
    pub published: usize,
    pub cache_size: usize,
}

// ---------------------------------------------------------------------------
// Wallet signals
// ---------------------------------------------------------------------------

/// Chain-derived facts about a wallet, the inputs to requirement checks.
#[derive(Debug, Clone, Default)]
pub struct WalletSignals {
    pub transaction_count: u64,
    pub token_transfer_count: u64,
    pub interacted_contracts: Vec<String>,
    pub held_token_contracts: Vec<String>,
}

#[async_trait]
pub trait WalletSignalProvider: Send + Sync {
    async fn signals_for(&self, wallet: &str) -> Result<WalletSignals>;
}

/// Provider used when no explorer credential is configured: a connected
/// wallet yields no corroborating signals and therefore no eligibility.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWalletSignals;

#[async_trait]
impl WalletSignalProvider for NoWalletSignals {
    async fn signals_for(&self, _wallet: &str) -> Result<WalletSignals> {
        Ok(WalletSignals::default())
    }
}

/// Explorer-backed wallet signals (txlist + tokentx for the wallet).
pub struct ExplorerWalletProvider {
    client: ExplorerClient,
}

impl ExplorerWalletProvider {
    pub fn new(client: ExplorerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WalletSignalProvider for ExplorerWalletProvider {
    async fn signals_for(&self, wallet: &str) -> Result<WalletSignals> {
        let probe_id = Uuid::new_v4();
        let txs = self.client.wallet_transactions(probe_id, wallet).await?;
        let token_txs = self.client.wallet_token_transfers(probe_id, wallet).await?;

        let wallet_lower = wallet.to_ascii_lowercase();
        let interacted: Vec<String> = txs
            .iter()
            .map(|tx| tx.to.to_ascii_lowercase())
            .filter(|to| !to.is_empty() && *to != wallet_lower)
            .collect();
        let held: Vec<String> = token_txs
            .iter()
            .filter(|tx| tx.to.eq_ignore_ascii_case(wallet))
            .map(|tx| tx.contract_address.to_ascii_lowercase())
            .collect();

        Ok(WalletSignals {
            transaction_count: txs.len() as u64,
            token_transfer_count: token_txs.len() as u64,
            interacted_contracts: interacted,
            held_token_contracts: held,
        })
    }
}

/// Minimum wallet transactions for an "activity" requirement to count.
const ACTIVITY_TX_FLOOR: u64 = 10;

fn requirement_satisfied(
    requirement: &Requirement,
    opportunity: &Opportunity,
    signals: &WalletSignals,
) -> bool {
    match requirement.kind {
        RequirementKind::WalletActivity => signals.transaction_count >= ACTIVITY_TX_FLOOR,
        RequirementKind::TokenHold => match &opportunity.contract_address {
            Some(address) => signals
                .held_token_contracts
                .iter()
                .any(|held| held == address),
            None => signals.token_transfer_count > 0,
        },
        RequirementKind::ProtocolInteraction => match &opportunity.contract_address {
            Some(address) => signals
                .interacted_contracts
                .iter()
                .any(|contract| contract == address),
            None => signals.transaction_count > 0,
        },
        // Manual tasks cannot be corroborated from chain data.
        RequirementKind::SocialTask | RequirementKind::Referral | RequirementKind::Testnet => false,
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Receiver half of the publish channel. Dropping it unsubscribes; a slow
/// subscriber skips missed snapshots instead of blocking the poller.
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<Vec<Opportunity>>>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Arc<Vec<Opportunity>>> {
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged, skipping stale snapshots");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_next(&mut self) -> Option<Arc<Vec<Opportunity>>> {
        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged, skipping stale snapshots");
                }
                Err(_) => return None,
            }
        }
    }
}

#[derive(Default)]
struct PollerState {
    handle: Option<tokio::task::JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One engine instance owns its adapters, cache, poller, and subscriber
/// channel; its caller constructs, starts, stops, and drops it. There is no
/// ambient global instance.
pub struct OpportunityEngine {
    config: EngineConfig,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    cache: OpportunityCache,
    publisher: broadcast::Sender<Arc<Vec<Opportunity>>>,
    poller: StdMutex<PollerState>,
    last_diagnostics: RwLock<Option<CycleDiagnostics>>,
    wallet_signals: Arc<dyn WalletSignalProvider>,
}

impl OpportunityEngine {
    pub fn new(config: EngineConfig, registry: &SourceRegistry) -> Result<Self> {
        let fetcher = Arc::new(JsonFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?);

        let deps = AdapterDeps {
            fetcher: fetcher.clone(),
            feeds_dir: config.feeds_dir.clone(),
            credentials: config.credentials.clone(),
        };

        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for source in registry.enabled() {
            match adapter_for_source(&source.source_id, &deps) {
                Some(adapter) => adapters.push(Arc::from(adapter)),
                None => warn!(
                    source_id = source.source_id.as_str(),
                    "no adapter available, source skipped"
                ),
            }
        }

        let wallet_signals: Arc<dyn WalletSignalProvider> =
            if config.credentials.etherscan.is_empty() {
                Arc::new(NoWalletSignals)
            } else {
                let client = ExplorerClient::new(
                    Chain::Ethereum,
                    config.credentials.etherscan.clone(),
                    fetcher,
                )
                .context("building wallet explorer client")?;
                Arc::new(ExplorerWalletProvider::new(client))
            };

        let (publisher, _) = broadcast::channel(config.broadcast_capacity.max(1));

        Ok(Self {
            config,
            adapters,
            cache: OpportunityCache::default(),
            publisher,
            poller: StdMutex::new(PollerState::default()),
            last_diagnostics: RwLock::new(None),
            wallet_signals,
        })
    }

    /// Replaces the adapter set; used to assemble engines over bespoke or
    /// in-memory sources.
    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_wallet_provider(mut self, provider: Arc<dyn WalletSignalProvider>) -> Self {
        self.wallet_signals = provider;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one full aggregation cycle and merges the result into the cache.
    /// Never fails: adapter and normalization errors are collected into the
    /// returned diagnostics.
    pub async fn run_cycle(&self) -> CycleDiagnostics {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ctx = AdapterContext {
            cycle_id,
            fetched_at: started_at,
            enabled_chains: self.config.enabled_chains.clone(),
        };

        let mut tasks = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            let timeout = self.config.adapter_timeout;
            tasks.spawn(async move {
                let source_id = adapter.source_id();
                let category = adapter.source_category();
                let result = match tokio::time::timeout(timeout, adapter.fetch(&ctx)).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                };
                (source_id, category, result)
            });
        }

        let mut sources_failed = Vec::new();
        let mut normalization_errors = Vec::new();
        let mut records_fetched = 0usize;
        let mut records_normalized = 0usize;
        let mut merged: HashMap<String, Opportunity> = HashMap::new();

        while let Some(joined) = tasks.join_next().await {
            let (source_id, category, result) = match joined {
                Ok(output) => output,
                Err(err) => {
                    warn!(error = %err, "adapter task failed to join");
                    continue;
                }
            };
            match result {
                Err(error) => {
                    warn!(source_id = source_id.as_str(), error = error.as_str(), "source failed");
                    sources_failed.push(SourceFailure { source_id, error });
                }
                Ok(records) => {
                    records_fetched += records.len();
                    for (ordinal, raw) in records.iter().enumerate() {
                        match normalize(raw, category, ordinal, started_at) {
                            Ok(opportunity) => {
                                records_normalized += 1;
                                merge_observation(&mut merged, opportunity);
                            }
                            Err(err) => {
                                debug!(error = %err, "dropping malformed record");
                                normalization_errors.push(err.to_string());
                            }
                        }
                    }
                }
            }
        }

        let merged_refs: Vec<&Opportunity> = merged.values().collect();
        let near_duplicates =
            near_duplicates(&merged_refs, self.config.near_duplicate_threshold);
        for flag in &near_duplicates {
            warn!(pair = flag.as_str(), "possible duplicate across sources");
        }

        let observed: Vec<Opportunity> = merged.into_values().collect();
        let outcome = self
            .cache
            .apply_cycle(observed, self.config.eviction, Utc::now())
            .await;

        let diagnostics = CycleDiagnostics {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            sources_total: self.adapters.len(),
            sources_failed,
            records_fetched,
            records_normalized,
            normalization_errors,
            near_duplicates,
            status_anomalies: outcome.anomalies,
            inserted: outcome.inserted,
            updated: outcome.updated,
            evicted: outcome.evicted,
            published: 0,
            cache_size: self.cache.len().await,
        };

        info!(
            cycle_id = %diagnostics.cycle_id,
            fetched = diagnostics.records_fetched,
            normalized = diagnostics.records_normalized,
            failed_sources = diagnostics.sources_failed.len(),
            cache = diagnostics.cache_size,
            "cycle complete"
        );

        *self.last_diagnostics.write().await = Some(diagnostics.clone());
        diagnostics
    }

    async fn publish_default(&self) -> usize {
        let snapshot = self
            .snapshot_filtered(&FilterSpec::high_quality(), RankKey::default())
            .await;
        let count = snapshot.len();
        if self.publisher.send(Arc::new(snapshot)).is_err() {
            debug!("no subscribers for published snapshot");
        }
        count
    }

    /// On-demand query: runs the same pipeline as a poll tick, refreshing the
    /// cache, then returns the filtered, ranked result.
    pub async fn get_opportunities(&self, filter: &FilterSpec) -> Vec<Opportunity> {
        self.get_opportunities_by(filter, RankKey::default()).await
    }

    pub async fn get_opportunities_by(
        &self,
        filter: &FilterSpec,
        key: RankKey,
    ) -> Vec<Opportunity> {
        self.run_cycle().await;
        self.snapshot_filtered(filter, key).await
    }

    /// Cache-only query; no sources are contacted.
    pub async fn snapshot_filtered(&self, filter: &FilterSpec, key: RankKey) -> Vec<Opportunity> {
        let mut items = filter.apply(self.cache.snapshot().await);
        rank(&mut items, key);
        items
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Opportunity, QueryError> {
        self.cache
            .get(id)
            .await
            .ok_or_else(|| QueryError::NotFound(id.to_string()))
    }

    pub async fn get_by_category(&self, category: Category) -> Vec<Opportunity> {
        let mut items = self.cache.by_category(category).await;
        rank(&mut items, RankKey::default());
        items
    }

    pub async fn latest_diagnostics(&self) -> Option<CycleDiagnostics> {
        self.last_diagnostics.read().await.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.publisher.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.receiver_count()
    }

    /// Starts (or restarts) the poll loop. Restarting while running swaps
    /// the interval without double-scheduling; the first tick fires one
    /// interval after the call.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let period = interval.max(Duration::from_millis(1));
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut diagnostics = engine.run_cycle().await;
                diagnostics.published = engine.publish_default().await;
                *engine.last_diagnostics.write().await = Some(diagnostics);
            }
        });

        let mut state = self.poller.lock().expect("poller state lock");
        if let Some(previous) = state.handle.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the poll loop. Idempotent, never blocks on the running tick,
    /// and safe to call from inside a subscriber task.
    pub fn stop(&self) {
        let mut state = self.poller.lock().expect("poller state lock");
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        let state = self.poller.lock().expect("poller state lock");
        state
            .handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Optional cron-driven deep rescan on top of the interval poller.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.rescan_cron.clone();
        let engine = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            Box::pin(async move {
                let diagnostics = engine.run_cycle().await;
                engine.publish_default().await;
                info!(cycle_id = %diagnostics.cycle_id, "scheduled rescan complete");
            })
        })
        .with_context(|| format!("creating rescan job for cron {cron}"))?;
        sched.add(job).await.context("adding rescan job")?;
        Ok(Some(sched))
    }

    /// Evaluates a wallet against an opportunity's requirements. A missing
    /// wallet yields the disconnected default rather than an error; an
    /// unknown id is a typed not-found.
    pub async fn check_eligibility(
        &self,
        id: &str,
        wallet: Option<&str>,
    ) -> Result<EligibilityCheck, QueryError> {
        let Some(wallet) = wallet.filter(|w| !w.trim().is_empty()) else {
            return Ok(EligibilityCheck::disconnected());
        };

        let opportunity = self
            .cache
            .get(id)
            .await
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;

        let signals = match self.wallet_signals.signals_for(wallet).await {
            Ok(signals) => signals,
            Err(err) => {
                warn!(error = %err, "wallet signal lookup failed; treating as no signals");
                WalletSignals::default()
            }
        };

        let mut satisfied = Vec::new();
        let mut verifiable = 0usize;
        let mut all_met = true;
        for requirement in &opportunity.requirements {
            if !requirement.kind.wallet_verifiable() {
                continue;
            }
            verifiable += 1;
            if requirement_satisfied(requirement, &opportunity, &signals) {
                satisfied.push(requirement.description.clone());
            } else {
                all_met = false;
            }
        }
        // Nothing verifiable on-chain: refuse to claim eligibility.
        let meets_requirements = verifiable > 0 && all_met;

        let check = EligibilityCheck {
            wallet_connected: true,
            meets_requirements,
            estimated_reward: meets_requirements
                .then(|| opportunity.estimated_value.midpoint_label()),
        };

        let stored = check.clone();
        self.cache
            .modify(id, move |entry| {
                entry.eligibility_check = stored;
                for requirement in &mut entry.requirements {
                    if satisfied.contains(&requirement.description) {
                        requirement.completed = true;
                    }
                }
            })
            .await;

        Ok(check)
    }

    /// Records a wallet claim: the only path into the claimed status, and
    /// only from active.
    pub async fn record_claim(&self, id: &str) -> Result<Opportunity, QueryError> {
        let outcome = self
            .cache
            .modify(id, |entry| {
                if entry.status != Status::Active {
                    return Err(QueryError::InvalidTransition(entry.status.as_str()));
                }
                entry.status = Status::Claimed;
                entry.last_updated = Utc::now();
                Ok(())
            })
            .await;
        match outcome {
            None => Err(QueryError::NotFound(id.to_string())),
            Some((Err(err), _)) => Err(err),
            Some((Ok(()), updated)) => Ok(updated),
        }
    }
}

impl Drop for OpportunityEngine {
    fn drop(&mut self) {
        if let Ok(mut state) = self.poller.lock() {
            if let Some(handle) = state.handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radar_core::{RawRequirement, RawValueRange};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticAdapter {
        id: String,
        category: SourceCategory,
        records: Vec<RawRecord>,
        calls: Arc<AtomicUsize>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl StaticAdapter {
        fn new(category: SourceCategory, records: Vec<RawRecord>) -> Self {
            Self {
                id: category.label(),
                category,
                records,
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
                delay: None,
            }
        }

        fn failing(category: SourceCategory) -> Self {
            Self {
                fail: true,
                ..Self::new(category, Vec::new())
            }
        }

        fn slow(category: SourceCategory, records: Vec<RawRecord>, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(category, records)
            }
        }

        fn call_counter(&self) -> Arc<AtomicUsize> {
            self.calls.clone()
        }
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn source_id(&self) -> String {
            self.id.clone()
        }

        fn source_category(&self) -> SourceCategory {
            self.category
        }

        async fn fetch(
            &self,
            _ctx: &AdapterContext,
        ) -> std::result::Result<Vec<RawRecord>, radar_adapters::AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(radar_adapters::AdapterError::Message(
                    "upstream unavailable".to_string(),
                ));
            }
            Ok(self.records.clone())
        }
    }

    /// Adapter whose output can be swapped between cycles.
    struct MutableAdapter {
        records: Arc<std::sync::Mutex<Vec<RawRecord>>>,
    }

    impl MutableAdapter {
        fn new(initial: Vec<RawRecord>) -> (Arc<Self>, Arc<std::sync::Mutex<Vec<RawRecord>>>) {
            let records = Arc::new(std::sync::Mutex::new(initial));
            (
                Arc::new(Self {
                    records: records.clone(),
                }),
                records,
            )
        }
    }

    #[async_trait]
    impl SourceAdapter for MutableAdapter {
        fn source_id(&self) -> String {
            "confirmed".to_string()
        }

        fn source_category(&self) -> SourceCategory {
            SourceCategory::Confirmed
        }

        async fn fetch(
            &self,
            _ctx: &AdapterContext,
        ) -> std::result::Result<Vec<RawRecord>, radar_adapters::AdapterError> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            workspace_root: PathBuf::from("."),
            feeds_dir: PathBuf::from("feeds"),
            enabled_chains: Chain::ALL.to_vec(),
            poll_interval: Duration::from_millis(100),
            adapter_timeout: Duration::from_secs(1),
            broadcast_capacity: 4,
            near_duplicate_threshold: 0.92,
            eviction: None,
            scheduler_enabled: false,
            rescan_cron: "0 0 6 * * *".to_string(),
            user_agent: "radar-test/0".to_string(),
            http_timeout_secs: 5,
            credentials: ApiCredentials::default(),
        }
    }

    fn engine_with(adapters: Vec<Arc<dyn SourceAdapter>>) -> OpportunityEngine {
        let registry = SourceRegistry { sources: Vec::new() };
        OpportunityEngine::new(test_config(), &registry)
            .unwrap()
            .with_adapters(adapters)
    }

    fn raw(name: &str, confidence: u8) -> RawRecord {
        RawRecord {
            name: Some(name.to_string()),
            chain: Some("ethereum".to_string()),
            category: Some("layer2".to_string()),
            status: Some("active".to_string()),
            confidence: Some(confidence),
            estimated_value: Some(RawValueRange {
                min: Some(100.0),
                max: Some(1000.0),
                currency: Some("USD".to_string()),
            }),
            ..RawRecord::default()
        }
    }

    #[test]
    fn normalize_applies_documented_defaults() {
        let record = RawRecord {
            name: Some("Mystery Rollup".to_string()),
            ..RawRecord::default()
        };
        let now = Utc::now();
        let opportunity = normalize(&record, SourceCategory::Potential, 3, now).unwrap();

        assert_eq!(opportunity.id, "potential-3");
        assert_eq!(opportunity.chain, Chain::Ethereum);
        assert_eq!(opportunity.kind, OpportunityKind::Potential);
        assert_eq!(opportunity.status, Status::Active);
        assert_eq!(opportunity.confidence, 50);
        assert_eq!(opportunity.estimated_value, EstimatedValue::default());
        assert_eq!(opportunity.verification_score, 50);
        assert!(opportunity.eligibility_check.is_unchecked());
        assert_eq!(opportunity.created_at, now);
    }

    #[test]
    fn normalize_rejects_missing_identity() {
        let record = RawRecord::default();
        let err = normalize(&record, SourceCategory::Confirmed, 0, Utc::now()).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingIdentity { .. }));
    }

    #[test]
    fn normalize_rejects_unknown_chain() {
        let record = RawRecord {
            name: Some("Mystery".to_string()),
            chain: Some("dogechain".to_string()),
            ..RawRecord::default()
        };
        let err = normalize(&record, SourceCategory::Confirmed, 0, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            NormalizationError::InvalidField { field: "chain", .. }
        ));
    }

    #[test]
    fn normalize_derives_contract_id() {
        let record = RawRecord {
            name: Some("Fresh Token".to_string()),
            contract_address: Some("0xABCDEF0000000000000000000000000000000001".to_string()),
            ..RawRecord::default()
        };
        let opportunity = normalize(
            &record,
            SourceCategory::ChainScan(Chain::Bsc),
            0,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            opportunity.id,
            "bsc-0xabcdef0000000000000000000000000000000001"
        );
        assert_eq!(opportunity.chain, Chain::Bsc);
        assert_eq!(opportunity.kind, OpportunityKind::NewToken);
    }

    #[test]
    fn normalize_swaps_inverted_value_range() {
        let record = RawRecord {
            name: Some("Swapped".to_string()),
            estimated_value: Some(RawValueRange {
                min: Some(900.0),
                max: Some(100.0),
                currency: None,
            }),
            ..RawRecord::default()
        };
        let opportunity = normalize(&record, SourceCategory::Confirmed, 0, Utc::now()).unwrap();
        assert_eq!(opportunity.estimated_value.min, 100.0);
        assert_eq!(opportunity.estimated_value.max, 900.0);
    }

    #[test]
    fn normalize_rejects_unknown_requirement_kind() {
        let record = RawRecord {
            name: Some("Tasked".to_string()),
            requirements: vec![RawRequirement {
                kind: Some("sacrifice".to_string()),
                description: "do the thing".to_string(),
                completed: None,
            }],
            ..RawRecord::default()
        };
        let err = normalize(&record, SourceCategory::Confirmed, 0, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            NormalizationError::InvalidField {
                field: "requirement kind",
                ..
            }
        ));
    }

    #[test]
    fn category_inference_uses_keywords() {
        assert_eq!(infer_category("SuperSwap Finance", None), Category::Defi);
        assert_eq!(infer_category("PixelPlay", Some("a gaming guild")), Category::Gaming);
        assert_eq!(infer_category("Ape Collectible Market", None), Category::Nft);
        assert_eq!(infer_category("Doge Inu", None), Category::Meme);
        assert_eq!(infer_category("AI Oracle", None), Category::Ai);
        // "chain" must not trip the ai keyword.
        assert_eq!(infer_category("Chainlet", None), Category::Infrastructure);
    }

    #[tokio::test]
    async fn same_id_merge_keeps_higher_score_and_unions_lists() {
        let mut weak = raw("Shared Project", 60);
        weak.id = Some("shared-1".to_string());
        weak.base_score = Some(55);
        weak.verified_by = vec!["Scout A".to_string()];
        weak.sources = vec!["feed-a".to_string()];

        let mut strong = raw("Shared Project", 70);
        strong.id = Some("shared-1".to_string());
        strong.base_score = Some(81);
        strong.verified_by = vec!["Scout B".to_string()];
        strong.sources = vec!["feed-b".to_string()];

        let engine = engine_with(vec![
            Arc::new(StaticAdapter::new(SourceCategory::Confirmed, vec![weak])),
            Arc::new(StaticAdapter::new(SourceCategory::Potential, vec![strong])),
        ]);

        engine.run_cycle().await;
        let merged = engine.get_by_id("shared-1").await.unwrap();
        assert_eq!(merged.verification_score, 82); // 81 base + 1 verifier
        assert!(merged.verified_by.contains(&"Scout A".to_string()));
        assert!(merged.verified_by.contains(&"Scout B".to_string()));
        assert!(merged.sources.contains(&"feed-a".to_string()));
        assert!(merged.sources.contains(&"feed-b".to_string()));
    }

    #[tokio::test]
    async fn reobservation_updates_in_place() {
        let mut record = raw("Stable Project", 80);
        record.id = Some("stable-1".to_string());
        let adapter = Arc::new(StaticAdapter::new(SourceCategory::Confirmed, vec![record]));
        let engine = engine_with(vec![adapter]);

        let first = engine.run_cycle().await;
        assert_eq!(first.inserted, 1);
        let created = engine.get_by_id("stable-1").await.unwrap().created_at;

        let second = engine.run_cycle().await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);
        assert_eq!(second.cache_size, 1);

        let entry = engine.get_by_id("stable-1").await.unwrap();
        assert_eq!(entry.created_at, created);
        assert!(entry.last_updated >= created);
    }

    #[tokio::test]
    async fn status_regression_is_logged_not_applied() {
        let mut active = raw("Regressor", 70);
        active.id = Some("reg-1".to_string());
        active.status = Some("active".to_string());
        let mut regressed = active.clone();
        regressed.status = Some("upcoming".to_string());

        let (adapter, records) = MutableAdapter::new(vec![active]);
        let engine = engine_with(vec![adapter]);
        engine.run_cycle().await;
        assert_eq!(
            engine.get_by_id("reg-1").await.unwrap().status,
            Status::Active
        );

        *records.lock().unwrap() = vec![regressed];
        let diagnostics = engine.run_cycle().await;
        assert_eq!(diagnostics.status_anomalies.len(), 1);
        assert!(diagnostics.status_anomalies[0].contains("active -> upcoming"));
        assert_eq!(
            engine.get_by_id("reg-1").await.unwrap().status,
            Status::Active
        );
    }

    #[tokio::test]
    async fn failing_adapter_does_not_abort_cycle() {
        let good = Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![raw("Survivor", 80)],
        ));
        let bad = Arc::new(StaticAdapter::failing(SourceCategory::Potential));
        let engine = engine_with(vec![good, bad]);

        let diagnostics = engine.run_cycle().await;
        assert_eq!(diagnostics.sources_failed.len(), 1);
        assert_eq!(diagnostics.sources_failed[0].source_id, "potential");
        assert_eq!(diagnostics.records_normalized, 1);
        assert_eq!(diagnostics.cache_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_adapter_times_out_without_blocking_cycle() {
        let fast = Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![raw("Quick", 80)],
        ));
        let slow = Arc::new(StaticAdapter::slow(
            SourceCategory::Potential,
            vec![raw("Tardy", 70)],
            Duration::from_secs(30),
        ));
        let engine = engine_with(vec![fast, slow]);

        let diagnostics = engine.run_cycle().await;
        assert_eq!(diagnostics.sources_failed.len(), 1);
        assert!(diagnostics.sources_failed[0].error.contains("timed out"));
        assert_eq!(diagnostics.cache_size, 1);
    }

    #[tokio::test]
    async fn all_sources_failing_still_completes_cycle() {
        let engine = engine_with(vec![
            Arc::new(StaticAdapter::failing(SourceCategory::Confirmed)),
            Arc::new(StaticAdapter::failing(SourceCategory::Potential)),
        ]);
        let diagnostics = engine.run_cycle().await;
        assert_eq!(diagnostics.sources_failed.len(), 2);
        assert_eq!(diagnostics.records_fetched, 0);
        assert_eq!(diagnostics.cache_size, 0);
    }

    #[tokio::test]
    async fn malformed_records_surface_in_diagnostics() {
        let broken = RawRecord::default(); // no identity at all
        let engine = engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![broken, raw("Fine", 60)],
        ))]);
        let diagnostics = engine.run_cycle().await;
        assert_eq!(diagnostics.records_fetched, 2);
        assert_eq!(diagnostics.records_normalized, 1);
        assert_eq!(diagnostics.normalization_errors.len(), 1);
        assert!(diagnostics.normalization_errors[0].contains("missing identity"));
    }

    #[tokio::test]
    async fn near_duplicates_are_flagged_not_merged() {
        let mut a = raw("AI Data Contributor", 70);
        a.id = Some("feed-a-0".to_string());
        let mut b = raw("AI Data Contributer", 70);
        b.id = Some("feed-b-0".to_string());

        let engine = engine_with(vec![
            Arc::new(StaticAdapter::new(SourceCategory::Confirmed, vec![a])),
            Arc::new(StaticAdapter::new(SourceCategory::Potential, vec![b])),
        ]);
        let diagnostics = engine.run_cycle().await;
        assert_eq!(diagnostics.near_duplicates.len(), 1);
        assert_eq!(diagnostics.cache_size, 2);
    }

    #[tokio::test]
    async fn eviction_removes_done_entries_after_unobserved_cycles() {
        let mut ended = raw("Finished", 50);
        ended.id = Some("done-1".to_string());
        ended.status = Some("ended".to_string());

        let (adapter, records) = MutableAdapter::new(vec![ended]);
        let mut config = test_config();
        config.eviction = Some(EvictionPolicy {
            after_unobserved_cycles: 2,
        });
        let registry = SourceRegistry { sources: Vec::new() };
        let engine = OpportunityEngine::new(config, &registry)
            .unwrap()
            .with_adapters(vec![adapter]);

        engine.run_cycle().await;
        assert!(engine.get_by_id("done-1").await.is_ok());

        *records.lock().unwrap() = Vec::new();
        engine.run_cycle().await; // unobserved x1
        assert!(engine.get_by_id("done-1").await.is_ok());
        let diagnostics = engine.run_cycle().await; // unobserved x2 -> evicted
        assert_eq!(diagnostics.evicted, 1);
        assert!(engine.get_by_id("done-1").await.is_err());
    }

    #[tokio::test]
    async fn absence_without_eviction_policy_never_deletes() {
        let mut sticky = raw("Sticky", 70);
        sticky.id = Some("sticky-1".to_string());

        let (adapter, records) = MutableAdapter::new(vec![sticky]);
        let engine = engine_with(vec![adapter]);
        engine.run_cycle().await;
        *records.lock().unwrap() = Vec::new();
        engine.run_cycle().await;
        engine.run_cycle().await;
        assert!(engine.get_by_id("sticky-1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_ticks_once_per_interval_and_stop_start_does_not_double_fire() {
        let adapter = Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![raw("Polled", 80)],
        ));
        let calls = adapter.call_counter();
        let engine = Arc::new(engine_with(vec![adapter]));

        engine.start(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Restart while running: interval replaced, no double-scheduling.
        engine.start(Duration::from_millis(100));
        engine.stop();
        engine.start(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        engine.stop();
        engine.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_receive_ranked_snapshots() {
        let mut rich = raw("Rich", 70);
        rich.id = Some("rich-1".to_string());
        rich.base_score = Some(90);
        rich.estimated_value = Some(RawValueRange {
            min: Some(100.0),
            max: Some(5000.0),
            currency: None,
        });
        let mut modest = raw("Modest", 60);
        modest.id = Some("modest-1".to_string());
        modest.base_score = Some(90);
        modest.estimated_value = Some(RawValueRange {
            min: Some(10.0),
            max: Some(100.0),
            currency: None,
        });

        let engine = Arc::new(engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![rich, modest],
        ))]));
        let mut subscription = engine.subscribe();

        engine.start(Duration::from_millis(50));
        let snapshot = subscription.next().await.unwrap();
        engine.stop();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "rich-1");
        assert_eq!(snapshot[1].id, "modest-1");
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_subscriber_does_not_block_poller_or_peers() {
        let adapter = Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![raw("Busy", 70)],
        ));
        let calls = adapter.call_counter();
        let engine = Arc::new(engine_with(vec![adapter]));

        let _stalled = engine.subscribe(); // never drained
        let mut live = engine.subscribe();

        engine.start(Duration::from_millis(50));
        // Far more ticks than the channel capacity of 4.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        engine.stop();

        assert!(calls.load(Ordering::SeqCst) >= 10);
        assert!(live.try_next().is_some());
    }

    #[tokio::test]
    async fn default_publish_excludes_ended_entries() {
        let mut live = raw("Live", 70);
        live.id = Some("live-1".to_string());
        let mut done = raw("Done", 70);
        done.id = Some("done-1".to_string());
        done.status = Some("ended".to_string());

        let engine = engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![live, done],
        ))]);
        engine.run_cycle().await;

        let published = engine
            .snapshot_filtered(&FilterSpec::high_quality(), RankKey::default())
            .await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, "live-1");

        // History still reachable when asked for explicitly.
        let ended = engine
            .snapshot_filtered(
                &FilterSpec {
                    statuses: Some(vec![Status::Ended]),
                    ..FilterSpec::default()
                },
                RankKey::default(),
            )
            .await;
        assert_eq!(ended.len(), 1);
    }

    struct FixedSignals(WalletSignals);

    #[async_trait]
    impl WalletSignalProvider for FixedSignals {
        async fn signals_for(&self, _wallet: &str) -> Result<WalletSignals> {
            Ok(self.0.clone())
        }
    }

    fn eligible_record() -> RawRecord {
        let mut record = raw("Eligible Project", 80);
        record.id = Some("elig-1".to_string());
        record.contract_address = Some("0x00000000000000000000000000000000000000aa".to_string());
        record.requirements = vec![
            RawRequirement {
                kind: Some("wallet_activity".to_string()),
                description: "Stay active on mainnet".to_string(),
                completed: None,
            },
            RawRequirement {
                kind: Some("protocol_interaction".to_string()),
                description: "Use the protocol".to_string(),
                completed: None,
            },
            RawRequirement {
                kind: Some("social_task".to_string()),
                description: "Follow on Twitter".to_string(),
                completed: None,
            },
        ];
        record
    }

    #[tokio::test]
    async fn eligibility_without_wallet_is_disconnected_not_error() {
        let engine = engine_with(Vec::new());
        let check = engine.check_eligibility("anything", None).await.unwrap();
        assert!(!check.wallet_connected);
        assert!(!check.meets_requirements);
        assert!(check.estimated_reward.is_none());
    }

    #[tokio::test]
    async fn eligibility_unknown_id_with_wallet_is_not_found() {
        let engine = engine_with(Vec::new());
        let err = engine
            .check_eligibility("ghost", Some("0xwallet"))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::NotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn eligibility_midpoint_reward_and_writeback() {
        let engine = engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![eligible_record()],
        ))])
        .with_wallet_provider(Arc::new(FixedSignals(WalletSignals {
            transaction_count: 25,
            token_transfer_count: 3,
            interacted_contracts: vec!["0x00000000000000000000000000000000000000aa".to_string()],
            held_token_contracts: Vec::new(),
        })));
        engine.run_cycle().await;

        let check = engine
            .check_eligibility("elig-1", Some("0xwallet"))
            .await
            .unwrap();
        assert!(check.wallet_connected);
        assert!(check.meets_requirements);
        assert_eq!(check.estimated_reward.as_deref(), Some("$550"));

        // Stored back: the eligible-only filter now matches.
        let eligible = engine
            .snapshot_filtered(
                &FilterSpec {
                    eligible_only: true,
                    ..FilterSpec::default()
                },
                RankKey::default(),
            )
            .await;
        assert_eq!(eligible.len(), 1);
        let stored = &eligible[0];
        assert!(stored.requirements[0].completed);
        assert!(stored.requirements[1].completed);
        assert!(!stored.requirements[2].completed); // manual task untouched
    }

    #[tokio::test]
    async fn eligibility_fails_when_signals_insufficient() {
        let engine = engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![eligible_record()],
        ))])
        .with_wallet_provider(Arc::new(FixedSignals(WalletSignals {
            transaction_count: 2, // below the activity floor
            ..WalletSignals::default()
        })));
        engine.run_cycle().await;

        let check = engine
            .check_eligibility("elig-1", Some("0xwallet"))
            .await
            .unwrap();
        assert!(check.wallet_connected);
        assert!(!check.meets_requirements);
        assert!(check.estimated_reward.is_none());
    }

    #[tokio::test]
    async fn eligibility_refuses_when_nothing_is_verifiable() {
        let mut record = raw("Manual Only", 70);
        record.id = Some("manual-1".to_string());
        record.requirements = vec![RawRequirement {
            kind: Some("social_task".to_string()),
            description: "Retweet".to_string(),
            completed: None,
        }];
        let engine = engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![record],
        ))])
        .with_wallet_provider(Arc::new(FixedSignals(WalletSignals {
            transaction_count: 1000,
            ..WalletSignals::default()
        })));
        engine.run_cycle().await;

        let check = engine
            .check_eligibility("manual-1", Some("0xwallet"))
            .await
            .unwrap();
        assert!(!check.meets_requirements);
    }

    #[tokio::test]
    async fn claim_only_from_active() {
        let mut active = raw("Claimable", 70);
        active.id = Some("claim-1".to_string());
        let mut upcoming = raw("NotYet", 70);
        upcoming.id = Some("claim-2".to_string());
        upcoming.status = Some("upcoming".to_string());

        let engine = engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![active, upcoming],
        ))]);
        engine.run_cycle().await;

        let claimed = engine.record_claim("claim-1").await.unwrap();
        assert_eq!(claimed.status, Status::Claimed);

        let err = engine.record_claim("claim-2").await.unwrap_err();
        assert_eq!(err, QueryError::InvalidTransition("upcoming"));

        let err = engine.record_claim("missing").await.unwrap_err();
        assert!(matches!(err, QueryError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_by_category_is_ranked() {
        let mut a = raw("Alpha", 60);
        a.id = Some("cat-a".to_string());
        a.base_score = Some(90);
        let mut b = raw("Beta", 90);
        b.id = Some("cat-b".to_string());
        b.base_score = Some(90);
        let engine = engine_with(vec![Arc::new(StaticAdapter::new(
            SourceCategory::Confirmed,
            vec![a, b],
        ))]);
        engine.run_cycle().await;

        let ranked = engine.get_by_category(Category::Layer2).await;
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "cat-b"); // same composite, higher confidence
    }

    #[test]
    fn registry_yaml_parses_enabled_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - source_id: confirmed\n    display_name: Confirmed feed\n    enabled: true\n  - source_id: bsc-scan\n    display_name: BSC scan\n    enabled: false\n    notes: waiting on key\n",
        )
        .unwrap();

        let registry = SourceRegistry::load(&path).unwrap();
        assert_eq!(registry.sources.len(), 2);
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["confirmed"]);
    }
}
