//! Core domain model, scoring rule, and filter/rank primitives for the radar.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "radar-core";

/// Networks the radar knows how to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Bsc,
    Polygon,
    Arbitrum,
    Optimism,
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 6] = [
        Chain::Ethereum,
        Chain::Bsc,
        Chain::Polygon,
        Chain::Arbitrum,
        Chain::Optimism,
        Chain::Solana,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Bsc => "bsc",
            Chain::Polygon => "polygon",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Solana => "solana",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(input.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Defi,
    Gaming,
    Nft,
    Infrastructure,
    Layer2,
    Bridge,
    Dex,
    Ai,
    Social,
    Meme,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Defi,
        Category::Gaming,
        Category::Nft,
        Category::Infrastructure,
        Category::Layer2,
        Category::Bridge,
        Category::Dex,
        Category::Ai,
        Category::Social,
        Category::Meme,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Defi => "defi",
            Category::Gaming => "gaming",
            Category::Nft => "nft",
            Category::Infrastructure => "infrastructure",
            Category::Layer2 => "layer2",
            Category::Bridge => "bridge",
            Category::Dex => "dex",
            Category::Ai => "ai",
            Category::Social => "social",
            Category::Meme => "meme",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(input.trim()))
    }
}

/// Origin tag distinguishing how a lead entered the radar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    Confirmed,
    Potential,
    Retroactive,
    Ongoing,
    NewToken,
}

impl OpportunityKind {
    pub const ALL: [OpportunityKind; 5] = [
        OpportunityKind::Confirmed,
        OpportunityKind::Potential,
        OpportunityKind::Retroactive,
        OpportunityKind::Ongoing,
        OpportunityKind::NewToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityKind::Confirmed => "confirmed",
            OpportunityKind::Potential => "potential",
            OpportunityKind::Retroactive => "retroactive",
            OpportunityKind::Ongoing => "ongoing",
            OpportunityKind::NewToken => "new_token",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(input.trim()))
    }
}

/// Lifecycle stage. Transitions only move forward: upcoming -> active ->
/// ended, with claimed reachable only from active via a recorded claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Upcoming,
    Active,
    Ended,
    Claimed,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Upcoming, Status::Active, Status::Ended, Status::Claimed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Upcoming => "upcoming",
            Status::Active => "active",
            Status::Ended => "ended",
            Status::Claimed => "claimed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(input.trim()))
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Status::Upcoming, Status::Active)
                | (Status::Upcoming, Status::Ended)
                | (Status::Active, Status::Ended)
                | (Status::Active, Status::Claimed)
        )
    }
}

/// Ordered low < medium < high so `max_risk` filtering is a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High]
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(input.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eth,
    Bnb,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eth => "ETH",
            Currency::Bnb => "BNB",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        [Currency::Usd, Currency::Eth, Currency::Bnb]
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(input.trim()))
    }
}

/// Expected payout range. `min <= max` holds after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatedValue {
    pub min: f64,
    pub max: f64,
    pub currency: Currency,
}

impl Default for EstimatedValue {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            currency: Currency::Usd,
        }
    }
}

impl EstimatedValue {
    /// Restores the range invariant by swapping an inverted pair.
    pub fn normalized(self) -> Self {
        if self.min > self.max {
            Self {
                min: self.max,
                max: self.min,
                ..self
            }
        } else {
            self
        }
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn midpoint_label(&self) -> String {
        match self.currency {
            Currency::Usd => format!("${:.0}", self.midpoint()),
            other => format!("{:.2} {}", self.midpoint(), other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    WalletActivity,
    SocialTask,
    TokenHold,
    ProtocolInteraction,
    Referral,
    Testnet,
}

impl RequirementKind {
    pub const ALL: [RequirementKind; 6] = [
        RequirementKind::WalletActivity,
        RequirementKind::SocialTask,
        RequirementKind::TokenHold,
        RequirementKind::ProtocolInteraction,
        RequirementKind::Referral,
        RequirementKind::Testnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementKind::WalletActivity => "wallet_activity",
            RequirementKind::SocialTask => "social_task",
            RequirementKind::TokenHold => "token_hold",
            RequirementKind::ProtocolInteraction => "protocol_interaction",
            RequirementKind::Referral => "referral",
            RequirementKind::Testnet => "testnet",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(input.trim()))
    }

    /// Whether a wallet check can corroborate this requirement from chain
    /// data alone. Social tasks, referrals, and testnet quests stay manual.
    pub fn wallet_verifiable(&self) -> bool {
        matches!(
            self,
            RequirementKind::WalletActivity
                | RequirementKind::TokenHold
                | RequirementKind::ProtocolInteraction
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub kind: RequirementKind,
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

/// Per-wallet eligibility verdict. Default until a wallet check runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityCheck {
    pub wallet_connected: bool,
    pub meets_requirements: bool,
    pub estimated_reward: Option<String>,
}

impl Default for EligibilityCheck {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl EligibilityCheck {
    pub fn disconnected() -> Self {
        Self {
            wallet_connected: false,
            meets_requirements: false,
            estimated_reward: None,
        }
    }

    pub fn is_unchecked(&self) -> bool {
        !self.wallet_connected
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialMetrics {
    pub twitter_followers: Option<u64>,
    pub discord_members: Option<u64>,
    pub telegram_members: Option<u64>,
    pub github_stars: Option<u64>,
}

/// Contract red flags, ranked by severity for the scoring penalty split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerSignal {
    Honeypot,
    UnlockedLiquidity,
    MintAuthorityRetained,
    UnverifiedProxy,
}

impl DangerSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            DangerSignal::Honeypot => "honeypot",
            DangerSignal::UnlockedLiquidity => "unlocked_liquidity",
            DangerSignal::MintAuthorityRetained => "mint_authority_retained",
            DangerSignal::UnverifiedProxy => "unverified_proxy",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractSignals {
    pub audited: bool,
    pub renounced: bool,
    pub liquidity_locked: bool,
    pub danger: Vec<DangerSignal>,
}

impl ContractSignals {
    pub fn has_danger(&self) -> bool {
        !self.danger.is_empty()
    }
}

/// Canonical entity representing one airdrop/token lead. Created by the
/// normalizer on first observation and updated in place on every later
/// cycle that re-observes the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub name: String,
    pub symbol: Option<String>,
    pub contract_address: Option<String>,
    pub chain: Chain,
    pub category: Category,
    pub kind: OpportunityKind,
    pub status: Status,
    pub confidence: u8,
    pub verification_score: u8,
    pub risk_level: RiskLevel,
    pub estimated_value: EstimatedValue,
    pub requirements: Vec<Requirement>,
    pub eligibility_check: EligibilityCheck,
    pub social_metrics: SocialMetrics,
    pub contract_signals: ContractSignals,
    pub verified_by: Vec<String>,
    pub sources: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

pub const VERIFIED_SCORE_FLOOR: u8 = 80;
const CORROBORATION_CAP: i32 = 20;

/// Number of distinct corroborating parties in `verified_by`.
fn independent_verifiers(verified_by: &[String]) -> i32 {
    verified_by
        .iter()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .len() as i32
}

/// The deterministic verification score: base (50 when unreported), +1 per
/// independent verifier capped at +20, +10 for an audit, +5 when ownership
/// is renounced and liquidity locked, -40 for the most severe danger signal
/// and -10 for each additional one, clamped into [0, 100].
pub fn verification_score(
    base: Option<u8>,
    verified_by: &[String],
    signals: &ContractSignals,
) -> u8 {
    let mut score = i32::from(base.unwrap_or(50).min(100));
    score += independent_verifiers(verified_by).min(CORROBORATION_CAP);
    if signals.audited {
        score += 10;
    }
    if signals.renounced && signals.liquidity_locked {
        score += 5;
    }

    let danger: BTreeSet<DangerSignal> = signals.danger.iter().copied().collect();
    if !danger.is_empty() {
        score -= 40;
        score -= 10 * (danger.len() as i32 - 1);
    }

    score.clamp(0, 100) as u8
}

pub fn risk_level_for(verification_score: u8) -> RiskLevel {
    if verification_score >= 80 {
        RiskLevel::Low
    } else if verification_score >= 50 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

/// Recomputes the derived score fields from the entity's own signal set.
pub fn rescore(opportunity: &mut Opportunity, base: Option<u8>) {
    opportunity.verification_score = verification_score(
        base,
        &opportunity.verified_by,
        &opportunity.contract_signals,
    );
    opportunity.risk_level = risk_level_for(opportunity.verification_score);
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Conjunction of optional predicates. Every unset predicate passes through,
/// so the default spec is the identity over any candidate set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub chains: Option<Vec<Chain>>,
    pub categories: Option<Vec<Category>>,
    pub kinds: Option<Vec<OpportunityKind>>,
    pub statuses: Option<Vec<Status>>,
    pub min_confidence: Option<u8>,
    pub min_value: Option<f64>,
    pub max_risk: Option<RiskLevel>,
    pub verified_only: bool,
    pub eligible_only: bool,
}

impl FilterSpec {
    /// The engine's default publish spec: live entries only. Ended and
    /// claimed history comes back only when a status set names it.
    pub fn high_quality() -> Self {
        Self {
            statuses: Some(vec![Status::Upcoming, Status::Active]),
            ..Self::default()
        }
    }

    pub fn matches(&self, o: &Opportunity) -> bool {
        if let Some(chains) = &self.chains {
            if !chains.contains(&o.chain) {
                return false;
            }
        }
        if let Some(categories) = &self.categories {
            if !categories.contains(&o.category) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&o.kind) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&o.status) {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if o.confidence < min {
                return false;
            }
        }
        if let Some(min) = self.min_value {
            if o.estimated_value.max < min {
                return false;
            }
        }
        if let Some(max) = self.max_risk {
            if o.risk_level > max {
                return false;
            }
        }
        if self.verified_only && o.verification_score < VERIFIED_SCORE_FLOOR {
            return false;
        }
        if self.eligible_only
            && !(o.eligibility_check.wallet_connected && o.eligibility_check.meets_requirements)
        {
            return false;
        }
        true
    }

    pub fn apply(&self, mut items: Vec<Opportunity>) -> Vec<Opportunity> {
        items.retain(|o| self.matches(o));
        items
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankKey {
    /// verification_score x estimated_value.max, descending.
    #[default]
    Composite,
    Confidence,
    MaxValue,
    VerificationScore,
    Recency,
}

impl RankKey {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "composite" => Some(RankKey::Composite),
            "confidence" => Some(RankKey::Confidence),
            "max_value" => Some(RankKey::MaxValue),
            "verification_score" => Some(RankKey::VerificationScore),
            "recency" => Some(RankKey::Recency),
            _ => None,
        }
    }
}

fn primary_key(o: &Opportunity, key: RankKey) -> f64 {
    match key {
        RankKey::Composite => f64::from(o.verification_score) * o.estimated_value.max,
        RankKey::Confidence => f64::from(o.confidence),
        RankKey::MaxValue => o.estimated_value.max,
        RankKey::VerificationScore => f64::from(o.verification_score),
        RankKey::Recency => o.last_updated.timestamp_millis() as f64,
    }
}

/// Sorts descending by the chosen primary key. The tie-break chain is
/// fixed regardless of key: confidence desc, then last_updated desc, then
/// id asc so the order is total.
pub fn rank(items: &mut [Opportunity], key: RankKey) {
    items.sort_by(|a, b| {
        primary_key(b, key)
            .partial_cmp(&primary_key(a, key))
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.confidence.cmp(&a.confidence))
            .then_with(|| b.last_updated.cmp(&a.last_updated))
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ---------------------------------------------------------------------------
// Raw records
// ---------------------------------------------------------------------------

/// Which upstream feed a raw record came from. Curated feeds are keyed by
/// variant name; chain scans by the scanned network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Confirmed,
    Potential,
    Retroactive,
    ChainScan(Chain),
}

impl SourceCategory {
    pub fn label(&self) -> String {
        match self {
            SourceCategory::Confirmed => "confirmed".to_string(),
            SourceCategory::Potential => "potential".to_string(),
            SourceCategory::Retroactive => "retroactive".to_string(),
            SourceCategory::ChainScan(chain) => format!("{}-scan", chain.as_str()),
        }
    }

    pub fn default_kind(&self) -> OpportunityKind {
        match self {
            SourceCategory::Confirmed => OpportunityKind::Confirmed,
            SourceCategory::Potential => OpportunityKind::Potential,
            SourceCategory::Retroactive => OpportunityKind::Retroactive,
            SourceCategory::ChainScan(_) => OpportunityKind::NewToken,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawValueRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRequirement {
    pub kind: Option<String>,
    pub description: String,
    pub completed: Option<bool>,
}

/// Loosely-typed adapter output. Everything is optional; the normalizer
/// owns defaulting and rejection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub contract_address: Option<String>,
    pub chain: Option<String>,
    pub category: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub confidence: Option<u8>,
    pub base_score: Option<u8>,
    pub estimated_value: Option<RawValueRange>,
    pub requirements: Vec<RawRequirement>,
    pub verified_by: Vec<String>,
    pub sources: Vec<String>,
    pub social_metrics: Option<SocialMetrics>,
    pub contract_signals: Option<ContractSignals>,
    pub launched_at: Option<DateTime<Utc>>,
    /// Pass-through metadata (website, twitter, logo, ...) the engine does
    /// not interpret.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawRecord {
    /// A record is addressable when it carries an explicit id, a contract
    /// address to derive `{chain}-{contract_address}` from, or at least a
    /// display name to anchor an ordinal id to.
    pub fn has_identity(&self) -> bool {
        self.id.is_some() || self.contract_address.is_some() || self.name.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn mk_opportunity(id: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            name: format!("Project {id}"),
            symbol: None,
            contract_address: None,
            chain: Chain::Ethereum,
            category: Category::Layer2,
            kind: OpportunityKind::Confirmed,
            status: Status::Active,
            confidence: 50,
            verification_score: 50,
            risk_level: RiskLevel::Medium,
            estimated_value: EstimatedValue {
                min: 100.0,
                max: 1000.0,
                currency: Currency::Usd,
            },
            requirements: Vec::new(),
            eligibility_check: EligibilityCheck::disconnected(),
            social_metrics: SocialMetrics::default(),
            contract_signals: ContractSignals::default(),
            verified_by: Vec::new(),
            sources: Vec::new(),
            created_at: ts(1_000),
            last_updated: ts(1_000),
        }
    }

    #[test]
    fn score_adds_verifiers_and_audit() {
        let signals = ContractSignals {
            audited: true,
            ..ContractSignals::default()
        };
        let verified_by = vec!["Team".to_string(), "Community".to_string()];
        assert_eq!(verification_score(Some(60), &verified_by, &signals), 72);
        assert_eq!(risk_level_for(72), RiskLevel::Medium);
    }

    #[test]
    fn honeypot_penalty_dominates() {
        let signals = ContractSignals {
            danger: vec![DangerSignal::Honeypot],
            ..ContractSignals::default()
        };
        assert_eq!(verification_score(Some(70), &[], &signals), 30);
        assert_eq!(risk_level_for(30), RiskLevel::High);
    }

    #[test]
    fn additional_danger_signals_subtract_ten_each() {
        let signals = ContractSignals {
            danger: vec![
                DangerSignal::Honeypot,
                DangerSignal::MintAuthorityRetained,
                DangerSignal::UnlockedLiquidity,
            ],
            ..ContractSignals::default()
        };
        // 70 - 40 - 10 - 10
        assert_eq!(verification_score(Some(70), &[], &signals), 10);
    }

    #[test]
    fn duplicate_danger_signals_count_once() {
        let signals = ContractSignals {
            danger: vec![DangerSignal::Honeypot, DangerSignal::Honeypot],
            ..ContractSignals::default()
        };
        assert_eq!(verification_score(Some(70), &[], &signals), 30);
    }

    #[test]
    fn score_clamps_to_bounds() {
        let heavy_danger = ContractSignals {
            danger: vec![
                DangerSignal::Honeypot,
                DangerSignal::UnlockedLiquidity,
                DangerSignal::MintAuthorityRetained,
                DangerSignal::UnverifiedProxy,
            ],
            ..ContractSignals::default()
        };
        assert_eq!(verification_score(Some(10), &[], &heavy_danger), 0);

        let all_good = ContractSignals {
            audited: true,
            renounced: true,
            liquidity_locked: true,
            danger: Vec::new(),
        };
        let many: Vec<String> = (0..40).map(|i| format!("verifier-{i}")).collect();
        assert_eq!(verification_score(Some(95), &many, &all_good), 100);
    }

    #[test]
    fn verifier_bonus_counts_distinct_entries_capped_at_twenty() {
        let signals = ContractSignals::default();
        let repeated = vec!["Team".to_string(), "team".to_string(), " Team ".to_string()];
        assert_eq!(verification_score(Some(50), &repeated, &signals), 51);

        let many: Vec<String> = (0..30).map(|i| format!("v{i}")).collect();
        assert_eq!(verification_score(Some(50), &many, &signals), 70);
    }

    #[test]
    fn missing_base_defaults_to_fifty() {
        assert_eq!(verification_score(None, &[], &ContractSignals::default()), 50);
    }

    #[test]
    fn risk_thresholds_at_boundaries() {
        assert_eq!(risk_level_for(100), RiskLevel::Low);
        assert_eq!(risk_level_for(80), RiskLevel::Low);
        assert_eq!(risk_level_for(79), RiskLevel::Medium);
        assert_eq!(risk_level_for(50), RiskLevel::Medium);
        assert_eq!(risk_level_for(49), RiskLevel::High);
        assert_eq!(risk_level_for(0), RiskLevel::High);
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(Status::Upcoming.can_transition_to(Status::Active));
        assert!(Status::Upcoming.can_transition_to(Status::Ended));
        assert!(Status::Active.can_transition_to(Status::Ended));
        assert!(Status::Active.can_transition_to(Status::Claimed));
        assert!(Status::Active.can_transition_to(Status::Active));

        assert!(!Status::Active.can_transition_to(Status::Upcoming));
        assert!(!Status::Ended.can_transition_to(Status::Active));
        assert!(!Status::Ended.can_transition_to(Status::Claimed));
        assert!(!Status::Upcoming.can_transition_to(Status::Claimed));
    }

    #[test]
    fn inverted_value_range_swaps() {
        let value = EstimatedValue {
            min: 5000.0,
            max: 500.0,
            currency: Currency::Usd,
        }
        .normalized();
        assert_eq!(value.min, 500.0);
        assert_eq!(value.max, 5000.0);
        assert_eq!(value.midpoint_label(), "$2750");
    }

    #[test]
    fn empty_filter_is_identity() {
        let items = vec![mk_opportunity("a"), mk_opportunity("b")];
        let filtered = FilterSpec::default().apply(items.clone());
        assert_eq!(filtered, items);
    }

    #[test]
    fn filtering_is_idempotent() {
        let spec = FilterSpec {
            min_confidence: Some(40),
            max_risk: Some(RiskLevel::Medium),
            ..FilterSpec::default()
        };
        let items = vec![mk_opportunity("a"), mk_opportunity("b"), mk_opportunity("c")];
        let once = spec.apply(items);
        let twice = spec.apply(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn verified_only_requires_score_floor() {
        let mut strong = mk_opportunity("strong");
        strong.verification_score = 85;
        strong.confidence = 72;
        let mut popular = mk_opportunity("popular");
        popular.verification_score = 79;
        popular.confidence = 90;

        let spec = FilterSpec {
            verified_only: true,
            min_confidence: Some(70),
            ..FilterSpec::default()
        };
        let kept = spec.apply(vec![strong.clone(), popular]);
        assert_eq!(kept, vec![strong]);
    }

    #[test]
    fn eligible_only_without_wallet_context_matches_nothing() {
        let spec = FilterSpec {
            eligible_only: true,
            ..FilterSpec::default()
        };
        let items = vec![mk_opportunity("a"), mk_opportunity("b")];
        assert!(spec.apply(items).is_empty());
    }

    #[test]
    fn max_risk_orders_low_medium_high() {
        let mut low = mk_opportunity("low");
        low.risk_level = RiskLevel::Low;
        let mut high = mk_opportunity("high");
        high.risk_level = RiskLevel::High;

        let spec = FilterSpec {
            max_risk: Some(RiskLevel::Medium),
            ..FilterSpec::default()
        };
        let kept = spec.apply(vec![low.clone(), high]);
        assert_eq!(kept, vec![low]);
    }

    #[test]
    fn default_rank_is_score_times_value() {
        let mut cheap_verified = mk_opportunity("cheap");
        cheap_verified.verification_score = 90;
        cheap_verified.estimated_value.max = 100.0;
        let mut rich_unverified = mk_opportunity("rich");
        rich_unverified.verification_score = 40;
        rich_unverified.estimated_value.max = 5000.0;

        let mut items = vec![cheap_verified, rich_unverified];
        rank(&mut items, RankKey::Composite);
        assert_eq!(items[0].id, "rich");
        assert_eq!(items[1].id, "cheap");
    }

    #[test]
    fn ties_break_on_confidence_then_recency() {
        let mut a = mk_opportunity("a");
        a.confidence = 70;
        a.last_updated = ts(2_000);
        let mut b = mk_opportunity("b");
        b.confidence = 90;
        b.last_updated = ts(1_500);
        let mut c = mk_opportunity("c");
        c.confidence = 70;
        c.last_updated = ts(3_000);

        let mut items = vec![a, b, c];
        rank(&mut items, RankKey::Composite);
        assert_eq!(
            items.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c", "a"]
        );
    }

    #[test]
    fn rank_override_keeps_fixed_tiebreaks() {
        let mut a = mk_opportunity("a");
        a.estimated_value.max = 500.0;
        a.confidence = 40;
        let mut b = mk_opportunity("b");
        b.estimated_value.max = 500.0;
        b.confidence = 80;

        let mut items = vec![a, b];
        rank(&mut items, RankKey::MaxValue);
        assert_eq!(items[0].id, "b");
    }

    #[test]
    fn raw_record_identity_rules() {
        let mut record = RawRecord::default();
        assert!(!record.has_identity());
        record.chain = Some("ethereum".to_string());
        assert!(!record.has_identity());
        record.contract_address = Some("0xabc".to_string());
        assert!(record.has_identity());

        let named = RawRecord {
            name: Some("LayerZero".to_string()),
            ..RawRecord::default()
        };
        assert!(named.has_identity());

        let explicit = RawRecord {
            id: Some("confirmed-0".to_string()),
            ..RawRecord::default()
        };
        assert!(explicit.has_identity());
    }

    #[test]
    fn enum_parsing_round_trips() {
        for chain in Chain::ALL {
            assert_eq!(Chain::parse(chain.as_str()), Some(chain));
        }
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), Some(category));
        }
        assert_eq!(Status::parse("ACTIVE"), Some(Status::Active));
        assert_eq!(RankKey::parse("recency"), Some(RankKey::Recency));
        assert_eq!(Chain::parse("dogechain"), None);
    }
}
