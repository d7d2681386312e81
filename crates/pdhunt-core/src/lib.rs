//! Core domain model, identity keys and shared error kinds for pdhunt.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "pdhunt-core";

/// Error kinds shared by every stage of a run.
///
/// `SourceUnavailable` and `ExternalApi` are recoverable: they are logged where
/// they happen and the run moves on. Everything else ends the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },
    #[error("academic graph request failed ({context}): {reason}")]
    ExternalApi { context: String, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("report export failed: {0}")]
    Report(String),
    #[error("notification failed: {0}")]
    Notification(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::SourceUnavailable { .. } | PipelineError::ExternalApi { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "EU")]
    Eu,
    Asia,
    Other,
}

const COUNTRY_TO_REGION: &[(&str, Region)] = &[
    ("united states", Region::Us),
    ("usa", Region::Us),
    ("us", Region::Us),
    ("canada", Region::Us),
    ("united kingdom", Region::Eu),
    ("uk", Region::Eu),
    ("england", Region::Eu),
    ("scotland", Region::Eu),
    ("wales", Region::Eu),
    ("germany", Region::Eu),
    ("france", Region::Eu),
    ("netherlands", Region::Eu),
    ("switzerland", Region::Eu),
    ("sweden", Region::Eu),
    ("denmark", Region::Eu),
    ("norway", Region::Eu),
    ("finland", Region::Eu),
    ("belgium", Region::Eu),
    ("austria", Region::Eu),
    ("spain", Region::Eu),
    ("italy", Region::Eu),
    ("ireland", Region::Eu),
    ("israel", Region::Eu),
    ("portugal", Region::Eu),
    ("luxembourg", Region::Eu),
    ("iceland", Region::Eu),
    ("czech republic", Region::Eu),
    ("czechia", Region::Eu),
    ("poland", Region::Eu),
    ("hungary", Region::Eu),
    ("romania", Region::Eu),
    ("croatia", Region::Eu),
    ("greece", Region::Eu),
    ("slovenia", Region::Eu),
    ("slovakia", Region::Eu),
    ("estonia", Region::Eu),
    ("latvia", Region::Eu),
    ("lithuania", Region::Eu),
    ("bulgaria", Region::Eu),
    ("cyprus", Region::Eu),
    ("malta", Region::Eu),
    ("serbia", Region::Eu),
    ("eu", Region::Eu),
    ("south korea", Region::Asia),
    ("korea", Region::Asia),
    ("japan", Region::Asia),
    ("china", Region::Asia),
    ("singapore", Region::Asia),
    ("taiwan", Region::Asia),
    ("hong kong", Region::Asia),
    ("india", Region::Asia),
    ("thailand", Region::Asia),
    ("vietnam", Region::Asia),
    ("malaysia", Region::Asia),
    ("indonesia", Region::Asia),
    ("philippines", Region::Asia),
    ("australia", Region::Other),
    ("new zealand", Region::Other),
    ("brazil", Region::Other),
    ("mexico", Region::Other),
    ("south africa", Region::Other),
    ("saudi arabia", Region::Other),
];

impl Region {
    /// Report order; also the sort priority.
    pub const ALL: [Region; 4] = [Region::Us, Region::Eu, Region::Asia, Region::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Us => "US",
            Region::Eu => "EU",
            Region::Asia => "Asia",
            Region::Other => "Other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(value.trim()))
    }

    /// Resolve a free-text country/location ("Boston, MA, USA") to a region.
    pub fn for_country(country: Option<&str>) -> Self {
        let Some(country) = country.map(str::trim).filter(|c| !c.is_empty()) else {
            return Region::Other;
        };
        let lower = country.to_lowercase();

        let exact = |candidate: &str| {
            COUNTRY_TO_REGION
                .iter()
                .find(|(name, _)| *name == candidate)
                .map(|(_, region)| *region)
        };
        if let Some(region) = exact(&lower) {
            return region;
        }
        for part in lower.rsplit(',').map(str::trim) {
            if let Some(region) = exact(part) {
                return region;
            }
        }

        // Short codes ("us", "uk", "eu") only ever match exactly.
        let padded = format!(" {} ", normalize_text(&lower));
        COUNTRY_TO_REGION
            .iter()
            .filter(|(name, _)| name.len() > 3)
            .find(|(name, _)| padded.contains(&format!(" {name} ")))
            .map(|(_, region)| *region)
            .unwrap_or(Region::Other)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Institution ranking bucket, T1 (best) to T4 (unranked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tier(u8);

impl Tier {
    pub const T1: Tier = Tier(1);
    pub const T2: Tier = Tier(2);
    pub const T3: Tier = Tier(3);
    pub const UNRANKED: Tier = Tier(4);

    pub fn new(rank: u8) -> Option<Self> {
        (1..=4).contains(&rank).then_some(Tier(rank))
    }

    pub fn rank(&self) -> u8 {
        self.0
    }

    /// Affiliation signal used by the PI recommender.
    pub fn affiliation_weight(&self) -> f64 {
        match self.0 {
            1 => 1.0,
            2 => 0.75,
            3 => 0.5,
            _ => 0.3,
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::UNRANKED
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Static institution -> tier reference table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default)]
    pub tiers: BTreeMap<u8, Vec<String>>,
}

impl TierTable {
    /// Best tier whose listed name and the institution contain one another as
    /// whole words. Unknown or empty institutions fall back to `Tier::UNRANKED`.
    pub fn lookup(&self, institution: Option<&str>) -> Tier {
        let Some(institution) = institution.map(normalize_text).filter(|s| !s.is_empty()) else {
            return Tier::UNRANKED;
        };
        let padded_inst = format!(" {institution} ");
        for (rank, names) in &self.tiers {
            let Some(tier) = Tier::new(*rank) else {
                continue;
            };
            let hit = names.iter().map(|n| normalize_text(n)).any(|name| {
                !name.is_empty()
                    && (padded_inst.contains(&format!(" {name} "))
                        || format!(" {name} ").contains(&padded_inst))
            });
            if hit {
                return tier;
            }
        }
        Tier::UNRANKED
    }
}

/// Lower-case, keep alphanumerics, collapse everything else to single spaces.
pub fn normalize_text(input: &str) -> String {
    input
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop the fragment and trailing slash, lower-case scheme and host.
/// Unparseable input is only trimmed.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => {
            let without_fragment = trimmed.split('#').next().unwrap_or_default();
            return without_fragment.trim_end_matches('/').to_string();
        }
    };
    url.set_fragment(None);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    let mut normalized = String::from(url);
    if !normalized.contains('?') && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deduplication key for a posting: the URL when there is one, otherwise the
/// normalized (title, institution, source) triple.
pub fn identity_key(
    title: &str,
    institution: Option<&str>,
    source_id: &str,
    url: Option<&str>,
) -> String {
    let basis = match url.map(normalize_url).filter(|u| !u.is_empty()) {
        Some(url) => format!("url|{url}"),
        None => format!(
            "tis|{}|{}|{}",
            normalize_text(title),
            normalize_text(institution.unwrap_or_default()),
            source_id.trim().to_ascii_lowercase()
        ),
    };
    sha256_hex(basis.as_bytes())
}

/// Normalized handoff record from a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingDraft {
    pub source_id: String,
    pub title: String,
    pub institution: Option<String>,
    pub country: Option<String>,
    pub field: Option<String>,
    pub description: Option<String>,
    pub salary: Option<String>,
    pub duration: Option<String>,
    pub url: Option<String>,
    pub posted_date: Option<String>,
    pub deadline: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PostingDraft {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            institution: None,
            country: None,
            field: None,
            description: None,
            salary: None,
            duration: None,
            url: None,
            posted_date: None,
            deadline: None,
            fetched_at,
        }
    }

    pub fn identity_key(&self) -> String {
        identity_key(
            &self.title,
            self.institution.as_deref(),
            &self.source_id,
            self.url.as_deref(),
        )
    }

    /// Text the keyword scorer and PI extractor look at.
    pub fn search_text(&self) -> String {
        [
            Some(self.title.as_str()),
            self.field.as_deref(),
            self.institution.as_deref(),
            self.description.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
    }
}

/// Scored, persisted posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub identity_key: String,
    pub source_id: String,
    pub title: String,
    pub institution: Option<String>,
    pub country: Option<String>,
    pub region: Region,
    pub tier: Tier,
    pub field: Option<String>,
    pub description: Option<String>,
    pub salary: Option<String>,
    pub duration: Option<String>,
    pub url: Option<String>,
    pub posted_date: Option<String>,
    pub deadline: Option<String>,
    pub pi_name: Option<String>,
    pub match_score: f64,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Researcher known to the store, either curated (seed) or discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiRecord {
    pub external_id: String,
    pub name: String,
    pub affiliation: Option<String>,
    pub is_seed: bool,
    pub is_recommended: bool,
    pub recommendation_score: f64,
    pub discovered_via: Option<String>,
    pub paper_count: Option<u32>,
    pub citation_count: Option<u32>,
    pub h_index: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PiRecord {
    pub fn seed(external_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            affiliation: None,
            is_seed: true,
            is_recommended: false,
            recommendation_score: 0.0,
            discovered_via: None,
            paper_count: None,
            citation_count: None,
            h_index: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a newly observed version of the same researcher into this one.
    ///
    /// The seed flag is sticky and the score only ever rises. Provenance follows
    /// whichever side carries the higher score. Metadata from a discovery result
    /// replaces existing values only when it outscores a non-seed record;
    /// otherwise it just fills gaps.
    pub fn merged_with(self, incoming: PiRecord) -> PiRecord {
        let incoming_wins = incoming.recommendation_score > self.recommendation_score;
        let prefer_incoming = incoming.is_seed || (incoming_wins && !self.is_seed);
        let is_seed = self.is_seed || incoming.is_seed;

        fn pick<T>(preferred: Option<T>, fallback: Option<T>) -> Option<T> {
            preferred.or(fallback)
        }

        let (name, affiliation, paper_count, citation_count, h_index) = if prefer_incoming {
            (
                if incoming.name.trim().is_empty() { self.name } else { incoming.name },
                pick(incoming.affiliation, self.affiliation),
                pick(incoming.paper_count, self.paper_count),
                pick(incoming.citation_count, self.citation_count),
                pick(incoming.h_index, self.h_index),
            )
        } else {
            (
                if self.name.trim().is_empty() { incoming.name } else { self.name },
                pick(self.affiliation, incoming.affiliation),
                pick(self.paper_count, incoming.paper_count),
                pick(self.citation_count, incoming.citation_count),
                pick(self.h_index, incoming.h_index),
            )
        };

        let discovered_via = if incoming_wins {
            pick(incoming.discovered_via, self.discovered_via)
        } else {
            pick(self.discovered_via, incoming.discovered_via)
        };

        PiRecord {
            external_id: self.external_id,
            name,
            affiliation,
            is_seed,
            is_recommended: !is_seed && (self.is_recommended || incoming.is_recommended),
            recommendation_score: self.recommendation_score.max(incoming.recommendation_score),
            discovered_via,
            paper_count,
            citation_count,
            h_index,
            created_at: self.created_at.min(incoming.created_at),
            updated_at: self.updated_at.max(incoming.updated_at),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeywordSpec {
    Plain(String),
    Weighted {
        term: String,
        #[serde(default = "default_keyword_weight")]
        weight: f64,
    },
}

fn default_keyword_weight() -> f64 {
    1.0
}

/// Positive keyword; `- CRISPR` and `- { term: CRISPR, weight: 2 }` both parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "KeywordSpec")]
pub struct WeightedKeyword {
    pub term: String,
    pub weight: f64,
}

impl From<KeywordSpec> for WeightedKeyword {
    fn from(spec: KeywordSpec) -> Self {
        match spec {
            KeywordSpec::Plain(term) => WeightedKeyword {
                term,
                weight: default_keyword_weight(),
            },
            KeywordSpec::Weighted { term, weight } => WeightedKeyword { term, weight },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordProfile {
    #[serde(default)]
    pub keywords: Vec<WeightedKeyword>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl KeywordProfile {
    pub fn total_weight(&self) -> f64 {
        self.keywords.iter().map(|k| k.weight.max(0.0)).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderWeights {
    pub coauthorship: f64,
    pub citation: f64,
    pub affiliation_tier: f64,
    pub h_index: f64,
    pub publication_volume: f64,
}

impl Default for RecommenderWeights {
    fn default() -> Self {
        Self {
            coauthorship: 0.35,
            citation: 0.25,
            affiliation_tier: 0.20,
            h_index: 0.10,
            publication_volume: 0.10,
        }
    }
}

impl RecommenderWeights {
    pub fn total(&self) -> f64 {
        self.coauthorship + self.citation + self.affiliation_tier + self.h_index + self.publication_volume
    }
}
