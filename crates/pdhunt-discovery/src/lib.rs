//! Co-author and citation based PI discovery.

mod semantic_scholar;

use std::collections::{BTreeMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pdhunt_core::{PiRecord, PipelineError, RecommenderWeights, Tier, TierTable};
use pdhunt_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub use semantic_scholar::{SemanticScholarClient, SemanticScholarConfig, DEFAULT_BASE_URL};

pub const CRATE_NAME: &str = "pdhunt-discovery";

/// Affiliation signal for a candidate whose affiliation is unknown.
const NO_AFFILIATION_SIGNAL: f64 = 0.15;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("academic graph request failed ({context}): {source}")]
    Api {
        context: String,
        #[source]
        source: FetchError,
    },
    #[error("not found in academic graph: {0}")]
    NotFound(String),
    #[error("academic graph client unavailable: {0}")]
    Client(String),
}

impl From<DiscoveryError> for PipelineError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Client(reason) => PipelineError::Configuration(reason),
            other => PipelineError::ExternalApi {
                context: "academic graph".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub id: String,
    pub name: String,
    pub affiliation: Option<String>,
    pub h_index: Option<u32>,
    pub paper_count: Option<u32>,
    pub citation_count: Option<u32>,
}

/// A researcher adjacent to another in the co-author or citation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    pub name: String,
    pub shared_papers: u32,
    pub citation_links: u32,
}

#[async_trait]
pub trait AcademicGraph: Send + Sync {
    async fn author(&self, id: &str) -> Result<AuthorProfile, DiscoveryError>;
    async fn coauthors(&self, id: &str, limit: usize) -> Result<Vec<Neighbor>, DiscoveryError>;
    async fn citation_neighbors(&self, id: &str, limit: usize) -> Result<Vec<Neighbor>, DiscoveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryLimits {
    /// Hops from a seed; 1 means direct neighbors only.
    pub max_depth: u8,
    pub max_candidates_per_seed: usize,
    pub neighbors_per_author: usize,
    pub h_index_ceiling: u32,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            max_depth: 1,
            max_candidates_per_seed: 25,
            neighbors_per_author: 50,
            h_index_ceiling: 60,
        }
    }
}

/// Raw evidence behind a recommendation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CandidateSignals {
    pub shared_papers: u32,
    pub citation_links: u32,
    /// `None` when the candidate has no known affiliation.
    pub tier: Option<Tier>,
    pub h_index: Option<u32>,
    pub paper_count: Option<u32>,
}

fn saturate(rate: f64, count: u32) -> f64 {
    1.0 - 1.0 / (1.0 + rate * f64::from(count))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecommendationScorer {
    weights: RecommenderWeights,
    h_index_ceiling: f64,
}

impl RecommendationScorer {
    pub fn new(weights: RecommenderWeights, h_index_ceiling: u32) -> Self {
        Self {
            weights,
            h_index_ceiling: f64::from(h_index_ceiling.max(1)),
        }
    }

    /// Weighted sum of saturating signals, scaled to 0-100 with one decimal.
    pub fn score(&self, signals: &CandidateSignals) -> f64 {
        let total = self.weights.total();
        if total <= 0.0 {
            return 0.0;
        }
        let affiliation = signals
            .tier
            .map(|t| t.affiliation_weight())
            .unwrap_or(NO_AFFILIATION_SIGNAL);
        let h_index = signals
            .h_index
            .map(|h| (f64::from(h) / self.h_index_ceiling).min(1.0))
            .unwrap_or(0.0);
        let volume = signals.paper_count.map(|p| saturate(0.02, p)).unwrap_or(0.0);

        let w = &self.weights;
        let raw = w.coauthorship * saturate(0.5, signals.shared_papers)
            + w.citation * saturate(0.3, signals.citation_links)
            + w.affiliation_tier * affiliation
            + w.h_index * h_index
            + w.publication_volume * volume;
        let scaled = (raw / total * 100.0).clamp(0.0, 100.0);
        (scaled * 10.0).round() / 10.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSeed {
    pub external_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    /// One record per candidate, sorted by score descending.
    pub candidates: Vec<PiRecord>,
    pub skipped_seeds: Vec<SkippedSeed>,
}

/// Bounded breadth-first expansion from seed PIs.
pub struct Discovery<'a, G: AcademicGraph + ?Sized> {
    graph: &'a G,
    tiers: &'a TierTable,
    scorer: RecommendationScorer,
    limits: DiscoveryLimits,
}

impl<'a, G: AcademicGraph + ?Sized> Discovery<'a, G> {
    pub fn new(
        graph: &'a G,
        tiers: &'a TierTable,
        weights: RecommenderWeights,
        limits: DiscoveryLimits,
    ) -> Self {
        Self {
            graph,
            tiers,
            scorer: RecommendationScorer::new(weights, limits.h_index_ceiling),
            limits,
        }
    }

    pub async fn run(&self, seeds: &[PiRecord], now: DateTime<Utc>) -> DiscoveryReport {
        let seed_ids: HashSet<&str> = seeds.iter().map(|s| s.external_id.as_str()).collect();
        let mut merged: BTreeMap<String, PiRecord> = BTreeMap::new();
        let mut skipped_seeds = Vec::new();

        for seed in seeds {
            let span = info_span!("discover_seed", seed = %seed.external_id);
            match self.expand_seed(seed, &seed_ids, now).instrument(span).await {
                Ok(found) => {
                    info!(seed = %seed.external_id, candidates = found.len(), "seed expanded");
                    for candidate in found {
                        match merged.get(&candidate.external_id) {
                            Some(existing) if existing.recommendation_score >= candidate.recommendation_score => {}
                            _ => {
                                merged.insert(candidate.external_id.clone(), candidate);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(seed = %seed.external_id, error = %err, "skipping seed");
                    skipped_seeds.push(SkippedSeed {
                        external_id: seed.external_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut candidates: Vec<PiRecord> = merged.into_values().collect();
        candidates.sort_by(|a, b| {
            b.recommendation_score
                .total_cmp(&a.recommendation_score)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        DiscoveryReport {
            candidates,
            skipped_seeds,
        }
    }

    /// Fill in affiliation and publication metadata for configured seeds. The
    /// configured name is kept; a failed lookup leaves the seed as it was.
    pub async fn profile_seeds(&self, seeds: &[PiRecord], now: DateTime<Utc>) -> Vec<PiRecord> {
        let mut profiled = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let mut seed = seed.clone();
            match self.graph.author(&seed.external_id).await {
                Ok(profile) => {
                    seed.affiliation = profile.affiliation.or(seed.affiliation);
                    seed.h_index = profile.h_index.or(seed.h_index);
                    seed.paper_count = profile.paper_count.or(seed.paper_count);
                    seed.citation_count = profile.citation_count.or(seed.citation_count);
                    seed.updated_at = now;
                    debug!(seed = %seed.external_id, h_index = ?seed.h_index, "seed profiled");
                }
                Err(err) => warn!(seed = %seed.external_id, error = %err, "seed profile unavailable"),
            }
            profiled.push(seed);
        }
        profiled
    }

    async fn expand_seed(
        &self,
        seed: &PiRecord,
        seed_ids: &HashSet<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PiRecord>, DiscoveryError> {
        let mut visited: HashSet<String> = seed_ids.iter().map(|id| id.to_string()).collect();
        let mut queue = VecDeque::from([(seed.external_id.clone(), 0u8)]);
        let mut found = Vec::new();

        while let Some((author_id, depth)) = queue.pop_front() {
            if depth >= self.limits.max_depth {
                continue;
            }
            let neighbors = match self.neighbors_of(&author_id).await {
                Ok(neighbors) => neighbors,
                Err(err) if author_id == seed.external_id => return Err(err),
                Err(err) => {
                    warn!(author = %author_id, error = %err, "skipping intermediate author");
                    continue;
                }
            };

            for neighbor in neighbors {
                if found.len() >= self.limits.max_candidates_per_seed {
                    return Ok(found);
                }
                if !visited.insert(neighbor.id.clone()) {
                    continue;
                }
                found.push(self.candidate(seed, &neighbor, now).await);
                if depth + 1 < self.limits.max_depth {
                    queue.push_back((neighbor.id, depth + 1));
                }
            }
        }
        Ok(found)
    }

    /// Co-authors and citation neighbors folded together, strongest first.
    async fn neighbors_of(&self, author_id: &str) -> Result<Vec<Neighbor>, DiscoveryError> {
        let limit = self.limits.neighbors_per_author;
        let mut combined: BTreeMap<String, Neighbor> = BTreeMap::new();
        let coauthors = self.graph.coauthors(author_id, limit).await?;
        let cited = self.graph.citation_neighbors(author_id, limit).await?;
        for n in coauthors.into_iter().chain(cited) {
            combined
                .entry(n.id.clone())
                .and_modify(|e| {
                    e.shared_papers += n.shared_papers;
                    e.citation_links += n.citation_links;
                    if e.name.is_empty() {
                        e.name = n.name.clone();
                    }
                })
                .or_insert(n);
        }
        let mut neighbors: Vec<Neighbor> = combined.into_values().collect();
        neighbors.sort_by(|a, b| {
            (b.shared_papers + b.citation_links)
                .cmp(&(a.shared_papers + a.citation_links))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(neighbors)
    }

    async fn candidate(&self, seed: &PiRecord, neighbor: &Neighbor, now: DateTime<Utc>) -> PiRecord {
        let profile = match self.graph.author(&neighbor.id).await {
            Ok(profile) => Some(profile),
            Err(err) => {
                debug!(author = %neighbor.id, error = %err, "metadata lookup failed; using neighbor data");
                None
            }
        };
        let name = profile
            .as_ref()
            .map(|p| p.name.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| neighbor.name.clone());
        let affiliation = profile.as_ref().and_then(|p| p.affiliation.clone());
        let signals = CandidateSignals {
            shared_papers: neighbor.shared_papers,
            citation_links: neighbor.citation_links,
            tier: affiliation.as_deref().map(|a| self.tiers.lookup(Some(a))),
            h_index: profile.as_ref().and_then(|p| p.h_index),
            paper_count: profile.as_ref().and_then(|p| p.paper_count),
        };
        let via = if neighbor.shared_papers >= neighbor.citation_links {
            "coauthor"
        } else {
            "citation"
        };

        PiRecord {
            external_id: neighbor.id.clone(),
            name,
            affiliation,
            is_seed: false,
            is_recommended: true,
            recommendation_score: self.scorer.score(&signals),
            discovered_via: Some(format!("{via}:{}", seed.external_id)),
            paper_count: signals.paper_count,
            citation_count: profile.as_ref().and_then(|p| p.citation_count),
            h_index: signals.h_index,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGraph {
        profiles: HashMap<String, AuthorProfile>,
        coauthors: HashMap<String, Vec<Neighbor>>,
        citations: HashMap<String, Vec<Neighbor>>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeGraph {
        fn link(&mut self, from: &str, to: &str, shared: u32, links: u32) {
            let neighbor = |s, l| Neighbor {
                id: to.to_string(),
                name: format!("Name {to}"),
                shared_papers: s,
                citation_links: l,
            };
            if shared > 0 {
                self.coauthors.entry(from.to_string()).or_default().push(neighbor(shared, 0));
            }
            if links > 0 {
                self.citations.entry(from.to_string()).or_default().push(neighbor(0, links));
            }
        }

        fn profile(&mut self, id: &str, affiliation: Option<&str>, h_index: u32) {
            self.profiles.insert(
                id.to_string(),
                AuthorProfile {
                    id: id.to_string(),
                    name: format!("Dr {id}"),
                    affiliation: affiliation.map(str::to_string),
                    h_index: Some(h_index),
                    paper_count: Some(100),
                    citation_count: Some(1000),
                },
            );
        }
    }

    #[async_trait]
    impl AcademicGraph for FakeGraph {
        async fn author(&self, id: &str) -> Result<AuthorProfile, DiscoveryError> {
            self.profiles
                .get(id)
                .cloned()
                .ok_or_else(|| DiscoveryError::NotFound(id.to_string()))
        }

        async fn coauthors(&self, id: &str, limit: usize) -> Result<Vec<Neighbor>, DiscoveryError> {
            self.calls.lock().unwrap().push(id.to_string());
            if self.failing.contains(id) {
                return Err(DiscoveryError::Client(format!("boom for {id}")));
            }
            Ok(self.coauthors.get(id).cloned().unwrap_or_default().into_iter().take(limit).collect())
        }

        async fn citation_neighbors(&self, id: &str, limit: usize) -> Result<Vec<Neighbor>, DiscoveryError> {
            Ok(self.citations.get(id).cloned().unwrap_or_default().into_iter().take(limit).collect())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    }

    fn tiers() -> TierTable {
        let mut tiers = BTreeMap::new();
        tiers.insert(1u8, vec!["MIT".to_string()]);
        tiers.insert(3u8, vec!["State University".to_string()]);
        TierTable { tiers }
    }

    fn seed(id: &str) -> PiRecord {
        PiRecord::seed(id, format!("Seed {id}"), now())
    }

    #[test]
    fn score_uses_saturating_signals() {
        let scorer = RecommendationScorer::new(RecommenderWeights::default(), 60);
        let none = CandidateSignals::default();
        assert_eq!(scorer.score(&none), 3.0);

        let strong = CandidateSignals {
            shared_papers: 2,
            citation_links: 0,
            tier: Some(Tier::T1),
            h_index: Some(120),
            paper_count: Some(0),
        };
        // .35 * .5 + .2 * 1.0 + .1 * 1.0
        assert_eq!(scorer.score(&strong), 47.5);
    }

    #[test]
    fn zero_weights_score_zero() {
        let weights = RecommenderWeights {
            coauthorship: 0.0,
            citation: 0.0,
            affiliation_tier: 0.0,
            h_index: 0.0,
            publication_volume: 0.0,
        };
        let scorer = RecommendationScorer::new(weights, 60);
        assert_eq!(scorer.score(&CandidateSignals::default()), 0.0);
    }

    #[tokio::test]
    async fn one_hop_expansion_excludes_seeds_and_sorts_by_score() {
        let mut graph = FakeGraph::default();
        graph.link("s1", "a", 4, 0);
        graph.link("s1", "b", 0, 1);
        graph.link("s1", "s2", 3, 0);
        graph.link("a", "deep", 9, 0);
        graph.profile("a", Some("MIT"), 50);
        graph.profile("b", Some("State University"), 10);

        let tiers = tiers();
        let discovery = Discovery::new(&graph, &tiers, RecommenderWeights::default(), DiscoveryLimits::default());
        let report = discovery.run(&[seed("s1"), seed("s2")], now()).await;

        let ids: Vec<_> = report.candidates.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(report.candidates.iter().all(|c| c.is_recommended && !c.is_seed));
        assert_eq!(report.candidates[0].discovered_via.as_deref(), Some("coauthor:s1"));
        assert_eq!(report.candidates[1].discovered_via.as_deref(), Some("citation:s1"));
        assert_eq!(report.candidates[0].affiliation.as_deref(), Some("MIT"));
    }

    #[tokio::test]
    async fn second_hop_follows_visited_set() {
        let mut graph = FakeGraph::default();
        graph.link("s1", "a", 1, 0);
        graph.link("a", "b", 1, 0);
        graph.link("a", "s1", 1, 0);
        graph.link("b", "a", 1, 0);

        let tiers = tiers();
        let limits = DiscoveryLimits {
            max_depth: 2,
            ..DiscoveryLimits::default()
        };
        let discovery = Discovery::new(&graph, &tiers, RecommenderWeights::default(), limits);
        let report = discovery.run(&[seed("s1")], now()).await;

        let mut ids: Vec<_> = report.candidates.iter().map(|c| c.external_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(*graph.calls.lock().unwrap(), vec!["s1".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn per_seed_cap_keeps_strongest_neighbors() {
        let mut graph = FakeGraph::default();
        graph.link("s1", "weak", 1, 0);
        graph.link("s1", "strong", 5, 0);
        graph.link("s1", "mid", 3, 0);

        let tiers = tiers();
        let limits = DiscoveryLimits {
            max_candidates_per_seed: 2,
            ..DiscoveryLimits::default()
        };
        let discovery = Discovery::new(&graph, &tiers, RecommenderWeights::default(), limits);
        let report = discovery.run(&[seed("s1")], now()).await;

        let ids: Vec<_> = report.candidates.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["strong", "mid"]);
    }

    #[tokio::test]
    async fn candidate_shared_by_seeds_keeps_highest_score() {
        let mut graph = FakeGraph::default();
        graph.link("s1", "c", 1, 0);
        graph.link("s2", "c", 6, 0);

        let tiers = tiers();
        let discovery = Discovery::new(&graph, &tiers, RecommenderWeights::default(), DiscoveryLimits::default());
        let report = discovery.run(&[seed("s1"), seed("s2")], now()).await;

        assert_eq!(report.candidates.len(), 1);
        let candidate = &report.candidates[0];
        assert_eq!(candidate.discovered_via.as_deref(), Some("coauthor:s2"));
        let weak = RecommendationScorer::new(RecommenderWeights::default(), 60).score(&CandidateSignals {
            shared_papers: 1,
            ..CandidateSignals::default()
        });
        assert!(candidate.recommendation_score > weak);
    }

    #[tokio::test]
    async fn failing_seed_is_skipped_and_others_continue() {
        let mut graph = FakeGraph::default();
        graph.failing.insert("s1".to_string());
        graph.link("s2", "x", 2, 0);

        let tiers = tiers();
        let discovery = Discovery::new(&graph, &tiers, RecommenderWeights::default(), DiscoveryLimits::default());
        let report = discovery.run(&[seed("s1"), seed("s2")], now()).await;

        assert_eq!(report.skipped_seeds.len(), 1);
        assert_eq!(report.skipped_seeds[0].external_id, "s1");
        assert_eq!(report.candidates.len(), 1);
        // no profile for "x": neighbor metadata is kept
        assert_eq!(report.candidates[0].name, "Name x");
        assert_eq!(report.candidates[0].h_index, None);
    }

    #[tokio::test]
    async fn seed_profiles_fill_metadata_and_keep_configured_name() {
        let mut graph = FakeGraph::default();
        graph.profile("s1", Some("MIT"), 42);

        let tiers = tiers();
        let discovery = Discovery::new(&graph, &tiers, RecommenderWeights::default(), DiscoveryLimits::default());
        let profiled = discovery.profile_seeds(&[seed("s1"), seed("unknown")], now()).await;

        assert_eq!(profiled.len(), 2);
        assert_eq!(profiled[0].name, "Seed s1");
        assert_eq!(profiled[0].affiliation.as_deref(), Some("MIT"));
        assert_eq!(profiled[0].h_index, Some(42));
        assert_eq!(profiled[0].paper_count, Some(100));
        assert!(profiled[0].is_seed);
        assert_eq!(profiled[1], seed("unknown"));
    }
}
