//! Keyword scoring, PI-name extraction and posting-term extraction.

mod pi_names;

use pdhunt_core::{JobPosting, KeywordProfile, PipelineError, PostingDraft, Region, TierTable};
use regex::Regex;
use thiserror::Error;

pub use pi_names::{is_valid_name, NameMatcher, PiNameExtractor, RegexMatcher};

pub const CRATE_NAME: &str = "pdhunt-matching";

#[derive(Debug, Error)]
pub enum MatchingError {
    #[error("invalid pattern for {label}: {source}")]
    InvalidPattern {
        label: String,
        #[source]
        source: regex::Error,
    },
}

impl From<MatchingError> for PipelineError {
    fn from(err: MatchingError) -> Self {
        PipelineError::Configuration(err.to_string())
    }
}

/// Case-insensitive pattern for a keyword that must start at a word boundary.
fn keyword_regex(term: &str) -> Result<Option<Regex>, MatchingError> {
    let parts: Vec<String> = term.split_whitespace().map(regex::escape).collect();
    if parts.is_empty() {
        return Ok(None);
    }
    let starts_with_word = term
        .trim_start()
        .chars()
        .next()
        .is_some_and(|c| c.is_alphanumeric() || c == '_');
    let boundary = if starts_with_word { r"\b" } else { "" };
    let pattern = format!("(?i){boundary}{}", parts.join(r"\s+"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|source| MatchingError::InvalidPattern {
            label: format!("keyword '{term}'"),
            source,
        })
}

/// A keyword profile compiled once and reused for every posting.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    positive: Vec<(Regex, f64)>,
    exclude: Vec<Regex>,
    total_weight: f64,
}

impl KeywordMatcher {
    pub fn new(profile: &KeywordProfile) -> Result<Self, MatchingError> {
        let mut positive = Vec::new();
        for keyword in &profile.keywords {
            if keyword.weight <= 0.0 {
                continue;
            }
            if let Some(regex) = keyword_regex(&keyword.term)? {
                positive.push((regex, keyword.weight));
            }
        }
        let mut exclude = Vec::new();
        for term in &profile.exclude {
            if let Some(regex) = keyword_regex(term)? {
                exclude.push(regex);
            }
        }
        let total_weight = positive.iter().map(|(_, w)| w).sum();
        Ok(Self {
            positive,
            exclude,
            total_weight,
        })
    }

    /// Matched weight over total weight, as 0-100 with one decimal.
    /// Any exclusion keyword forces the minimum.
    pub fn score(&self, text: &str) -> f64 {
        if text.trim().is_empty() || self.total_weight <= 0.0 {
            return 0.0;
        }
        if self.exclude.iter().any(|re| re.is_match(text)) {
            return 0.0;
        }
        let matched: f64 = self
            .positive
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|(_, w)| w)
            .sum();
        let score = (matched / self.total_weight * 100.0).clamp(0.0, 100.0);
        (score * 10.0).round() / 10.0
    }
}

pub fn score_text(text: &str, profile: &KeywordProfile) -> Result<f64, MatchingError> {
    Ok(KeywordMatcher::new(profile)?.score(text))
}

/// Text patterns for posting terms that boards often leave unstructured.
#[derive(Debug, Clone)]
pub struct TermExtractor {
    salary: Vec<Regex>,
    duration: Vec<Regex>,
}

const SALARY_PATTERNS: &[&str] = &[
    r"(?i)\b(?:salary|stipend|compensation|remuneration)\s*(?:of|is|:)?\s*[$€£]?\s*\d[\d,]*(?:\.\d+)?\s*(?:k\b|per\s+(?:year|annum|month))?",
    r"(?i)[$€£]\s*\d[\d,]*(?:\.\d+)?\s*k?\s*(?:per\s+(?:year|annum)|/\s*(?:yr|year|annum))",
    r"\b(?:TV-?L\s*E?\s*1[3-5]|E\s*1[3-5])\b",
    r"(?i)\b(?:grade|band|scale)\s*\d+",
];

const DURATION_PATTERNS: &[&str] = &[
    r"(?i)\b(?:up\s+to|minimum\s+of|at\s+least)\s+\d+\s+(?:years?|yrs?|months?)\b",
    r"(?i)\b\d+\s*(?:-\s*\d+\s*)?(?:years?|yrs?)\b",
    r"(?i)\b\d+\s*(?:-\s*\d+\s*)?months?\b",
];

impl TermExtractor {
    pub fn new() -> Result<Self, MatchingError> {
        let compile = |label: &str, patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| MatchingError::InvalidPattern {
                        label: label.to_string(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            salary: compile("salary", SALARY_PATTERNS)?,
            duration: compile("duration", DURATION_PATTERNS)?,
        })
    }

    pub fn salary(&self, text: &str) -> Option<String> {
        first_match(&self.salary, text)
    }

    pub fn duration(&self, text: &str) -> Option<String> {
        first_match(&self.duration, text)
    }
}

fn first_match(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
}

pub fn extract_salary(text: &str) -> Result<Option<String>, MatchingError> {
    Ok(TermExtractor::new()?.salary(text))
}

pub fn extract_duration(text: &str) -> Result<Option<String>, MatchingError> {
    Ok(TermExtractor::new()?.duration(text))
}

/// Turns adapter drafts into scored, classified postings.
#[derive(Debug)]
pub struct Scorer {
    keywords: KeywordMatcher,
    tiers: TierTable,
    names: PiNameExtractor,
    terms: TermExtractor,
}

impl Scorer {
    pub fn new(profile: &KeywordProfile, tiers: TierTable) -> Result<Self, MatchingError> {
        Ok(Self {
            keywords: KeywordMatcher::new(profile)?,
            tiers,
            names: PiNameExtractor::new()?,
            terms: TermExtractor::new()?,
        })
    }

    pub fn score(&self, draft: PostingDraft) -> JobPosting {
        let text = draft.search_text();
        let match_score = self.keywords.score(&text);
        let region = Region::for_country(draft.country.as_deref());
        let tier = self.tiers.lookup(draft.institution.as_deref());
        let pi_name = self.names.extract(&text);
        let body = draft.description.as_deref().unwrap_or_default();
        let salary = draft.salary.clone().or_else(|| self.terms.salary(body));
        let duration = draft.duration.clone().or_else(|| self.terms.duration(body));
        let identity_key = draft.identity_key();

        JobPosting {
            identity_key,
            source_id: draft.source_id,
            title: draft.title,
            institution: draft.institution,
            country: draft.country,
            region,
            tier,
            field: draft.field,
            description: draft.description,
            salary,
            duration,
            url: draft.url,
            posted_date: draft.posted_date,
            deadline: draft.deadline,
            pi_name,
            match_score,
            discovered_at: draft.fetched_at,
            last_seen_at: draft.fetched_at,
        }
    }

    pub fn score_all(&self, drafts: Vec<PostingDraft>) -> Vec<JobPosting> {
        drafts.into_iter().map(|d| self.score(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pdhunt_core::{Tier, WeightedKeyword};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn profile(terms: &[(&str, f64)], exclude: &[&str]) -> KeywordProfile {
        KeywordProfile {
            keywords: terms
                .iter()
                .map(|(term, weight)| WeightedKeyword {
                    term: term.to_string(),
                    weight: *weight,
                })
                .collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn score_is_weighted_fraction_of_matched_keywords() {
        let p = profile(&[("synthetic biology", 1.0), ("CRISPR", 2.0), ("yeast", 1.0)], &[]);
        assert_eq!(score_text("Postdoc in Synthetic  Biology using crispr screens", &p).unwrap(), 75.0);
        assert_eq!(score_text("unrelated text", &p).unwrap(), 0.0);
        assert_eq!(score_text("", &p).unwrap(), 0.0);
    }

    #[test]
    fn keywords_match_at_word_starts_only() {
        let p = profile(&[("rna", 1.0)], &[]);
        assert_eq!(score_text("RNA-seq pipelines", &p).unwrap(), 100.0);
        assert_eq!(score_text("Learn more about our programme", &p).unwrap(), 0.0);
    }

    #[test]
    fn exclusion_forces_minimum_regardless_of_positives() {
        let p = profile(&[("synthetic biology", 1.0), ("CRISPR", 1.0)], &["clinical trial"]);
        let text = "Synthetic biology and CRISPR work supporting a Clinical Trial";
        assert_eq!(score_text(text, &p).unwrap(), 0.0);
    }

    #[test]
    fn empty_profile_scores_zero() {
        assert_eq!(score_text("anything at all", &KeywordProfile::default()).unwrap(), 0.0);
    }

    #[test]
    fn scores_round_to_one_decimal() {
        let p = profile(&[("alpha", 1.0), ("beta", 1.0), ("gamma", 1.0)], &[]);
        assert_eq!(score_text("alpha", &p).unwrap(), 33.3);
        assert_eq!(score_text("alpha beta", &p).unwrap(), 66.7);
    }

    #[test]
    fn salary_and_duration_patterns() {
        let terms = TermExtractor::new().unwrap();
        assert_eq!(
            terms.salary("Salary: £37,694 per annum plus benefits").as_deref(),
            Some("Salary: £37,694 per annum")
        );
        assert_eq!(terms.salary("Paid according to TV-L E13.").as_deref(), Some("TV-L E13"));
        assert_eq!(terms.salary("no pay info"), None);
        assert_eq!(terms.duration("Fixed term for 2 years.").as_deref(), Some("2 years"));
        assert_eq!(terms.duration("A contract of up to 36 months").as_deref(), Some("up to 36 months"));
        assert_eq!(extract_duration("open-ended").unwrap(), None);
    }

    #[test]
    fn scorer_builds_classified_posting() {
        let mut tiers = BTreeMap::new();
        tiers.insert(1u8, vec!["Harvard Medical School".to_string()]);
        let scorer = Scorer::new(
            &profile(&[("systems biology", 1.0), ("microbiology", 1.0)], &[]),
            TierTable { tiers },
        )
        .unwrap();

        let fetched_at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        let mut draft = PostingDraft::new("nature-careers", "Postdoctoral Fellow - Systems Biology", fetched_at);
        draft.institution = Some("Harvard Medical School".to_string());
        draft.country = Some("Boston, MA, United States".to_string());
        draft.url = Some("https://www.nature.com/naturecareers/job/12790001/".to_string());
        draft.description = Some(
            "Supervisor: Dr. Rahul Mehta. Two positions in quantitative microbiology for 3 years.".to_string(),
        );

        let expected_key = draft.identity_key();
        let posting = scorer.score(draft);
        assert_eq!(posting.identity_key, expected_key);
        assert_eq!(posting.region, Region::Us);
        assert_eq!(posting.tier, Tier::T1);
        assert_eq!(posting.match_score, 100.0);
        assert_eq!(posting.pi_name.as_deref(), Some("Rahul Mehta"));
        assert_eq!(posting.duration.as_deref(), Some("3 years"));
        assert_eq!(posting.discovered_at, fetched_at);
    }
}
