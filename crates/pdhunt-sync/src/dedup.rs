use pdhunt_core::{normalize_text, PostingDraft};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub threshold: f64,
    pub title_weight: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            title_weight: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub kept_source: String,
    pub dropped_source: String,
    /// Listing URL of the draft folded away, kept as an alternate link.
    pub dropped_url: Option<String>,
    pub title: String,
    pub confidence: f64,
}

/// Collapses the same posting surfaced by more than one board in a run.
#[derive(Debug, Clone, Default)]
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn similarity(&self, a: &PostingDraft, b: &PostingDraft) -> f64 {
        let title = jaro_winkler(&normalize_text(&a.title), &normalize_text(&b.title));
        let inst_a = normalize_text(a.institution.as_deref().unwrap_or_default());
        let inst_b = normalize_text(b.institution.as_deref().unwrap_or_default());
        let institution = if inst_a.is_empty() || inst_b.is_empty() {
            0.0
        } else {
            jaro_winkler(&inst_a, &inst_b)
        };
        title * self.config.title_weight + institution * (1.0 - self.config.title_weight)
    }

    /// Duplicates merge into the draft already kept. The richer description
    /// decides which draft's identity survives; the other fills its gaps.
    /// Drafts from the same board only collapse on an identical identity key;
    /// that board's own listing is the authority on whether two similar
    /// titles are distinct posts.
    pub fn apply(&self, drafts: Vec<PostingDraft>) -> (Vec<PostingDraft>, Vec<DuplicateMatch>) {
        let mut kept: Vec<(String, PostingDraft)> = Vec::with_capacity(drafts.len());
        let mut matches = Vec::new();

        for draft in drafts {
            let key = draft.identity_key();
            let hit = kept.iter().enumerate().find_map(|(idx, (kept_key, existing))| {
                let confidence = if *kept_key == key {
                    1.0
                } else if existing.source_id != draft.source_id {
                    self.similarity(existing, &draft)
                } else {
                    0.0
                };
                (confidence >= self.config.threshold).then_some((idx, confidence))
            });

            let Some((idx, confidence)) = hit else {
                kept.push((key, draft));
                continue;
            };
            let (kept_key, existing) = &mut kept[idx];
            let dropped = merge_duplicate(existing, draft);
            *kept_key = existing.identity_key();
            debug!(
                kept = %existing.source_id,
                dropped = %dropped.source_id,
                confidence,
                "duplicate posting merged"
            );
            matches.push(DuplicateMatch {
                kept_source: existing.source_id.clone(),
                dropped_source: dropped.source_id,
                dropped_url: dropped.url,
                title: dropped.title,
                confidence,
            });
        }

        (kept.into_iter().map(|(_, d)| d).collect(), matches)
    }
}

fn text_len(value: &Option<String>) -> usize {
    value.as_deref().map_or(0, |v| v.trim().chars().count())
}

fn fill_gap(slot: &mut Option<String>, other: &mut Option<String>) {
    if text_len(slot) == 0 && text_len(other) > 0 {
        *slot = other.take();
    }
}

/// Folds `other` into `kept` and returns what was left over. A strictly
/// longer description swaps the two first.
fn merge_duplicate(kept: &mut PostingDraft, mut other: PostingDraft) -> PostingDraft {
    if text_len(&other.description) > text_len(&kept.description) {
        std::mem::swap(kept, &mut other);
    }
    fill_gap(&mut kept.institution, &mut other.institution);
    fill_gap(&mut kept.country, &mut other.country);
    fill_gap(&mut kept.field, &mut other.field);
    fill_gap(&mut kept.salary, &mut other.salary);
    fill_gap(&mut kept.duration, &mut other.duration);
    fill_gap(&mut kept.posted_date, &mut other.posted_date);
    fill_gap(&mut kept.deadline, &mut other.deadline);
    other
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn draft(source: &str, title: &str, institution: &str, url: &str) -> PostingDraft {
        let fetched = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        let mut d = PostingDraft::new(source, title, fetched);
        d.institution = Some(institution.to_string());
        d.url = Some(url.to_string());
        d
    }

    #[test]
    fn same_posting_on_two_boards_collapses() {
        let engine = DedupEngine::default();
        let (kept, matches) = engine.apply(vec![
            draft("euraxess", "Postdoctoral Researcher in Synthetic Biology", "ETH Zurich", "https://a/1"),
            draft("academic-positions", "Postdoctoral researcher in synthetic biology", "ETH Zürich", "https://b/9"),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_id, "euraxess");
        assert_eq!(matches[0].dropped_source, "academic-positions");
    }

    #[test]
    fn different_institutions_stay_separate() {
        let engine = DedupEngine::default();
        let (kept, matches) = engine.apply(vec![
            draft("euraxess", "Postdoc in Microbiology", "Institut Pasteur", "https://a/1"),
            draft("nature-careers", "Postdoc in Microbiology", "Harvard Medical School", "https://b/2"),
        ]);
        assert_eq!(kept.len(), 2);
        assert!(matches.is_empty());
    }

    #[test]
    fn same_board_similar_titles_are_kept_unless_identical() {
        let engine = DedupEngine::default();
        let (kept, _) = engine.apply(vec![
            draft("jobs-ac-uk", "Research Associate in Genomics", "University of Oxford", "https://c/1"),
            draft("jobs-ac-uk", "Research Associate in Genomics", "University of Oxford", "https://c/2"),
            draft("jobs-ac-uk", "Research Associate in Genomics", "University of Oxford", "https://c/1#apply"),
        ]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn duplicate_fills_missing_terms_and_keeps_alternate_url() {
        let engine = DedupEngine::default();
        let first = draft("euraxess", "Postdoc in Plant Genomics", "University of Cambridge", "https://a/1");
        let mut second = draft("jobs-ac-uk", "Postdoc in plant genomics", "University of Cambridge", "https://b/7");
        second.salary = Some("£36,024 - £44,263".to_string());
        second.deadline = Some("2026-04-30".to_string());

        let (kept, matches) = engine.apply(vec![first, second]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_id, "euraxess");
        assert_eq!(kept[0].url.as_deref(), Some("https://a/1"));
        assert_eq!(kept[0].salary.as_deref(), Some("£36,024 - £44,263"));
        assert_eq!(kept[0].deadline.as_deref(), Some("2026-04-30"));
        assert_eq!(matches[0].dropped_source, "jobs-ac-uk");
        assert_eq!(matches[0].dropped_url.as_deref(), Some("https://b/7"));
    }

    #[test]
    fn richer_description_wins_the_merge() {
        let engine = DedupEngine::default();
        let mut first = draft("euraxess", "Postdoc in Plant Genomics", "University of Cambridge", "https://a/1");
        first.deadline = Some("2026-04-30".to_string());
        let mut second = draft("nature-careers", "Postdoc in Plant Genomics", "University of Cambridge", "https://b/7");
        second.description = Some("Join the lab to study wheat genome evolution.".to_string());

        let (kept, matches) = engine.apply(vec![first, second]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_id, "nature-careers");
        assert_eq!(kept[0].deadline.as_deref(), Some("2026-04-30"));
        assert_eq!(matches[0].kept_source, "nature-careers");
        assert_eq!(matches[0].dropped_url.as_deref(), Some("https://a/1"));
    }
}
