//! Job-board source adapters: search URLs, listing-page parsing, normalized drafts.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pdhunt_core::{normalize_text, PipelineError, PostingDraft};
use pdhunt_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pdhunt-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keywords: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
}

impl SearchQuery {
    pub fn new(keywords: impl Into<String>) -> Self {
        Self {
            keywords: keywords.into(),
            location: None,
            page: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("could not parse listing: {0}")]
    Parse(String),
}

impl AdapterError {
    pub fn into_pipeline_error(self, source_id: &str) -> PipelineError {
        PipelineError::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: self.to_string(),
        }
    }
}

/// A job board. Adapters produce drafts and never touch the store.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn search_urls(&self, query: &SearchQuery) -> Result<Vec<String>, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<PostingDraft>, AdapterError>;

    /// Fetch every search URL once and parse the results in order.
    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &SearchQuery,
    ) -> Result<Vec<PostingDraft>, AdapterError> {
        let mut drafts = Vec::new();
        for url in self.search_urls(query)? {
            let response = http
                .fetch_bytes(ctx.run_id, self.source_id(), &url)
                .await
                .map_err(|err| AdapterError::Unavailable(err.to_string()))?;
            let page = FetchedPage {
                url: response.final_url.clone(),
                body: response.text(),
                fetched_at: ctx.fetched_at,
            };
            drafts.extend(self.parse_listing(&page)?);
        }
        Ok(drafts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Board {
    Euraxess,
    AcademicPositions,
    JobsAcUk,
    NatureCareers,
}

impl Board {
    pub const ALL: [Board; 4] = [
        Board::Euraxess,
        Board::AcademicPositions,
        Board::JobsAcUk,
        Board::NatureCareers,
    ];

    pub fn source_id(&self) -> &'static str {
        match self {
            Board::Euraxess => "euraxess",
            Board::AcademicPositions => "academic-positions",
            Board::JobsAcUk => "jobs-ac-uk",
            Board::NatureCareers => "nature-careers",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Board::Euraxess => "EURAXESS",
            Board::AcademicPositions => "AcademicPositions",
            Board::JobsAcUk => "jobs.ac.uk",
            Board::NatureCareers => "Nature Careers",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Board::Euraxess => "https://euraxess.ec.europa.eu",
            Board::AcademicPositions => "https://academicpositions.com",
            Board::JobsAcUk => "https://www.jobs.ac.uk",
            Board::NatureCareers => "https://www.nature.com",
        }
    }

    pub fn from_source_id(source_id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.source_id() == source_id.trim())
    }
}

pub fn known_sources() -> Vec<&'static str> {
    Board::ALL.iter().map(Board::source_id).collect()
}

#[derive(Debug, Clone)]
pub struct BoardAdapter {
    board: Board,
    base_url: String,
}

impl BoardAdapter {
    pub fn new(board: Board) -> Self {
        Self::with_base_url(board, board.default_base_url())
    }

    /// Point the adapter at another host (mirrors, local test servers).
    pub fn with_base_url(board: Board, base_url: impl Into<String>) -> Self {
        Self {
            board,
            base_url: base_url.into(),
        }
    }

    pub fn board(&self) -> Board {
        self.board
    }
}

#[async_trait]
impl SourceAdapter for BoardAdapter {
    fn source_id(&self) -> &'static str {
        self.board.source_id()
    }

    fn display_name(&self) -> &'static str {
        self.board.display_name()
    }

    fn search_urls(&self, query: &SearchQuery) -> Result<Vec<String>, AdapterError> {
        let keywords = query.keywords.trim().to_string();
        let url = match self.board {
            Board::Euraxess => {
                let mut params = vec![("keywords", keywords)];
                if let Some(page) = query.page.filter(|p| *p > 0) {
                    params.push(("page", page.to_string()));
                }
                build_url(&self.base_url, "/jobs/search", &params)?
            }
            Board::AcademicPositions => {
                let mut params = vec![("search", keywords)];
                if let Some(location) = &query.location {
                    params.push(("location", location.clone()));
                }
                if let Some(page) = query.page.filter(|p| *p > 1) {
                    params.push(("page", page.to_string()));
                }
                build_url(&self.base_url, "/jobs/position/post-doc", &params)?
            }
            Board::JobsAcUk => {
                let params = vec![
                    ("keywords", keywords),
                    ("activeFacet", "typeOfJobFacet".to_string()),
                    ("typeOfJobId", "2".to_string()),
                    ("pageNo", query.page.unwrap_or(1).max(1).to_string()),
                ];
                build_url(&self.base_url, "/search/", &params)?
            }
            Board::NatureCareers => {
                let mut params = vec![("keywords", keywords), ("type", "postdoc".to_string())];
                if let Some(location) = &query.location {
                    params.push(("location", location.clone()));
                }
                if let Some(page) = query.page.filter(|p| *p > 1) {
                    params.push(("page", page.to_string()));
                }
                build_url(&self.base_url, "/naturecareers/jobs/search", &params)?
            }
        };
        Ok(vec![url])
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<PostingDraft>, AdapterError> {
        match self.board {
            Board::Euraxess => parse_cards(page, self.board, "article.ecl-content-item", parse_euraxess_card),
            Board::AcademicPositions => {
                parse_cards(page, self.board, "div.list-group-item", parse_academic_positions_card)
            }
            Board::JobsAcUk => parse_cards(page, self.board, "div.j-search-result__result", parse_jobs_ac_uk_card),
            Board::NatureCareers => parse_cards(page, self.board, "li.lister__item", parse_nature_careers_card),
        }
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    Board::from_source_id(source_id).map(|board| Box::new(BoardAdapter::new(board)) as Box<dyn SourceAdapter>)
}

fn build_url(base: &str, path: &str, params: &[(&str, String)]) -> Result<String, AdapterError> {
    let mut url = Url::parse(base)
        .and_then(|b| b.join(path))
        .map_err(|err| AdapterError::Unavailable(format!("invalid base url {base}: {err}")))?;
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    Ok(url.into())
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|err| AdapterError::Parse(format!("selector {css}: {err}")))
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<Vec<_>>().join(" "))
}

fn select_first<'a>(scope: ElementRef<'a>, css: &str) -> Result<Option<ElementRef<'a>>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next())
}

fn select_first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    Ok(select_first(scope, css)?.and_then(element_text))
}

fn select_all_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).filter_map(element_text).collect())
}

fn resolve_url(page_url: &str, href: &str) -> Option<String> {
    let mut resolved = Url::parse(page_url).ok()?.join(href.trim()).ok()?;
    resolved.set_fragment(None);
    Some(resolved.into())
}

/// Drop a leading "Label:" (case-insensitive) from a field's text.
fn strip_label(text: &str, label: &str) -> String {
    let trimmed = text.trim();
    let rest = match trimmed.get(..label.len()) {
        Some(head) if head.eq_ignore_ascii_case(label) => &trimmed[label.len()..],
        _ => trimmed,
    };
    rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace())
        .trim()
        .to_string()
}

fn country_from_location(location: &str) -> Option<String> {
    location.rsplit(',').next().and_then(text_or_none)
}

const UK_PLACES: &[&str] = &[
    "united kingdom",
    "uk",
    "england",
    "scotland",
    "wales",
    "northern ireland",
    "london",
    "oxford",
    "cambridge",
    "edinburgh",
    "manchester",
    "birmingham",
    "bristol",
    "leeds",
    "sheffield",
    "nottingham",
    "liverpool",
    "glasgow",
    "belfast",
];

fn uk_aware_country(location: &str) -> Option<String> {
    let padded = format!(" {} ", normalize_text(location));
    if UK_PLACES.iter().any(|place| padded.contains(&format!(" {place} "))) {
        return Some("United Kingdom".to_string());
    }
    country_from_location(location)
}

fn strip_ordinal(token: &str) -> &str {
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(number) = token.strip_suffix(suffix) {
            if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                return number;
            }
        }
    }
    token
}

/// Normalize board date strings to `YYYY-MM-DD`; unparseable text is kept as-is.
pub fn normalize_date(raw: &str) -> Option<String> {
    let cleaned = raw
        .split_whitespace()
        .map(strip_ordinal)
        .collect::<Vec<_>>()
        .join(" ");
    if cleaned.is_empty() {
        return None;
    }

    const FORMATS: [&str; 6] = ["%Y-%m-%d", "%d %B %Y", "%d %b %Y", "%B %d, %Y", "%b %d, %Y", "%d/%m/%Y"];
    for fmt in FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    if let Some(prefix) = cleaned.get(..10) {
        if NaiveDate::parse_from_str(prefix, "%Y-%m-%d").is_ok() {
            return Some(prefix.to_string());
        }
    }
    Some(cleaned)
}

type CardParser = fn(ElementRef<'_>, &FetchedPage) -> Result<Option<PostingDraft>, AdapterError>;

fn parse_cards(
    page: &FetchedPage,
    board: Board,
    card_css: &str,
    parse_card: CardParser,
) -> Result<Vec<PostingDraft>, AdapterError> {
    let document = Html::parse_document(&page.body);
    let card_sel = selector(card_css)?;

    let mut cards = 0usize;
    let mut drafts = Vec::new();
    for card in document.select(&card_sel) {
        cards += 1;
        if let Some(draft) = parse_card(card, page)? {
            drafts.push(draft);
        }
    }

    if cards > 0 && drafts.is_empty() {
        return Err(AdapterError::Parse(format!(
            "{}: {cards} result cards on {} but none had a title and link",
            board.source_id(),
            page.url
        )));
    }

    debug!(source_id = board.source_id(), cards, parsed = drafts.len(), url = %page.url, "parsed listing page");
    Ok(drafts)
}

fn title_and_url(link: ElementRef<'_>, title_scope: Option<ElementRef<'_>>, page: &FetchedPage) -> Option<(String, String)> {
    let title = title_scope.and_then(element_text).or_else(|| element_text(link))?;
    let url = link
        .value()
        .attr("href")
        .and_then(|href| resolve_url(&page.url, href))?;
    Some((title, url))
}

fn parse_euraxess_card(card: ElementRef<'_>, page: &FetchedPage) -> Result<Option<PostingDraft>, AdapterError> {
    let Some(link) = select_first(card, "h3.ecl-content-block__title a, h2.ecl-content-block__title a")? else {
        return Ok(None);
    };
    let Some((title, url)) = title_and_url(link, None, page) else {
        return Ok(None);
    };

    let mut draft = PostingDraft::new(Board::Euraxess.source_id(), title, page.fetched_at);
    draft.url = Some(url);

    let meta_sel = selector("li.ecl-content-block__primary-meta-item")?;
    let org_link_sel = selector("a[href*='/organisations/']")?;
    for item in card.select(&meta_sel) {
        if let Some(org) = item.select(&org_link_sel).next().and_then(element_text) {
            draft.institution.get_or_insert(org);
            continue;
        }
        let Some(text) = element_text(item) else {
            continue;
        };
        if text.to_ascii_lowercase().starts_with("posted on") {
            draft.posted_date = normalize_date(&strip_label(&text, "Posted on"));
        } else if draft.institution.is_none() {
            draft.institution = Some(text);
        }
    }

    draft.deadline = select_first_text(card, "div.id-Application-Deadline")?
        .and_then(|t| normalize_date(&strip_label(&t, "Application Deadline")));
    draft.country = select_first_text(card, "div.id-Work-Locations")?
        .and_then(|t| country_from_location(&strip_label(&t, "Work Locations")));
    draft.field = select_first_text(card, "div.id-Research-Field")?.and_then(|t| {
        let fields = strip_label(&t, "Research Field");
        fields.rsplit('»').next().and_then(text_or_none)
    });
    draft.description = select_first_text(card, "div.ecl-content-block__description")?;

    Ok(Some(draft))
}

fn parse_academic_positions_card(
    card: ElementRef<'_>,
    page: &FetchedPage,
) -> Result<Option<PostingDraft>, AdapterError> {
    let Some(link) = select_first(card, "a[href*='/ad/']")? else {
        return Ok(None);
    };
    let Some((title, url)) = title_and_url(link, select_first(link, "h4")?, page) else {
        return Ok(None);
    };

    let mut draft = PostingDraft::new(Board::AcademicPositions.source_id(), title, page.fetched_at);
    draft.url = Some(url);
    draft.institution = select_first_text(card, "a.job-link[href*='/employer/']")?;
    draft.country = select_first_text(card, "div.job-locations")?.and_then(|l| country_from_location(&l));
    draft.description = select_first_text(link, "p")?;
    draft.deadline = select_all_texts(card, "div.row.row-tight div.col-auto")?
        .into_iter()
        .find_map(|col| {
            col.split_once("Closing on:")
                .and_then(|(_, date)| normalize_date(date))
        });

    Ok(Some(draft))
}

fn parse_jobs_ac_uk_card(card: ElementRef<'_>, page: &FetchedPage) -> Result<Option<PostingDraft>, AdapterError> {
    let Some(link) = select_first(card, "a[href*='/job/']")? else {
        return Ok(None);
    };
    let Some((title, url)) = title_and_url(link, None, page) else {
        return Ok(None);
    };

    let mut draft = PostingDraft::new(Board::JobsAcUk.source_id(), title, page.fetched_at);
    draft.url = Some(url);
    draft.institution = select_first_text(card, "div.j-search-result__employer")?;
    draft.field = select_first_text(card, "div.j-search-result__department")?;
    draft.country = select_all_texts(card, "div")?
        .into_iter()
        .find(|text| text.starts_with("Location:"))
        .and_then(|text| uk_aware_country(&strip_label(&text, "Location")));
    draft.salary = select_first_text(card, "div.j-search-result__info")?
        .and_then(|t| text_or_none(&strip_label(&t, "Salary")));
    draft.deadline = select_first_text(card, "span.j-search-result__date--blue")?
        .and_then(|t| normalize_date(&strip_label(&t, "Closes")));

    Ok(Some(draft))
}

fn parse_nature_careers_card(
    card: ElementRef<'_>,
    page: &FetchedPage,
) -> Result<Option<PostingDraft>, AdapterError> {
    let Some(link) = select_first(card, "h3.lister__header a")? else {
        return Ok(None);
    };
    let Some((title, url)) = title_and_url(link, None, page) else {
        return Ok(None);
    };

    let mut draft = PostingDraft::new(Board::NatureCareers.source_id(), title, page.fetched_at);
    draft.url = Some(url);
    draft.institution = select_first_text(card, "li.lister__meta-item--recruiter")?;
    draft.country = select_first_text(card, "li.lister__meta-item--location")?
        .and_then(|l| country_from_location(&l));
    draft.salary = select_first_text(card, "li.lister__meta-item--salary")?;
    draft.description = select_first_text(card, "p.lister__description")?;

    Ok(Some(draft))
}
