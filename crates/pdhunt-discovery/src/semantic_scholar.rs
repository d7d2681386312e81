use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pdhunt_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AcademicGraph, AuthorProfile, DiscoveryError, Neighbor};

pub const DEFAULT_BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const SOURCE_ID: &str = "semantic-scholar";
const AUTHOR_FIELDS: &str = "authorId,name,affiliations,hIndex,paperCount,citationCount";

#[derive(Debug, Clone)]
pub struct SemanticScholarConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Recent papers inspected per author for co-authors and citation links.
    pub papers_per_author: usize,
    pub links_per_paper: usize,
}

impl Default for SemanticScholarConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            papers_per_author: 20,
            links_per_paper: 50,
        }
    }
}

impl SemanticScholarConfig {
    /// 100 requests per 5 minutes for anonymous callers, 1 request per second
    /// with a key.
    pub fn token_bucket(&self) -> TokenBucketConfig {
        if self.api_key.is_some() {
            TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            }
        } else {
            TokenBucketConfig {
                capacity: 5,
                refill_every: Duration::from_secs(3),
            }
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.timeout,
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
            },
            token_bucket: Some(self.token_bucket()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorDto {
    author_id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    affiliations: Vec<String>,
    h_index: Option<u32>,
    paper_count: Option<u32>,
    citation_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaperDto {
    paper_id: Option<String>,
    #[serde(default)]
    authors: Vec<AuthorRefDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorRefDto {
    author_id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CitationDto {
    citing_paper: Option<PaperDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceDto {
    cited_paper: Option<PaperDto>,
}

/// Semantic Scholar Graph API client. Calls are sequential and share one
/// token bucket. An author's paper list is fetched once per client and
/// shared by the co-author and citation passes.
#[derive(Debug)]
pub struct SemanticScholarClient {
    http: HttpFetcher,
    config: SemanticScholarConfig,
    run_id: Uuid,
    papers: Mutex<HashMap<String, Vec<PaperDto>>>,
}

impl SemanticScholarClient {
    pub fn new(config: SemanticScholarConfig, run_id: Uuid) -> Result<Self, DiscoveryError> {
        let http = HttpFetcher::new(config.http_config())
            .map_err(|err| DiscoveryError::Client(format!("{err:#}")))?;
        Ok(Self::with_fetcher(config, http, run_id))
    }

    pub fn with_fetcher(config: SemanticScholarConfig, http: HttpFetcher, run_id: Uuid) -> Self {
        Self {
            http,
            config,
            run_id,
            papers: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<T, DiscoveryError> {
        let url = self.url(path);
        let headers: Vec<(&str, &str)> = self
            .config
            .api_key
            .as_deref()
            .map(|key| vec![("x-api-key", key)])
            .unwrap_or_default();
        self.http
            .get_json(self.run_id, SOURCE_ID, &url, query, &headers)
            .await
            .map_err(|source| DiscoveryError::from_fetch(context, source))
    }

    async fn papers(&self, author_id: &str) -> Result<Vec<PaperDto>, DiscoveryError> {
        let cached = self
            .papers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(author_id)
            .cloned();
        if let Some(papers) = cached {
            return Ok(papers);
        }

        let page: Page<PaperDto> = self
            .get(
                &format!("author/{author_id}/papers"),
                &[
                    ("fields", "paperId,title,year,authors".to_string()),
                    ("limit", self.config.papers_per_author.to_string()),
                ],
                &format!("papers of {author_id}"),
            )
            .await?;
        self.papers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(author_id.to_string(), page.data.clone());
        Ok(page.data)
    }
}

fn tally(
    counts: &mut HashMap<String, (String, u32)>,
    exclude: &str,
    authors: impl IntoIterator<Item = AuthorRefDto>,
) {
    for author in authors {
        let Some(id) = author.author_id.filter(|id| id != exclude) else {
            continue;
        };
        let entry = counts
            .entry(id)
            .or_insert_with(|| (author.name.clone().unwrap_or_default(), 0));
        entry.1 += 1;
        if entry.0.is_empty() {
            entry.0 = author.name.unwrap_or_default();
        }
    }
}

/// Strongest links first, then by id for a stable order.
fn ranked(
    counts: HashMap<String, (String, u32)>,
    limit: usize,
    build: impl Fn(String, String, u32) -> Neighbor,
) -> Vec<Neighbor> {
    let mut entries: Vec<_> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1 .1.cmp(&a.1 .1).then_with(|| a.0.cmp(&b.0)));
    entries
        .into_iter()
        .take(limit)
        .map(|(id, (name, n))| build(id, name, n))
        .collect()
}

#[async_trait]
impl AcademicGraph for SemanticScholarClient {
    async fn author(&self, id: &str) -> Result<AuthorProfile, DiscoveryError> {
        let dto: AuthorDto = self
            .get(
                &format!("author/{id}"),
                &[("fields", AUTHOR_FIELDS.to_string())],
                &format!("author {id}"),
            )
            .await?;
        Ok(AuthorProfile {
            id: dto.author_id.unwrap_or_else(|| id.to_string()),
            name: dto.name.unwrap_or_default(),
            affiliation: dto.affiliations.into_iter().find(|a| !a.trim().is_empty()),
            h_index: dto.h_index,
            paper_count: dto.paper_count,
            citation_count: dto.citation_count,
        })
    }

    async fn coauthors(&self, id: &str, limit: usize) -> Result<Vec<Neighbor>, DiscoveryError> {
        let mut counts = HashMap::new();
        for paper in self.papers(id).await? {
            tally(&mut counts, id, paper.authors);
        }
        debug!(author = id, distinct = counts.len(), "co-authors collected");
        Ok(ranked(counts, limit, |id, name, shared| Neighbor {
            id,
            name,
            shared_papers: shared,
            citation_links: 0,
        }))
    }

    async fn citation_neighbors(&self, id: &str, limit: usize) -> Result<Vec<Neighbor>, DiscoveryError> {
        let query = vec![
            ("fields", "authors".to_string()),
            ("limit", self.config.links_per_paper.to_string()),
        ];
        let mut counts = HashMap::new();
        for paper in self.papers(id).await? {
            let Some(paper_id) = paper.paper_id else {
                continue;
            };
            // A paper whose links cannot be read is skipped; the rest still count.
            match self
                .get::<Page<CitationDto>>(
                    &format!("paper/{paper_id}/citations"),
                    &query,
                    &format!("citations of {paper_id}"),
                )
                .await
            {
                Ok(citations) => {
                    for citing in citations.data.into_iter().filter_map(|c| c.citing_paper) {
                        tally(&mut counts, id, citing.authors);
                    }
                }
                Err(err) => warn!(author = id, paper = %paper_id, error = %err, "skipping citations"),
            }
            match self
                .get::<Page<ReferenceDto>>(
                    &format!("paper/{paper_id}/references"),
                    &query,
                    &format!("references of {paper_id}"),
                )
                .await
            {
                Ok(references) => {
                    for cited in references.data.into_iter().filter_map(|r| r.cited_paper) {
                        tally(&mut counts, id, cited.authors);
                    }
                }
                Err(err) => warn!(author = id, paper = %paper_id, error = %err, "skipping references"),
            }
        }
        Ok(ranked(counts, limit, |id, name, links| Neighbor {
            id,
            name,
            shared_papers: 0,
            citation_links: links,
        }))
    }
}

impl DiscoveryError {
    fn from_fetch(context: &str, source: FetchError) -> Self {
        if source.status() == Some(404) {
            DiscoveryError::NotFound(context.to_string())
        } else {
            DiscoveryError::Api {
                context: context.to_string(),
                source,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, api_key: Option<&str>) -> SemanticScholarClient {
        let config = SemanticScholarConfig {
            base_url: format!("{}/graph/v1", server.uri()),
            api_key: api_key.map(str::to_string),
            ..SemanticScholarConfig::default()
        };
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            token_bucket: None,
        })
        .unwrap();
        SemanticScholarClient::with_fetcher(config, http, Uuid::new_v4())
    }

    #[test]
    fn anonymous_callers_get_the_tighter_bucket() {
        let anonymous = SemanticScholarConfig::default().token_bucket();
        let keyed = SemanticScholarConfig {
            api_key: Some("k".to_string()),
            ..SemanticScholarConfig::default()
        }
        .token_bucket();
        assert!(anonymous.refill_every > keyed.refill_every);
    }

    #[tokio::test]
    async fn author_lookup_sends_api_key_and_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/1741101"))
            .and(header("x-api-key", "secret"))
            .and(query_param("fields", AUTHOR_FIELDS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorId": "1741101",
                "name": "Pamela Silver",
                "affiliations": ["Harvard Medical School"],
                "hIndex": 78,
                "paperCount": 310,
                "citationCount": 25000
            })))
            .expect(1)
            .mount(&server)
            .await;

        let profile = client(&server, Some("secret")).author("1741101").await.unwrap();
        assert_eq!(profile.name, "Pamela Silver");
        assert_eq!(profile.affiliation.as_deref(), Some("Harvard Medical School"));
        assert_eq!(profile.h_index, Some(78));
        assert_eq!(profile.paper_count, Some(310));
    }

    #[tokio::test]
    async fn coauthors_count_shared_papers_and_skip_self() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/A/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"paperId": "p1", "authors": [
                        {"authorId": "A", "name": "Seed"},
                        {"authorId": "B", "name": "Bea"},
                        {"authorId": "C", "name": "Cal"}
                    ]},
                    {"paperId": "p2", "authors": [
                        {"authorId": "A", "name": "Seed"},
                        {"authorId": "B", "name": "Bea"},
                        {"authorId": null, "name": "Anonymous"}
                    ]}
                ]
            })))
            .mount(&server)
            .await;

        let neighbors = client(&server, None).coauthors("A", 10).await.unwrap();
        let summary: Vec<_> = neighbors.iter().map(|n| (n.id.as_str(), n.shared_papers)).collect();
        assert_eq!(summary, vec![("B", 2), ("C", 1)]);
    }

    #[tokio::test]
    async fn citation_neighbors_merge_citations_and_references() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/A/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"paperId": "p1", "authors": [{"authorId": "A", "name": "Seed"}]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/p1/citations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"citingPaper": {"paperId": "c1", "authors": [{"authorId": "D", "name": "Dee"}]}},
                    {"citingPaper": {"paperId": "c2", "authors": [{"authorId": "D", "name": "Dee"}, {"authorId": "A", "name": "Seed"}]}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/p1/references"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"citedPaper": {"paperId": "r1", "authors": [{"authorId": "E", "name": "Eve"}]}}]
            })))
            .mount(&server)
            .await;

        let neighbors = client(&server, None).citation_neighbors("A", 10).await.unwrap();
        let summary: Vec<_> = neighbors.iter().map(|n| (n.id.as_str(), n.citation_links)).collect();
        assert_eq!(summary, vec![("D", 2), ("E", 1)]);
    }

    #[tokio::test]
    async fn unreadable_paper_links_are_skipped_and_papers_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/A/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"paperId": "p1", "authors": [{"authorId": "A", "name": "Seed"}, {"authorId": "B", "name": "Bea"}]},
                    {"paperId": "p2", "authors": [{"authorId": "A", "name": "Seed"}]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/p1/citations"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/p1/references"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"citedPaper": {"paperId": "r1", "authors": [{"authorId": "E", "name": "Eve"}]}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/p2/citations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"citingPaper": {"paperId": "c9", "authors": [{"authorId": "D", "name": "Dee"}]}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/p2/references"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let client = client(&server, None);
        let coauthors = client.coauthors("A", 10).await.unwrap();
        assert_eq!(coauthors.len(), 1);

        let neighbors = client.citation_neighbors("A", 10).await.unwrap();
        let summary: Vec<_> = neighbors.iter().map(|n| (n.id.as_str(), n.citation_links)).collect();
        assert_eq!(summary, vec![("D", 1), ("E", 1)]);
    }

    #[tokio::test]
    async fn rate_limited_requests_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/42"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorId": "42",
                "name": "Retry Success"
            })))
            .mount(&server)
            .await;

        let profile = client(&server, None).author("42").await.unwrap();
        assert_eq!(profile.name, "Retry Success");
    }

    #[tokio::test]
    async fn persistent_rate_limit_surfaces_as_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/42"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server, None).author("42").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Api { ref source, .. } if source.is_rate_limited()));
    }

    #[tokio::test]
    async fn missing_author_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/author/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server, None).author("nope").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound(_)));
    }
}
