use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pdhunt_core::{KeywordProfile, RecommenderWeights, TierTable};
use pdhunt_discovery::DiscoveryLimits;
use serde::{Deserialize, Serialize};

pub const SOURCES_FILE: &str = "sources.yaml";
pub const PROFILE_FILE: &str = "profile.yaml";
pub const TIERS_FILE: &str = "reference/institution_tiers.yaml";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
    pub recipients: Vec<String>,
}

/// Process-level settings, read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub workspace_root: PathBuf,
    pub report_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub semantic_scholar_api_key: Option<String>,
    pub daily_cron: String,
    pub weekly_cron: String,
    pub smtp: SmtpSettings,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let workspace_root = var("PDHUNT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: var("PDHUNT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data").join("pdhunt.db")),
            report_dir: var("PDHUNT_REPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            user_agent: var("PDHUNT_USER_AGENT").unwrap_or_else(|| "pdhunt-bot/0.1".to_string()),
            http_timeout_secs: var("PDHUNT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            semantic_scholar_api_key: var("SEMANTIC_SCHOLAR_API_KEY"),
            daily_cron: var("PDHUNT_DAILY_CRON").unwrap_or_else(|| "0 0 7 * * *".to_string()),
            weekly_cron: var("PDHUNT_WEEKLY_CRON").unwrap_or_else(|| "0 0 8 * * Mon".to_string()),
            smtp: SmtpSettings {
                host: var("PDHUNT_SMTP_HOST"),
                port: var("PDHUNT_SMTP_PORT").and_then(|v| v.parse().ok()),
                username: var("PDHUNT_SMTP_USERNAME"),
                password: var("PDHUNT_SMTP_PASSWORD"),
                from: var("PDHUNT_SMTP_FROM"),
                recipients: var("PDHUNT_REPORT_RECIPIENTS")
                    .map(|raw| {
                        raw.split([',', ';'])
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            workspace_root,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Overrides the board's public host.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default = "one_page")]
    pub max_pages: u32,
}

fn enabled_by_default() -> bool {
    true
}

fn one_page() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPi {
    /// Semantic Scholar author id.
    pub id: String,
    pub name: String,
}

/// Contents of `profile.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchProfile {
    #[serde(flatten)]
    pub keywords: KeywordProfile,
    #[serde(default)]
    pub seeds: Vec<SeedPi>,
    #[serde(default)]
    pub recommender: RecommenderWeights,
    #[serde(default)]
    pub discovery: DiscoveryLimits,
}

/// Everything a run needs, loaded once at start-up.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub sources: Vec<SourceConfig>,
    pub profile: SearchProfile,
    pub tiers: TierTable,
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

impl AppConfig {
    pub fn load(sync: SyncConfig) -> Result<Self> {
        let root = sync.workspace_root.clone();
        let registry: SourceRegistry = read_yaml(&root.join(SOURCES_FILE))?;
        let profile: SearchProfile = read_yaml(&root.join(PROFILE_FILE))?;
        let tiers_path = root.join(TIERS_FILE);
        let tiers: TierTable = if tiers_path.exists() {
            read_yaml(&tiers_path)?
        } else {
            tracing::warn!(path = %tiers_path.display(), "no institution tier table; every institution is unranked");
            TierTable::default()
        };
        Ok(Self {
            sync,
            sources: registry.sources,
            profile,
            tiers,
        })
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_lookup_defaults_and_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PDHUNT_WORKSPACE_ROOT", "/srv/pdhunt"),
            ("PDHUNT_HTTP_TIMEOUT_SECS", "45"),
            ("PDHUNT_REPORT_RECIPIENTS", "a@example.org; b@example.org,"),
            ("SEMANTIC_SCHOLAR_API_KEY", "  "),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.db_path, PathBuf::from("/srv/pdhunt/data/pdhunt.db"));
        assert_eq!(config.report_dir, PathBuf::from("/srv/pdhunt/reports"));
        assert_eq!(config.http_timeout_secs, 45);
        assert_eq!(config.semantic_scholar_api_key, None);
        assert_eq!(config.smtp.recipients, vec!["a@example.org", "b@example.org"]);
        assert_eq!(config.user_agent, "pdhunt-bot/0.1");
    }

    #[test]
    fn workspace_yaml_files_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let sync = SyncConfig::from_lookup(|k| {
            (k == "PDHUNT_WORKSPACE_ROOT").then(|| root.display().to_string())
        });
        let config = AppConfig::load(sync).expect("load workspace config");

        let ids: Vec<_> = config.sources.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(ids, pdhunt_adapters::known_sources());
        assert!(config.enabled_sources().all(|s| !s.queries.is_empty()));
        assert!(!config.profile.keywords.keywords.is_empty());
        assert!(!config.profile.seeds.is_empty());
        assert!(config.tiers.tiers.contains_key(&1));
        assert_eq!(config.profile.discovery.max_depth, 1);
    }

    #[test]
    fn profile_sections_are_optional() {
        let profile: SearchProfile = serde_yaml::from_str("keywords: [CRISPR]\n").unwrap();
        assert_eq!(profile.keywords.keywords.len(), 1);
        assert!(profile.seeds.is_empty());
        assert_eq!(profile.recommender, RecommenderWeights::default());
        assert_eq!(profile.discovery, DiscoveryLimits::default());
    }
}
