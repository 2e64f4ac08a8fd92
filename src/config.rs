//! TOML configuration.
//!
//! Loaded once at startup into an immutable [`Config`] that is passed by
//! reference to every component. Validation happens in [`load_config`];
//! contradictory settings (no search scope enabled, no sort enabled, invalid
//! tag regex) are fatal and the application refuses to start.

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub facets: FacetsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the persisted state tree: cache database, index generations,
    /// downloaded attachments, and the run lock all live under this path.
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.sqlite")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("sync.lock")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Base URL of the remote bibliographic API.
    pub base_url: String,
    /// Remote library identifier (e.g. a group or user library ID).
    pub library_id: String,
    /// Library kind: `"group"` or `"user"`.
    #[serde(default = "default_library_kind")]
    pub library_kind: String,
    /// API key. Read access only; the client never issues mutating requests.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Page size for entity listing requests. The remote imposes a ceiling
    /// of 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed wait between retry attempts, unless the remote sends an
    /// explicit retry-after signal.
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_library_kind() -> String {
    "group".to_string()
}
fn default_batch_size() -> u32 {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_wait_secs() -> u64 {
    30
}
fn default_timeout_secs() -> u64 {
    30
}

/// Tag-based child filtering, applied at two independent points: once when
/// deciding what enters the cache, and once when deciding what is displayed.
/// Display filtering never alters raw/export data paths.
#[derive(Debug, Deserialize, Clone)]
pub struct FiltersConfig {
    /// Child notes/attachments must match at least one of these patterns to
    /// be cached. Empty list means everything is included.
    #[serde(default)]
    pub cache_include_tags: Vec<String>,
    /// Children matching any of these patterns are dropped before caching.
    #[serde(default)]
    pub cache_exclude_tags: Vec<String>,
    #[serde(default)]
    pub display_include_tags: Vec<String>,
    #[serde(default)]
    pub display_exclude_tags: Vec<String>,
    /// Reserved tag marking a child note as a relation list.
    #[serde(default = "default_relation_marker")]
    pub relation_marker_tag: String,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            cache_include_tags: Vec::new(),
            cache_exclude_tags: Vec::new(),
            display_include_tags: Vec::new(),
            display_exclude_tags: Vec::new(),
            relation_marker_tag: default_relation_marker(),
        }
    }
}

fn default_relation_marker() -> String {
    "_cites".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Enabled search scopes. At least one must be enabled.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Enabled sort options. At least one must be enabled. `relevance` is
    /// only honored when keyword terms were supplied.
    #[serde(default = "default_sorts")]
    pub sorts: Vec<String>,
    #[serde(default = "default_page_len")]
    pub page_len: u32,
    /// Abstracts longer than this are truncated for display...
    #[serde(default = "default_abstract_max_chars")]
    pub abstract_max_chars: usize,
    /// ...unless the overage is within this leeway.
    #[serde(default = "default_abstract_leeway")]
    pub abstract_leeway: usize,
    /// Boundary policy when the overage exactly equals the leeway: `true`
    /// keeps the full abstract, `false` truncates.
    #[serde(default = "default_leeway_inclusive")]
    pub leeway_inclusive: bool,
    #[serde(default)]
    pub boosts: BoostsConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            scopes: default_scopes(),
            sorts: default_sorts(),
            page_len: default_page_len(),
            abstract_max_chars: default_abstract_max_chars(),
            abstract_leeway: default_abstract_leeway(),
            leeway_inclusive: default_leeway_inclusive(),
            boosts: BoostsConfig::default(),
        }
    }
}

fn default_scopes() -> Vec<String> {
    vec![
        "all".to_string(),
        "title".to_string(),
        "creator".to_string(),
        "fulltext".to_string(),
    ]
}
fn default_sorts() -> Vec<String> {
    vec![
        "relevance".to_string(),
        "date_desc".to_string(),
        "date_asc".to_string(),
        "title".to_string(),
        "author".to_string(),
    ]
}
fn default_page_len() -> u32 {
    20
}
fn default_abstract_max_chars() -> usize {
    500
}
fn default_abstract_leeway() -> usize {
    40
}
fn default_leeway_inclusive() -> bool {
    true
}

/// Per-field score boost weights for relevance ranking.
#[derive(Debug, Deserialize, Clone)]
pub struct BoostsConfig {
    #[serde(default = "default_boost_title")]
    pub title: f64,
    #[serde(default = "default_boost_creators")]
    pub creators: f64,
    #[serde(default = "default_boost_tags")]
    pub tags: f64,
    #[serde(default = "default_boost_identifiers")]
    pub identifiers: f64,
    #[serde(default = "default_boost_abstract")]
    pub abstract_text: f64,
    #[serde(default = "default_boost_fulltext")]
    pub fulltext: f64,
}

impl Default for BoostsConfig {
    fn default() -> Self {
        Self {
            title: default_boost_title(),
            creators: default_boost_creators(),
            tags: default_boost_tags(),
            identifiers: default_boost_identifiers(),
            abstract_text: default_boost_abstract(),
            fulltext: default_boost_fulltext(),
        }
    }
}

fn default_boost_title() -> f64 {
    4.0
}
fn default_boost_creators() -> f64 {
    2.0
}
fn default_boost_tags() -> f64 {
    2.0
}
fn default_boost_identifiers() -> f64 {
    3.0
}
fn default_boost_abstract() -> f64 {
    1.5
}
fn default_boost_fulltext() -> f64 {
    1.0
}

impl BoostsConfig {
    pub fn for_field(&self, field: &str) -> f64 {
        match field {
            "title" => self.title,
            "creators" => self.creators,
            "tags" => self.tags,
            "identifiers" => self.identifiers,
            "abstract" => self.abstract_text,
            "fulltext" => self.fulltext,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FacetsConfig {
    #[serde(default = "default_true")]
    pub item_type: bool,
    #[serde(default = "default_true")]
    pub year: bool,
    #[serde(default = "default_true")]
    pub tag: bool,
    #[serde(default = "default_true")]
    pub collection: bool,
    /// Facet over attachment-link presence.
    #[serde(default = "default_true")]
    pub link: bool,
    /// Number of values shown per facet before folding...
    #[serde(default = "default_facet_value_limit")]
    pub value_limit: usize,
    /// ...unless the overage is within this leeway.
    #[serde(default = "default_facet_count_leeway")]
    pub count_leeway: usize,
}

impl Default for FacetsConfig {
    fn default() -> Self {
        Self {
            item_type: true,
            year: true,
            tag: true,
            collection: true,
            link: true,
            value_limit: default_facet_value_limit(),
            count_leeway: default_facet_count_leeway(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_facet_value_limit() -> usize {
    10
}
fn default_facet_count_leeway() -> usize {
    2
}

impl FacetsConfig {
    pub fn enabled_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.item_type {
            names.push("item_type");
        }
        if self.year {
            names.push("year");
        }
        if self.tag {
            names.push("tag");
        }
        if self.collection {
            names.push("collection");
        }
        if self.link {
            names.push("link");
        }
        names
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config, SyncError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Configuration(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| SyncError::Configuration(format!("failed to parse config file: {}", e)))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), SyncError> {
    if config.remote.base_url.is_empty() {
        return Err(SyncError::Configuration(
            "remote.base_url must be set".into(),
        ));
    }
    if config.remote.library_id.is_empty() {
        return Err(SyncError::Configuration(
            "remote.library_id must be set".into(),
        ));
    }
    match config.remote.library_kind.as_str() {
        "group" | "user" => {}
        other => {
            return Err(SyncError::Configuration(format!(
                "remote.library_kind must be 'group' or 'user', got '{}'",
                other
            )))
        }
    }
    if config.remote.batch_size == 0 || config.remote.batch_size > 100 {
        return Err(SyncError::Configuration(
            "remote.batch_size must be between 1 and 100".into(),
        ));
    }

    if config.search.scopes.is_empty() {
        return Err(SyncError::Configuration(
            "search.scopes must enable at least one scope".into(),
        ));
    }
    for scope in &config.search.scopes {
        match scope.as_str() {
            "all" | "title" | "creator" | "fulltext" => {}
            other => {
                return Err(SyncError::Configuration(format!(
                    "unknown search scope '{}'",
                    other
                )))
            }
        }
    }

    if config.search.sorts.is_empty() {
        return Err(SyncError::Configuration(
            "search.sorts must enable at least one sort option".into(),
        ));
    }
    for sort in &config.search.sorts {
        match sort.as_str() {
            "relevance" | "date_desc" | "date_asc" | "title" | "author" => {}
            other => {
                return Err(SyncError::Configuration(format!(
                    "unknown sort option '{}'",
                    other
                )))
            }
        }
    }

    if config.search.page_len == 0 {
        return Err(SyncError::Configuration(
            "search.page_len must be >= 1".into(),
        ));
    }

    let boosts = &config.search.boosts;
    for (name, value) in [
        ("title", boosts.title),
        ("creators", boosts.creators),
        ("tags", boosts.tags),
        ("identifiers", boosts.identifiers),
        ("abstract_text", boosts.abstract_text),
        ("fulltext", boosts.fulltext),
    ] {
        if value <= 0.0 || !value.is_finite() {
            return Err(SyncError::Configuration(format!(
                "search.boosts.{} must be a positive number",
                name
            )));
        }
    }

    if config.facets.enabled_names().is_empty() {
        return Err(SyncError::Configuration(
            "facets must enable at least one facet".into(),
        ));
    }

    // Tag patterns must compile up front, not mid-sync.
    for (name, patterns) in [
        ("filters.cache_include_tags", &config.filters.cache_include_tags),
        ("filters.cache_exclude_tags", &config.filters.cache_exclude_tags),
        ("filters.display_include_tags", &config.filters.display_include_tags),
        ("filters.display_exclude_tags", &config.filters.display_exclude_tags),
    ] {
        for pattern in patterns {
            Regex::new(pattern).map_err(|e| {
                SyncError::Configuration(format!("invalid regex in {}: {}", name, e))
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
[storage]
data_dir = "/tmp/bibmirror-test"

[remote]
base_url = "https://api.example.org"
library_id = "12345"

[server]
bind = "127.0.0.1:7661"
"#
        .to_string()
    }

    fn parse(toml_str: &str) -> Result<Config, SyncError> {
        let config: Config = toml::from_str(toml_str).unwrap();
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&base_toml()).unwrap();
        assert_eq!(config.remote.batch_size, 100);
        assert_eq!(config.filters.relation_marker_tag, "_cites");
        assert!(config.search.sorts.iter().any(|s| s == "relevance"));
        assert_eq!(
            config.facets.enabled_names(),
            vec!["item_type", "year", "tag", "collection", "link"]
        );
    }

    #[test]
    fn rejects_empty_scopes() {
        let toml_str = format!("{}\n[search]\nscopes = []\n", base_toml());
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("at least one scope"));
    }

    #[test]
    fn rejects_empty_sorts() {
        let toml_str = format!("{}\n[search]\nsorts = []\n", base_toml());
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("at least one sort"));
    }

    #[test]
    fn rejects_oversized_batch() {
        let toml_str = base_toml().replace(
            "library_id = \"12345\"",
            "library_id = \"12345\"\nbatch_size = 500",
        );
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn rejects_bad_tag_regex() {
        let toml_str = format!(
            "{}\n[filters]\ncache_exclude_tags = [\"[unclosed\"]\n",
            base_toml()
        );
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn storage_paths_derive_from_data_dir() {
        let config = parse(&base_toml()).unwrap();
        assert!(config.storage.cache_path().ends_with("cache.sqlite"));
        assert!(config.storage.index_dir().ends_with("index"));
        assert!(config.storage.attachments_dir().ends_with("attachments"));
    }
}
