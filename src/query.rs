//! Query execution against the live index generation.
//!
//! Relevance ranking is TF-IDF style with per-field boost weights and
//! field-length normalization. Facet filters only restrict the candidate
//! set (boolean inclusion) and never contribute to the score. Sort options
//! other than `relevance` bypass scoring entirely and order by a stored
//! field value; `relevance` is only permitted when keyword terms were
//! supplied.

use serde::Serialize;
use sqlx::Row;
use std::collections::{HashMap, HashSet};

use crate::analyze::tokenize;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::index::IndexReader;
use crate::models::IndexDocument;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Raw keyword input. Empty means "browse everything".
    pub terms: String,
    pub scope: String,
    /// `(facet, value)` pairs, ANDed together.
    pub facet_filters: Vec<(String, String)>,
    pub sort: String,
    /// 1-based page number.
    pub page: u32,
    pub page_len: Option<u32>,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            terms: String::new(),
            scope: "all".to_string(),
            facet_filters: Vec::new(),
            sort: "date_desc".to_string(),
            page: 1,
            page_len: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub id: String,
    pub title: String,
    pub creators: Vec<String>,
    pub item_type: String,
    pub year: Option<i32>,
    pub abstract_display: String,
    pub badges: Vec<String>,
    pub score: Option<f64>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetValueCount {
    pub value: String,
    pub count: u64,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetBlock {
    pub name: String,
    pub values: Vec<FacetValueCount>,
    /// True when values beyond the configured display limit were folded.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub total: u64,
    pub page: u32,
    pub page_len: u32,
    pub results: Vec<SearchResultItem>,
    pub facets: Vec<FacetBlock>,
}

/// Fields searched per scope.
fn scope_fields(scope: &str) -> &'static [&'static str] {
    match scope {
        "title" => &["title"],
        "creator" => &["creators"],
        "fulltext" => &["fulltext", "abstract"],
        _ => &[
            "title",
            "creators",
            "tags",
            "identifiers",
            "abstract",
            "fulltext",
        ],
    }
}

pub async fn run_query(
    config: &Config,
    reader: &IndexReader,
    request: &QueryRequest,
) -> Result<SearchPage> {
    if !config.search.scopes.iter().any(|s| s == &request.scope) {
        return Err(SyncError::Configuration(format!(
            "search scope '{}' is not enabled",
            request.scope
        )));
    }
    if !config.search.sorts.iter().any(|s| s == &request.sort) {
        return Err(SyncError::Configuration(format!(
            "sort option '{}' is not enabled",
            request.sort
        )));
    }

    let tokens = tokenize(&request.terms);
    if request.sort == "relevance" && tokens.is_empty() {
        return Err(SyncError::Configuration(
            "relevance sort requires keyword terms".into(),
        ));
    }

    let pool = reader.pool();
    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;

    // ── Candidates + scores ──────────────────────────────────────────
    let mut scores: HashMap<String, f64> = HashMap::new();
    let candidates: HashSet<String> = if tokens.is_empty() {
        let rows = sqlx::query("SELECT id FROM documents").fetch_all(pool).await?;
        rows.iter().map(|r| r.get::<String, _>("id")).collect()
    } else {
        match_and_score(config, reader, &tokens, &request.scope, total_docs, &mut scores).await?
    };

    // ── Facet filters: boolean restriction only ──────────────────────
    let mut filtered = candidates;
    for (facet, value) in &request.facet_filters {
        let rows = sqlx::query("SELECT doc_id FROM facets WHERE facet = ? AND value = ?")
            .bind(facet)
            .bind(value)
            .fetch_all(pool)
            .await?;
        let members: HashSet<String> = rows.iter().map(|r| r.get::<String, _>("doc_id")).collect();
        filtered.retain(|id| members.contains(id));
    }

    let total = filtered.len() as u64;

    // ── Ordering ─────────────────────────────────────────────────────
    let ordered = order_candidates(pool, &filtered, &request.sort, &scores).await?;

    // ── Pagination ───────────────────────────────────────────────────
    let page_len = request.page_len.unwrap_or(config.search.page_len).max(1);
    let page = request.page.max(1);
    let offset = ((page - 1) as usize) * page_len as usize;
    let page_ids: Vec<&String> = ordered.iter().skip(offset).take(page_len as usize).collect();

    let mut results = Vec::with_capacity(page_ids.len());
    for id in page_ids {
        if let Some(doc) = reader.get_document(id).await? {
            results.push(project(doc, scores.get(id).copied(), &tokens));
        }
    }

    // ── Facet counts over the filtered candidate set ─────────────────
    let facets = facet_blocks(config, reader, &filtered, &request.facet_filters).await?;

    Ok(SearchPage {
        total,
        page,
        page_len,
        results,
        facets,
    })
}

/// AND semantics across tokens: a document qualifies when every token
/// matches in at least one scoped field. Scores accumulate per (token,
/// field) posting with the field's boost weight.
async fn match_and_score(
    config: &Config,
    reader: &IndexReader,
    tokens: &[String],
    scope: &str,
    total_docs: i64,
    scores: &mut HashMap<String, f64>,
) -> Result<HashSet<String>> {
    let pool = reader.pool();
    let fields = scope_fields(scope);
    let n = total_docs.max(1) as f64;

    // Average field lengths for the normalization term.
    let mut avg_len: HashMap<String, f64> = HashMap::new();
    let rows = sqlx::query("SELECT field, AVG(len) AS avg_len FROM field_lengths GROUP BY field")
        .fetch_all(pool)
        .await?;
    for row in &rows {
        avg_len.insert(row.get("field"), row.get("avg_len"));
    }

    let mut matched: Option<HashSet<String>> = None;

    for token in tokens {
        let mut token_docs: HashSet<String> = HashSet::new();

        for field in fields {
            let postings = sqlx::query(
                r#"
                SELECT t.doc_id, t.tf, fl.len
                FROM terms t
                JOIN field_lengths fl ON fl.doc_id = t.doc_id AND fl.field = t.field
                WHERE t.term = ? AND t.field = ?
                "#,
            )
            .bind(token)
            .bind(field)
            .fetch_all(pool)
            .await?;

            if postings.is_empty() {
                continue;
            }

            let df = postings.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            let boost = config.search.boosts.for_field(field);
            let field_avg = avg_len.get(*field).copied().unwrap_or(1.0).max(1.0);

            for row in &postings {
                let doc_id: String = row.get("doc_id");
                let tf: i64 = row.get("tf");
                let len: i64 = row.get("len");

                let norm = 1.0 - BM25_B + BM25_B * (len as f64 / field_avg);
                let tf_component =
                    (tf as f64 * (BM25_K1 + 1.0)) / (tf as f64 + BM25_K1 * norm);

                *scores.entry(doc_id.clone()).or_insert(0.0) += boost * idf * tf_component;
                token_docs.insert(doc_id);
            }
        }

        matched = Some(match matched {
            None => token_docs,
            Some(previous) => previous.intersection(&token_docs).cloned().collect(),
        });
    }

    let matched = matched.unwrap_or_default();
    // Scores accumulated for documents that failed the AND requirement are
    // dropped with them.
    scores.retain(|id, _| matched.contains(id));
    Ok(matched)
}

/// Order the filtered candidates. Only `relevance` consults the score map;
/// every other sort reads a stored column. Ties break deterministically on
/// document id.
async fn order_candidates(
    pool: &sqlx::SqlitePool,
    candidates: &HashSet<String>,
    sort: &str,
    scores: &HashMap<String, f64>,
) -> Result<Vec<String>> {
    struct SortRow {
        id: String,
        title: String,
        date_sort: i64,
        first_creator: String,
    }

    let rows = sqlx::query("SELECT id, title, date_sort, first_creator FROM documents")
        .fetch_all(pool)
        .await?;
    let mut sortable: Vec<SortRow> = rows
        .iter()
        .map(|row| SortRow {
            id: row.get("id"),
            title: row.get("title"),
            date_sort: row.get("date_sort"),
            first_creator: row.get("first_creator"),
        })
        .filter(|r| candidates.contains(&r.id))
        .collect();

    match sort {
        "relevance" => sortable.sort_by(|a, b| {
            let sa = scores.get(&a.id).copied().unwrap_or(0.0);
            let sb = scores.get(&b.id).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.date_sort.cmp(&a.date_sort))
                .then(a.id.cmp(&b.id))
        }),
        "date_asc" => sortable.sort_by(|a, b| {
            a.date_sort.cmp(&b.date_sort).then(a.id.cmp(&b.id))
        }),
        "title" => sortable.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id))),
        "author" => sortable.sort_by(|a, b| {
            // Creator-less records go last, not first.
            (a.first_creator.is_empty(), &a.first_creator, &a.id)
                .cmp(&(b.first_creator.is_empty(), &b.first_creator, &b.id))
        }),
        // date_desc, the default: missing dates sort most recent by the
        // date normalization's encoding.
        _ => sortable.sort_by(|a, b| b.date_sort.cmp(&a.date_sort).then(a.id.cmp(&b.id))),
    }

    Ok(sortable.into_iter().map(|r| r.id).collect())
}

fn project(doc: IndexDocument, score: Option<f64>, tokens: &[String]) -> SearchResultItem {
    SearchResultItem {
        id: doc.id,
        title: doc.title,
        creators: doc.creators,
        item_type: doc.item_type,
        year: doc.year,
        abstract_display: doc.abstract_display,
        badges: doc.badges,
        score: if tokens.is_empty() { None } else { score },
        url: doc.url,
    }
}

/// Per-facet value counts over the filtered candidate set. Values beyond
/// the display limit are folded unless the overage fits the configured
/// leeway; currently-selected values are always kept visible.
async fn facet_blocks(
    config: &Config,
    reader: &IndexReader,
    candidates: &HashSet<String>,
    active_filters: &[(String, String)],
) -> Result<Vec<FacetBlock>> {
    let pool = reader.pool();
    let mut blocks = Vec::new();

    for facet in config.facets.enabled_names() {
        let rows = sqlx::query("SELECT value, doc_id FROM facets WHERE facet = ?")
            .bind(facet)
            .fetch_all(pool)
            .await?;

        let mut counts: HashMap<String, u64> = HashMap::new();
        for row in &rows {
            let doc_id: String = row.get("doc_id");
            if candidates.contains(&doc_id) {
                *counts.entry(row.get("value")).or_insert(0) += 1;
            }
        }

        let selected: HashSet<&str> = active_filters
            .iter()
            .filter(|(f, _)| f == facet)
            .map(|(_, v)| v.as_str())
            .collect();

        let mut values: Vec<FacetValueCount> = counts
            .into_iter()
            .map(|(value, count)| FacetValueCount {
                selected: selected.contains(value.as_str()),
                value,
                count,
            })
            .collect();
        values.sort_by(|a, b| b.count.cmp(&a.count).then(a.value.cmp(&b.value)));

        let limit = config.facets.value_limit;
        let leeway = config.facets.count_leeway;
        let truncated = values.len() > limit + leeway;
        if truncated {
            // Fold the tail but keep anything the user has selected.
            let mut kept: Vec<FacetValueCount> = Vec::with_capacity(limit);
            for value in values {
                if kept.len() < limit || value.selected {
                    kept.push(value);
                }
            }
            values = kept;
        }

        blocks.push(FacetBlock {
            name: facet.to_string(),
            values,
            truncated,
        });
    }

    Ok(blocks)
}

/// CLI search: query the live generation and print a ranked page.
pub async fn run_search(config: &Config, request: &QueryRequest) -> anyhow::Result<()> {
    let Some(reader) = IndexReader::open_live(config).await? else {
        println!("No index generation. Run `bibm sync all` first.");
        return Ok(());
    };

    let page = run_query(config, &reader, request).await?;
    reader.close().await;

    if page.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in page.results.iter().enumerate() {
        let rank = (page.page - 1) as usize * page.page_len as usize + i + 1;
        let title_display = if result.title.is_empty() {
            "(untitled)"
        } else {
            &result.title
        };
        match result.score {
            Some(score) => println!("{}. [{:.2}] {}", rank, score, title_display),
            None => println!("{}. {}", rank, title_display),
        }
        if !result.creators.is_empty() {
            println!("    creators: {}", result.creators.join("; "));
        }
        if let Some(year) = result.year {
            println!("    year: {}", year);
        }
        println!("    type: {}", result.item_type);
        if !result.badges.is_empty() {
            println!("    badges: {}", result.badges.join(", "));
        }
        println!("    id: {}", result.id);
        println!();
    }
    println!(
        "page {} of {} results ({} per page)",
        page.page, page.total, page.page_len
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexBuilder;
    use crate::models::IndexDocument;
    use std::path::PathBuf;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let config_path = dir.path().join("bibmirror.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[storage]
data_dir = "{}"

[remote]
base_url = "http://127.0.0.1:1"
library_id = "1"

[server]
bind = "127.0.0.1:0"

[facets]
value_limit = 2
count_leeway = 1
"#,
                dir.path().join("data").display()
            ),
        )
        .unwrap();
        crate::config::load_config(&PathBuf::from(config_path)).unwrap()
    }

    fn doc(id: &str) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            item_type: "book".to_string(),
            date_sort: 2020_12_31,
            year: Some(2020),
            ..Default::default()
        }
    }

    async fn build_corpus(config: &Config, docs: Vec<IndexDocument>) -> IndexReader {
        let mut builder = IndexBuilder::begin(config).await.unwrap();
        for d in &docs {
            builder.add_document(config, d).await.unwrap();
        }
        builder.commit("fp").await.unwrap();
        IndexReader::open_live(config).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn title_match_outranks_fulltext_match() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut title_hit = doc("AAAA1111");
        title_hit.title = "Falconry Handbook".to_string();
        let mut body_hit = doc("BBBB2222");
        body_hit.title = "Unrelated".to_string();
        body_hit.fulltext = "a passing mention of falconry in the text".to_string();

        let reader = build_corpus(&config, vec![title_hit, body_hit]).await;
        let page = run_query(
            &config,
            &reader,
            &QueryRequest {
                terms: "falconry".to_string(),
                sort: "relevance".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.results[0].id, "AAAA1111");
        assert!(page.results[0].score.unwrap() > page.results[1].score.unwrap());
        reader.close().await;
    }

    #[tokio::test]
    async fn all_tokens_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut both = doc("AAAA1111");
        both.title = "medieval falconry".to_string();
        let mut one = doc("BBBB2222");
        one.title = "medieval cooking".to_string();

        let reader = build_corpus(&config, vec![both, one]).await;
        let page = run_query(
            &config,
            &reader,
            &QueryRequest {
                terms: "medieval falconry".to_string(),
                sort: "relevance".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].id, "AAAA1111");
        reader.close().await;
    }

    #[tokio::test]
    async fn facet_filters_restrict_without_scoring() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut a = doc("AAAA1111");
        a.title = "falconry one".to_string();
        a.tags = vec!["keep".to_string()];
        let mut b = doc("BBBB2222");
        b.title = "falconry two".to_string();
        b.tags = vec!["drop".to_string()];

        let reader = build_corpus(&config, vec![a, b]).await;

        let unfiltered = run_query(
            &config,
            &reader,
            &QueryRequest {
                terms: "falconry".to_string(),
                sort: "relevance".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let filtered = run_query(
            &config,
            &reader,
            &QueryRequest {
                terms: "falconry".to_string(),
                sort: "relevance".to_string(),
                facet_filters: vec![("tag".to_string(), "keep".to_string())],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(filtered.total, 1);
        assert_eq!(filtered.results[0].id, "AAAA1111");
        // The surviving document's score is unchanged by the filter.
        let unfiltered_score = unfiltered
            .results
            .iter()
            .find(|r| r.id == "AAAA1111")
            .unwrap()
            .score
            .unwrap();
        assert!((filtered.results[0].score.unwrap() - unfiltered_score).abs() < 1e-9);
        reader.close().await;
    }

    #[tokio::test]
    async fn relevance_requires_terms() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let reader = build_corpus(&config, vec![doc("AAAA1111")]).await;

        let err = run_query(
            &config,
            &reader,
            &QueryRequest {
                sort: "relevance".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("relevance"));
        reader.close().await;
    }

    #[tokio::test]
    async fn date_sorts_bypass_scoring_and_handle_missing_dates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut old = doc("AAAA1111");
        old.date_sort = 1990_06_30;
        let mut recent = doc("BBBB2222");
        recent.date_sort = 2021_01_15;
        let mut undated = doc("CCCC3333");
        undated.date_sort = crate::extract::DATE_SORT_MISSING;

        let reader = build_corpus(&config, vec![old, recent, undated]).await;
        let page = run_query(
            &config,
            &reader,
            &QueryRequest {
                sort: "date_desc".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Undated records surface first rather than being buried.
        let ids: Vec<&str> = page.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["CCCC3333", "BBBB2222", "AAAA1111"]);
        assert!(page.results.iter().all(|r| r.score.is_none()));
        reader.close().await;
    }

    #[tokio::test]
    async fn facet_value_leeway_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        // limit 2, leeway 1: three tag values fit, four fold.
        let mut docs = Vec::new();
        for (i, tag) in ["alpha", "beta", "gamma"].iter().enumerate() {
            let mut d = doc(&format!("AAAA111{}", i));
            d.tags = vec![tag.to_string()];
            docs.push(d);
        }
        let reader = build_corpus(&config, docs).await;
        let page = run_query(&config, &reader, &QueryRequest::default()).await.unwrap();
        let tag_block = page.facets.iter().find(|b| b.name == "tag").unwrap();
        assert_eq!(tag_block.values.len(), 3);
        assert!(!tag_block.truncated);
        reader.close().await;

        let mut docs = Vec::new();
        for (i, tag) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
            let mut d = doc(&format!("BBBB222{}", i));
            d.tags = vec![tag.to_string()];
            docs.push(d);
        }
        let reader = build_corpus(&config, docs).await;
        let page = run_query(&config, &reader, &QueryRequest::default()).await.unwrap();
        let tag_block = page.facets.iter().find(|b| b.name == "tag").unwrap();
        assert_eq!(tag_block.values.len(), 2);
        assert!(tag_block.truncated);
        reader.close().await;
    }

    #[tokio::test]
    async fn pagination_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut docs = Vec::new();
        for i in 0..5 {
            let mut d = doc(&format!("DOC{:05}", i));
            d.date_sort = 2000_01_01 + i;
            docs.push(d);
        }
        let reader = build_corpus(&config, docs).await;

        let page1 = run_query(
            &config,
            &reader,
            &QueryRequest {
                sort: "date_asc".to_string(),
                page: 1,
                page_len: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let page2 = run_query(
            &config,
            &reader,
            &QueryRequest {
                sort: "date_asc".to_string(),
                page: 2,
                page_len: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(page1.total, 5);
        assert_eq!(page1.results.len(), 2);
        assert_eq!(page1.results[0].id, "DOC00000");
        assert_eq!(page2.results[0].id, "DOC00002");
        reader.close().await;
    }
}
