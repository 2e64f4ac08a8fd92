//! Document transformer: cached entity subtree → index document.
//!
//! A closed, ordered list of extractor units, each responsible for one
//! field or small field group. Extractors are pure functions of the cached
//! entity subtree — no network access, no side effects — which keeps full
//! index rebuilds deterministic and idempotent. The set is selected once at
//! startup via [`default_extractors`]; there is no runtime registration.

use regex::Regex;
use std::collections::{HashMap, HashSet};

use crate::analyze::strip_html;
use crate::config::Config;
use crate::error::SyncError;
use crate::models::{
    AttachmentEntry, BibFields, CollectionData, IndexDocument, RemoteEntity, TypedItem,
};

// ═══════════════════════════════════════════════════════════════════════
// Tag filtering
// ═══════════════════════════════════════════════════════════════════════

/// Compiled include/exclude tag patterns. Used twice with independent
/// configuration: once by the cache synchronizer to decide what enters the
/// cache, once here to decide what is displayed. Display filtering never
/// touches raw/export data.
pub struct TagFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TagFilter {
    pub fn from_patterns(include: &[String], exclude: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            include: include.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            exclude: exclude.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
        })
    }

    /// A single tag passes when it matches no exclusion pattern and, if any
    /// inclusion patterns are configured, matches at least one of them.
    pub fn accepts_tag(&self, tag: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(tag)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|re| re.is_match(tag))
    }

    /// A tag set passes when none of its tags is excluded and, if inclusion
    /// patterns are configured, at least one tag matches one.
    pub fn accepts(&self, tags: &[String]) -> bool {
        if tags.iter().any(|t| self.exclude.iter().any(|re| re.is_match(t))) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        tags.iter()
            .any(|t| self.include.iter().any(|re| re.is_match(t)))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Collection paths
// ═══════════════════════════════════════════════════════════════════════

/// Resolved collection-key → full-path map ("History/Middle Ages"),
/// built once per index build from the cached collection entities.
pub struct CollectionPaths {
    paths: HashMap<String, String>,
}

impl CollectionPaths {
    pub fn from_entities(collections: &[RemoteEntity]) -> Self {
        let mut parsed: HashMap<String, CollectionData> = HashMap::new();
        for entity in collections {
            if let Ok(data) = CollectionData::parse(&entity.key, &entity.data) {
                parsed.insert(entity.key.clone(), data);
            }
        }

        let mut paths = HashMap::new();
        for key in parsed.keys() {
            let mut segments = Vec::new();
            let mut cursor = Some(key.clone());
            // Walk up the parent chain; the visited set breaks cycles a
            // corrupt remote could produce.
            let mut visited = HashSet::new();
            while let Some(current) = cursor {
                if !visited.insert(current.clone()) {
                    break;
                }
                match parsed.get(&current) {
                    Some(data) => {
                        segments.push(data.name.clone());
                        cursor = data.parent_collection.clone();
                    }
                    None => break,
                }
            }
            segments.reverse();
            paths.insert(key.clone(), segments.join("/"));
        }

        Self { paths }
    }

    pub fn path_of(&self, key: &str) -> Option<&str> {
        self.paths.get(key).map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extraction interface
// ═══════════════════════════════════════════════════════════════════════

/// Everything an extractor may look at. Children are the item's accepted
/// subtree (already cache-filtered), pre-parsed into the typed layer.
pub struct ExtractContext<'a> {
    pub config: &'a Config,
    pub display_filter: &'a TagFilter,
    pub item_key: &'a str,
    pub bib: &'a BibFields,
    pub children: &'a [(String, TypedItem)],
    pub collection_paths: &'a CollectionPaths,
}

/// One field (or small field group) extractor. Pure: reads the context,
/// writes into the document under construction.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument);
}

/// The closed extractor set, in application order.
pub fn default_extractors() -> Vec<Box<dyn Extractor>> {
    vec![
        Box::new(TitleExtractor),
        Box::new(ItemTypeExtractor),
        Box::new(CreatorsExtractor),
        Box::new(DateExtractor),
        Box::new(IdentifierExtractor),
        Box::new(AbstractExtractor),
        Box::new(FullTextExtractor),
        Box::new(TagsExtractor),
        Box::new(CollectionFacetExtractor),
        Box::new(RelationExtractor),
        Box::new(AttachmentManifestExtractor),
        Box::new(BadgeExtractor),
    ]
}

/// Transform one cached item and its accepted children into an index
/// document. Fails with [`SyncError::MalformedEntity`] when the item
/// payload cannot be typed; callers skip the document and continue.
pub fn transform(
    config: &Config,
    display_filter: &TagFilter,
    extractors: &[Box<dyn Extractor>],
    item: &RemoteEntity,
    children: &[RemoteEntity],
    collection_paths: &CollectionPaths,
) -> Result<IndexDocument, SyncError> {
    let typed = TypedItem::parse(&item.key, &item.data)?;
    let bib = match typed {
        TypedItem::Bib(fields) => fields,
        _ => {
            return Err(SyncError::MalformedEntity {
                key: item.key.clone(),
                message: "not a top-level bibliographic item".into(),
            })
        }
    };

    let typed_children: Vec<(String, TypedItem)> = children
        .iter()
        .filter_map(|child| {
            TypedItem::parse(&child.key, &child.data)
                .ok()
                .map(|t| (child.key.clone(), t))
        })
        .collect();

    let ctx = ExtractContext {
        config,
        display_filter,
        item_key: &item.key,
        bib: &bib,
        children: &typed_children,
        collection_paths,
    };

    let mut doc = IndexDocument {
        id: item.key.clone(),
        ..Default::default()
    };
    for extractor in extractors {
        extractor.extract(&ctx, &mut doc);
    }
    Ok(doc)
}

// ═══════════════════════════════════════════════════════════════════════
// Extractor units
// ═══════════════════════════════════════════════════════════════════════

pub struct TitleExtractor;

impl Extractor for TitleExtractor {
    fn name(&self) -> &'static str {
        "title"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        doc.title = ctx.bib.title.clone();
        doc.url = ctx.bib.url.clone();
    }
}

pub struct ItemTypeExtractor;

impl Extractor for ItemTypeExtractor {
    fn name(&self) -> &'static str {
        "item_type"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        doc.item_type = ctx.bib.item_type.label().to_string();
    }
}

pub struct CreatorsExtractor;

impl Extractor for CreatorsExtractor {
    fn name(&self) -> &'static str {
        "creators"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        doc.creators = ctx
            .bib
            .creators
            .iter()
            .map(|c| c.display())
            .filter(|name| !name.is_empty())
            .collect();
    }
}

/// Sortable encoding of a (possibly partial) date: `YYYYMMDD` as i64.
/// Missing dates sort as most recent so undated records are not buried;
/// missing month/day components clamp to the end of their containing
/// period so age-based filtering treats "2014" as "still current through
/// 2014-12-31".
pub struct DateExtractor;

pub const DATE_SORT_MISSING: i64 = 9999_12_31;

impl Extractor for DateExtractor {
    fn name(&self) -> &'static str {
        "date"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        let (sort, year) = normalize_date(&ctx.bib.date);
        doc.date_sort = sort;
        doc.year = year;
    }
}

/// Parse a partial date string into (sort key, year). Accepts
/// `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, and falls back to the first
/// four-digit run found anywhere in the string.
pub fn normalize_date(raw: &str) -> (i64, Option<i32>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (DATE_SORT_MISSING, None);
    }

    let mut parts = trimmed.splitn(3, '-');
    let year: Option<i32> = parts.next().and_then(|p| p.parse().ok()).filter(|y| (1000..=9999).contains(y));
    let year = match year {
        Some(y) => Some(y),
        None => first_year_in(trimmed),
    };

    let Some(y) = year else {
        return (DATE_SORT_MISSING, None);
    };

    let month: Option<u32> = parts
        .next()
        .and_then(|p| p.parse().ok())
        .filter(|m| (1..=12).contains(m));
    let day: Option<u32> = parts
        .next()
        .and_then(|p| p.parse().ok())
        .filter(|d| (1..=31).contains(d));

    let (m, d) = match (month, day) {
        (Some(m), Some(d)) => (m, d),
        (Some(m), None) => (m, last_day_of_month(y, m)),
        _ => (12, 31),
    };

    ((y as i64) * 10_000 + (m as i64) * 100 + d as i64, Some(y))
}

fn first_year_in(s: &str) -> Option<i32> {
    let digits: Vec<char> = s.chars().collect();
    for window_start in 0..digits.len() {
        let run: String = digits[window_start..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if run.len() >= 4 {
            return run[..4].parse().ok().filter(|y| (1000..=9999).contains(y));
        }
    }
    None
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    use chrono::NaiveDate;
    let (next_y, next_m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_y, next_m, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| chrono::Datelike::day(&d))
        .unwrap_or(28)
}

pub struct IdentifierExtractor;

impl Extractor for IdentifierExtractor {
    fn name(&self) -> &'static str {
        "identifiers"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        for id in [&ctx.bib.doi, &ctx.bib.isbn, &ctx.bib.issn] {
            if !id.is_empty() {
                doc.identifiers.push(id.clone());
            }
        }
    }
}

pub struct AbstractExtractor;

impl Extractor for AbstractExtractor {
    fn name(&self) -> &'static str {
        "abstract"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        let full = ctx.bib.abstract_note.clone();
        let search = &ctx.config.search;
        let (display, truncated) = truncate_with_leeway(
            &full,
            search.abstract_max_chars,
            search.abstract_leeway,
            search.leeway_inclusive,
        );
        doc.abstract_text = full;
        doc.abstract_display = display;
        doc.abstract_truncated = truncated;
    }
}

/// Truncate `text` to `max` chars unless the overage fits in the leeway.
/// With the inclusive policy an overage exactly equal to the leeway keeps
/// the full text; the exclusive policy truncates it.
pub fn truncate_with_leeway(
    text: &str,
    max: usize,
    leeway: usize,
    inclusive: bool,
) -> (String, bool) {
    let len = text.chars().count();
    if len <= max {
        return (text.to_string(), false);
    }
    let overage = len - max;
    let within = if inclusive {
        overage <= leeway
    } else {
        overage < leeway
    };
    if within {
        return (text.to_string(), false);
    }
    let truncated: String = text.chars().take(max).collect();
    (format!("{}…", truncated.trim_end()), true)
}

/// Full text: attachment text layers plus the plain text of non-relation
/// notes. Raw path, unaffected by display filtering.
pub struct FullTextExtractor;

impl Extractor for FullTextExtractor {
    fn name(&self) -> &'static str {
        "fulltext"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        let marker = &ctx.config.filters.relation_marker_tag;
        let mut parts = Vec::new();
        for (_, child) in ctx.children {
            match child {
                TypedItem::Attachment(att) if !att.fulltext.is_empty() => {
                    parts.push(att.fulltext.clone());
                }
                TypedItem::Note(note) if !note.tags.contains(marker) => {
                    let text = strip_html(&note.note_html);
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
                _ => {}
            }
        }
        doc.fulltext = parts.join("\n");
    }
}

pub struct TagsExtractor;

impl Extractor for TagsExtractor {
    fn name(&self) -> &'static str {
        "tags"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        doc.tags_raw = ctx.bib.tags.clone();
        doc.tags = ctx
            .bib
            .tags
            .iter()
            .filter(|t| ctx.display_filter.accepts_tag(t))
            .cloned()
            .collect();
    }
}

/// Collection facet values: the full path of every collection the item
/// belongs to, plus each ancestor prefix so filtering on a parent
/// collection also matches items filed deeper down.
pub struct CollectionFacetExtractor;

impl Extractor for CollectionFacetExtractor {
    fn name(&self) -> &'static str {
        "collections"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        let mut paths = HashSet::new();
        for key in &ctx.bib.collections {
            if let Some(path) = ctx.collection_paths.path_of(key) {
                let mut prefix = String::new();
                for segment in path.split('/') {
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(segment);
                    paths.insert(prefix.clone());
                }
            }
        }
        doc.collections = paths.into_iter().collect();
        doc.collections.sort();
    }
}

/// Forward "cites" edges, parsed from child notes carrying the reserved
/// relation marker tag. References are accepted as remote "select" URIs
/// (`.../items/KEY`) or bare eight-character keys; the inverse "cited by"
/// edges are synthesized later by the index builder, which needs the full
/// edge set first.
pub struct RelationExtractor;

impl Extractor for RelationExtractor {
    fn name(&self) -> &'static str {
        "relations"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        let marker = &ctx.config.filters.relation_marker_tag;
        let mut cites = Vec::new();
        let mut seen = HashSet::new();

        for (_, child) in ctx.children {
            let TypedItem::Note(note) = child else { continue };
            if !note.tags.contains(marker) {
                continue;
            }
            let text = strip_html(&note.note_html);
            for token in text.split_whitespace() {
                if let Some(key) = parse_relation_reference(token) {
                    if key != ctx.item_key && seen.insert(key.clone()) {
                        cites.push(key);
                    }
                }
            }
        }

        doc.cites = cites;
    }
}

/// Accept `https://…/items/ABCD2345`-style select links and bare keys.
pub fn parse_relation_reference(token: &str) -> Option<String> {
    let candidate = match token.rsplit_once("/items/") {
        Some((_, tail)) => tail.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()),
        None => token,
    };
    let is_key = candidate.len() == 8
        && candidate
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if is_key {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Attachment manifest: every cached attachment child that carries a
/// content hash. Drives the attachment reconciler, so this is a raw path
/// too.
pub struct AttachmentManifestExtractor;

impl Extractor for AttachmentManifestExtractor {
    fn name(&self) -> &'static str {
        "attachments"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        for (key, child) in ctx.children {
            let TypedItem::Attachment(att) = child else { continue };
            if att.md5.is_empty() || att.filename.is_empty() {
                continue;
            }
            doc.attachments.push(AttachmentEntry {
                key: key.clone(),
                filename: att.filename.clone(),
                md5: att.md5.clone(),
                mtime: att.mtime,
            });
        }
        doc.attachments.sort_by(|a, b| a.key.cmp(&b.key));
    }
}

/// Badge eligibility flags shown next to results. Display-filtered: a note
/// hidden from display does not earn the note badge, while raw paths
/// (fulltext, manifest) are unaffected.
pub struct BadgeExtractor;

impl Extractor for BadgeExtractor {
    fn name(&self) -> &'static str {
        "badges"
    }

    fn extract(&self, ctx: &ExtractContext, doc: &mut IndexDocument) {
        let marker = &ctx.config.filters.relation_marker_tag;

        if !doc.attachments.is_empty() {
            doc.badges.push("attachment".to_string());
        }
        let has_visible_note = ctx.children.iter().any(|(_, child)| match child {
            TypedItem::Note(note) => {
                !note.tags.contains(marker) && ctx.display_filter.accepts(&note.tags)
            }
            _ => false,
        });
        if has_visible_note {
            doc.badges.push("note".to_string());
        }
        if !doc.fulltext.is_empty() {
            doc.badges.push("fulltext".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteEntity;
    use serde_json::json;
    use std::path::PathBuf;

    fn test_config() -> Config {
        let toml_str = r#"
[storage]
data_dir = "/tmp/x"

[remote]
base_url = "http://127.0.0.1:1"
library_id = "1"

[server]
bind = "127.0.0.1:0"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        std::fs::write(&path, toml_str).unwrap();
        crate::config::load_config(&PathBuf::from(path)).unwrap()
    }

    fn no_filter() -> TagFilter {
        TagFilter::from_patterns(&[], &[]).unwrap()
    }

    fn item(key: &str, data: serde_json::Value) -> RemoteEntity {
        RemoteEntity {
            key: key.to_string(),
            version: 1,
            parent_key: None,
            data,
        }
    }

    fn child(key: &str, parent: &str, data: serde_json::Value) -> RemoteEntity {
        RemoteEntity {
            key: key.to_string(),
            version: 1,
            parent_key: Some(parent.to_string()),
            data,
        }
    }

    #[test]
    fn normalize_date_full_and_partial() {
        assert_eq!(normalize_date("2014-05-07"), (2014_05_07, Some(2014)));
        // Missing day clamps to the end of the month.
        assert_eq!(normalize_date("2014-05"), (2014_05_31, Some(2014)));
        assert_eq!(normalize_date("2014-02"), (2014_02_28, Some(2014)));
        assert_eq!(normalize_date("2016-02"), (2016_02_29, Some(2016)));
        // Missing month clamps to year end.
        assert_eq!(normalize_date("2014"), (2014_12_31, Some(2014)));
        // Free-form dates fall back to the first four-digit year.
        assert_eq!(normalize_date("circa 1999, maybe"), (1999_12_31, Some(1999)));
    }

    #[test]
    fn normalize_date_missing_sorts_most_recent() {
        let (missing, year) = normalize_date("");
        assert_eq!(missing, DATE_SORT_MISSING);
        assert!(year.is_none());
        let (dated, _) = normalize_date("2024-01-01");
        assert!(missing > dated);
    }

    #[test]
    fn truncation_leeway_boundaries() {
        let text: String = "a".repeat(110);
        // Overage 10 within leeway 20: untouched.
        let (out, truncated) = truncate_with_leeway(&text, 100, 20, true);
        assert_eq!(out.chars().count(), 110);
        assert!(!truncated);

        // Overage exactly equal to leeway: inclusive keeps, exclusive cuts.
        let (_, truncated) = truncate_with_leeway(&text, 100, 10, true);
        assert!(!truncated);
        let (out, truncated) = truncate_with_leeway(&text, 100, 10, false);
        assert!(truncated);
        assert!(out.chars().count() <= 101);
    }

    #[test]
    fn relation_reference_parsing() {
        assert_eq!(
            parse_relation_reference("https://example.org/groups/9/items/BBBB2222"),
            Some("BBBB2222".to_string())
        );
        assert_eq!(
            parse_relation_reference("CCCC3333"),
            Some("CCCC3333".to_string())
        );
        assert_eq!(parse_relation_reference("notakey"), None);
        assert_eq!(parse_relation_reference("TOOSHORT1"), None);
    }

    #[test]
    fn transform_builds_complete_document() {
        let config = test_config();
        let extractors = default_extractors();
        let paths = CollectionPaths::from_entities(&[
            item("COLL1111", json!({"name": "History", "parentCollection": false})),
            item("COLL2222", json!({"name": "Middle Ages", "parentCollection": "COLL1111"})),
        ]);

        let parent = item(
            "AAAA1111",
            json!({
                "itemType": "journalArticle",
                "title": "On Mirrors",
                "creators": [{"creatorType": "author", "firstName": "Ada", "lastName": "Byron"}],
                "date": "2014-05",
                "DOI": "10.1000/xyz",
                "abstractNote": "Short abstract.",
                "tags": [{"tag": "optics"}, {"tag": "_private"}],
                "collections": ["COLL2222"]
            }),
        );
        let children = vec![
            child(
                "NOTE1111",
                "AAAA1111",
                json!({
                    "itemType": "note",
                    "note": "<p>see https://example.org/groups/9/items/BBBB2222</p>",
                    "tags": [{"tag": "_cites"}]
                }),
            ),
            child(
                "ATTA1111",
                "AAAA1111",
                json!({
                    "itemType": "attachment",
                    "filename": "mirrors.pdf",
                    "md5": "d41d8cd98f00b204e9800998ecf8427e",
                    "mtime": 1700000000000i64,
                    "contentType": "application/pdf",
                    "fulltext": "the full text layer"
                }),
            ),
        ];

        let display_filter =
            TagFilter::from_patterns(&[], &["^_".to_string()]).unwrap();
        let doc = transform(&config, &display_filter, &extractors, &parent, &children, &paths)
            .unwrap();

        assert_eq!(doc.id, "AAAA1111");
        assert_eq!(doc.title, "On Mirrors");
        assert_eq!(doc.creators, vec!["Ada Byron"]);
        assert_eq!(doc.year, Some(2014));
        assert_eq!(doc.date_sort, 2014_05_31);
        assert_eq!(doc.identifiers, vec!["10.1000/xyz"]);
        // Display filter hides the underscore tag, raw set keeps it.
        assert_eq!(doc.tags, vec!["optics"]);
        assert_eq!(doc.tags_raw, vec!["optics", "_private"]);
        // Ancestor prefixes are included for facet filtering.
        assert_eq!(doc.collections, vec!["History", "History/Middle Ages"]);
        assert_eq!(doc.cites, vec!["BBBB2222"]);
        assert!(doc.cited_by.is_empty());
        assert_eq!(doc.attachments.len(), 1);
        assert_eq!(doc.attachments[0].filename, "mirrors.pdf");
        assert_eq!(doc.fulltext, "the full text layer");
        assert!(doc.badges.contains(&"attachment".to_string()));
        assert!(doc.badges.contains(&"fulltext".to_string()));
        // The relation note does not earn the note badge.
        assert!(!doc.badges.contains(&"note".to_string()));
    }

    #[test]
    fn transform_rejects_child_entities_as_top_level() {
        let config = test_config();
        let extractors = default_extractors();
        let filter = no_filter();
        let paths = CollectionPaths::from_entities(&[]);

        let note = item("NOTE1111", json!({"itemType": "note", "note": "x"}));
        let err = transform(&config, &filter, &extractors, &note, &[], &paths).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEntity { .. }));
    }

    #[test]
    fn relation_note_excluded_from_fulltext() {
        let config = test_config();
        let extractors = default_extractors();
        let filter = no_filter();
        let paths = CollectionPaths::from_entities(&[]);

        let parent = item("AAAA1111", json!({"itemType": "book", "title": "T"}));
        let children = vec![
            child(
                "NOTE1111",
                "AAAA1111",
                json!({"itemType": "note", "note": "<p>BBBB2222</p>", "tags": [{"tag": "_cites"}]}),
            ),
            child(
                "NOTE2222",
                "AAAA1111",
                json!({"itemType": "note", "note": "<p>reading notes</p>", "tags": []}),
            ),
        ];

        let doc = transform(&config, &filter, &extractors, &parent, &children, &paths).unwrap();
        assert_eq!(doc.fulltext, "reading notes");
        assert_eq!(doc.cites, vec!["BBBB2222"]);
        assert!(doc.badges.contains(&"note".to_string()));
    }
}
