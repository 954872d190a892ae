//! Record refiner
//!
//! Flattens raw OpenAlex work objects into [`NormalizedRecord`] rows. Every
//! accessor here is total: a missing or oddly shaped field yields an empty
//! cell and, when the shape was wrong, an issue on the record.

use crate::error::Result;
use crate::store::{open_records, LogEntry};
use crate::table::{NormalizedRecord, RecordTable, DELIMITER};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

const DOI_PREFIXES: &[&str] = &["https://doi.org/", "http://doi.org/", "doi:"];

/// Counters for one refine pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefineReport {
    /// Non-blank lines read from the log
    pub lines: usize,
    /// Rows produced
    pub rows: usize,
    /// Lines that were not JSON objects and produced no row
    pub malformed_lines: usize,
    /// Rows where at least one field had an unexpected shape
    pub records_with_issues: usize,
}

/// A flattened record and the fields that could not be read as expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: NormalizedRecord,
    pub issues: Vec<String>,
}

/// Refine a whole record log into a table.
pub fn refine_file(path: &Path) -> Result<(RecordTable, RefineReport)> {
    let (table, report) = refine_entries(open_records(path)?)?;
    info!(
        path = ?path,
        rows = report.rows,
        malformed = report.malformed_lines,
        with_issues = report.records_with_issues,
        "Refined record log"
    );
    Ok((table, report))
}

/// Refine log entries in order. Only I/O errors abort.
pub fn refine_entries<I>(entries: I) -> Result<(RecordTable, RefineReport)>
where
    I: IntoIterator<Item = Result<LogEntry>>,
{
    let mut report = RefineReport::default();
    let mut rows = Vec::new();

    for entry in entries {
        report.lines += 1;
        match entry? {
            LogEntry::Record(value) if value.is_object() => {
                let normalized = normalize(&value);
                if !normalized.issues.is_empty() {
                    report.records_with_issues += 1;
                    debug!(id = %normalized.record.id, issues = ?normalized.issues, "Record has unexpected fields");
                }
                rows.push(normalized.record);
            }
            LogEntry::Record(_) => {
                report.malformed_lines += 1;
                warn!(line = report.lines, "Skipping log line that is not a JSON object");
            }
            LogEntry::Malformed { line, reason } => {
                report.malformed_lines += 1;
                warn!(line = line, reason = %reason, "Skipping malformed log line");
            }
        }
    }

    report.rows = rows.len();
    Ok((RecordTable::new(rows), report))
}

/// Flatten one raw work object.
pub fn normalize(work: &Value) -> Normalized {
    let mut issues = Vec::new();

    let authors = authorships(work, &mut issues);
    let first = authors.first();
    let corresponding: Vec<&Author> = authors.iter().filter(|a| a.is_corresponding).collect();
    let percentile = &work["citation_normalized_percentile"];

    let record = NormalizedRecord {
        id: text(&work["id"]).unwrap_or_default(),
        doi: text(&work["doi"]).map(|d| strip_doi(&d)).unwrap_or_default(),
        title: text(&work["display_name"])
            .or_else(|| text(&work["title"]))
            .unwrap_or_default(),
        publication_year: integer(work, "publication_year", &mut issues)
            .and_then(|y| i32::try_from(y).ok()),
        work_type: text(&work["type"]).unwrap_or_default(),
        cited_by_count: integer(work, "cited_by_count", &mut issues),
        fwci: float(work, "fwci", &mut issues),
        citation_percentile: float(percentile, "value", &mut issues),
        is_top_10_percent: flag(percentile, "is_in_top_10_percent", &mut issues),
        first_author_name: first.map(|a| a.name.clone()).unwrap_or_default(),
        first_author_institution: first.map(|a| join_unique(&a.institutions)).unwrap_or_default(),
        first_author_country: first.map(|a| join_unique(&a.countries)).unwrap_or_default(),
        corresponding_author_names: join_unique(
            corresponding.iter().map(|a| a.name.as_str()).filter(|n| !n.is_empty()),
        ),
        corresponding_institution_names: join_unique(
            corresponding.iter().flat_map(|a| a.institutions.iter()),
        ),
        // One slot per authorship, so names stay positional.
        all_authors: authors
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(DELIMITER.to_string().as_str()),
        all_institutions: join_unique(authors.iter().flat_map(|a| a.institutions.iter())),
        all_countries: join_unique(authors.iter().flat_map(|a| a.countries.iter())),
        primary_topic: primary_topic(work, &mut issues).unwrap_or_default(),
        keywords: keywords(work, &mut issues),
    };

    Normalized { record, issues }
}

#[derive(Debug, Default)]
struct Author {
    name: String,
    institutions: Vec<String>,
    countries: Vec<String>,
    is_corresponding: bool,
}

fn authorships(work: &Value, issues: &mut Vec<String>) -> Vec<Author> {
    let mut authors = Vec::new();

    for entry in list(work, "authorships", issues) {
        if !entry.is_object() {
            issues.push("authorships: entry is not an object".to_string());
            continue;
        }

        let name = text(&entry["author"]["display_name"])
            .or_else(|| text(&entry["raw_author_name"]))
            .map(|n| clean_entry(&n))
            .unwrap_or_default();

        let mut institutions = Vec::new();
        let mut institution_countries = Vec::new();
        for institution in list(entry, "institutions", issues) {
            if let Some(name) = text(&institution["display_name"]) {
                institutions.push(clean_entry(&name));
            }
            if let Some(code) = text(&institution["country_code"]) {
                institution_countries.push(clean_entry(&code));
            }
        }

        let mut countries: Vec<String> = list(entry, "countries", issues)
            .iter()
            .filter_map(text)
            .map(|c| clean_entry(&c))
            .collect();
        if countries.is_empty() {
            countries = institution_countries;
        }

        authors.push(Author {
            name,
            institutions,
            countries,
            is_corresponding: flag(entry, "is_corresponding", issues).unwrap_or(false),
        });
    }

    authors
}

/// Highest-scoring topic; the first one wins a tie.
fn primary_topic(work: &Value, issues: &mut Vec<String>) -> Option<String> {
    let mut best: Option<(String, Option<f64>)> = None;

    for topic in list(work, "topics", issues) {
        let Some(name) = text(&topic["display_name"]) else {
            continue;
        };
        let score = float(topic, "score", issues);
        let better = match &best {
            None => true,
            Some((_, current)) => score.unwrap_or(f64::NEG_INFINITY) > current.unwrap_or(f64::NEG_INFINITY),
        };
        if better {
            best = Some((name, score));
        }
    }

    if best.is_none() {
        let topic = &work["primary_topic"];
        if let Some(name) = text(&topic["display_name"]) {
            best = Some((name, float(topic, "score", issues)));
        }
    }

    best.map(|(name, score)| scored(&name, score))
}

fn keywords(work: &Value, issues: &mut Vec<String>) -> String {
    let entries: Vec<String> = list(work, "keywords", issues)
        .iter()
        .filter_map(|keyword| {
            let name = text(&keyword["display_name"])
                .or_else(|| text(&keyword["keyword"]))
                .or_else(|| text(keyword))?;
            Some(scored(&name, float(keyword, "score", issues)))
        })
        .collect();
    entries.join(DELIMITER.to_string().as_str())
}

/// `name(score)`, or just `name` when there is no score.
fn scored(name: &str, score: Option<f64>) -> String {
    let name = clean_entry(name).replace(['(', ')'], " ");
    let name = name.trim();
    match score {
        Some(score) => format!("{}({})", name, score),
        None => name.to_string(),
    }
}

/// Join entries with the delimiter, dropping empties and repeats.
fn join_unique<'a, I, S>(entries: I) -> String
where
    I: IntoIterator<Item = &'a S>,
    S: AsRef<str> + ?Sized + 'a,
{
    let mut seen = HashSet::new();
    let mut out: Vec<&str> = Vec::new();
    for entry in entries {
        let entry = entry.as_ref();
        if !entry.is_empty() && seen.insert(entry) {
            out.push(entry);
        }
    }
    out.join(DELIMITER.to_string().as_str())
}

/// Entries must not carry the delimiter themselves.
fn clean_entry(value: &str) -> String {
    value.trim().replace(DELIMITER, ",")
}

fn strip_doi(doi: &str) -> String {
    DOI_PREFIXES
        .iter()
        .find_map(|p| doi.strip_prefix(p))
        .unwrap_or(doi)
        .to_string()
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Array at `field`; absent or null is empty, any other shape is an issue.
fn list<'a>(parent: &'a Value, field: &str, issues: &mut Vec<String>) -> &'a [Value] {
    match &parent[field] {
        Value::Array(items) => items,
        Value::Null => &[],
        _ => {
            issues.push(format!("{}: not an array", field));
            &[]
        }
    }
}

fn float(parent: &Value, field: &str, issues: &mut Vec<String>) -> Option<f64> {
    let parsed = match &parent[field] {
        Value::Null => return None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let parsed = parsed.filter(|f| f.is_finite());
    if parsed.is_none() {
        issues.push(format!("{}: not a number", field));
    }
    parsed
}

fn integer(parent: &Value, field: &str, issues: &mut Vec<String>) -> Option<i64> {
    let whole = |f: f64| (f.is_finite() && f.fract() == 0.0).then_some(f as i64);
    let parsed = match &parent[field] {
        Value::Null => return None,
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().and_then(whole))
        }
        _ => None,
    };
    if parsed.is_none() {
        issues.push(format!("{}: not an integer", field));
    }
    parsed
}

fn flag(parent: &Value, field: &str, issues: &mut Vec<String>) -> Option<bool> {
    let parsed = match &parent[field] {
        Value::Null => return None,
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    };
    if parsed.is_none() {
        issues.push(format!("{}: not a boolean", field));
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordLog;
    use crate::table::decode_keywords;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    fn two_author_work() -> Value {
        json!({
            "id": "https://openalex.org/W1",
            "doi": "https://doi.org/10.1000/xyz",
            "display_name": "Spin-orbit torque synapses",
            "publication_year": 2019,
            "type": "article",
            "cited_by_count": 42,
            "fwci": 2.5,
            "citation_normalized_percentile": {"value": 0.97, "is_in_top_10_percent": true},
            "authorships": [
                {
                    "author": {"display_name": "Alice"},
                    "institutions": [{"display_name": "KAIST", "country_code": "KR"}],
                    "countries": ["KR"],
                    "is_corresponding": true
                },
                {
                    "author": {"display_name": "Bob"},
                    "institutions": [{"display_name": "MIT", "country_code": "US"}],
                    "countries": ["US"],
                    "is_corresponding": false
                }
            ],
            "topics": [
                {"display_name": "Magnetic memory", "score": 0.81},
                {"display_name": "Neuromorphic computing", "score": 0.99}
            ],
            "keywords": [
                {"display_name": "memristor", "score": 0.92},
                {"display_name": "neuromorphic", "score": 0.81}
            ]
        })
    }

    #[test]
    fn test_flatten_authorships() {
        let normalized = normalize(&two_author_work());
        let r = &normalized.record;

        assert!(normalized.issues.is_empty());
        assert_eq!(r.id, "https://openalex.org/W1");
        assert_eq!(r.doi, "10.1000/xyz");
        assert_eq!(r.all_authors, "Alice;Bob");
        assert_eq!(r.all_institutions, "KAIST;MIT");
        assert_eq!(r.all_countries, "KR;US");
        assert_eq!(r.first_author_name, "Alice");
        assert_eq!(r.first_author_institution, "KAIST");
        assert_eq!(r.first_author_country, "KR");
        assert_eq!(r.corresponding_author_names, "Alice");
        assert_eq!(r.corresponding_institution_names, "KAIST");
        assert_eq!(r.citation_percentile, Some(0.97));
        assert_eq!(r.is_top_10_percent, Some(true));
        assert_eq!(r.publication_year, Some(2019));
    }

    #[test]
    fn test_corresponding_author_need_not_be_first() {
        let mut work = two_author_work();
        work["authorships"][0]["is_corresponding"] = json!(false);
        work["authorships"][1]["is_corresponding"] = json!(true);

        let r = normalize(&work).record;
        assert_eq!(r.first_author_name, "Alice");
        assert_eq!(r.first_author_institution, "KAIST");
        assert_eq!(r.corresponding_author_names, "Bob");
        assert_eq!(r.corresponding_institution_names, "MIT");
        assert_eq!(r.all_authors, "Alice;Bob");
    }

    #[test]
    fn test_keywords_and_topic() {
        let r = normalize(&two_author_work()).record;
        assert_eq!(r.keywords, "memristor(0.92);neuromorphic(0.81)");
        assert_eq!(
            decode_keywords(&r.keywords),
            vec![
                ("memristor".to_string(), Some(0.92)),
                ("neuromorphic".to_string(), Some(0.81))
            ]
        );
        assert_eq!(r.primary_topic, "Neuromorphic computing(0.99)");
    }

    #[test]
    fn test_primary_topic_fallback_and_ties() {
        let tied = json!({
            "topics": [
                {"display_name": "First", "score": 0.5},
                {"display_name": "Second", "score": 0.5}
            ]
        });
        assert_eq!(normalize(&tied).record.primary_topic, "First(0.5)");

        let fallback = json!({"primary_topic": {"display_name": "Only", "score": 0.7}});
        assert_eq!(normalize(&fallback).record.primary_topic, "Only(0.7)");
    }

    #[test]
    fn test_missing_institutions() {
        let work = json!({
            "id": "W2",
            "authorships": [{"author": {"display_name": "Carol"}}]
        });
        let normalized = normalize(&work);
        let r = &normalized.record;

        assert!(normalized.issues.is_empty());
        assert_eq!(r.all_authors, "Carol");
        assert_eq!(r.all_institutions, "");
        assert_eq!(r.first_author_institution, "");
        assert_eq!(r.all_countries, "");
        assert_eq!(r.cited_by_count, None);
    }

    #[test]
    fn test_positional_authors_keep_empty_slots() {
        let work = json!({
            "authorships": [
                {"author": {"display_name": "Alice"}},
                {"author": {}},
                {"author": {"display_name": "Dan; Jr."}}
            ]
        });
        assert_eq!(normalize(&work).record.all_authors, "Alice;;Dan, Jr.");
    }

    #[test]
    fn test_country_falls_back_to_institution() {
        let work = json!({
            "authorships": [{
                "author": {"display_name": "Eve"},
                "institutions": [
                    {"display_name": "ETH Zurich", "country_code": "CH"},
                    {"display_name": "EPFL", "country_code": "CH"}
                ]
            }]
        });
        let r = normalize(&work).record;
        assert_eq!(r.all_countries, "CH");
        assert_eq!(r.first_author_institution, "ETH Zurich;EPFL");
    }

    #[test]
    fn test_wrong_shapes_become_issues() {
        let work = json!({
            "id": "W3",
            "publication_year": "2020",
            "cited_by_count": "many",
            "authorships": {"author": "not a list"},
            "keywords": [{"display_name": "plain"}]
        });
        let normalized = normalize(&work);

        assert_eq!(normalized.record.publication_year, Some(2020));
        assert_eq!(normalized.record.cited_by_count, None);
        assert_eq!(normalized.record.all_authors, "");
        assert_eq!(normalized.record.keywords, "plain");
        assert_eq!(normalized.issues.len(), 2);
    }

    #[test]
    fn test_refine_skips_torn_tail() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("collected_data.jsonl");

        let mut log = RecordLog::create(&path, "f")?;
        log.append_page(&[two_author_work(), json!({"id": "W2"})], Some("c2"))?;
        drop(log);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"42\n{\"id\": \"W3\", \"auth")?;

        let (table, report) = refine_file(&path)?;
        assert_eq!(table.len(), 2);
        assert_eq!(report.lines, 4);
        assert_eq!(report.malformed_lines, 2);
        Ok(())
    }

    #[test]
    fn test_refine_is_deterministic() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("collected_data.jsonl");
        let mut log = RecordLog::create(&path, "f")?;
        log.append_page(&[two_author_work()], None)?;
        drop(log);

        let render = || -> Result<Vec<u8>> {
            let (table, _) = refine_file(&path)?;
            let mut out = Vec::new();
            table.write_csv(&mut out)?;
            Ok(out)
        };
        assert_eq!(render()?, render()?);
        Ok(())
    }
}
