//! Query Builder
//!
//! Turns user search criteria into one fully resolved OpenAlex `/works` request.
//!
//! OpenAlex filter syntax (per OpenAlex docs):
//! - Filters are joined with `,` and all must match
//! - `*.search` filters accept boolean `AND`/`OR` with parentheses and quoted phrases
//! - `publication_year:2015-2020` is an inclusive range, `type:a|b` is a disjunction
//! - Cursor paging starts with `cursor=*`

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use url::Url;

/// Cursor value that requests the first page
pub const START_CURSOR: &str = "*";

/// Fields requested from OpenAlex; everything the refiner reads
pub const SELECT_FIELDS: &str = "id,doi,title,display_name,publication_year,type,cited_by_count,fwci,citation_normalized_percentile,authorships,primary_topic,topics,keywords";

/// OpenAlex work types offered to the user.
///
/// Conference papers are typed `article` by OpenAlex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentType {
    Article,
    BookChapter,
    Review,
    Dissertation,
    Preprint,
    Book,
    Dataset,
    Letter,
    Editorial,
}

impl DocumentType {
    pub const ALL: [DocumentType; 9] = [
        DocumentType::Article,
        DocumentType::BookChapter,
        DocumentType::Review,
        DocumentType::Dissertation,
        DocumentType::Preprint,
        DocumentType::Book,
        DocumentType::Dataset,
        DocumentType::Letter,
        DocumentType::Editorial,
    ];

    /// Value used in the OpenAlex `type` filter
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Article => "article",
            DocumentType::BookChapter => "book-chapter",
            DocumentType::Review => "review",
            DocumentType::Dissertation => "dissertation",
            DocumentType::Preprint => "preprint",
            DocumentType::Book => "book",
            DocumentType::Dataset => "dataset",
            DocumentType::Letter => "letter",
            DocumentType::Editorial => "editorial",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        DocumentType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| PipelineError::Validation(format!("unknown document type: {}", s.trim())))
    }
}

/// Query construction strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Recall first: AND-group or OR-group, searched in full text as well
    Broad,
    /// Precision first: AND-group and OR-group, title and abstract only
    #[default]
    Precise,
}

impl FromStr for SearchMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broad" => Ok(SearchMode::Broad),
            "precise" => Ok(SearchMode::Precise),
            other => Err(PipelineError::Validation(format!("unknown search mode: {}", other))),
        }
    }
}

/// User search criteria, one per search submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub or_keywords: Vec<String>,
    #[serde(default)]
    pub and_keywords: Vec<String>,
    pub start_year: i32,
    pub end_year: i32,
    #[serde(default)]
    pub document_types: Vec<DocumentType>,
    #[serde(default)]
    pub mode: SearchMode,
    /// Contact address sent to OpenAlex (polite pool)
    pub email: String,
}

impl SearchCriteria {
    /// Check everything that can be checked without I/O.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_email(&self.email) {
            return Err(PipelineError::Validation(format!(
                "a contact email address is required, got {:?}",
                self.email
            )));
        }
        if self.start_year > self.end_year {
            return Err(PipelineError::Validation(format!(
                "start year {} is after end year {}",
                self.start_year, self.end_year
            )));
        }
        KeywordGroups::from_criteria(self)?;
        Ok(())
    }
}

fn is_valid_email(email: &str) -> bool {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("email pattern is valid"))
        .is_match(email.trim())
}

/// Split comma-separated keyword text into keywords.
///
/// Double-quoted phrases are kept whole even if they contain commas:
/// `MRAM, "non-volatile memory", memristor` gives three keywords.
pub fn parse_keywords(text: &str) -> Vec<String> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let token = TOKEN.get_or_init(|| Regex::new(r#""([^"]*)"|([^,]+)"#).expect("keyword pattern is valid"));

    token
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| clean_keyword(m.as_str()))
        .filter(|k| !k.is_empty())
        .collect()
}

/// Strip characters that would break the filter syntax and collapse whitespace.
fn clean_keyword(raw: &str) -> String {
    raw.replace(['"', ',', '|'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render one keyword as a search term. Phrases, terms with parentheses and
/// bare operator words are quoted so they cannot change the expression.
fn format_term(keyword: &str) -> String {
    let needs_quotes = keyword.contains(|c: char| c.is_whitespace() || c == '(' || c == ')')
        || ["AND", "OR", "NOT"].iter().any(|op| keyword.eq_ignore_ascii_case(op));
    if needs_quotes {
        format!("\"{}\"", keyword)
    } else {
        keyword.to_string()
    }
}

fn join_group(keywords: &[String], operator: &str) -> Option<String> {
    let mut seen = BTreeSet::new();
    let terms: Vec<String> = keywords
        .iter()
        .map(|k| clean_keyword(k))
        .filter(|k| !k.is_empty() && seen.insert(k.to_lowercase()))
        .map(|k| format_term(&k))
        .collect();

    match terms.len() {
        0 => None,
        1 => terms.into_iter().next(),
        _ => Some(format!("({})", terms.join(&format!(" {} ", operator)))),
    }
}

/// Rendered keyword groups; at least one is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordGroups {
    /// Conjunction of the AND keywords
    pub all_of: Option<String>,
    /// Disjunction of the OR keywords
    pub any_of: Option<String>,
}

impl KeywordGroups {
    pub fn from_criteria(criteria: &SearchCriteria) -> Result<Self> {
        let groups = Self {
            all_of: join_group(&criteria.and_keywords, "AND"),
            any_of: join_group(&criteria.or_keywords, "OR"),
        };
        if groups.all_of.is_none() && groups.any_of.is_none() {
            return Err(PipelineError::Validation(
                "at least one OR or AND keyword is required".to_string(),
            ));
        }
        Ok(groups)
    }

    fn combine(&self, operator: &str) -> String {
        match (&self.all_of, &self.any_of) {
            (Some(all), Some(any)) => format!("{} {} {}", all, operator, any),
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => String::new(),
        }
    }
}

/// A search filter: OpenAlex field plus boolean expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchExpression {
    pub field: &'static str,
    pub expression: String,
}

impl fmt::Display for SearchExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.expression)
    }
}

/// Broad strategy: either group matches, searched in title, abstract and full text.
pub fn broad_expression(groups: &KeywordGroups) -> SearchExpression {
    SearchExpression {
        field: "default.search",
        expression: groups.combine("OR"),
    }
}

/// Precise strategy: both groups must match in title or abstract.
pub fn precise_expression(groups: &KeywordGroups) -> SearchExpression {
    SearchExpression {
        field: "title_and_abstract.search",
        expression: groups.combine("AND"),
    }
}

impl SearchMode {
    pub fn strategy(&self) -> fn(&KeywordGroups) -> SearchExpression {
        match self {
            SearchMode::Broad => broad_expression,
            SearchMode::Precise => precise_expression,
        }
    }
}

/// A fully resolved request descriptor. Only `cursor` changes while fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// `{api_base}/works`
    pub base_url: String,
    pub filter: String,
    pub per_page: u32,
    pub email: String,
    pub select: String,
    pub cursor: String,
}

impl Query {
    /// Full request URL for the current cursor.
    pub fn url(&self) -> Result<Url> {
        let per_page = self.per_page.to_string();
        Url::parse_with_params(
            &self.base_url,
            &[
                ("filter", self.filter.as_str()),
                ("per-page", per_page.as_str()),
                ("cursor", self.cursor.as_str()),
                ("mailto", self.email.as_str()),
                ("select", self.select.as_str()),
            ],
        )
        .map_err(|e| PipelineError::Config(format!("invalid API URL {}: {}", self.base_url, e)))
    }

    pub fn advance(&mut self, next_cursor: &str) {
        self.cursor = next_cursor.to_string();
    }
}

/// Build the filter expression for validated criteria.
pub fn build_filter(criteria: &SearchCriteria) -> Result<String> {
    let groups = KeywordGroups::from_criteria(criteria)?;
    let search = (criteria.mode.strategy())(&groups);

    let mut filters = vec![
        search.to_string(),
        format!("publication_year:{}-{}", criteria.start_year, criteria.end_year),
    ];

    let types: BTreeSet<DocumentType> = criteria.document_types.iter().copied().collect();
    if !types.is_empty() {
        let types: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        filters.push(format!("type:{}", types.join("|")));
    }

    Ok(filters.join(","))
}

/// Build the query for one search. Fails before any I/O on invalid criteria.
pub fn build_query(criteria: &SearchCriteria, config: &PipelineConfig) -> Result<Query> {
    criteria.validate()?;
    config.validate()?;

    let query = Query {
        base_url: format!("{}/works", config.api_base.trim_end_matches('/')),
        filter: build_filter(criteria)?,
        per_page: config.per_page,
        email: criteria.email.trim().to_string(),
        select: SELECT_FIELDS.to_string(),
        cursor: START_CURSOR.to_string(),
    };
    // Render once so an unusable base URL fails here, not mid-crawl.
    query.url()?;
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> SearchCriteria {
        SearchCriteria {
            or_keywords: vec!["MRAM".to_string()],
            and_keywords: vec!["neuromorphic".to_string()],
            start_year: 2015,
            end_year: 2020,
            document_types: vec![],
            mode: SearchMode::Precise,
            email: "a@b.com".to_string(),
        }
    }

    #[test]
    fn test_precise_scenario_filter() {
        let query = build_query(&criteria(), &PipelineConfig::default()).unwrap();
        assert_eq!(
            query.filter,
            "title_and_abstract.search:neuromorphic AND MRAM,publication_year:2015-2020"
        );
        assert_eq!(query.cursor, START_CURSOR);
        assert_eq!(query.base_url, "https://api.openalex.org/works");
    }

    #[test]
    fn test_broad_joins_groups_with_or() {
        let c = SearchCriteria {
            or_keywords: vec!["MRAM".into(), "non-volatile memory".into()],
            and_keywords: vec!["neuromorphic".into(), "synapse".into()],
            mode: SearchMode::Broad,
            ..criteria()
        };
        assert_eq!(
            build_filter(&c).unwrap(),
            "default.search:(neuromorphic AND synapse) OR (MRAM OR \"non-volatile memory\"),publication_year:2015-2020"
        );
    }

    #[test]
    fn test_single_group_used_alone() {
        let c = SearchCriteria {
            and_keywords: vec![],
            or_keywords: vec!["RRAM".into(), "memristor".into()],
            ..criteria()
        };
        assert_eq!(
            build_filter(&c).unwrap(),
            "title_and_abstract.search:(RRAM OR memristor),publication_year:2015-2020"
        );
    }

    #[test]
    fn test_type_filter_sorted_and_deduplicated() {
        let c = SearchCriteria {
            document_types: vec![DocumentType::Review, DocumentType::Article, DocumentType::Review],
            ..criteria()
        };
        let filter = build_filter(&c).unwrap();
        assert!(filter.ends_with(",type:article|review"));
    }

    #[test]
    fn test_same_criteria_same_url() {
        let config = PipelineConfig::default();
        let a = build_query(&criteria(), &config).unwrap().url().unwrap();
        let b = build_query(&criteria(), &config).unwrap().url().unwrap();
        assert_eq!(a.as_str(), b.as_str());
        assert!(a.as_str().contains("per-page=200"));
        assert!(a.as_str().contains("cursor=*") || a.as_str().contains("cursor=%2A"));
        assert!(a.as_str().contains("mailto=a%40b.com"));
    }

    #[test]
    fn test_inverted_years_rejected() {
        let c = SearchCriteria {
            start_year: 2021,
            end_year: 2020,
            ..criteria()
        };
        let err = build_query(&c, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_email_required() {
        for email in ["", "nobody", "@b.com", "a@", "a b@c.com"] {
            let c = SearchCriteria {
                email: email.to_string(),
                ..criteria()
            };
            assert!(
                matches!(c.validate(), Err(PipelineError::Validation(_))),
                "accepted {:?}",
                email
            );
        }
    }

    #[test]
    fn test_empty_keyword_groups_rejected() {
        let c = SearchCriteria {
            or_keywords: vec!["  ".into()],
            and_keywords: vec![],
            ..criteria()
        };
        assert!(matches!(c.validate(), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_parse_keywords_keeps_quoted_phrases() {
        let parsed = parse_keywords(
            r#"MRAM, PRAM, "Resistive Random-Access Memory", "storage class, memory" ,memristor,,"#,
        );
        assert_eq!(
            parsed,
            vec![
                "MRAM",
                "PRAM",
                "Resistive Random-Access Memory",
                "storage class memory",
                "memristor"
            ]
        );
    }

    #[test]
    fn test_parentheses_and_operator_words_are_quoted() {
        let c = SearchCriteria {
            or_keywords: vec!["spin(orbit)".into(), "or".into()],
            and_keywords: vec!["AND".into()],
            ..criteria()
        };
        assert_eq!(
            build_filter(&c).unwrap(),
            "title_and_abstract.search:\"AND\" AND (\"spin(orbit)\" OR \"or\"),publication_year:2015-2020"
        );
    }

    #[test]
    fn test_document_type_parsing() {
        assert_eq!("Book_Chapter".parse::<DocumentType>().unwrap(), DocumentType::BookChapter);
        assert!("poster".parse::<DocumentType>().is_err());
        assert_eq!("BROAD".parse::<SearchMode>().unwrap(), SearchMode::Broad);
    }
}
