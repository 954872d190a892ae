//! Normalized record table
//!
//! The fixed-schema table produced by the refiner. The same schema is the
//! contract for tables uploaded back into the analysis side, so the readers
//! are lenient about number formatting but strict about columns.
//!
//! Tables are saved as a one-sheet `.xlsx` workbook or as CSV, chosen by
//! file extension.

use crate::error::{PipelineError, Result};
use calamine::{Reader, Xlsx};
use csv::StringRecord;
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, Write};
use std::path::Path;
use tracing::{info, warn};

/// Separator used inside every multi-valued column
pub const DELIMITER: char = ';';

/// Name of the single worksheet in an exported workbook
pub const SHEET_NAME: &str = "Sheet1";

/// Excel's limit on characters in one cell
const MAX_CELL_CHARS: usize = 32_767;

/// Excel's row limit, header included
const MAX_SHEET_ROWS: usize = 1_048_576;

/// Column order for the normalized table
pub const COLUMNS: &[&str] = &[
    "id",
    "doi",
    "title",
    "publication_year",
    "type",
    "cited_by_count",
    "fwci",
    "Citation_Percentile",
    "Is_Top_10_Percent",
    "First_Author_Name",
    "First_Author_Institution",
    "First_Author_Country",
    "Corresponding_Author_Names",
    "Corresponding_Institution_Names",
    "All_Authors",
    "All_Institutions",
    "All_Countries",
    "Primary_Topic(Score)",
    "Keywords(Scores)",
];

/// One row of the analysis table. Field order matches [`COLUMNS`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub doi: String,
    pub title: String,
    #[serde(default, deserialize_with = "lenient::opt_i32")]
    pub publication_year: Option<i32>,
    #[serde(rename = "type")]
    pub work_type: String,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub cited_by_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub fwci: Option<f64>,
    #[serde(rename = "Citation_Percentile", default, deserialize_with = "lenient::opt_f64")]
    pub citation_percentile: Option<f64>,
    #[serde(rename = "Is_Top_10_Percent", default, deserialize_with = "lenient::opt_bool")]
    pub is_top_10_percent: Option<bool>,
    #[serde(rename = "First_Author_Name")]
    pub first_author_name: String,
    #[serde(rename = "First_Author_Institution")]
    pub first_author_institution: String,
    #[serde(rename = "First_Author_Country")]
    pub first_author_country: String,
    #[serde(rename = "Corresponding_Author_Names")]
    pub corresponding_author_names: String,
    #[serde(rename = "Corresponding_Institution_Names")]
    pub corresponding_institution_names: String,
    #[serde(rename = "All_Authors")]
    pub all_authors: String,
    #[serde(rename = "All_Institutions")]
    pub all_institutions: String,
    #[serde(rename = "All_Countries")]
    pub all_countries: String,
    #[serde(rename = "Primary_Topic(Score)")]
    pub primary_topic: String,
    #[serde(rename = "Keywords(Scores)")]
    pub keywords: String,
}

/// A typed spreadsheet cell.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cell<'a> {
    Text(&'a str),
    Number(f64),
    Flag(bool),
    Empty,
}

impl<'a> Cell<'a> {
    fn number<T: Into<f64>>(value: Option<T>) -> Self {
        value.map_or(Cell::Empty, |v| Cell::Number(v.into()))
    }
}

impl NormalizedRecord {
    /// Cells in [`COLUMNS`] order.
    fn cells(&self) -> [Cell<'_>; 19] {
        [
            Cell::Text(&self.id),
            Cell::Text(&self.doi),
            Cell::Text(&self.title),
            Cell::number(self.publication_year),
            Cell::Text(&self.work_type),
            Cell::number(self.cited_by_count.map(|v| v as f64)),
            Cell::number(self.fwci),
            Cell::number(self.citation_percentile),
            self.is_top_10_percent.map_or(Cell::Empty, Cell::Flag),
            Cell::Text(&self.first_author_name),
            Cell::Text(&self.first_author_institution),
            Cell::Text(&self.first_author_country),
            Cell::Text(&self.corresponding_author_names),
            Cell::Text(&self.corresponding_institution_names),
            Cell::Text(&self.all_authors),
            Cell::Text(&self.all_institutions),
            Cell::Text(&self.all_countries),
            Cell::Text(&self.primary_topic),
            Cell::Text(&self.keywords),
        ]
    }
}

/// Clip text to the cell limit on a char boundary.
fn fit_cell(text: &str) -> &str {
    match text.char_indices().nth(MAX_CELL_CHARS) {
        Some((end, _)) => {
            warn!(chars = text.chars().count(), "Cell text clipped to the spreadsheet limit");
            &text[..end]
        }
        None => text,
    }
}

/// Fail with the list of [`COLUMNS`] absent from `headers`.
fn check_columns(headers: &StringRecord) -> Result<()> {
    let missing: Vec<&str> = COLUMNS
        .iter()
        .copied()
        .filter(|c| !headers.iter().any(|h| h.trim() == *c))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(PipelineError::Schema(format!(
        "missing column(s): {}",
        missing.join(", ")
    )))
}

fn is_workbook(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xlsx"))
}

/// Cell parsers for uploaded tables; spreadsheet tools write `2019.0` and `True`.
mod lenient {
    use serde::{Deserialize, Deserializer};

    fn cell<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<String>::deserialize(d)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && !matches!(s.to_lowercase().as_str(), "nan" | "none" | "null")))
    }

    fn whole(s: &str) -> Option<i64> {
        s.parse::<i64>().ok().or_else(|| {
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        })
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(cell(d)?.and_then(|s| whole(&s)))
    }

    pub fn opt_i32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
        Ok(cell(d)?.and_then(|s| whole(&s)).and_then(|v| i32::try_from(v).ok()))
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(cell(d)?.and_then(|s| s.parse::<f64>().ok()).filter(|f| f.is_finite()))
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(cell(d)?.and_then(|s| match s.to_lowercase().as_str() {
            "true" | "1" | "1.0" => Some(true),
            "false" | "0" | "0.0" => Some(false),
            _ => None,
        }))
    }
}

/// Split a multi-valued cell into trimmed, non-empty entries.
pub fn split_multi(value: &str) -> Vec<&str> {
    value
        .split(DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Decode a `Keywords(Scores)` cell into `(keyword, score)` pairs.
///
/// Entries split on `;`, then on the first `(`; an entry without a
/// parseable score yields `None` for it.
pub fn decode_keywords(value: &str) -> Vec<(String, Option<f64>)> {
    split_multi(value)
        .into_iter()
        .filter_map(|entry| {
            let (name, score) = match entry.split_once('(') {
                Some((name, rest)) => {
                    let score = rest.rsplit_once(')').map(|(s, _)| s).unwrap_or(rest);
                    (name.trim(), score.trim().parse::<f64>().ok())
                }
                None => (entry, None),
            };
            (!name.is_empty()).then(|| (name.to_string(), score))
        })
        .collect()
}

/// Summary statistics for a loaded table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableSummary {
    pub rows: usize,
    pub first_year: Option<i32>,
    pub last_year: Option<i32>,
    pub total_citations: i64,
    pub distinct_authors: usize,
    pub distinct_institutions: usize,
    pub distinct_countries: usize,
    /// Most frequent bare keywords, highest count first
    pub top_keywords: Vec<(String, usize)>,
}

/// The active analysis dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordTable {
    rows: Vec<NormalizedRecord>,
}

impl RecordTable {
    pub fn new(rows: Vec<NormalizedRecord>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[NormalizedRecord] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<NormalizedRecord> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the table as CSV. The header row is written even with no rows.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);

        wtr.write_record(COLUMNS)?;
        for row in &self.rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Save to a CSV file, replacing it if present.
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv(std::io::BufWriter::new(file))?;
        info!(path = ?path, rows = self.rows.len(), "Saved table");
        Ok(())
    }

    /// Read a table exported by [`RecordTable::write_csv`] or an equivalent tool.
    ///
    /// Every column of [`COLUMNS`] must be present; extra columns are ignored.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        check_columns(rdr.headers()?)?;

        let mut rows = Vec::new();
        for record in rdr.deserialize::<NormalizedRecord>() {
            rows.push(record?);
        }
        Ok(Self { rows })
    }

    pub fn load_csv(path: &Path) -> Result<Self> {
        let table = Self::read_csv(std::fs::File::open(path)?)?;
        info!(path = ?path, rows = table.len(), "Loaded table");
        Ok(table)
    }

    /// Render the table as a one-sheet workbook. The header row is written
    /// even with no rows; absent values are left as blank cells.
    pub fn to_xlsx(&self) -> Result<Vec<u8>> {
        if self.rows.len() >= MAX_SHEET_ROWS {
            return Err(PipelineError::Schema(format!(
                "{} rows do not fit in one worksheet; save as .csv instead",
                self.rows.len()
            )));
        }

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name(SHEET_NAME)?;

        for (col, name) in (0u16..).zip(COLUMNS) {
            sheet.write_string(0, col, *name)?;
        }
        for (row, record) in (1u32..).zip(&self.rows) {
            for (col, cell) in (0u16..).zip(record.cells()) {
                match cell {
                    Cell::Text(text) if !text.is_empty() => {
                        sheet.write_string(row, col, fit_cell(text))?;
                    }
                    Cell::Number(value) => {
                        sheet.write_number(row, col, value)?;
                    }
                    Cell::Flag(value) => {
                        sheet.write_boolean(row, col, value)?;
                    }
                    Cell::Text(_) | Cell::Empty => {}
                }
            }
        }

        Ok(workbook.save_to_buffer()?)
    }

    /// Read the first worksheet of a workbook.
    ///
    /// The first row is the header; the same column check and cell coercion
    /// as [`RecordTable::read_csv`] apply. Blank rows are skipped.
    pub fn read_xlsx<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut workbook: Xlsx<R> = Xlsx::new(reader)?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| PipelineError::Schema("workbook has no worksheet".to_string()))??;

        let mut sheet_rows = range.rows();
        let headers: StringRecord = match sheet_rows.next() {
            Some(cells) => cells.iter().map(|c| c.to_string().trim().to_string()).collect(),
            None => StringRecord::new(),
        };
        check_columns(&headers)?;

        let mut rows = Vec::new();
        for cells in sheet_rows {
            let record: StringRecord = cells.iter().map(|c| c.to_string()).collect();
            if record.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            rows.push(record.deserialize::<NormalizedRecord>(Some(&headers))?);
        }
        Ok(Self { rows })
    }

    /// Save as a workbook when `path` ends in `.xlsx`, otherwise as CSV.
    pub fn save(&self, path: &Path) -> Result<()> {
        if !is_workbook(path) {
            return self.save_csv(path);
        }
        std::fs::write(path, self.to_xlsx()?)?;
        info!(path = ?path, rows = self.rows.len(), "Saved table");
        Ok(())
    }

    /// Load a workbook when `path` ends in `.xlsx`, otherwise CSV.
    pub fn load(path: &Path) -> Result<Self> {
        if !is_workbook(path) {
            return Self::load_csv(path);
        }
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        let table = Self::read_xlsx(file)?;
        info!(path = ?path, rows = table.len(), "Loaded table");
        Ok(table)
    }

    pub fn summary(&self, top_n: usize) -> TableSummary {
        let years = self.rows.iter().filter_map(|r| r.publication_year);

        let mut keyword_counts: HashMap<String, usize> = HashMap::new();
        for row in &self.rows {
            for (keyword, _) in decode_keywords(&row.keywords) {
                *keyword_counts.entry(keyword).or_default() += 1;
            }
        }
        let mut top_keywords: Vec<(String, usize)> = keyword_counts.into_iter().collect();
        top_keywords.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_keywords.truncate(top_n);

        TableSummary {
            rows: self.rows.len(),
            first_year: years.clone().min(),
            last_year: years.max(),
            total_citations: self.rows.iter().filter_map(|r| r.cited_by_count).sum(),
            distinct_authors: self.distinct(|r| r.all_authors.as_str()),
            distinct_institutions: self.distinct(|r| r.all_institutions.as_str()),
            distinct_countries: self.distinct(|r| r.all_countries.as_str()),
            top_keywords,
        }
    }

    fn distinct<'a>(&'a self, column: impl Fn(&'a NormalizedRecord) -> &'a str) -> usize {
        self.rows
            .iter()
            .flat_map(|r| split_multi(column(r)))
            .collect::<BTreeSet<_>>()
            .len()
    }
}
