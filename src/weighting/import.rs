//! Imported weight files: reading a workbook of (response id, weight) rows
//! and reconciling it with computed weights.
//!
//! Workbooks are read from CSV. Each file becomes a single sheet named after
//! the file stem; cells are decoded once into [`CellValue`] at this boundary.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::weighting::scheme::{RespondentId, ResponseWeight};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import file not found: {path}")]
    MissingFile { path: String },
    #[error("import file {name} could not be read: {message}")]
    InvalidFile { name: String, message: String },
    #[error("no sheet has both a response id and a weight column")]
    MissingSheet,
    #[error("sheet '{sheet}' has no valid weight rows")]
    MissingData { sheet: String },
}

/// A decoded spreadsheet cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Empty,
}

impl CellValue {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            CellValue::Empty
        } else if let Ok(number) = trimmed.parse::<f64>() {
            CellValue::Number(number)
        } else {
            CellValue::Text(trimmed.to_string())
        }
    }

    fn as_respondent_id(&self) -> Option<RespondentId> {
        match self {
            CellValue::Number(n) if n.fract() == 0.0 && *n >= i32::MIN as f64 && *n <= i32::MAX as f64 => {
                Some(*n as i32)
            }
            CellValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn as_weight(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Text(s) => s.parse().ok(),
            CellValue::Empty => None,
        }
        .filter(|w: &f64| w.is_finite())
    }

    fn header_text(&self) -> Option<String> {
        match self {
            CellValue::Text(s) => Some(s.to_lowercase()),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            CellValue::Number(n) => n.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Empty => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn from_csv_path(path: &Path) -> Result<Self, ImportError> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Data".to_string());
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ImportError::MissingFile {
                path: path.display().to_string(),
            },
            _ => ImportError::InvalidFile {
                name: name.clone(),
                message: e.to_string(),
            },
        })?;
        Self::from_csv_reader(&name, file)
    }

    pub fn from_csv_reader(name: &str, reader: impl Read) -> Result<Self, ImportError> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        for record in csv.records() {
            let record = record.map_err(|e| ImportError::InvalidFile {
                name: name.to_string(),
                message: e.to_string(),
            })?;
            rows.push(record.iter().map(CellValue::parse).collect());
        }

        Ok(Self {
            sheets: vec![Sheet {
                name: name.to_string(),
                rows,
            }],
        })
    }

    /// Empty upload template.
    pub fn template() -> Self {
        Self {
            sheets: vec![Sheet {
                name: "Data".to_string(),
                rows: vec![vec![
                    CellValue::Text("ResponseId".to_string()),
                    CellValue::Text("Weight".to_string()),
                ]],
            }],
        }
    }

    /// Writes the first sheet as CSV.
    pub fn write_csv(&self, writer: impl Write) -> Result<(), csv::Error> {
        let mut csv = csv::WriterBuilder::new().flexible(true).from_writer(writer);
        if let Some(sheet) = self.sheets.first() {
            for row in &sheet.rows {
                csv.write_record(row.iter().map(CellValue::render))?;
            }
        }
        csv.flush()?;
        Ok(())
    }
}

/// Weight an unlisted survey response is counted with when totals are checked.
pub const DEFAULT_MISSING_WEIGHT: f64 = 1.0;

/// Advisory thresholds for imported weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImportSettings {
    pub min_weight_warning: f64,
    pub max_weight_warning: f64,
    pub duplicate_tolerance: f64,
    /// Relative difference between imported and computed totals that is reported.
    pub total_difference_ratio: f64,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            min_weight_warning: 0.2,
            max_weight_warning: 5.0,
            duplicate_tolerance: 0.000001,
            total_difference_ratio: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportMessageKind {
    ExcelIgnoringRow,
    InvalidWeight,
    DuplicateResponse,
    NotFoundInSurvey,
    MissingFromImport,
    WeightTooSmall,
    WeightTooLarge,
    DifferenceTooGreat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportMessage {
    pub kind: ImportMessageKind,
    /// One-based row number in the sheet, when the message is about a row.
    pub row: Option<usize>,
    pub message: String,
}

/// Valid rows read from a workbook.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedImport {
    pub sheet: String,
    pub rows: Vec<ResponseWeight>,
    pub rows_read: usize,
    pub ignored_rows: usize,
    pub invalid_weights: usize,
    pub messages: Vec<ImportMessage>,
}

/// Side-channel of an import: counts, ranges and advisory messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationStatistics {
    pub sheet: Option<String>,
    pub rows_read: usize,
    pub valid_rows: usize,
    pub ignored_rows: usize,
    pub duplicate_rows: usize,
    pub invalid_weights: usize,
    /// Imported ids that are not in the respondent snapshot.
    pub extra_responses: Vec<RespondentId>,
    /// Snapshot respondents the import does not list; they count as weight 1 in the total check.
    pub missing_responses: Vec<RespondentId>,
    pub matched_responses: usize,
    pub responses_in_snapshot: usize,
    pub min_weight: Option<f64>,
    pub max_weight: Option<f64>,
    pub imported_total: f64,
    pub is_valid: bool,
    pub messages: Vec<ImportMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedWeights {
    pub weights: BTreeMap<RespondentId, f64>,
    pub statistics: ValidationStatistics,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportedWeightMerger {
    settings: ImportSettings,
}

struct Header {
    row: usize,
    id_column: usize,
    weight_column: usize,
}

fn find_header(sheet: &Sheet) -> Option<Header> {
    sheet.rows.iter().enumerate().find_map(|(row, cells)| {
        let texts: Vec<Option<String>> = cells.iter().map(CellValue::header_text).collect();
        let id_column = texts.iter().position(|t| {
            t.as_deref()
                .is_some_and(|t| t.starts_with("response") || t.starts_with("id"))
        })?;
        let weight_column = texts
            .iter()
            .position(|t| t.as_deref().is_some_and(|t| t.starts_with("weight")))?;
        Some(Header {
            row,
            id_column,
            weight_column,
        })
    })
}

impl ImportedWeightMerger {
    pub fn new(settings: ImportSettings) -> Self {
        Self { settings }
    }

    /// Reads the first sheet carrying both required columns.
    pub fn read_workbook(&self, workbook: &Workbook) -> Result<ParsedImport, ImportError> {
        let (sheet, header) = workbook
            .sheets
            .iter()
            .find_map(|sheet| find_header(sheet).map(|header| (sheet, header)))
            .ok_or(ImportError::MissingSheet)?;

        let mut parsed = ParsedImport {
            sheet: sheet.name.clone(),
            rows: Vec::new(),
            rows_read: 0,
            ignored_rows: 0,
            invalid_weights: 0,
            messages: Vec::new(),
        };

        for (index, cells) in sheet.rows.iter().enumerate().skip(header.row + 1) {
            let row = index + 1;
            if cells.iter().all(|c| *c == CellValue::Empty) {
                continue;
            }
            parsed.rows_read += 1;

            let id = cells.get(header.id_column).and_then(CellValue::as_respondent_id);
            let weight = cells.get(header.weight_column).and_then(CellValue::as_weight);
            match (id, weight) {
                (Some(respondent_id), Some(weight)) if weight >= 0.0 => {
                    parsed.rows.push(ResponseWeight { respondent_id, weight });
                }
                (Some(respondent_id), Some(weight)) => {
                    parsed.ignored_rows += 1;
                    parsed.invalid_weights += 1;
                    parsed.messages.push(ImportMessage {
                        kind: ImportMessageKind::InvalidWeight,
                        row: Some(row),
                        message: format!("negative weight {weight} for response {respondent_id}"),
                    });
                }
                _ => {
                    parsed.ignored_rows += 1;
                    parsed.messages.push(ImportMessage {
                        kind: ImportMessageKind::ExcelIgnoringRow,
                        row: Some(row),
                        message: format!("ignoring row {row}: response id or weight could not be read"),
                    });
                }
            }
        }

        if parsed.rows.is_empty() {
            return Err(ImportError::MissingData { sheet: parsed.sheet });
        }

        tracing::debug!(
            sheet = %parsed.sheet,
            rows = parsed.rows.len(),
            ignored = parsed.ignored_rows,
            "read imported weights"
        );
        Ok(parsed)
    }

    /// Overrides computed weights with imported ones.
    ///
    /// `computed` must hold every respondent in the snapshot; imported ids
    /// outside it are reported and dropped.
    pub fn merge(&self, computed: &BTreeMap<RespondentId, f64>, imported: &[ResponseWeight]) -> MergedWeights {
        let mut statistics = ValidationStatistics {
            responses_in_snapshot: computed.len(),
            ..Default::default()
        };
        let mut weights = computed.clone();
        let mut kept: BTreeMap<RespondentId, f64> = BTreeMap::new();

        for row in imported {
            if let Some(&first) = kept.get(&row.respondent_id) {
                statistics.duplicate_rows += 1;
                statistics.ignored_rows += 1;
                if (first - row.weight).abs() > self.settings.duplicate_tolerance {
                    tracing::warn!(
                        respondent_id = row.respondent_id,
                        kept = first,
                        ignored = row.weight,
                        "conflicting duplicate in imported weights"
                    );
                    statistics.messages.push(ImportMessage {
                        kind: ImportMessageKind::DuplicateResponse,
                        row: None,
                        message: format!(
                            "response {} imported again with weight {}, keeping {}",
                            row.respondent_id, row.weight, first
                        ),
                    });
                }
                continue;
            }
            kept.insert(row.respondent_id, row.weight);
            statistics.valid_rows += 1;

            if !computed.contains_key(&row.respondent_id) {
                statistics.extra_responses.push(row.respondent_id);
                statistics.messages.push(ImportMessage {
                    kind: ImportMessageKind::NotFoundInSurvey,
                    row: None,
                    message: format!("response {} is not part of the survey", row.respondent_id),
                });
                continue;
            }

            if row.weight < self.settings.min_weight_warning {
                statistics.messages.push(ImportMessage {
                    kind: ImportMessageKind::WeightTooSmall,
                    row: None,
                    message: format!("response {} has a small weight {}", row.respondent_id, row.weight),
                });
            } else if row.weight > self.settings.max_weight_warning {
                statistics.messages.push(ImportMessage {
                    kind: ImportMessageKind::WeightTooLarge,
                    row: None,
                    message: format!("response {} has a large weight {}", row.respondent_id, row.weight),
                });
            }

            statistics.matched_responses += 1;
            statistics.imported_total += row.weight;
            statistics.min_weight = Some(statistics.min_weight.map_or(row.weight, |m| m.min(row.weight)));
            statistics.max_weight = Some(statistics.max_weight.map_or(row.weight, |m| m.max(row.weight)));
            weights.insert(row.respondent_id, row.weight);
        }

        statistics.missing_responses = computed.keys().filter(|id| !kept.contains_key(id)).copied().collect();
        if !statistics.missing_responses.is_empty() {
            statistics.messages.push(ImportMessage {
                kind: ImportMessageKind::MissingFromImport,
                row: None,
                message: format!(
                    "{} survey responses have no imported weight",
                    statistics.missing_responses.len()
                ),
            });
        }

        let expected = computed.len() as f64;
        let total = statistics.imported_total + statistics.missing_responses.len() as f64 * DEFAULT_MISSING_WEIGHT;
        if (total - expected).abs() > self.settings.total_difference_ratio * expected {
            statistics.messages.push(ImportMessage {
                kind: ImportMessageKind::DifferenceTooGreat,
                row: None,
                message: format!(
                    "total weight {total:.4} differs from the {} survey responses",
                    computed.len()
                ),
            });
        }

        statistics.is_valid = statistics.matched_responses > 0 && statistics.missing_responses.is_empty();
        MergedWeights { weights, statistics }
    }

    /// Merges rows read by [`Self::read_workbook`], keeping its row messages.
    pub fn merge_parsed(&self, computed: &BTreeMap<RespondentId, f64>, parsed: ParsedImport) -> MergedWeights {
        let mut merged = self.merge(computed, &parsed.rows);
        let statistics = &mut merged.statistics;
        statistics.sheet = Some(parsed.sheet);
        statistics.rows_read = parsed.rows_read;
        statistics.ignored_rows += parsed.ignored_rows;
        statistics.invalid_weights = parsed.invalid_weights;
        statistics.is_valid &= parsed.invalid_weights == 0;
        let mut messages = parsed.messages;
        messages.append(&mut statistics.messages);
        statistics.messages = messages;
        merged
    }
}
