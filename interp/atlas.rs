//! Parcellation atlases: a label volume plus a table naming each label.

use crate::shared::volume::{self, Volume, VolumeError};
use calamine::{Data, Reader, open_workbook_auto};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("Failed to read label table '{path}': {source}")]
    Csv { path: String, source: csv::Error },
    #[error("Failed to read label workbook '{path}': {source}")]
    Workbook {
        path: String,
        source: calamine::Error,
    },
    #[error("Label workbook '{0}' has no worksheets.")]
    NoWorksheet(String),
    #[error("Label table '{path}' line {line}: column {column} is missing.")]
    MissingColumn {
        path: String,
        line: usize,
        column: usize,
    },
    #[error("Label table '{path}' line {line}: '{value}' is not an integer label.")]
    InvalidLabelNumber {
        path: String,
        line: usize,
        value: String,
    },
    #[error(
        "Label table '{path}' line {line}: '{value}' has no token {index} when split on '{separator}'."
    )]
    MissingToken {
        path: String,
        line: usize,
        value: String,
        separator: String,
        index: usize,
    },
    #[error("Label table '{path}' has no column named '{column}'.")]
    UnknownHeader { path: String, column: String },
    #[error("Label table '{0}' contains no labels.")]
    Empty(String),
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// Field delimiter of a label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Tab,
    Space,
    Comma,
}

impl Delimiter {
    fn byte(self) -> u8 {
        match self {
            Self::Tab => b'\t',
            Self::Space => b' ',
            Self::Comma => b',',
        }
    }
}

/// Selects one `separator`-delimited token out of a cell, e.g. the network
/// name `Default` out of `7Networks_LH_Default_Temp_1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default = "default_token_separator")]
    pub separator: String,
    pub index: usize,
}

fn default_token_separator() -> String {
    "_".to_string()
}

/// A column is addressed by position, or by header name when the table has a
/// header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Column {
    Index(usize),
    Name(String),
}

/// How to parse a label table file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFormat {
    #[serde(default)]
    pub delimiter: Delimiter,
    #[serde(default)]
    pub has_header: bool,
    #[serde(default = "default_number_column")]
    pub number_column: Column,
    #[serde(default = "default_name_column")]
    pub name_column: Column,
    #[serde(default)]
    pub number_token: Option<Token>,
    #[serde(default)]
    pub name_token: Option<Token>,
    /// Worksheet of a spreadsheet table; the first sheet when unset.
    #[serde(default)]
    pub sheet: Option<String>,
    /// Rows above the header (or above the first label when there is none).
    #[serde(default)]
    pub skip_rows: usize,
}

fn default_number_column() -> Column {
    Column::Index(0)
}

fn default_name_column() -> Column {
    Column::Index(1)
}

impl Default for LabelFormat {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Tab,
            has_header: false,
            number_column: default_number_column(),
            name_column: default_name_column(),
            number_token: None,
            name_token: None,
            sheet: None,
            skip_rows: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub number: i64,
    pub name: String,
}

/// Mapping from label number to region name, in file order.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    entries: Vec<LabelEntry>,
}

impl LabelTable {
    pub fn new(entries: Vec<LabelEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path, format: &LabelFormat) -> Result<Self, AtlasError> {
        let path_str = path.display().to_string();
        let rows = if is_spreadsheet(path) {
            read_sheet_rows(path, format.sheet.as_deref())?
        } else {
            read_delimited_rows(path, format.delimiter)?
        };

        let mut rows = rows.into_iter().skip(format.skip_rows);
        let headers: Vec<String> = if format.has_header {
            rows.next().unwrap_or_default()
        } else {
            Vec::new()
        };
        let resolve = |column: &Column| -> Result<usize, AtlasError> {
            match column {
                Column::Index(idx) => Ok(*idx),
                Column::Name(name) => headers.iter().position(|h| h == name).ok_or_else(|| {
                    AtlasError::UnknownHeader {
                        path: path_str.clone(),
                        column: name.clone(),
                    }
                }),
            }
        };
        let number_idx = resolve(&format.number_column)?;
        let name_idx = resolve(&format.name_column)?;

        let mut entries = Vec::new();
        let first_line = format.skip_rows + usize::from(format.has_header) + 1;
        for (row, record) in rows.enumerate() {
            let line = first_line + row;
            if record.iter().all(String::is_empty) {
                continue;
            }
            let cell = |idx: usize| {
                record.get(idx).map(String::as_str).ok_or(AtlasError::MissingColumn {
                    path: path_str.clone(),
                    line,
                    column: idx,
                })
            };
            let pick = |value: &str, token: &Option<Token>| -> Result<String, AtlasError> {
                match token {
                    None => Ok(value.to_string()),
                    Some(token) => value
                        .split(token.separator.as_str())
                        .nth(token.index)
                        .map(str::to_string)
                        .ok_or_else(|| AtlasError::MissingToken {
                            path: path_str.clone(),
                            line,
                            value: value.to_string(),
                            separator: token.separator.clone(),
                            index: token.index,
                        }),
                }
            };

            let number_text = pick(cell(number_idx)?, &format.number_token)?;
            let number = parse_label_number(&number_text).ok_or_else(|| {
                AtlasError::InvalidLabelNumber {
                    path: path_str.clone(),
                    line,
                    value: number_text.clone(),
                }
            })?;
            let name = pick(cell(name_idx)?, &format.name_token)?;
            entries.push(LabelEntry { number, name });
        }

        if entries.is_empty() {
            return Err(AtlasError::Empty(path_str));
        }
        log::debug!("Read {} labels from '{}'", entries.len(), path.display());
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[LabelEntry] {
        &self.entries
    }

    /// Label numbers whose name equals `name`.
    pub fn numbers_named(&self, name: &str) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.number)
            .collect()
    }

    /// Label numbers whose name contains `fragment`.
    pub fn numbers_containing(&self, fragment: &str) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|e| e.name.contains(fragment))
            .map(|e| e.number)
            .collect()
    }

    /// Distinct region names in order of first appearance.
    pub fn unique_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.name.as_str()))
            .map(|e| e.name.clone())
            .collect()
    }
}

fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "xlsx" | "xlsm" | "xls" | "xlsb" | "ods"
            )
        })
}

/// Every record of a delimited text table, cells trimmed.
fn read_delimited_rows(path: &Path, delimiter: Delimiter) -> Result<Vec<Vec<String>>, AtlasError> {
    let csv_err = |source| AtlasError::Csv {
        path: path.display().to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter.byte())
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;
    reader
        .records()
        .map(|record| {
            record
                .map(|r| r.iter().map(str::to_string).collect::<Vec<String>>())
                .map_err(csv_err)
        })
        .collect()
}

/// Cells of one worksheet as text, positioned from the sheet's top-left
/// corner even when the used range starts further in.
fn read_sheet_rows(path: &Path, sheet: Option<&str>) -> Result<Vec<Vec<String>>, AtlasError> {
    let path_str = path.display().to_string();
    let workbook_err = |source| AtlasError::Workbook {
        path: path_str.clone(),
        source,
    };
    let mut workbook = open_workbook_auto(path).map_err(workbook_err)?;
    let range = match sheet {
        Some(name) => workbook.worksheet_range(name).map_err(workbook_err)?,
        None => workbook
            .worksheet_range_at(0)
            .ok_or_else(|| AtlasError::NoWorksheet(path_str.clone()))?
            .map_err(workbook_err)?,
    };
    let Some((first_row, first_col)) = range.start() else {
        return Ok(Vec::new());
    };

    let mut rows = vec![Vec::new(); first_row as usize];
    rows.extend(range.rows().map(|cells| {
        std::iter::repeat_n(String::new(), first_col as usize)
            .chain(cells.iter().map(|cell: &Data| cell.to_string().trim().to_string()))
            .collect::<Vec<String>>()
    }));
    Ok(rows)
}

/// Accepts integers written as floats (`12.0`), as some tables store them.
fn parse_label_number(text: &str) -> Option<i64> {
    text.parse::<i64>().ok().or_else(|| {
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

/// A label volume aligned with the map it will summarize.
#[derive(Debug, Clone)]
pub struct Atlas {
    pub name: String,
    pub labels: Array3<i64>,
    pub table: LabelTable,
    pub is_white_matter: bool,
}

/// Where an atlas lives on disk and how to read it.
#[derive(Debug, Clone)]
pub struct AtlasSource {
    pub name: String,
    pub volume: PathBuf,
    pub labels: PathBuf,
    pub format: LabelFormat,
    pub resample: bool,
    pub is_white_matter: bool,
}

impl AtlasSource {
    /// Loads the atlas, resampling the label volume to the reference grid when
    /// requested.
    pub fn load(&self, reference: &Volume) -> Result<Atlas, AtlasError> {
        let raw = volume::load_volume(&self.volume)?;
        let aligned = if self.resample {
            log::info!("Resampling atlas '{}' to the map grid", self.name);
            volume::resample_nearest(&raw, reference.shape(), &reference.affine)?
        } else {
            raw
        };
        let table = LabelTable::load(&self.labels, &self.format)?;
        Ok(Atlas {
            name: self.name.clone(),
            labels: aligned.to_labels(),
            table,
            is_white_matter: self.is_white_matter,
        })
    }
}
