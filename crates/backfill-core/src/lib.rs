//! Core domain model for the contracts back-fill: the cell grid, proposal identifiers,
//! resolved client records and per-row merge outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "backfill-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("cell coordinates out of range: row {row}, col {col}")]
    OutOfRange { row: i64, col: i64 },
}

/// Missing or invalid startup configuration (connection parameters, column layout).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Row/column grid of string-or-absent cells loaded from a tabular source.
///
/// Rows may be ragged as loaded; reads past the end of a row yield `None`. Every column
/// write pads all rows to the grid width first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    rows: Vec<Vec<Option<String>>>,
    width: usize,
}

impl Grid {
    pub fn from_rows(rows: Vec<Vec<Option<String>>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        Self { rows, width }
    }

    /// Convenience constructor used by tests and fixtures; empty strings become absent cells.
    pub fn from_str_rows(rows: &[&[&str]]) -> Self {
        Self::from_rows(
            rows.iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| (!cell.is_empty()).then(|| (*cell).to_string()))
                        .collect()
                })
                .collect(),
        )
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(col))
            .and_then(|cell| cell.as_deref())
    }

    /// Read with externally supplied coordinates. Negative coordinates are the only error;
    /// anything past the ragged edge reads as absent.
    pub fn try_get(&self, row: i64, col: i64) -> Result<Option<&str>, GridError> {
        if row < 0 || col < 0 {
            return Err(GridError::OutOfRange { row, col });
        }
        Ok(self.get(row as usize, col as usize))
    }

    /// Snapshot of one column, one entry per row.
    pub fn column(&self, col: usize) -> Vec<Option<String>> {
        self.rows
            .iter()
            .map(|cells| cells.get(col).cloned().flatten())
            .collect()
    }

    /// Replace (or create) a column in place. Short value lists are padded with empty
    /// strings up to the grid height; longer lists grow the grid. Height never shrinks.
    pub fn set_column(&mut self, col: usize, values: Vec<String>) {
        if col >= self.width {
            self.width = col + 1;
        }
        if values.len() > self.rows.len() {
            self.rows.resize_with(values.len(), Vec::new);
        }
        self.pad_rows();

        let mut values = values.into_iter();
        for cells in &mut self.rows {
            cells[col] = Some(values.next().unwrap_or_default());
        }
    }

    fn pad_rows(&mut self) {
        let width = self.width;
        for cells in &mut self.rows {
            if cells.len() < width {
                cells.resize(width, None);
            }
        }
    }
}

/// Proposal key read from the source column: trimmed, all ASCII digits, at least
/// [`Identifier::MIN_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub const MIN_LEN: usize = 4;

    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() >= Self::MIN_LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(trimmed.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub const HOLDER_TITULAR: &str = "TITULAR";
pub const HOLDER_PROPIETARIO: &str = "PROPIETARIO";

/// Priority of a holder-role label: 1 = titular, 2 = propietario, 3 = anything else.
pub fn holder_rank(label: &str) -> u8 {
    let label = label.trim();
    if label.eq_ignore_ascii_case(HOLDER_TITULAR) {
        1
    } else if label.eq_ignore_ascii_case(HOLDER_PROPIETARIO) {
        2
    } else {
        3
    }
}

/// The single relational record chosen for an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub client_name: String,
    pub holder_role: String,
    pub amount: Option<f64>,
    pub contract_date: Option<String>,
}

impl ResolvedRecord {
    pub fn is_titular(&self) -> bool {
        self.holder_role.to_ascii_uppercase().contains(HOLDER_TITULAR)
    }

    pub fn amount_text(&self) -> String {
        self.amount.map(|a| format!("{a:.2}")).unwrap_or_default()
    }

    /// Store dates arrive as text; keep only the `YYYY-MM-DD` prefix when it is one.
    pub fn contract_date_text(&self) -> String {
        let Some(raw) = self.contract_date.as_deref() else {
            return String::new();
        };
        let raw = raw.trim();
        let prefix = raw.get(..10).unwrap_or(raw);
        if is_iso_date(prefix) {
            prefix.to_string()
        } else {
            raw.to_string()
        }
    }
}

fn is_iso_date(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

/// Per-row classification produced by the merge step. Reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Filled,
    AlreadyFilledMatching,
    AlreadyFilledConflicting,
    Overwritten,
    Unmatched,
}

/// Parse a column reference: spreadsheet letters (`"B"`, `"AA"`) or a 0-based index (`"5"`).
pub fn parse_column_ref(raw: &str) -> Result<usize, ConfigurationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigurationError::new("empty column reference"));
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse()
            .map_err(|_| ConfigurationError::new(format!("invalid column index {raw:?}")));
    }
    if !raw.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ConfigurationError::new(format!(
            "invalid column reference {raw:?}"
        )));
    }
    let mut index = 0usize;
    for b in raw.bytes() {
        let digit = (b.to_ascii_uppercase() - b'A') as usize + 1;
        index = index
            .checked_mul(26)
            .and_then(|i| i.checked_add(digit))
            .ok_or_else(|| ConfigurationError::new(format!("column reference {raw:?} too large")))?;
    }
    Ok(index - 1)
}

/// Spreadsheet letter for a 0-based column index (0 -> "A", 26 -> "AA").
pub fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}
