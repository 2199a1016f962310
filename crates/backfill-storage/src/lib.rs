//! Tabular source loading and atomic write-back for the back-fill pipeline.

use std::path::{Path, PathBuf};

use anyhow::Context;
use backfill_core::{column_letter, Grid};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "backfill-storage";

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const DELIMITER_CANDIDATES: &[u8] = &[b',', b'\t', b';', b'|'];
const SNIFF_LINES: usize = 15;

/// The tabular source cannot be turned into a grid at all. Ragged rows are not an error.
#[derive(Debug, Error)]
pub enum SourceFormatError {
    #[error("reading tabular source {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tabular source {0} contains no rows")]
    Empty(String),
    #[error("malformed tabular source {origin}: {message}")]
    Malformed { origin: String, message: String },
    #[error("grid has {width} columns but column {column} ({letter}) is required")]
    TooNarrow {
        width: usize,
        column: usize,
        letter: String,
    },
}

#[derive(Debug, Clone)]
pub struct LoadedGrid {
    pub grid: Grid,
    pub delimiter: u8,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct WrittenGrid {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Decode raw export bytes: strip a UTF-8 BOM, fall back to Windows-1252 for legacy exports.
pub fn decode_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Pick the delimiter that yields the most consistent multi-field split over the first lines.
pub fn sniff_delimiter(content: &str) -> u8 {
    let sample: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(SNIFF_LINES)
        .collect();
    if sample.is_empty() {
        return b',';
    }

    let mut best = b',';
    let mut best_score = 0usize;
    for &delim in DELIMITER_CANDIDATES {
        let counts: Vec<usize> = sample
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let multi_field_lines = counts.iter().filter(|&&c| c > 1).count();
        if multi_field_lines == 0 {
            continue;
        }
        let widest = counts.iter().copied().max().unwrap_or(1);
        let score = multi_field_lines * widest;
        if score > best_score {
            best_score = score;
            best = delim;
        }
    }
    best
}

/// Parse bytes into a grid. `origin` only labels errors and log spans.
pub fn parse_grid(bytes: &[u8], origin: &str) -> Result<LoadedGrid, SourceFormatError> {
    let content = decode_bytes(bytes);
    let delimiter = sniff_delimiter(&content);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| SourceFormatError::Malformed {
            origin: origin.to_string(),
            message: err.to_string(),
        })?;
        rows.push(
            record
                .iter()
                .map(|field| (!field.is_empty()).then(|| field.to_string()))
                .collect::<Vec<_>>(),
        );
    }

    if rows.is_empty() {
        return Err(SourceFormatError::Empty(origin.to_string()));
    }

    let grid = Grid::from_rows(rows);
    debug!(
        origin,
        rows = grid.height(),
        cols = grid.width(),
        delimiter = %(delimiter as char).escape_default(),
        "parsed tabular source"
    );
    Ok(LoadedGrid {
        grid,
        delimiter,
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

pub async fn load_grid(path: impl AsRef<Path>) -> Result<LoadedGrid, SourceFormatError> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    let bytes = fs::read(path)
        .instrument(info_span!("load_grid", path = %origin))
        .await
        .map_err(|source| SourceFormatError::Io {
            path: origin.clone(),
            source,
        })?;
    parse_grid(&bytes, &origin)
}

/// Fail fast when the grid is narrower than the highest column the layout addresses.
pub fn ensure_width(grid: &Grid, required_columns: &[usize]) -> Result<(), SourceFormatError> {
    if let Some(&column) = required_columns.iter().max() {
        if column >= grid.width() {
            return Err(SourceFormatError::TooNarrow {
                width: grid.width(),
                column,
                letter: column_letter(column),
            });
        }
    }
    Ok(())
}

/// Serialize in the grid's own shape: every row padded to the grid width, absent cells empty.
pub fn render_grid(grid: &Grid, delimiter: u8) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());

    let width = grid.width();
    for row in grid.rows() {
        let record = (0..width).map(|col| row.get(col).cloned().flatten().unwrap_or_default());
        writer
            .write_record(record)
            .context("serializing grid row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing grid writer: {}", err.error()))
}

/// Write the grid through a temp file in the target directory and an atomic rename.
pub async fn write_grid(
    path: impl AsRef<Path>,
    grid: &Grid,
    delimiter: u8,
) -> anyhow::Result<WrittenGrid> {
    let path = path.as_ref();
    let bytes = render_grid(grid, delimiter)?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp output file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp output file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenGrid {
        path: path.to_path_buf(),
        content_hash: sha256_hex(&bytes),
        byte_size: bytes.len(),
    })
}

/// `<stem>_PROCESADO.<ext>` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "csv".to_string());
    input.with_file_name(format!("{stem}_PROCESADO.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn sniffs_tabs_and_commas() {
        assert_eq!(sniff_delimiter("a\tb\tc\n1\t2\t3\n"), b'\t');
        assert_eq!(sniff_delimiter("a,b,c\n1,2,3\n"), b',');
        assert_eq!(sniff_delimiter("a;b;c\n1;2;3\n"), b';');
        assert_eq!(sniff_delimiter("single\n"), b',');
    }

    #[test]
    fn ragged_rows_load_without_error() {
        let loaded = parse_grid(b"title\n,1234,x,y\n,5678\n", "mem").expect("parse");
        assert_eq!(loaded.grid.height(), 3);
        assert_eq!(loaded.grid.width(), 4);
        assert_eq!(loaded.grid.get(1, 1), Some("1234"));
        assert_eq!(loaded.grid.get(2, 3), None);
        assert_eq!(loaded.grid.get(1, 0), None);
    }

    #[test]
    fn bom_and_legacy_encoding_are_tolerated() {
        let loaded = parse_grid(b"\xEF\xBB\xBFa,b\n", "bom").expect("parse");
        assert_eq!(loaded.grid.get(0, 0), Some("a"));

        let loaded = parse_grid(b"Pe\xF1a,1234\n", "latin").expect("parse");
        assert_eq!(loaded.grid.get(0, 0), Some("Peña"));
    }

    #[test]
    fn empty_source_is_a_format_error() {
        assert!(matches!(
            parse_grid(b"", "empty"),
            Err(SourceFormatError::Empty(_))
        ));
    }

    #[test]
    fn narrow_grid_fails_fast() {
        let grid = Grid::from_str_rows(&[&["a", "b"]]);
        assert!(ensure_width(&grid, &[1]).is_ok());
        let err = ensure_width(&grid, &[1, 5]).unwrap_err();
        assert!(err.to_string().contains("(F)"));
    }

    #[test]
    fn render_pads_rows_to_grid_width() {
        let grid = Grid::from_str_rows(&[&["a", "b", "c"], &["d"]]);
        let bytes = render_grid(&grid, b',').expect("render");
        assert_eq!(String::from_utf8(bytes).unwrap(), "a,b,c\nd,,\n");
    }

    #[tokio::test]
    async fn write_then_load_preserves_shape() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.csv");
        let grid = Grid::from_str_rows(&[&["x", "", "Juan Perez, hijo"], &["", "1234"]]);

        let written = write_grid(&path, &grid, b',').await.expect("write");
        assert!(written.path.exists());

        let loaded = load_grid(&path).await.expect("load");
        assert_eq!(loaded.grid.height(), 2);
        assert_eq!(loaded.grid.width(), 3);
        assert_eq!(loaded.grid.get(0, 2), Some("Juan Perez, hijo"));
        assert_eq!(loaded.grid.get(1, 1), Some("1234"));
        assert_eq!(loaded.content_hash, written.content_hash);
    }

    #[tokio::test]
    async fn missing_file_is_a_format_error() {
        let dir = tempdir().expect("tempdir");
        let err = load_grid(dir.path().join("nope.csv")).await.unwrap_err();
        assert!(matches!(err, SourceFormatError::Io { .. }));
    }

    #[test]
    fn default_output_path_appends_suffix() {
        assert_eq!(
            default_output_path(Path::new("/data/ORDEN DE VENTA CUA.csv")),
            PathBuf::from("/data/ORDEN DE VENTA CUA_PROCESADO.csv")
        );
    }
}
