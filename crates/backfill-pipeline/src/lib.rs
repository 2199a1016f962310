//! Reconciliation pipeline: extract identifiers from the grid, resolve them against the
//! contracts store, merge the results back under the fill policy and summarize.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use backfill_core::{
    column_letter, parse_column_ref, ConfigurationError, Grid, Identifier, MergeOutcome,
    ResolvedRecord,
};
use backfill_resolver::{
    BatchResolver, ContractLookup, DatabaseConfig, FailedBatch, Resolution, ResolverConfig,
    SqlLookup, Tier, DEFAULT_BATCH_SIZE,
};
use backfill_storage::{ensure_width, load_grid, parse_grid, write_grid, LoadedGrid, SourceFormatError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "backfill-pipeline";

pub const DEFAULT_DATA_START_ROW: usize = 11;
pub const DEFAULT_PLACEHOLDERS: &[&str] = &["CLIENTE", "nan", "none", "null", "#N/D"];
const UNMATCHED_SAMPLE_LIMIT: usize = 50;

/// Fixed column addressing, 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    pub source_column: usize,
    pub client_column: usize,
    pub amount_column: Option<usize>,
    pub contract_date_column: Option<usize>,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            source_column: 1,
            client_column: 5,
            amount_column: Some(21),
            contract_date_column: Some(7),
        }
    }
}

impl ColumnLayout {
    pub fn required_columns(&self) -> Vec<usize> {
        let mut cols = vec![self.source_column, self.client_column];
        cols.extend(self.amount_column);
        cols.extend(self.contract_date_column);
        cols
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub layout: ColumnLayout,
    /// 1-based row where data begins.
    pub data_start_row: usize,
    pub batch_size: usize,
    pub overwrite: bool,
    pub placeholders: Vec<String>,
    pub reports_dir: Option<PathBuf>,
    pub database: DatabaseConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            layout: ColumnLayout::default(),
            data_start_row: DEFAULT_DATA_START_ROW,
            batch_size: DEFAULT_BATCH_SIZE,
            overwrite: false,
            placeholders: DEFAULT_PLACEHOLDERS.iter().map(|s| s.to_string()).collect(),
            reports_dir: None,
            database: DatabaseConfig::default(),
        }
    }
}

/// On-disk form of [`PipelineConfig`]; columns may be letters or indices.
#[derive(Debug, Clone, Default, Deserialize)]
struct PipelineConfigFile {
    source_column: Option<String>,
    client_column: Option<String>,
    amount_column: Option<String>,
    contract_date_column: Option<String>,
    data_start_row: Option<usize>,
    batch_size: Option<usize>,
    overwrite: Option<bool>,
    placeholders: Option<Vec<String>>,
    reports_dir: Option<PathBuf>,
    database: Option<DatabaseConfig>,
}

/// `""`, `"none"` or `"-"` disable an optional column.
fn parse_optional_column(raw: &str) -> Result<Option<usize>, ConfigurationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        parse_column_ref(trimmed).map(Some)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let defaults = Self::default();
        let layout = ColumnLayout {
            source_column: match std::env::var("BACKFILL_SOURCE_COLUMN") {
                Ok(v) => parse_column_ref(&v)?,
                Err(_) => defaults.layout.source_column,
            },
            client_column: match std::env::var("BACKFILL_CLIENT_COLUMN") {
                Ok(v) => parse_column_ref(&v)?,
                Err(_) => defaults.layout.client_column,
            },
            amount_column: match std::env::var("BACKFILL_AMOUNT_COLUMN") {
                Ok(v) => parse_optional_column(&v)?,
                Err(_) => defaults.layout.amount_column,
            },
            contract_date_column: match std::env::var("BACKFILL_DATE_COLUMN") {
                Ok(v) => parse_optional_column(&v)?,
                Err(_) => defaults.layout.contract_date_column,
            },
        };
        let config = Self {
            layout,
            data_start_row: std::env::var("BACKFILL_DATA_START_ROW")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.data_start_row),
            batch_size: std::env::var("BACKFILL_BATCH_SIZE")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.batch_size),
            overwrite: env_flag("BACKFILL_OVERWRITE").unwrap_or(false),
            placeholders: defaults.placeholders,
            reports_dir: Some(PathBuf::from(
                std::env::var("BACKFILL_REPORTS_DIR").unwrap_or_else(|_| "reports".to_string()),
            )),
            database: DatabaseConfig::from_env(),
        };
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: PipelineConfigFile = serde_yaml::from_str(text).context("parsing pipeline config")?;
        let defaults = Self::default();
        let layout = ColumnLayout {
            source_column: file
                .source_column
                .as_deref()
                .map(parse_column_ref)
                .transpose()?
                .unwrap_or(defaults.layout.source_column),
            client_column: file
                .client_column
                .as_deref()
                .map(parse_column_ref)
                .transpose()?
                .unwrap_or(defaults.layout.client_column),
            amount_column: match file.amount_column.as_deref() {
                Some(raw) => parse_optional_column(raw)?,
                None => defaults.layout.amount_column,
            },
            contract_date_column: match file.contract_date_column.as_deref() {
                Some(raw) => parse_optional_column(raw)?,
                None => defaults.layout.contract_date_column,
            },
        };
        Ok(Self {
            layout,
            data_start_row: file.data_start_row.unwrap_or(defaults.data_start_row),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            overwrite: file.overwrite.unwrap_or(defaults.overwrite),
            placeholders: file.placeholders.unwrap_or(defaults.placeholders),
            reports_dir: Some(file.reports_dir.unwrap_or_else(|| PathBuf::from("reports"))),
            database: file.database.unwrap_or_default(),
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Layout and run parameters only; connection parameters are checked separately.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.data_start_row == 0 {
            return Err(ConfigurationError::new("data_start_row is 1-based and must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::new("batch_size must be >= 1"));
        }
        let layout = &self.layout;
        let targets = [
            Some(layout.client_column),
            layout.amount_column,
            layout.contract_date_column,
        ];
        if targets.iter().flatten().any(|&c| c == layout.source_column) {
            return Err(ConfigurationError::new(format!(
                "source column {} cannot also be a target column",
                column_letter(layout.source_column)
            )));
        }
        let mut seen = Vec::with_capacity(targets.len());
        for col in targets.into_iter().flatten() {
            if seen.contains(&col) {
                return Err(ConfigurationError::new(format!(
                    "column {} is assigned to more than one target",
                    column_letter(col)
                )));
            }
            seen.push(col);
        }
        Ok(())
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            client_column: self.layout.client_column,
            amount_column: self.layout.amount_column,
            contract_date_column: self.layout.contract_date_column,
            overwrite: self.overwrite,
            placeholders: self.placeholders.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedIdentifier {
    /// 0-based grid row.
    pub row: usize,
    pub identifier: Identifier,
}

/// Walk `source_column` from the 1-based `data_start_row`, keeping cells that parse as
/// identifiers. Row order and duplicates are preserved; anything else is skipped silently.
pub fn extract_identifiers(
    grid: &Grid,
    source_column: usize,
    data_start_row: usize,
) -> Vec<ExtractedIdentifier> {
    let start = data_start_row.saturating_sub(1);
    (start..grid.height())
        .filter_map(|row| {
            grid.get(row, source_column)
                .and_then(Identifier::parse)
                .map(|identifier| ExtractedIdentifier { row, identifier })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    pub client_column: usize,
    pub amount_column: Option<usize>,
    pub contract_date_column: Option<usize>,
    pub overwrite: bool,
    pub placeholders: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounters {
    pub filled: usize,
    pub already_filled_matching: usize,
    pub already_filled_conflicting: usize,
    pub overwritten: usize,
    pub unmatched: usize,
    pub titular_fills: usize,
}

impl MergeCounters {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Filled => self.filled += 1,
            MergeOutcome::AlreadyFilledMatching => self.already_filled_matching += 1,
            MergeOutcome::AlreadyFilledConflicting => self.already_filled_conflicting += 1,
            MergeOutcome::Overwritten => self.overwritten += 1,
            MergeOutcome::Unmatched => self.unmatched += 1,
        }
    }

    pub fn writes(&self) -> usize {
        self.filled + self.overwritten
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowOutcome {
    pub row: usize,
    pub identifier: Identifier,
    pub outcome: MergeOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub counters: MergeCounters,
    pub outcomes: Vec<RowOutcome>,
}

pub struct MergeEngine {
    policy: MergePolicy,
}

struct TargetColumn {
    col: usize,
    values: Vec<Option<String>>,
}

impl TargetColumn {
    fn load(grid: &Grid, col: usize) -> Self {
        Self {
            col,
            values: grid.column(col),
        }
    }

    fn write(&mut self, row: usize, value: String) {
        if row >= self.values.len() {
            self.values.resize(row + 1, None);
        }
        self.values[row] = Some(value);
    }

    fn finalize(self, grid: &mut Grid) {
        grid.set_column(
            self.col,
            self.values.into_iter().map(Option::unwrap_or_default).collect(),
        );
    }
}

impl MergeEngine {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    /// Blank cells and placeholder tokens (header text, null-likes) may be filled.
    pub fn is_fillable(&self, value: Option<&str>) -> bool {
        let Some(value) = value.map(str::trim) else {
            return true;
        };
        value.is_empty()
            || self
                .policy
                .placeholders
                .iter()
                .any(|p| p.trim().eq_ignore_ascii_case(value))
    }

    pub fn classify(&self, current: Option<&str>, record: &ResolvedRecord) -> MergeOutcome {
        if self.is_fillable(current) {
            MergeOutcome::Filled
        } else if current.map(str::trim) == Some(record.client_name.trim()) {
            MergeOutcome::AlreadyFilledMatching
        } else if self.policy.overwrite {
            MergeOutcome::Overwritten
        } else {
            MergeOutcome::AlreadyFilledConflicting
        }
    }

    /// Apply resolved records to the target columns. Target columns are only rewritten
    /// when at least one row was filled or overwritten.
    pub fn apply(
        &self,
        grid: &mut Grid,
        extracted: &[ExtractedIdentifier],
        resolved: &HashMap<Identifier, ResolvedRecord>,
    ) -> MergeResult {
        let mut client = TargetColumn::load(grid, self.policy.client_column);
        let mut amount = self.policy.amount_column.map(|c| TargetColumn::load(grid, c));
        let mut date = self
            .policy
            .contract_date_column
            .map(|c| TargetColumn::load(grid, c));

        let mut result = MergeResult::default();
        for item in extracted {
            let record = resolved
                .get(&item.identifier)
                .filter(|r| !r.client_name.trim().is_empty());
            let outcome = match record {
                None => MergeOutcome::Unmatched,
                Some(record) => {
                    let current = client.values.get(item.row).cloned().flatten();
                    let outcome = self.classify(current.as_deref(), record);
                    if matches!(outcome, MergeOutcome::Filled | MergeOutcome::Overwritten) {
                        client.write(item.row, record.client_name.clone());
                        if let Some(col) = amount.as_mut() {
                            col.write(item.row, record.amount_text());
                        }
                        if let Some(col) = date.as_mut() {
                            col.write(item.row, record.contract_date_text());
                        }
                        if record.is_titular() {
                            result.counters.titular_fills += 1;
                        }
                    }
                    outcome
                }
            };
            result.counters.record(outcome);
            result.outcomes.push(RowOutcome {
                row: item.row,
                identifier: item.identifier.clone(),
                outcome,
            });
        }

        if result.counters.writes() > 0 {
            client.finalize(grid);
            if let Some(col) = amount {
                col.finalize(grid);
            }
            if let Some(col) = date {
                col.finalize(grid);
            }
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedSample {
    /// 1-based, as shown in a spreadsheet.
    pub row: usize,
    pub identifier: Identifier,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub extracted: usize,
    pub unique_identifiers: usize,
    pub resolved: usize,
    pub filled: usize,
    pub already_filled_matching: usize,
    pub already_filled_conflicting: usize,
    pub overwritten: usize,
    pub unmatched: usize,
    pub titular_fills: usize,
    pub match_efficiency: f64,
    pub fill_rate: f64,
    pub titular_rate: f64,
    pub batches: usize,
    pub tier_counts: BTreeMap<Tier, usize>,
    pub failed_batches: Vec<FailedBatch>,
    pub unmatched_samples: Vec<UnmatchedSample>,
    pub warnings: Vec<String>,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Pure aggregation of one reconciliation pass.
pub fn summarize(
    extracted: &[ExtractedIdentifier],
    resolution: &Resolution,
    merge: &MergeResult,
) -> ReconcileSummary {
    let c = merge.counters;
    let unmatched_samples = merge
        .outcomes
        .iter()
        .filter(|o| o.outcome == MergeOutcome::Unmatched)
        .take(UNMATCHED_SAMPLE_LIMIT)
        .map(|o| UnmatchedSample {
            row: o.row + 1,
            identifier: o.identifier.clone(),
        })
        .collect();

    let unresolved_ids = resolution.candidates.saturating_sub(resolution.resolved_count());
    let mut warnings = Vec::new();
    if unresolved_ids > 0 {
        warnings.push(format!(
            "{unresolved_ids} identifiers unmatched ({} rows)",
            c.unmatched
        ));
    }
    if !resolution.failed_batches.is_empty() {
        warnings.push(format!(
            "{} batches failed on connection errors",
            resolution.failed_batches.len()
        ));
    }
    if c.already_filled_conflicting > 0 {
        warnings.push(format!(
            "{} rows hold a different client name and were left untouched",
            c.already_filled_conflicting
        ));
    }

    ReconcileSummary {
        extracted: extracted.len(),
        unique_identifiers: resolution.candidates,
        resolved: resolution.resolved_count(),
        filled: c.filled,
        already_filled_matching: c.already_filled_matching,
        already_filled_conflicting: c.already_filled_conflicting,
        overwritten: c.overwritten,
        unmatched: c.unmatched,
        titular_fills: c.titular_fills,
        match_efficiency: ratio(resolution.resolved_count(), extracted.len()),
        fill_rate: ratio(
            c.filled + c.overwritten + c.already_filled_matching,
            extracted.len(),
        ),
        titular_rate: ratio(c.titular_fills, c.writes()),
        batches: resolution.batches,
        tier_counts: resolution.tier_counts.clone(),
        failed_batches: resolution.failed_batches.clone(),
        unmatched_samples,
        warnings,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub execution_time_secs: f64,
    pub input: String,
    pub input_sha256: String,
    pub output_path: String,
    pub rows: usize,
    pub columns: usize,
    pub summary: ReconcileSummary,
    pub reports_dir: Option<String>,
}

pub struct Pipeline {
    config: PipelineConfig,
    resolver: BatchResolver,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let resolver = BatchResolver::new(ResolverConfig {
            batch_size: config.batch_size,
        });
        Ok(Self { config, resolver })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Extract, resolve and merge against an already loaded grid. Only a grid narrower
    /// than the layout is an error; lookup failures end up as unmatched counts.
    pub async fn reconcile(
        &self,
        grid: &mut Grid,
        lookup: &dyn ContractLookup,
    ) -> Result<ReconcileSummary, SourceFormatError> {
        let layout = &self.config.layout;
        ensure_width(grid, &layout.required_columns())?;

        let extracted = extract_identifiers(grid, layout.source_column, self.config.data_start_row);
        info!(
            extracted = extracted.len(),
            source_column = %column_letter(layout.source_column),
            data_start_row = self.config.data_start_row,
            "extracted identifiers"
        );

        let ids: Vec<Identifier> = extracted.iter().map(|e| e.identifier.clone()).collect();
        let resolution = self.resolver.resolve(lookup, &ids).await;

        let merge = MergeEngine::new(self.config.merge_policy()).apply(grid, &extracted, &resolution.records);
        let summary = summarize(&extracted, &resolution, &merge);
        for warning in &summary.warnings {
            warn!("{warning}");
        }
        Ok(summary)
    }

    /// Full file run: one connection for the whole run, closed on every path.
    pub async fn run_file(&self, input: &Path, output: &Path) -> Result<RunReport> {
        self.config.database.validate()?;
        let loaded = load_grid(input).await?;
        let lookup = SqlLookup::connect(&self.config.database)
            .await
            .context("connecting to the contracts database")?;
        let report = self
            .run_loaded(loaded, &input.display().to_string(), output, &lookup)
            .await;
        if let Err(err) = lookup.close().await {
            warn!(error = %err, "closing database connection failed");
        }
        report
    }

    /// Run against uploaded bytes with a caller-supplied lookup.
    pub async fn run_bytes(
        &self,
        bytes: &[u8],
        origin: &str,
        output: &Path,
        lookup: &dyn ContractLookup,
    ) -> Result<RunReport> {
        let loaded = parse_grid(bytes, origin)?;
        self.run_loaded(loaded, origin, output, lookup).await
    }

    async fn run_loaded(
        &self,
        loaded: LoadedGrid,
        origin: &str,
        output: &Path,
        lookup: &dyn ContractLookup,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_id = Uuid::new_v4();
        let LoadedGrid {
            mut grid,
            delimiter,
            content_hash,
            ..
        } = loaded;

        let summary = self.reconcile(&mut grid, lookup).await?;
        let written = write_grid(output, &grid, delimiter).await?;

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            execution_time_secs: clock.elapsed().as_secs_f64(),
            input: origin.to_string(),
            input_sha256: content_hash,
            output_path: written.path.display().to_string(),
            rows: grid.height(),
            columns: grid.width(),
            summary,
            reports_dir: None,
        };

        if let Some(root) = &self.config.reports_dir {
            let dir = write_run_reports(root, &report).await?;
            report.reports_dir = Some(dir.display().to_string());
        }

        info!(
            %run_id,
            extracted = report.summary.extracted,
            resolved = report.summary.resolved,
            filled = report.summary.filled,
            unmatched = report.summary.unmatched,
            output = %report.output_path,
            "run complete"
        );
        Ok(report)
    }
}

pub fn report_markdown(report: &RunReport) -> String {
    let s = &report.summary;
    let mut lines = vec![
        "# Back-fill Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Input: `{}` (sha256 `{}`)", report.input, report.input_sha256),
        format!("- Output: `{}`", report.output_path),
        String::new(),
        "## Counts".to_string(),
        format!("- Identifiers extracted: {}", s.extracted),
        format!("- Unique identifiers: {}", s.unique_identifiers),
        format!("- Resolved: {}", s.resolved),
        format!("- Filled: {} (titular: {})", s.filled, s.titular_fills),
        format!("- Already filled, matching: {}", s.already_filled_matching),
        format!("- Already filled, conflicting: {}", s.already_filled_conflicting),
        format!("- Overwritten: {}", s.overwritten),
        format!("- Unmatched rows: {}", s.unmatched),
        format!("- Match efficiency: {:.1}%", s.match_efficiency * 100.0),
        format!("- Fill rate: {:.1}%", s.fill_rate * 100.0),
        format!("- Titular rate: {:.1}%", s.titular_rate * 100.0),
        String::new(),
        "## Batches".to_string(),
        format!("- Total: {}", s.batches),
    ];
    for (tier, count) in &s.tier_counts {
        lines.push(format!("- {}: {}", tier.as_str(), count));
    }
    for failed in &s.failed_batches {
        lines.push(format!(
            "- failed batch {} ({} identifiers): {}",
            failed.batch_no, failed.identifiers, failed.error
        ));
    }
    if !s.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Warnings".to_string());
        lines.extend(s.warnings.iter().map(|w| format!("- {w}")));
    }
    if !s.unmatched_samples.is_empty() {
        lines.push(String::new());
        lines.push("## Unmatched (sample)".to_string());
        lines.extend(
            s.unmatched_samples
                .iter()
                .map(|u| format!("- row {}: {}", u.row, u.identifier)),
        );
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn write_run_reports(root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(dir.join("brief.md"), report_markdown(report))
        .await
        .context("writing brief.md")?;
    Ok(dir)
}
