//! Batched, priority-aware resolution of proposal identifiers against the contracts store.
//!
//! Each batch walks an ordered cascade of [`ResolveStrategy`] tiers (ranked batch query,
//! ordered batch query, one query per identifier) until one answers. Whatever a tier
//! returns is reduced to one record per identifier in-process by holder priority, so the
//! result never depends on the store's row order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use backfill_core::{holder_rank, ConfigurationError, Identifier, ResolvedRecord};
use serde::{Deserialize, Serialize};
use sqlx::AnyConnection;
use sqlx::{Connection, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "backfill-resolver";

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Connection parameters for the contracts store, supplied once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub database_path: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Full connection URL / DSN. Takes precedence over the individual fields.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_user() -> String {
    "SYSDBA".to_string()
}

fn default_charset() -> String {
    "UTF8".to_string()
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("BACKFILL_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            database_path: std::env::var("BACKFILL_DB_PATH").unwrap_or_default(),
            user: std::env::var("BACKFILL_DB_USER").unwrap_or_else(|_| default_user()),
            password: std::env::var("BACKFILL_DB_PASSWORD").unwrap_or_default(),
            charset: std::env::var("BACKFILL_DB_CHARSET").unwrap_or_else(|_| default_charset()),
            url: std::env::var("BACKFILL_DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            database_path: path.into(),
            user: default_user(),
            charset: default_charset(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.to_url().map(|_| ())
    }

    pub fn to_url(&self) -> Result<String, ConfigurationError> {
        let charset = self.charset.trim().replace('-', "");
        if !charset.is_empty() && !charset.eq_ignore_ascii_case("UTF8") {
            return Err(ConfigurationError::new(format!(
                "unsupported charset {:?}; only UTF8 is supported",
                self.charset
            )));
        }

        if let Some(url) = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            return if url.contains(':') {
                Ok(url.to_string())
            } else {
                Err(ConfigurationError::new(format!(
                    "connection url {url:?} has no scheme"
                )))
            };
        }

        let path = self.database_path.trim();
        if path.is_empty() {
            return Err(ConfigurationError::new(
                "database_path (or a connection url) is required",
            ));
        }
        if path == ":memory:" {
            return Ok("sqlite::memory:".to_string());
        }
        let lowered = path.to_ascii_lowercase();
        if [".db", ".sqlite", ".sqlite3"]
            .iter()
            .any(|ext| lowered.ends_with(ext))
        {
            return Ok(format!("sqlite://{path}"));
        }

        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigurationError::new("host is required for server databases"));
        }
        let user = self.user.trim();
        if user.is_empty() {
            return Err(ConfigurationError::new("user is required for server databases"));
        }
        let credentials = if self.password.is_empty() {
            encode_userinfo(user)
        } else {
            format!("{}:{}", encode_userinfo(user), encode_userinfo(&self.password))
        };
        Ok(format!(
            "postgres://{credentials}@{host}/{}",
            path.trim_start_matches('/')
        ))
    }
}

fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// One relational row as returned by a lookup query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRow {
    pub identifier: String,
    pub client_name: String,
    pub holder_role: String,
    pub amount: Option<f64>,
    pub contract_date: Option<String>,
}

impl LookupRow {
    pub fn into_record(self) -> ResolvedRecord {
        ResolvedRecord {
            client_name: self.client_name,
            holder_role: self.holder_role,
            amount: self.amount,
            contract_date: self.contract_date,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("query shape not supported by the store: {0}")]
    Unsupported(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("decoding lookup row failed: {0}")]
    Decode(String),
    #[error("connection failure: {0}")]
    Connection(String),
}

impl LookupError {
    /// Batch-query failures move on to the next tier; connection failures stop the cascade.
    pub fn falls_through(&self) -> bool {
        !matches!(self, LookupError::Connection(_))
    }
}

impl From<sqlx::Error> for LookupError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                let message = db.message().to_ascii_lowercase();
                let unsupported = matches!(code.as_str(), "42601" | "42883" | "0A000")
                    || message.contains("syntax error")
                    || message.contains("no such function")
                    || message.contains("not supported")
                    || message.contains("window");
                if unsupported {
                    LookupError::Unsupported(err.to_string())
                } else {
                    LookupError::Query(err.to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::TypeNotFound { .. } => LookupError::Decode(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => LookupError::Connection(err.to_string()),
            _ => LookupError::Query(err.to_string()),
        }
    }
}

/// Relational lookup collaborator: the three query shapes the cascade needs.
#[async_trait]
pub trait ContractLookup: Send + Sync {
    /// One row per identifier, already ranked by holder priority in the store.
    async fn ranked_batch(&self, ids: &[Identifier]) -> Result<Vec<LookupRow>, LookupError>;

    /// Every candidate row for the batch, ordered by identifier then priority.
    async fn ordered_batch(&self, ids: &[Identifier]) -> Result<Vec<LookupRow>, LookupError>;

    /// The single top-priority row for one identifier.
    async fn top_for(&self, id: &Identifier) -> Result<Option<LookupRow>, LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    RankedBatch,
    OrderedBatch,
    PerIdentifier,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::RankedBatch => "ranked_batch",
            Tier::OrderedBatch => "ordered_batch",
            Tier::PerIdentifier => "per_identifier",
        }
    }
}

#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn tier(&self) -> Tier;

    async fn resolve(
        &self,
        lookup: &dyn ContractLookup,
        batch: &[Identifier],
    ) -> Result<Vec<LookupRow>, LookupError>;
}

#[derive(Debug, Default)]
pub struct RankedBatchStrategy;

#[async_trait]
impl ResolveStrategy for RankedBatchStrategy {
    fn tier(&self) -> Tier {
        Tier::RankedBatch
    }

    async fn resolve(
        &self,
        lookup: &dyn ContractLookup,
        batch: &[Identifier],
    ) -> Result<Vec<LookupRow>, LookupError> {
        lookup.ranked_batch(batch).await
    }
}

#[derive(Debug, Default)]
pub struct OrderedBatchStrategy;

#[async_trait]
impl ResolveStrategy for OrderedBatchStrategy {
    fn tier(&self) -> Tier {
        Tier::OrderedBatch
    }

    async fn resolve(
        &self,
        lookup: &dyn ContractLookup,
        batch: &[Identifier],
    ) -> Result<Vec<LookupRow>, LookupError> {
        lookup.ordered_batch(batch).await
    }
}

/// Last tier: never fails. A failing identifier is logged and treated as not found.
#[derive(Debug, Default)]
pub struct PerIdentifierStrategy;

#[async_trait]
impl ResolveStrategy for PerIdentifierStrategy {
    fn tier(&self) -> Tier {
        Tier::PerIdentifier
    }

    async fn resolve(
        &self,
        lookup: &dyn ContractLookup,
        batch: &[Identifier],
    ) -> Result<Vec<LookupRow>, LookupError> {
        let mut rows = Vec::with_capacity(batch.len());
        for id in batch {
            match lookup.top_for(id).await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(err) => debug!(identifier = %id, error = %err, "single lookup failed; unmatched"),
            }
        }
        Ok(rows)
    }
}

pub fn default_cascade() -> Vec<Box<dyn ResolveStrategy>> {
    vec![
        Box::new(RankedBatchStrategy),
        Box::new(OrderedBatchStrategy),
        Box::new(PerIdentifierStrategy),
    ]
}

/// Reduce rows to one record per requested identifier: lowest holder rank, then client
/// name ascending. Rows for identifiers outside `batch` and rows without a client name
/// are dropped.
pub fn select_top_per_identifier(
    rows: Vec<LookupRow>,
    batch: &[Identifier],
) -> Vec<(Identifier, ResolvedRecord)> {
    let requested: HashMap<&str, &Identifier> = batch.iter().map(|id| (id.as_str(), id)).collect();

    let mut keyed: Vec<(Identifier, LookupRow)> = rows
        .into_iter()
        .filter(|row| !row.client_name.trim().is_empty())
        .filter_map(|row| {
            requested
                .get(row.identifier.trim())
                .map(|id| ((*id).clone(), row))
        })
        .collect();
    keyed.sort_by(|(id_a, a), (id_b, b)| {
        id_a.cmp(id_b)
            .then_with(|| holder_rank(&a.holder_role).cmp(&holder_rank(&b.holder_role)))
            .then_with(|| a.client_name.cmp(&b.client_name))
    });

    let mut seen = HashSet::new();
    keyed
        .into_iter()
        .filter(|(id, _)| seen.insert(id.clone()))
        .map(|(id, row)| (id, row.into_record()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub batch_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedBatch {
    pub batch_no: usize,
    pub identifiers: usize,
    pub error: String,
}

/// Accumulated result of a resolution run. Identifiers absent from `records` are unmatched.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub records: HashMap<Identifier, ResolvedRecord>,
    pub candidates: usize,
    pub batches: usize,
    pub tier_counts: BTreeMap<Tier, usize>,
    pub failed_batches: Vec<FailedBatch>,
}

impl Resolution {
    pub fn get(&self, id: &Identifier) -> Option<&ResolvedRecord> {
        self.records.get(id)
    }

    pub fn resolved_count(&self) -> usize {
        self.records.len()
    }
}

pub struct BatchResolver {
    config: ResolverConfig,
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl BatchResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_strategies(config, default_cascade())
    }

    pub fn with_strategies(config: ResolverConfig, strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { config, strategies }
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Resolve every distinct identifier, one batch at a time. Never fails: anything the
    /// cascade cannot answer is simply left out of the returned map.
    pub async fn resolve(&self, lookup: &dyn ContractLookup, identifiers: &[Identifier]) -> Resolution {
        let mut seen = HashSet::new();
        let candidates: Vec<Identifier> = identifiers
            .iter()
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();

        let batch_size = self.batch_size();
        let total_batches = candidates.len().div_ceil(batch_size);
        let mut resolution = Resolution {
            candidates: candidates.len(),
            batches: total_batches,
            ..Default::default()
        };

        info!(
            candidates = candidates.len(),
            batch_size, total_batches, "resolving identifiers"
        );

        for (index, batch) in candidates.chunks(batch_size).enumerate() {
            let batch_no = index + 1;
            let started = Instant::now();
            let mut answered: Option<(Tier, Vec<LookupRow>)> = None;
            let mut last_error: Option<LookupError> = None;

            for strategy in &self.strategies {
                match strategy.resolve(lookup, batch).await {
                    Ok(rows) => {
                        answered = Some((strategy.tier(), rows));
                        break;
                    }
                    Err(err) if err.falls_through() => {
                        warn!(batch_no, tier = strategy.tier().as_str(), error = %err, "tier failed; falling back");
                        last_error = Some(err);
                    }
                    Err(err) => {
                        error!(batch_no, tier = strategy.tier().as_str(), error = %err, "connection failure; batch left unmatched");
                        last_error = Some(err);
                        break;
                    }
                }
            }

            let Some((tier, rows)) = answered else {
                resolution.failed_batches.push(FailedBatch {
                    batch_no,
                    identifiers: batch.len(),
                    error: last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no resolution strategy configured".to_string()),
                });
                continue;
            };

            let mut matched = 0usize;
            for (id, record) in select_top_per_identifier(rows, batch) {
                if !resolution.records.contains_key(&id) {
                    resolution.records.insert(id, record);
                    matched += 1;
                }
            }
            *resolution.tier_counts.entry(tier).or_default() += 1;

            info!(
                batch_no,
                total_batches,
                size = batch.len(),
                tier = tier.as_str(),
                matched,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch resolved"
            );
        }

        resolution
    }
}

/// Placeholder style of the connected backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Self {
        if url.trim_start().to_ascii_lowercase().starts_with("sqlite:") {
            Dialect::Sqlite
        } else {
            Dialect::Postgres
        }
    }

    fn placeholder(&self, position: usize) -> String {
        match self {
            Dialect::Postgres => format!("${position}"),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

const HOLDER_PRIORITY_SQL: &str = r#"CASE
                 WHEN UPPER(TRIM(cart.nombre)) = 'TITULAR' THEN 1
                 WHEN UPPER(TRIM(cart.nombre)) = 'PROPIETARIO' THEN 2
                 ELSE 3
             END"#;

const CONTRACT_JOINS_SQL: &str = r#"
      FROM contratos_clientes cc
      INNER JOIN clientes c ON cc.cod_cliente = c.cod_cliente
      INNER JOIN caracter_titulares cart ON cart.cod_caracter_titular = cc.cod_caracter_titular
      INNER JOIN contratos ct ON cc.cod_contrato = ct.cod_contrato
      INNER JOIN propuesta p ON ct.cod_propuesta = p.cod_propuesta
      INNER JOIN creditos cr ON cr.cod_propuesta = p.cod_propuesta"#;

const ROW_COLUMNS_SQL: &str = r#"
           CAST(p.legajo AS TEXT) AS legajo,
           c.nombre AS client_name,
           cart.nombre AS holder_role,
           CAST(cr.monto AS DOUBLE PRECISION) AS amount,
           CAST(ct.fecha AS TEXT) AS contract_date"#;

pub fn ranked_batch_sql(dialect: Dialect, count: usize) -> String {
    format!(
        r#"
SELECT ranked.legajo, ranked.client_name, ranked.holder_role, ranked.amount, ranked.contract_date
  FROM (
    SELECT {ROW_COLUMNS_SQL},
           ROW_NUMBER() OVER (
             PARTITION BY p.legajo
             ORDER BY {HOLDER_PRIORITY_SQL} ASC,
                      c.nombre ASC
           ) AS rn
      {CONTRACT_JOINS_SQL}
     WHERE p.legajo IN ({placeholders})
  ) ranked
 WHERE ranked.rn = 1
 ORDER BY ranked.legajo
"#,
        placeholders = dialect.placeholders(count)
    )
}

pub fn ordered_batch_sql(dialect: Dialect, count: usize) -> String {
    format!(
        r#"
SELECT {ROW_COLUMNS_SQL}
      {CONTRACT_JOINS_SQL}
 WHERE p.legajo IN ({placeholders})
 ORDER BY p.legajo,
          {HOLDER_PRIORITY_SQL} ASC,
          c.nombre ASC
"#,
        placeholders = dialect.placeholders(count)
    )
}

pub fn single_sql(dialect: Dialect) -> String {
    format!(
        r#"
SELECT {ROW_COLUMNS_SQL}
      {CONTRACT_JOINS_SQL}
 WHERE p.legajo = {placeholder}
 ORDER BY {HOLDER_PRIORITY_SQL} ASC,
          c.nombre ASC
 LIMIT 1
"#,
        placeholder = dialect.placeholder(1)
    )
}

fn decode_row(row: &sqlx::any::AnyRow) -> Result<LookupRow, LookupError> {
    Ok(LookupRow {
        identifier: row.try_get::<String, _>("legajo")?,
        client_name: row
            .try_get::<Option<String>, _>("client_name")?
            .unwrap_or_default(),
        holder_role: row
            .try_get::<Option<String>, _>("holder_role")?
            .unwrap_or_default(),
        amount: row.try_get::<Option<f64>, _>("amount")?,
        contract_date: row.try_get::<Option<String>, _>("contract_date")?,
    })
}

/// sqlx-backed lookup over a single connection, held for the whole run.
pub struct SqlLookup {
    conn: Mutex<AnyConnection>,
    dialect: Dialect,
}

impl SqlLookup {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, LookupError> {
        let url = config
            .to_url()
            .map_err(|err| LookupError::Connection(err.to_string()))?;
        Self::connect_url(&url).await
    }

    pub async fn connect_url(url: &str) -> Result<Self, LookupError> {
        sqlx::any::install_default_drivers();
        let conn = AnyConnection::connect(url).await?;
        Ok(Self::from_connection(conn, Dialect::from_url(url)))
    }

    pub fn from_connection(conn: AnyConnection, dialect: Dialect) -> Self {
        Self {
            conn: Mutex::new(conn),
            dialect,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn ping(&self) -> Result<(), LookupError> {
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        Ok(())
    }

    pub async fn close(self) -> Result<(), LookupError> {
        self.conn.into_inner().close().await?;
        Ok(())
    }

    async fn fetch_rows(&self, sql: &str, ids: &[Identifier]) -> Result<Vec<LookupRow>, LookupError> {
        let mut query = sqlx::query(sql);
        for id in ids {
            query = query.bind(id.as_str().to_string());
        }
        let mut conn = self.conn.lock().await;
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl ContractLookup for SqlLookup {
    async fn ranked_batch(&self, ids: &[Identifier]) -> Result<Vec<LookupRow>, LookupError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = ranked_batch_sql(self.dialect, ids.len());
        self.fetch_rows(&sql, ids).await
    }

    async fn ordered_batch(&self, ids: &[Identifier]) -> Result<Vec<LookupRow>, LookupError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = ordered_batch_sql(self.dialect, ids.len());
        self.fetch_rows(&sql, ids).await
    }

    async fn top_for(&self, id: &Identifier) -> Result<Option<LookupRow>, LookupError> {
        let sql = single_sql(self.dialect);
        let mut rows = self.fetch_rows(&sql, std::slice::from_ref(id)).await?;
        Ok(if rows.is_empty() { None } else { Some(rows.swap_remove(0)) })
    }
}
