use backfill_pipeline::{ColumnLayout, Pipeline, PipelineConfig};
use backfill_resolver::DatabaseConfig;
use backfill_storage::default_output_path;
use sqlx::AnyConnection;
use sqlx::Connection;
use tempfile::tempdir;

const SEED: &[&str] = &[
    "CREATE TABLE clientes (cod_cliente INTEGER PRIMARY KEY, nombre TEXT NOT NULL)",
    "CREATE TABLE caracter_titulares (cod_caracter_titular INTEGER PRIMARY KEY, nombre TEXT NOT NULL)",
    "CREATE TABLE propuesta (cod_propuesta INTEGER PRIMARY KEY, legajo TEXT NOT NULL)",
    "CREATE TABLE contratos (cod_contrato INTEGER PRIMARY KEY, cod_propuesta INTEGER NOT NULL, fecha TEXT)",
    "CREATE TABLE contratos_clientes (cod_contrato INTEGER NOT NULL, cod_cliente INTEGER NOT NULL, cod_caracter_titular INTEGER NOT NULL)",
    "CREATE TABLE creditos (cod_propuesta INTEGER NOT NULL, monto REAL)",
    "INSERT INTO caracter_titulares VALUES (1, 'TITULAR'), (2, 'PROPIETARIO'), (3, 'GARANTE')",
    "INSERT INTO clientes VALUES (1, 'Garante Gomez'), (2, 'Juan Perez'), (3, 'Maria Lopez')",
    "INSERT INTO propuesta VALUES (10, '642799'), (20, '642800')",
    "INSERT INTO contratos VALUES (100, 10, '2024-03-01 00:00:00'), (200, 20, '2023-07-15')",
    "INSERT INTO creditos VALUES (10, 125000), (20, 98000.456)",
    "INSERT INTO contratos_clientes VALUES (100, 1, 3), (100, 2, 1), (200, 3, 2)",
];

async fn seed(path: &std::path::Path) {
    sqlx::any::install_default_drivers();
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let mut conn = AnyConnection::connect(&url).await.expect("create sqlite file");
    for statement in SEED {
        sqlx::query(statement)
            .execute(&mut conn)
            .await
            .expect("seed statement");
    }
    conn.close().await.expect("close seed connection");
}

fn config(db: &std::path::Path, reports: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        layout: ColumnLayout {
            source_column: 1,
            client_column: 2,
            amount_column: Some(4),
            contract_date_column: Some(3),
        },
        data_start_row: 3,
        reports_dir: Some(reports.to_path_buf()),
        database: DatabaseConfig::sqlite(db.display().to_string()),
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn run_file_fills_from_sqlite_and_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("contracts.db");
    seed(&db).await;

    let input = dir.path().join("ORDEN DE VENTA.csv");
    std::fs::write(
        &input,
        "ORDEN DE VENTA,,,,\n\
         #,PROPUESTA,CLIENTE,FECHA,IMPORTE\n\
         1,642799,CLIENTE,,\n\
         2,642800,Juan Perez,,\n\
         3,999999,,,\n\
         4,12,,,\n",
    )
    .expect("write input");

    let pipeline = Pipeline::new(config(&db, &dir.path().join("reports"))).expect("pipeline");
    let output = default_output_path(&input);
    let report = pipeline.run_file(&input, &output).await.expect("first run");

    assert_eq!(report.summary.extracted, 3);
    assert_eq!(report.summary.resolved, 2);
    assert_eq!(report.summary.filled, 1);
    assert_eq!(report.summary.titular_fills, 1);
    assert_eq!(report.summary.already_filled_conflicting, 1);
    assert_eq!(report.summary.unmatched, 1);
    assert_eq!(report.summary.unmatched_samples[0].row, 5);
    assert!(output.ends_with("ORDEN DE VENTA_PROCESADO.csv"));

    let written = std::fs::read_to_string(&output).expect("output");
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines[2], "1,642799,Juan Perez,2024-03-01,125000.00");
    assert_eq!(lines[3], "2,642800,Juan Perez,,");
    assert_eq!(lines[5], "4,12,,,");

    let second = pipeline.run_file(&output, &output).await.expect("second run");
    assert_eq!(second.summary.filled, 0);
    assert_eq!(second.summary.already_filled_matching, 1);
    assert_eq!(std::fs::read_to_string(&output).expect("output"), written);
}

#[tokio::test]
async fn run_file_rejects_missing_database_path_before_reading() {
    let dir = tempdir().expect("tempdir");
    let pipeline = Pipeline::new(PipelineConfig {
        database: DatabaseConfig::default(),
        ..PipelineConfig::default()
    })
    .expect("pipeline");

    let err = pipeline
        .run_file(&dir.path().join("missing.csv"), &dir.path().join("out.csv"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("database_path"));
}
