use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use backfill_core::{parse_column_ref, Identifier};
use backfill_pipeline::{Pipeline, PipelineConfig};
use backfill_resolver::{BatchResolver, ResolverConfig, SqlLookup};
use backfill_storage::default_output_path;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "backfill")]
#[command(about = "Fill client columns of a contracts spreadsheet from the contracts database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile a spreadsheet export and write the filled copy.
    Run {
        input: PathBuf,
        /// Defaults to `<stem>_PROCESADO.<ext>` next to the input.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Resolve proposal identifiers and print the chosen holder.
    Lookup {
        #[arg(required = true)]
        ids: Vec<String>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Start the HTTP surface.
    Serve,
}

#[derive(Debug, Args)]
struct Overrides {
    /// YAML file with pipeline and database settings; the environment is used otherwise.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    source_column: Option<String>,
    #[arg(long)]
    client_column: Option<String>,
    #[arg(long)]
    data_start_row: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

impl Overrides {
    fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_yaml_file(path)?,
            None => PipelineConfig::from_env()?,
        };
        if let Some(url) = &self.database_url {
            config.database.url = Some(url.clone());
        }
        if let Some(raw) = &self.source_column {
            config.layout.source_column = parse_column_ref(raw)?;
        }
        if let Some(raw) = &self.client_column {
            config.layout.client_column = parse_column_ref(raw)?;
        }
        if let Some(row) = self.data_start_row {
            config.data_start_row = row;
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if self.overwrite {
            config.overwrite = true;
        }
        if self.reports_dir.is_some() {
            config.reports_dir = self.reports_dir.clone();
        }
        Ok(config)
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backfill=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn lookup_ids(config: &PipelineConfig, raw_ids: &[String]) -> Result<()> {
    let mut ids = Vec::with_capacity(raw_ids.len());
    for raw in raw_ids {
        match Identifier::parse(raw) {
            Some(id) => ids.push(id),
            None => bail!("invalid proposal identifier {raw:?}"),
        }
    }

    config.database.validate()?;
    let lookup = SqlLookup::connect(&config.database)
        .await
        .context("connecting to the contracts database")?;
    let resolution = BatchResolver::new(ResolverConfig {
        batch_size: config.batch_size,
    })
    .resolve(&lookup, &ids)
    .await;
    lookup.close().await.context("closing database connection")?;

    for id in &ids {
        match resolution.get(id) {
            Some(record) => println!(
                "{id}\t{}\t{}\t{}\t{}",
                record.client_name,
                record.holder_role,
                record.amount_text(),
                record.contract_date_text()
            ),
            None => println!("{id}\t(not found)"),
        }
    }
    for failed in &resolution.failed_batches {
        eprintln!("batch {} failed: {}", failed.batch_no, failed.error);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            output,
            overrides,
        } => {
            let config = overrides.resolve()?;
            let output = output.unwrap_or_else(|| default_output_path(&input));
            info!(input = %input.display(), output = %output.display(), "starting run");
            let report = Pipeline::new(config)?.run_file(&input, &output).await?;
            let s = &report.summary;
            println!(
                "run complete: run_id={} extracted={} resolved={} filled={} overwritten={} unmatched={} efficiency={:.1}% output={}",
                report.run_id,
                s.extracted,
                s.resolved,
                s.filled,
                s.overwritten,
                s.unmatched,
                s.match_efficiency * 100.0,
                report.output_path
            );
            if let Some(dir) = &report.reports_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Lookup { ids, overrides } => {
            let config = overrides.resolve()?;
            lookup_ids(&config, &ids).await?;
        }
        Commands::Serve => {
            backfill_web::serve_from_env().await?;
        }
    }

    Ok(())
}
