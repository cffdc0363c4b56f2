use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use biomass_adapters::CsvParser;
use biomass_core::CanonicalField;
use biomass_query::{export_csv, select, FilterState};
use biomass_storage::{MemoryRowStore, PgRowStore, RowStore};
use biomass_sync::{
    build_refresh_scheduler, load_scope, working_set_from_store, IngestionPipeline,
    RefreshPipeline, SourceRegistry, SyncConfig,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "biomass-cli")]
#[command(about = "Biomass survey ingestion and query tool")]
struct Cli {
    /// Fallback log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source and write a run report.
    Refresh {
        /// Keep running and refresh on BIOMASS_REFRESH_CRON.
        #[arg(long)]
        watch: bool,
    },
    /// Append CSV files to the upload table.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        table: Option<String>,
    },
    /// Filter and sort rows for a region scope.
    Query(QueryArgs),
    Migrate,
    Serve,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    district: Option<String>,
    #[arg(long)]
    taluka: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    village: Option<String>,
    #[arg(long)]
    density_category: Option<String>,
    #[arg(long)]
    biomass_range: Option<String>,
    /// `min-max`, either side optional.
    #[arg(long)]
    quantity_range: Option<String>,
    /// Column key or label, e.g. `quantity_per_hectare`.
    #[arg(long)]
    sort: Option<CanonicalField>,
    #[arg(long, requires = "sort")]
    desc: bool,
    /// Also query rows from the upload table.
    #[arg(long)]
    include_uploads: bool,
    /// Write CSV here instead of printing a table; `-` for stdout.
    #[arg(long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Refresh { watch: false }) {
        Commands::Refresh { watch } => refresh(config, watch).await?,
        Commands::Ingest { files, table } => ingest(config, files, table).await?,
        Commands::Query(args) => query(config, args).await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgRowStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let pipeline = Arc::new(refresh_pipeline(config.clone()).await?);
            let scheduler = build_refresh_scheduler(pipeline).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            let state = biomass_web::AppState::from_config(config).await?;
            biomass_web::serve(state, port).await?;
        }
    }

    Ok(())
}

async fn refresh_pipeline(config: SyncConfig) -> Result<RefreshPipeline> {
    let registry = SourceRegistry::load(&config.sources_path()).await?;
    RefreshPipeline::new(config, registry)
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn RowStore>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(
            PgRowStore::connect(url).await.context("connecting to database")?,
        )),
        None => {
            warn!("DATABASE_URL not set; rows are kept in memory for this process only");
            Ok(Arc::new(MemoryRowStore::new()))
        }
    }
}

async fn refresh(config: SyncConfig, watch: bool) -> Result<()> {
    let scheduler_config = SyncConfig {
        scheduler_enabled: watch,
        ..config.clone()
    };
    let pipeline = Arc::new(refresh_pipeline(scheduler_config).await?);

    let summary = pipeline.run_once().await?;
    println!(
        "refresh complete: run_id={} sources={} loaded={} failed={} rows={} reports={}",
        summary.run_id,
        summary.enabled_sources,
        summary.loaded_sources.len(),
        summary.failed_sources.len(),
        summary.rows,
        summary.reports_dir
    );
    for failure in &summary.failed_sources {
        eprintln!("  {} failed: {}", failure.source_id, failure.reason);
    }

    if let Some(mut sched) = build_refresh_scheduler(pipeline).await? {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.refresh_cron, "waiting for scheduled refreshes; ctrl-c to stop");
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn ingest(config: SyncConfig, files: Vec<PathBuf>, table: Option<String>) -> Result<()> {
    let store = open_store(&config).await?;
    let table = table.unwrap_or_else(|| config.upload_table.clone());
    let pipeline = IngestionPipeline::new(store, table);

    let mut fatal = 0usize;
    for (path, result) in files.iter().zip(pipeline.ingest_many(&files[..]).await) {
        match result {
            Ok(report) => {
                println!(
                    "{}: inserted {} row(s), {} failed, {} warning(s)",
                    report.filename,
                    report.inserted_count,
                    report.failures.len(),
                    report.warnings.len()
                );
                for failure in &report.failures {
                    println!("  row {}: {}", failure.row_index, failure.reason);
                }
            }
            Err(err) => {
                if err.is_fatal() {
                    fatal += 1;
                }
                eprintln!("{}: {err}", path.display());
            }
        }
    }

    if fatal > 0 {
        bail!("{fatal} of {} file(s) could not be ingested", files.len());
    }
    Ok(())
}

async fn query(config: SyncConfig, args: QueryArgs) -> Result<()> {
    let registry = SourceRegistry::load(&config.sources_path()).await?;
    let regions = &registry.regions;

    let mut filter = FilterState::default()
        .with_district(args.district, regions)
        .with_taluka(args.taluka, regions)
        .with_search(args.search)
        .with_village(args.village)
        .with_density_category(args.density_category)
        .with_biomass_range(args.biomass_range)
        .with_quantity_range(args.quantity_range);
    if let Some(field) = args.sort {
        filter = filter.toggle_sort(field);
        if args.desc {
            filter = filter.toggle_sort(field);
        }
    }

    let fetcher = config.build_fetcher()?;
    let outcome = load_scope(
        &fetcher,
        &CsvParser::default(),
        &registry,
        &filter.scope(),
        &config.workspace_root,
    )
    .await?;
    for failure in &outcome.failed {
        eprintln!("warning: {} unavailable: {}", failure.source_id, failure.reason);
    }

    let mut rows = outcome.rows;
    if args.include_uploads {
        let store = open_store(&config).await?;
        rows.extend(working_set_from_store(store.as_ref(), &config.upload_table).await?);
    }

    let selected = select(&rows, &filter, regions);
    match args.export {
        Some(path) => {
            let csv = export_csv(selected.iter().copied())?;
            if path.as_os_str() == "-" {
                print!("{csv}");
            } else {
                tokio::fs::write(&path, csv)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                eprintln!("wrote {} row(s) to {}", selected.len(), path.display());
            }
        }
        None => {
            let header: Vec<&str> = CanonicalField::ALL.iter().map(|f| f.label()).collect();
            println!("{}", header.join(" | "));
            for row in &selected {
                let cells: Vec<String> = CanonicalField::ALL
                    .iter()
                    .map(|f| row.value(*f).unwrap_or_default())
                    .collect();
                println!("{}", cells.join(" | "));
            }
            eprintln!("showing {} of {} rows", selected.len(), rows.len());
        }
    }
    Ok(())
}
