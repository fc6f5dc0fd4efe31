use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod aggregate;
mod config;
mod db;
mod error;
mod models;
mod report;

use crate::config::DashboardConfig;
use crate::models::{AggregationResult, ProductionScope, QueryWindow, WeekRange};

#[derive(Parser)]
#[command(name = "defect-dashboard")]
#[command(about = "Defect Pareto and weekly failure-rate dashboard for production lines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Selection {
    /// 0 for final assembly, 1 for every other production type
    #[arg(long, default_value_t = 0)]
    scope: i32,
    /// Use the N most recent production days
    #[arg(long, conflicts_with = "weeks")]
    days: Option<u32>,
    /// Inclusive week range such as 202641..202642
    #[arg(long)]
    weeks: Option<WeekRange>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load two weeks of sample production data
    Seed,
    /// Import daily production and defect records from CSV files
    #[command(group(
        ArgGroup::new("files")
            .args(["production", "defects"])
            .required(true)
            .multiple(true)
    ))]
    Import {
        #[arg(long)]
        production: Option<PathBuf>,
        #[arg(long)]
        defects: Option<PathBuf>,
    },
    /// Print the defect Pareto for a window
    Pareto {
        #[command(flatten)]
        selection: Selection,
    },
    /// Generate the full dashboard report
    Report {
        #[command(flatten)]
        selection: Selection,
        /// Production days before the window used as the historical baseline
        #[arg(long, default_value_t = 28)]
        history_days: u32,
        #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
        format: OutputFormat,
        #[arg(long, default_value = "dashboard.md")]
        out: PathBuf,
    },
}

async fn resolve_window(pool: &PgPool, selection: &Selection) -> anyhow::Result<QueryWindow> {
    if let Some(days) = selection.days {
        return Ok(QueryWindow::LastDays(days.max(1)));
    }
    if let Some(range) = selection.weeks {
        return Ok(QueryWindow::Weeks(range));
    }
    let range = db::latest_weeks(pool, 2)
        .await?
        .context("no production records found; run `seed` or `import` first")?;
    Ok(QueryWindow::Weeks(range))
}

/// Fetches both row sets concurrently and aggregates them for the scope.
async fn load_dashboard(
    pool: &PgPool,
    scope: ProductionScope,
    window: &QueryWindow,
) -> anyhow::Result<AggregationResult> {
    let (defect_rows, daily_records) = tokio::try_join!(
        db::fetch_defect_rows(pool, window),
        db::fetch_daily_records(pool, window),
    )?;
    let result = aggregate::aggregate(scope, &defect_rows, &daily_records)
        .context("failed to aggregate dashboard data")?;
    info!(
        scope = scope.label(),
        top_defects = result.top_defect_ids.len(),
        weeks = result.weekly_rates.len(),
        "dashboard aggregated"
    );
    Ok(result)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "production_defect_dashboard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = DashboardConfig::from_env()?;
    let pool = db::connect(&config).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import {
            production,
            defects,
        } => {
            if let Some(path) = production {
                let inserted = db::import_production_csv(&pool, &path).await?;
                println!("Inserted {inserted} production records from {}.", path.display());
            }
            if let Some(path) = defects {
                let inserted = db::import_defects_csv(&pool, &path).await?;
                println!("Inserted {inserted} defect records from {}.", path.display());
            }
        }
        Commands::Pareto { selection } => {
            let scope = ProductionScope::from_code(selection.scope)?;
            let window = resolve_window(&pool, &selection).await?;
            let result = load_dashboard(&pool, scope, &window).await?;

            if !result.has_failures() {
                println!("No failures reported for {} ({window}).", scope.label());
                return Ok(());
            }
            report::print_summary(&window.to_string(), &result);
        }
        Commands::Report {
            selection,
            history_days,
            format,
            out,
        } => {
            let scope = ProductionScope::from_code(selection.scope)?;
            let window = resolve_window(&pool, &selection).await?;
            let result = load_dashboard(&pool, scope, &window).await?;

            let history = match result.earliest_date_id {
                Some(before) => {
                    db::fetch_historical_rates(
                        &pool,
                        scope,
                        &result.top_defect_ids,
                        before,
                        history_days,
                    )
                    .await?
                }
                None => {
                    warn!("no dated defects in window; skipping historical comparison");
                    Vec::new()
                }
            };

            let rendered = match format {
                OutputFormat::Markdown => report::build_report(&window.to_string(), &result, &history),
                OutputFormat::Json => {
                    report::DashboardSnapshot::new(window.to_string(), &result, &history).to_json()?
                }
            };
            std::fs::write(&out, rendered)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
