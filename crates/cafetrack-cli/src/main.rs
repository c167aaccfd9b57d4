use std::path::PathBuf;

use anyhow::Result;
use cafetrack_etl::EtlConfig;
use cafetrack_storage::{fetch_metrics, Metrics, StoreConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cafetrack")]
#[command(about = "CafeTrack admissions ETL and analytics")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the applicants table and its identity index.
    InitDb,
    /// Read the JSONL feed and load new rows into the store.
    Load {
        /// Input file, overriding CAFETRACK_INPUT.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Print the analytics catalog for the configured target term.
    Report,
    /// Run the web dashboard.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Report) {
        Commands::InitDb => {
            let pool = StoreConfig::from_env().connect().await?;
            cafetrack_storage::ensure_schema(&pool).await?;
            println!("schema ready");
        }
        Commands::Load { input } => {
            let mut config = EtlConfig::from_env();
            if let Some(path) = input {
                config.input_path = path;
            }
            let pool = config.store.connect().await?;
            let summary = cafetrack_etl::run_load_from_path(&pool, &config.input_path).await?;
            println!(
                "load complete: run_id={} read={} inserted={} skipped={} malformed={}",
                summary.run_id,
                summary.read,
                summary.inserted,
                summary.skipped,
                summary.malformed_lines
            );
        }
        Commands::Report => {
            let config = StoreConfig::from_env();
            let pool = config.connect().await?;
            let metrics = fetch_metrics(&pool, &config.target_term).await?;
            print_report(&metrics);
        }
        Commands::Serve => {
            cafetrack_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn print_report(metrics: &Metrics) {
    println!("CafeTrack report, target term {}", metrics.target_term);
    println!("  total entries:            {}", metrics.total);
    println!("  entries for target term:  {}", metrics.term_count);
    println!(
        "  percent international:    {}",
        fmt_pct(metrics.pct_international)
    );
    println!("  average GPA:              {}", fmt_avg(metrics.avg_gpa));
    println!(
        "  average GRE quant:        {}",
        fmt_avg(metrics.avg_gre_quant)
    );
    println!(
        "  average GRE verbal:       {}",
        fmt_avg(metrics.avg_gre_verbal)
    );
    println!(
        "  average GRE AW:           {}",
        fmt_avg(metrics.avg_gre_aw)
    );
    println!(
        "  average GPA (American):   {}",
        fmt_avg(metrics.avg_gpa_american)
    );
    println!(
        "  acceptance rate:          {}",
        fmt_pct(metrics.acceptance_pct)
    );
    println!(
        "  average GPA of accepted:  {}",
        fmt_avg(metrics.avg_gpa_accepted)
    );
    if !metrics.term_distribution.is_empty() {
        println!("  entries by term:");
        for (term, count) in &metrics.term_distribution {
            println!("    {term}: {count}");
        }
    }
    if !metrics.decision_distribution.is_empty() {
        println!("  entries by decision:");
        for (decision, count) in &metrics.decision_distribution {
            println!("    {decision}: {count}");
        }
    }
    if !metrics.top_universities.is_empty() {
        println!("  top universities for target term:");
        for (name, count) in &metrics.top_universities {
            println!("    {name}: {count}");
        }
    }
}

fn fmt_avg(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}

fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}%"))
}
