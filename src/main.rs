use chrono::Local;
use clap::{Parser, Subcommand};
use glucose_scrap::config::{Credentials, OutputFormat, Settings};
use glucose_scrap::process::{investigate_site, process_site};
use glucose_scrap::record::DateFilter;
use glucose_scrap::{info_time, Result};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glucose-scrap", about = "Scrapes blood sugar records from the measurement portal")]
struct Cli {
    /// Settings file, without extension
    #[arg(long, global = true)]
    config: Option<String>,

    /// Run the browser without a window
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in, extract the records and write them out
    Scrape {
        /// Only this month, as YYYY-MM
        #[arg(long)]
        month: Option<String>,

        /// json, csv or both
        #[arg(long)]
        format: Option<OutputFormat>,
    },
    /// Dump screenshots, page sources and form inventories for tuning selectors
    Investigate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if cli.headless {
        settings.browser.headless = true;
    }
    let credentials = Credentials::from_env();

    let start_time = Local::now();
    match cli.command {
        Command::Scrape { month, format } => {
            if let Some(format) = format {
                settings.output.format = format;
            }
            let filter = month.as_deref().map(str::parse::<DateFilter>).transpose()?;
            let report = process_site(settings, &credentials, filter.as_ref()).await?;
            println!("Records: {}", report.records.len());
            for path in &report.written {
                println!("Wrote {}", path.display());
            }
        }
        Command::Investigate => investigate_site(settings, &credentials).await?,
    }
    info_time!(start_time, "Full program time:");

    Ok(())
}
