//! CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use copernicus_batch::{
    C3sDownloader, CmemsDownloader, DownloadSummary, Granularity, RangeResults, Registry, Settings,
    list_available_datasets,
};
use serde_json::json;
use tracing::{debug, info, info_span};

mod cli;

use cli::{Args, Plan, Service, resolve};

fn c3s_default_dataset(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Monthly => "era5_monthly",
        Granularity::Daily => "era5_daily",
        Granularity::Hourly => "era5_hourly",
    }
}

fn cmems_default_dataset(_: Granularity) -> &'static str {
    "glo12_monthly"
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut settings = Settings::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    if let Some(dir) = &args.output_dir {
        settings.merge(json!({ "output_base_dir": dir }));
    }
    let progress = !args.quiet;

    let results = match &args.service {
        Service::C3s(range) => {
            let section = settings.c3s()?;
            if range.list_datasets {
                print_datasets(&section.datasets);
                return Ok(());
            }

            let (plan, selection) = resolve(range, &section.defaults, args.cli_override, c3s_default_dataset)?;
            let span = info_span!("c3s", dataset = %selection.dataset);
            let mut downloader = C3sDownloader::new(&settings, span, progress)?;
            info!(?plan, "starting C3S download");

            match plan {
                Plan::Months { start, end } => downloader.download_monthly_range(&start, &end, &selection)?,
                Plan::Years {
                    start_year,
                    end_year,
                    start_month,
                    end_month,
                } => downloader.download_range(start_year, end_year, start_month, end_month, &selection)?,
                Plan::Days { start, end, hourly: false } => {
                    downloader.download_daily_range(&start, &end, &selection)?
                }
                Plan::Days { start, end, hourly: true } => {
                    downloader.download_hourly_range(&start, &end, &selection)?
                }
            }
        }
        Service::Cmems(range) => {
            let section = settings.cmems()?;
            if range.list_datasets {
                print_datasets(&section.datasets);
                return Ok(());
            }

            let (plan, selection) = resolve(range, &section.defaults, args.cli_override, cmems_default_dataset)?;
            let span = info_span!("cmems", dataset = %selection.dataset);
            let mut downloader = CmemsDownloader::new(&settings, span, progress)?;
            info!(?plan, "starting CMEMS download");

            match plan {
                Plan::Months { start, end } => downloader.download_monthly_range(&start, &end, &selection)?,
                Plan::Years {
                    start_year,
                    end_year,
                    start_month,
                    end_month,
                } => downloader.download_range(start_year, end_year, start_month, end_month, &selection)?,
                Plan::Days { start, end, hourly: false } => {
                    downloader.download_daily_range(&start, &end, &selection)?
                }
                Plan::Days { start, end, hourly: true } => {
                    downloader.download_hourly_range(&start, &end, &selection)?
                }
            }
        }
    };

    report(&results);
    Ok(())
}

fn print_datasets(registry: &Registry) {
    println!("Available datasets:");
    for (name, description) in list_available_datasets(registry) {
        println!("  {}: {}", name, description);
    }
}

fn report(results: &RangeResults) {
    println!();
    print!("{}", DownloadSummary::from_results(results));
}
