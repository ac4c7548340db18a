//! CLI argument definitions and range resolution.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use copernicus_batch::{Granularity, RunDefaults, Selection};
use std::path::PathBuf;

/// Batch download Copernicus climate and ocean datasets over date ranges.
///
/// Files already present in the output directory are skipped, so an
/// interrupted run can simply be started again.
#[derive(Parser, Debug)]
#[command(name = "copernicus-batch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output and progress bars
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (.yaml, .yml or .json)
    #[arg(long, global = true, default_value = "./config/config.yaml")]
    pub config: PathBuf,

    /// Output directory, replacing the configured one
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Let command-line values win over the config file's `defaults` section
    #[arg(long, global = true)]
    pub cli_override: bool,

    #[command(subcommand)]
    pub service: Service,
}

#[derive(Subcommand, Debug)]
pub enum Service {
    /// Climate Data Store (ERA5 and friends)
    C3s(RangeArgs),
    /// Copernicus Marine
    Cmems(RangeArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RangeArgs {
    /// List the configured datasets and exit
    #[arg(long)]
    pub list_datasets: bool,

    /// First period: YYYY-MM (monthly) or YYYY-MM-DD (daily/hourly)
    #[arg(long)]
    pub start_date: Option<String>,

    /// Last period, same format as --start-date
    #[arg(long)]
    pub end_date: Option<String>,

    /// First year of a monthly range (alternative to --start-date)
    #[arg(long)]
    pub start_year: Option<i32>,

    /// Last year of a monthly range
    #[arg(long)]
    pub end_year: Option<i32>,

    /// First month of --start-year (defaults to 1)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    pub start_month: Option<u32>,

    /// Last month of --end-year (defaults to 12)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    pub end_month: Option<u32>,

    /// Dataset name from the config registry
    #[arg(long)]
    pub dataset: Option<String>,

    /// Variables to download, replacing the registry's list
    #[arg(long, num_args = 1..)]
    pub variables: Option<Vec<String>>,

    /// Hours of day (HH:MM) for hourly downloads
    #[arg(long, num_args = 1..)]
    pub hours: Option<Vec<String>>,

    /// Treat YYYY-MM-DD dates as hourly rather than daily
    #[arg(long)]
    pub hourly: bool,
}

/// The range a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Months {
        start: String,
        end: String,
    },
    Years {
        start_year: i32,
        end_year: i32,
        start_month: Option<u32>,
        end_month: Option<u32>,
    },
    Days {
        start: String,
        end: String,
        hourly: bool,
    },
}

impl Plan {
    pub fn granularity(&self) -> Granularity {
        match self {
            Plan::Months { .. } | Plan::Years { .. } => Granularity::Monthly,
            Plan::Days { hourly: false, .. } => Granularity::Daily,
            Plan::Days { hourly: true, .. } => Granularity::Hourly,
        }
    }
}

/// Picks the mode from the literal date lengths: 7 characters is monthly,
/// 10 is daily (or hourly when asked for).
pub fn detect_granularity(start: &str, end: &str, hourly: bool) -> Result<Granularity> {
    match (start.len(), end.len()) {
        (7, 7) if !hourly => Ok(Granularity::Monthly),
        (7, 7) => bail!("--hourly needs YYYY-MM-DD dates, got {} and {}", start, end),
        (10, 10) if hourly => Ok(Granularity::Hourly),
        (10, 10) => Ok(Granularity::Daily),
        _ => bail!(
            "--start-date and --end-date must both be YYYY-MM or both YYYY-MM-DD, got {:?} and {:?}",
            start,
            end
        ),
    }
}

/// Command-line value unless the config has one and the command line may not
/// override it.
fn pick<T>(cli: Option<T>, config: Option<T>, cli_wins: bool) -> Option<T> {
    match (cli, config) {
        (Some(cli), Some(config)) => Some(if cli_wins { cli } else { config }),
        (cli, config) => cli.or(config),
    }
}

/// Combines the command line with the service's config `defaults` into a plan
/// and a selection.
pub fn resolve(
    args: &RangeArgs,
    defaults: &RunDefaults,
    cli_wins: bool,
    default_dataset: impl Fn(Granularity) -> &'static str,
) -> Result<(Plan, Selection)> {
    // Explicit years are a command-line range of their own: they replace the
    // config dates when the command line wins or the config has none.
    let cli_dates = args.start_date.is_some() || args.end_date.is_some();
    let cli_years = args.start_year.is_some() || args.end_year.is_some();
    let config_dates = defaults.start_date.is_some() || defaults.end_date.is_some();
    let (start, end) = if cli_years && !cli_dates && (cli_wins || !config_dates) {
        (None, None)
    } else {
        (
            pick(args.start_date.clone(), defaults.start_date.clone(), cli_wins),
            pick(args.end_date.clone(), defaults.end_date.clone(), cli_wins),
        )
    };

    let plan = match (start, end, args.start_year, args.end_year) {
        (Some(start), Some(end), _, _) => match detect_granularity(&start, &end, args.hourly)? {
            Granularity::Monthly => Plan::Months { start, end },
            g => Plan::Days {
                start,
                end,
                hourly: g == Granularity::Hourly,
            },
        },
        (None, None, Some(start_year), Some(end_year)) => {
            if args.hourly {
                bail!("--hourly needs --start-date/--end-date as YYYY-MM-DD");
            }
            Plan::Years {
                start_year,
                end_year,
                start_month: args.start_month,
                end_month: args.end_month,
            }
        }
        (Some(_), None, _, _) | (None, Some(_), _, _) => {
            bail!("both --start-date and --end-date are required")
        }
        _ => bail!("missing range: pass --start-date/--end-date or --start-year/--end-year"),
    };

    let dataset = pick(args.dataset.clone(), defaults.dataset.clone(), cli_wins)
        .unwrap_or_else(|| default_dataset(plan.granularity()).to_string());
    let selection = Selection::new(dataset)
        .with_variables(pick(args.variables.clone(), defaults.variables.clone(), cli_wins))
        .with_hours(pick(args.hours.clone(), defaults.hours.clone(), cli_wins));

    Ok((plan, selection))
}
