use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::commands::convert::ConvertOptions;
use crate::commands::fetch::FetchOptions;
use crate::commands::merge::MergeOptions;
use crate::commands::split::SplitOptions;
use crate::commands::tag::TagOptions;
use crate::commands::{self, CommandReport, RangeOptions, StepOptions};
use crate::config::load_config;
use crate::logging;
use crate::paths::resolve_paths;

#[derive(Parser, Debug)]
#[command(name = "gnss-ingest", version)]
#[command(about = "Scheduled GNSS receiver file ingestion", long_about = None)]
pub struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Print the command report as JSON
    #[arg(long, global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download one remote file per epoch
    Fetch(FetchArgs),
    /// Convert raw receiver files to RINEX
    Convert(ConvertArgs),
    /// Join short files into one file per site and period
    Merge(MergeArgs),
    /// Cut one long file into one file per epoch
    Split(SplitArgs),
    /// Rewrite file headers from site metadata
    Tag(TagArgs),
    /// Print the epochs a range generates
    Epochs(RangeArgs),
    /// Show resolved paths, configuration and active env overrides
    Status,
}

#[derive(Args, Debug, Clone)]
pub struct RangeArgs {
    /// First epoch: RFC 3339, YYYY-MM-DD, YYYY-DDD, today, "3 days ago"...
    #[arg(long)]
    pub start: Option<String>,
    /// Last epoch; defaults to now when only --start is given
    #[arg(long)]
    pub end: Option<String>,
    /// Explicit epoch, repeatable; replaces --start/--end
    #[arg(long = "epoch")]
    pub epochs: Vec<String>,
    #[arg(long, default_value = "1d")]
    pub period: String,
    /// ceil, floor, round or none
    #[arg(long, default_value = "floor")]
    pub round: String,
    #[arg(long, default_value = "UTC")]
    pub tz: String,
}

impl From<RangeArgs> for RangeOptions {
    fn from(args: RangeArgs) -> Self {
        Self {
            start: args.start,
            end: args.end,
            epochs: args.epochs,
            period: args.period,
            round: args.round,
            tz: args.tz,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StepArgs {
    /// Output directory template, e.g. /data/<SITE_ID4>/%Y/%j
    #[arg(long = "out")]
    pub out_dir: String,
    /// Input directory template, listed when no files are given
    #[arg(long = "inp")]
    pub inp_dir: Option<String>,
    #[arg(long)]
    pub site: Option<String>,
    /// Session field KEY=VALUE, repeatable
    #[arg(long = "session")]
    pub session: Vec<String>,
    /// Site field KEY=VALUE, repeatable
    #[arg(long = "field")]
    pub fields: Vec<String>,
    /// Converter option KEY=VALUE, repeatable
    #[arg(long = "option")]
    pub options: Vec<String>,
    /// Keep only rows whose file name matches this regex
    #[arg(long)]
    pub filter: Option<String>,
}

impl From<StepArgs> for StepOptions {
    fn from(args: StepArgs) -> Self {
        Self {
            out_dir: args.out_dir,
            inp_dir: args.inp_dir,
            site: args.site,
            session: args.session,
            fields: args.fields,
            options: args.options,
            filter: args.filter,
        }
    }
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    #[command(flatten)]
    pub step: StepArgs,
    #[command(flatten)]
    pub range: RangeArgs,
    /// Remote location template: http(s) URL or local mirror path
    #[arg(long)]
    pub remote: String,
    /// Local file name template; defaults to the remote name
    #[arg(long)]
    pub local_name: Option<String>,
    /// Check remote directory listings before downloading
    #[arg(long = "list")]
    pub check_listing: bool,
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    #[command(flatten)]
    pub step: StepArgs,
    #[command(flatten)]
    pub range: RangeArgs,
    pub files: Vec<PathBuf>,
    /// Force a converter instead of detecting one per file
    #[arg(long)]
    pub converter: Option<String>,
    #[arg(long)]
    pub output_name: Option<String>,
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    #[command(flatten)]
    pub step: StepArgs,
    #[command(flatten)]
    pub range: RangeArgs,
    pub files: Vec<PathBuf>,
    #[arg(long)]
    pub converter: Option<String>,
    /// Merged file name template, e.g. <site_id4>%j0.%yo
    #[arg(long)]
    pub output_name: String,
    /// Rolling window anchor: epoch index or instant
    #[arg(long, allow_hyphen_values = true)]
    pub rolling: Option<String>,
}

#[derive(Args, Debug)]
pub struct SplitArgs {
    #[command(flatten)]
    pub step: StepArgs,
    #[command(flatten)]
    pub range: RangeArgs,
    #[arg(long)]
    pub input: PathBuf,
    #[arg(long)]
    pub converter: Option<String>,
    /// Part file name template, e.g. <site_id4>%j<HOURCHAR>.%yo
    #[arg(long)]
    pub output_name: String,
}

#[derive(Args, Debug)]
pub struct TagArgs {
    #[command(flatten)]
    pub step: StepArgs,
    #[command(flatten)]
    pub range: RangeArgs,
    pub files: Vec<PathBuf>,
    #[arg(long)]
    pub converter: Option<String>,
    #[arg(long)]
    pub output_name: Option<String>,
    /// Directory of <site>.toml metadata files
    #[arg(long)]
    pub metadata_dir: Option<PathBuf>,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let state = if report.ok { "ok" } else { "issues" };
    println!("{}: {state} (exit {})", report.command, report.exit_code);
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

/// Parses arguments, builds the configuration once and runs one command.
/// Returns the process exit status.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;
    debug!(config = %paths.config_file.display(), "configuration loaded");

    let report = match cli.command {
        Commands::Fetch(args) => commands::fetch::run(
            &FetchOptions {
                step: args.step.into(),
                range: args.range.into(),
                remote: args.remote,
                local_name: args.local_name,
                check_listing: args.check_listing,
            },
            &cfg,
        )?,
        Commands::Convert(args) => commands::convert::run(
            &ConvertOptions {
                step: args.step.into(),
                range: args.range.into(),
                files: args.files,
                converter: args.converter,
                output_name: args.output_name,
                workers: args.workers,
            },
            &cfg,
        )?,
        Commands::Merge(args) => commands::merge::run(
            &MergeOptions {
                step: args.step.into(),
                range: args.range.into(),
                files: args.files,
                converter: args.converter,
                output_name: args.output_name,
                rolling: args.rolling,
            },
            &cfg,
        )?,
        Commands::Split(args) => commands::split::run(
            &SplitOptions {
                step: args.step.into(),
                range: args.range.into(),
                input: args.input,
                converter: args.converter,
                output_name: args.output_name,
            },
            &cfg,
        )?,
        Commands::Tag(args) => commands::tag::run(
            &TagOptions {
                step: args.step.into(),
                range: args.range.into(),
                files: args.files,
                converter: args.converter,
                output_name: args.output_name,
                metadata_dir: args.metadata_dir,
            },
            &cfg,
        )?,
        Commands::Epochs(args) => commands::epochs::run(&RangeOptions::from(args))?,
        Commands::Status => commands::status::run(&paths, &cfg)?,
    };

    print_report(&report, cli.json)?;
    Ok(report.exit_code)
}
