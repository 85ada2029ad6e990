mod config;
mod error;
mod estimate;
mod extract;
mod logging;
mod pricing;
mod report;
mod snapshot;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration as ChronoDuration, Local, NaiveDate, Utc};
use chrono_tz::Tz;
use clap::{ArgGroup, Args, Parser, Subcommand};
use directories::ProjectDirs;
use num_format::Locale;
use tracing::debug;

use crate::config::{
    DefaultsConfig, FileConfig, home_dir, load_config, resolve_bool, resolve_path,
    resolve_string, resolve_week_start,
};
use crate::error::CostError;
use crate::extract::{DateFilter, GroupBy, WeekStart, parse_date, parse_month};
use crate::pricing::PriceTable;
use crate::report::{format_cost, format_tokens_short};

const SESSIONS_DIR_ENV: &str = "AGENTCOST_SESSIONS_DIR";
const SNAPSHOT_DIR_ENV: &str = "AGENTCOST_SNAPSHOT_DIR";
const DEFAULT_SESSIONS_DIR: &str = ".openclaw/agents/main/sessions";

#[derive(Parser, Debug)]
#[command(
    name = "agentcost",
    version,
    about = "Report agent spend from session logs, or estimate it from token snapshots"
)]
struct Cli {
    /// Optional config file (JSON). If omitted, tries ./agentcost.json then ~/.config/agentcost/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Timezone for calendar dates (IANA name, e.g. UTC, Europe/Berlin). Defaults to each timestamp's own offset.
    #[arg(long, global = true)]
    timezone: Option<String>,

    /// Locale for token counts in tables (e.g. en, fr, de). Falls back to en.
    #[arg(long, global = true)]
    locale: Option<String>,

    /// Output JSON instead of tables (can be passed as --json or --json=false)
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json: Option<bool>,

    /// Debug logging on stderr (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Default: measured cost from session logs, by date or by model
    Cost(CostArgs),
    /// Store today's token snapshot from a session listing (stdin or --input)
    Snapshot(SnapshotArgs),
    /// Estimate a day's cost from its snapshot and the previous day's
    Estimate(EstimateArgs),
}

#[derive(Args, Debug, Clone, Default)]
#[command(group(
    ArgGroup::new("range")
        .args(["yesterday", "date", "since", "week", "month", "month_of"])
        .multiple(false)
))]
struct CostArgs {
    /// Directory holding per-session *.jsonl logs
    #[arg(long)]
    sessions_dir: Option<PathBuf>,

    /// Only yesterday
    #[arg(long)]
    yesterday: bool,

    /// Only this date (YYYY-MM-DD)
    #[arg(long, value_name = "YYYY-MM-DD")]
    date: Option<String>,

    /// This date and later (YYYY-MM-DD)
    #[arg(long, value_name = "YYYY-MM-DD")]
    since: Option<String>,

    /// Since the start of the current week
    #[arg(long)]
    week: bool,

    /// The current month
    #[arg(long)]
    month: bool,

    /// A specific month (YYYY-MM)
    #[arg(long = "month-of", value_name = "YYYY-MM")]
    month_of: Option<String>,

    /// First day of the week for --week (default monday)
    #[arg(long = "start-of-week", value_enum)]
    start_of_week: Option<WeekStart>,

    /// Group by model across all dates instead of by date
    #[arg(long = "by-model", conflicts_with = "range")]
    by_model: bool,
}

#[derive(Args, Debug, Clone, Default)]
struct SnapshotArgs {
    /// Read the session listing from this file instead of stdin
    #[arg(long)]
    input: Option<PathBuf>,

    /// Where snapshots are stored
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Date to file the snapshot under (default today)
    #[arg(long, value_name = "YYYY-MM-DD")]
    date: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
struct EstimateArgs {
    /// Where snapshots are stored
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Day to estimate (default today)
    #[arg(long, value_name = "YYYY-MM-DD")]
    date: Option<String>,
}

/// Settings shared by every command after layering CLI, config and defaults.
struct Settings {
    json: bool,
    tz: Option<Tz>,
    locale: Locale,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<CostError>()
                .map(CostError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let file_cfg = load_config(cli.config.as_deref())?;
    let command = cli
        .command
        .clone()
        .unwrap_or(Command::Cost(CostArgs::default()));

    match command {
        Command::Cost(args) => {
            let cmd_cfg = file_cfg.command("cost");
            let ctx = resolve_context(&cli, cmd_cfg, &file_cfg)?;
            run_cost(&args, &ctx, cmd_cfg, file_cfg.defaults.as_ref())
        }
        Command::Snapshot(args) => {
            let cmd_cfg = file_cfg.command("snapshot");
            let ctx = resolve_context(&cli, cmd_cfg, &file_cfg)?;
            let prices = load_prices(&file_cfg)?;
            run_snapshot(&args, &ctx, cmd_cfg, file_cfg.defaults.as_ref(), &prices)
        }
        Command::Estimate(args) => {
            let cmd_cfg = file_cfg.command("estimate");
            let ctx = resolve_context(&cli, cmd_cfg, &file_cfg)?;
            let prices = load_prices(&file_cfg)?;
            run_estimate(&args, &ctx, cmd_cfg, file_cfg.defaults.as_ref(), &prices)
        }
    }
}

fn load_prices(file_cfg: &FileConfig) -> Result<PriceTable> {
    let prices = PriceTable::with_overrides(file_cfg.pricing.as_ref())?;
    debug!(reference = prices.default_model(), "price table loaded");
    Ok(prices)
}

fn resolve_context(
    cli: &Cli,
    cmd: Option<&DefaultsConfig>,
    file_cfg: &FileConfig,
) -> Result<Settings> {
    let defaults = file_cfg.defaults.as_ref();
    let json = resolve_bool(
        cli.json,
        cmd.and_then(|c| c.json),
        defaults.and_then(|d| d.json),
        false,
    );
    let tz = resolve_string(
        cli.timezone.as_ref(),
        cmd.and_then(|c| c.timezone.as_ref()),
        defaults.and_then(|d| d.timezone.as_ref()),
    )
    .map(|raw| parse_timezone(&raw))
    .transpose()?;
    let locale = resolve_locale(
        resolve_string(
            cli.locale.as_ref(),
            cmd.and_then(|c| c.locale.as_ref()),
            defaults.and_then(|d| d.locale.as_ref()),
        )
        .as_deref(),
    );
    Ok(Settings { json, tz, locale })
}

fn run_cost(
    args: &CostArgs,
    ctx: &Settings,
    cmd: Option<&DefaultsConfig>,
    defaults: Option<&DefaultsConfig>,
) -> Result<()> {
    let sessions_dir = resolve_path(
        args.sessions_dir.as_ref(),
        SESSIONS_DIR_ENV,
        cmd.and_then(|c| c.sessions_dir.as_ref()),
        defaults.and_then(|d| d.sessions_dir.as_ref()),
    )
    .or_else(|| home_dir().map(|h| h.join(DEFAULT_SESSIONS_DIR)))
    .ok_or_else(|| {
        CostError::InvalidArgument(format!(
            "could not determine home directory; pass --sessions-dir or set {SESSIONS_DIR_ENV}"
        ))
    })?;
    let start_of_week = resolve_week_start(
        args.start_of_week,
        cmd.and_then(|c| c.start_of_week),
        defaults.and_then(|d| d.start_of_week),
    );
    let filter = resolve_filter(args, today(ctx.tz.as_ref()), start_of_week)?;
    let group_by = if args.by_model {
        GroupBy::Model
    } else {
        GroupBy::Date
    };
    debug!(dir = %sessions_dir.display(), filter = %filter.describe(), ?group_by, "cost report");

    let scan = extract::scan_sessions(&sessions_dir, ctx.tz.as_ref())
        .with_context(|| format!("reading usage logs from {}", sessions_dir.display()))?;
    let report = extract::build_report(&scan, &sessions_dir, &filter, group_by, Utc::now());
    report::emit(&report, ctx.json, &ctx.locale)?;
    Ok(())
}

fn resolve_filter(args: &CostArgs, today: NaiveDate, start_of_week: WeekStart) -> Result<DateFilter> {
    let filter = if args.yesterday {
        DateFilter::Day(today - ChronoDuration::days(1))
    } else if let Some(raw) = &args.date {
        DateFilter::Day(parse_date(raw)?)
    } else if let Some(raw) = &args.since {
        DateFilter::Since(parse_date(raw)?)
    } else if args.week {
        DateFilter::this_week(today, start_of_week)
    } else if args.month {
        DateFilter::this_month(today)
    } else if let Some(raw) = &args.month_of {
        parse_month(raw)?
    } else {
        DateFilter::All
    };
    Ok(filter)
}

fn run_snapshot(
    args: &SnapshotArgs,
    ctx: &Settings,
    cmd: Option<&DefaultsConfig>,
    defaults: Option<&DefaultsConfig>,
    prices: &PriceTable,
) -> Result<()> {
    let dir = resolve_snapshot_dir(args.snapshot_dir.as_ref(), cmd, defaults)?;
    let date = match &args.date {
        Some(raw) => parse_date(raw)?,
        None => today(ctx.tz.as_ref()),
    };

    let raw = snapshot::read_payload(args.input.as_deref())?;
    let sessions = snapshot::parse_listing(&raw)?;
    if sessions.is_empty() {
        tracing::warn!("session listing has no sessions; writing an empty snapshot");
    }
    let snap = snapshot::build_snapshot(&sessions, date, Utc::now(), prices)?;
    let path = snapshot::write_snapshot(&dir, &snap)
        .with_context(|| format!("writing snapshot to {}", dir.display()))?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&snap)?);
    } else {
        let cost = snap.estimated_cost.as_ref().map(|c| c.total).unwrap_or(0.0);
        println!(
            "Snapshot for {}: {} sessions, {} models, {} tokens cumulative (~{} estimated)",
            snap.date,
            snap.sessions.len(),
            snap.summary.by_model.len(),
            format_tokens_short(snap.summary.total_tokens as i64),
            format_cost(cost)
        );
        println!("Wrote {}", path.display());
    }
    Ok(())
}

fn run_estimate(
    args: &EstimateArgs,
    ctx: &Settings,
    cmd: Option<&DefaultsConfig>,
    defaults: Option<&DefaultsConfig>,
    prices: &PriceTable,
) -> Result<()> {
    let dir = resolve_snapshot_dir(args.snapshot_dir.as_ref(), cmd, defaults)?;
    let date = match &args.date {
        Some(raw) => parse_date(raw)?,
        None => today(ctx.tz.as_ref()),
    };
    let report = estimate::run_estimate(&dir, date, prices)?;
    report::emit(&report, ctx.json, &ctx.locale)?;
    Ok(())
}

fn resolve_snapshot_dir(
    cli: Option<&PathBuf>,
    cmd: Option<&DefaultsConfig>,
    defaults: Option<&DefaultsConfig>,
) -> Result<PathBuf> {
    resolve_path(
        cli,
        SNAPSHOT_DIR_ENV,
        cmd.and_then(|c| c.snapshot_dir.as_ref()),
        defaults.and_then(|d| d.snapshot_dir.as_ref()),
    )
    .or_else(|| {
        ProjectDirs::from("com", "agentcost", "agentcost")
            .map(|dirs| dirs.data_dir().join("snapshots"))
    })
    .ok_or_else(|| {
        CostError::InvalidArgument(format!(
            "could not determine a data directory; pass --snapshot-dir or set {SNAPSHOT_DIR_ENV}"
        ))
        .into()
    })
}

/// Process-clock date, in `tz` when one is configured.
fn today(tz: Option<&Tz>) -> NaiveDate {
    match tz {
        Some(tz) => Utc::now().with_timezone(tz).date_naive(),
        None => Local::now().date_naive(),
    }
}

fn resolve_locale(raw: Option<&str>) -> Locale {
    match raw {
        Some("en") | Some("en-US") | Some("en-GB") | None => Locale::en,
        Some("fr") | Some("fr-FR") => Locale::fr,
        Some("de") | Some("de-DE") => Locale::de,
        Some("es") | Some("es-ES") => Locale::es,
        Some("it") | Some("it-IT") => Locale::it,
        Some("ja") | Some("ja-JP") => Locale::ja,
        _ => Locale::en,
    }
}

fn parse_timezone(raw: &str) -> Result<Tz> {
    raw.parse::<Tz>().map_err(|e| {
        anyhow!(CostError::InvalidArgument(format!(
            "Invalid timezone '{raw}': {e}. Example: 'UTC' or 'America/Los_Angeles'"
        )))
    })
}
