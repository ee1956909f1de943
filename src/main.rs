use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn};
use profit_sharing_ledger::checksum::{self, ReportChecksum};
use profit_sharing_ledger::config::EngineConfig;
use profit_sharing_ledger::engine::{self, CancellationToken, ComputeRequest, Engine};
use profit_sharing_ledger::ledger_store::ReversalPolicy;
use profit_sharing_ledger::source::MemorySource;
use profit_sharing_ledger::{BadgeNumber, Money, ProfitYear, RunID, TransactionID};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "psledger")]
#[command(about = "Year-end profit sharing settlement and vesting reconciliation")]
struct Args {
    /// TOML config; falls back to $PSLEDGER_CONFIG, then defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Settle member-year balances, vest them and validate the year
    Compute {
        /// Directory holding transactions.csv, employees.csv and friends
        #[arg(long)]
        data: PathBuf,

        #[arg(long)]
        year: ProfitYear,

        /// Last year of a range starting at --year
        #[arg(long)]
        through: Option<ProfitYear>,

        #[arg(long = "badge")]
        badges: Vec<BadgeNumber>,

        #[arg(long, default_value = "0")]
        skip: usize,

        #[arg(long)]
        take: Option<usize>,

        /// Append checksums of the recomputed totals to this file
        #[arg(long)]
        archive: Option<PathBuf>,
    },

    /// Remove a processing run's ledger rows and recompute affected members
    Revert {
        #[arg(long)]
        data: PathBuf,

        #[arg(long)]
        run: RunID,

        /// Recompute this year rather than the years the run touched
        #[arg(long)]
        year: Option<ProfitYear>,
    },

    /// Append reversal entries for ledger rows
    Reverse {
        #[arg(long)]
        data: PathBuf,

        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<TransactionID>,

        /// Date the reversal is booked; defaults to today
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };

    match args.command {
        Commands::Compute {
            data,
            year,
            through,
            badges,
            skip,
            take,
            archive,
        } => {
            let through = through.unwrap_or(year);
            if through < year {
                return Err(anyhow!("--through {through} is before --year {year}"));
            }
            let request = ComputeRequest {
                badges: (!badges.is_empty()).then(|| badges.into_iter().collect::<BTreeSet<_>>()),
                skip,
                take,
                ..ComputeRequest::years(year..=through)
            };
            compute(config, &data, &request, archive.as_deref())
        }
        Commands::Revert { data, run, year } => revert(config, &data, run, year),
        Commands::Reverse { data, ids, as_of } => reverse(config, &data, &ids, as_of),
    }
}

fn load(data: &Path) -> Result<MemorySource> {
    MemorySource::load_dir(data).with_context(|| format!("Failed to load {}", data.display()))
}

fn compute(
    config: EngineConfig,
    data: &Path,
    request: &ComputeRequest,
    archive: Option<&Path>,
) -> Result<()> {
    let source = load(data)?;
    let report_type = config.report_type.clone();
    let year_end = Engine::new(config);
    let result = year_end.compute(&source, request, &CancellationToken::new())?;

    engine::write_csv(&result.records, std::io::stdout())?;
    info!(
        "{} of {} records written; ending {} vested {} forfeitures {} beneficiary allocation {}",
        result.records.len(),
        result.total_records,
        result.totals.ending_balance,
        result.totals.vested_balance,
        result.totals.forfeitures,
        result.totals.beneficiary_allocation()
    );
    for missing in &result.skipped {
        warn!("skipped: {missing}");
    }
    let histories = engine::group_by_member(&result.records, *request.years.end());
    info!(
        "{} members on this page; suggested forfeitures {}",
        histories.len(),
        histories
            .iter()
            .map(|history| history.suggested_forfeit)
            .sum::<Money>()
    );

    if let Some(path) = archive {
        let captured_at = Utc::now();
        let mut archives = if path.exists() {
            checksum::read_csv(std::fs::File::open(path)?)?
        } else {
            Vec::new()
        };
        for (year, totals) in &result.year_totals {
            let fields = totals.fields();
            archives.push(ReportChecksum::capture(
                *year,
                &report_type,
                captured_at,
                fields.iter().map(|(name, value)| (name.as_str(), *value)),
            ));
        }
        checksum::write_csv(&archives, std::fs::File::create(path)?)
            .with_context(|| format!("Failed to write archive {}", path.display()))?;
        info!("archived checksums to {}", path.display());
    }

    if result.blocked() {
        return Err(anyhow!("critical cross-reference checks failed"));
    }
    Ok(())
}

fn revert(config: EngineConfig, data: &Path, run: RunID, year: Option<ProfitYear>) -> Result<()> {
    let mut source = load(data)?;
    let year_end = Engine::new(config);
    let outcome = year_end.revert(
        &mut source,
        run,
        year.map(|year| year..=year),
        &CancellationToken::new(),
    )?;
    source.save_ledger(data)?;
    info!(
        "run {run}: {} rows removed, {} members recomputed",
        outcome.summary.removed,
        outcome.summary.affected.len()
    );
    engine::write_csv(&outcome.recomputed.records, std::io::stdout())
}

fn reverse(
    config: EngineConfig,
    data: &Path,
    ids: &[TransactionID],
    as_of: Option<NaiveDate>,
) -> Result<()> {
    let mut source = load(data)?;
    let policy = ReversalPolicy {
        frozen_through: config.frozen_through,
        max_batch: config.max_reversal_batch,
        as_of: as_of.unwrap_or_else(|| Local::now().date_naive()),
    };
    let outcome = source.ledger.reverse(ids, &policy)?;
    source.save_ledger(data)?;
    for id in &outcome.created {
        println!("{id}");
    }
    for (ssn, delta) in &outcome.etva_adjustments {
        info!("ssn {ssn}: 100% vested earnings change {delta}");
    }
    Ok(())
}
