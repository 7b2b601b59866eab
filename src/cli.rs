//! CLI definition and dispatch.

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

use crate::adapters::csv_adapter::{read_trades_csv, CsvFillsAdapter};
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::quote_feed_adapter::QuoteFeedAdapter;
use crate::domain::allocation::DEFAULT_EPSILON;
use crate::domain::allocation_engine::{AllocationEngine, ComputeRequest};
use crate::domain::computation_run::{AllocationScope, ComputationRun, RunStatus};
use crate::domain::config_validation::validate_all;
use crate::domain::diagnostics;
use crate::domain::error::LedgerError;
use crate::domain::exit_rules::{ExitConfig, Signal, SignalReading};
use crate::domain::monitor::PositionMonitor;
use crate::domain::position::Position;
use crate::domain::position_book::PositionBook;
use crate::domain::reconciliation::{Discrepancy, ReconcileConfig, Reconciler, Tier};
use crate::domain::trade::{format_timestamp, parse_timestamp};
use crate::ports::allocation_port::AllocationStorePort;
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::TradeLedgerPort;
use crate::ports::position_port::PositionStorePort;

#[derive(Parser, Debug)]
#[command(
    name = "lotwarden",
    about = "FIFO lot allocation, ledger reconciliation and position exits"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Append trades from a CSV file to the ledger
    Import {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Compute FIFO allocations into a version
    Allocate {
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated symbols; all ledger symbols when omitted
        #[arg(long)]
        symbols: Option<String>,
        /// Target version; the next unused one when omitted
        #[arg(long)]
        version: Option<i64>,
        /// Recompute symbols that already have a set at this version
        #[arg(long)]
        force: bool,
        /// Only recompute symbols with trades since this time
        #[arg(long)]
        since: Option<String>,
    },
    /// Recompute the failed symbols of an earlier run
    Retry {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        batch: String,
    },
    /// Classify unmatched sells against venue history
    Reconcile {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        version: i64,
        #[arg(long)]
        tier: Option<String>,
        /// Venue fill export; defaults to [reconciliation] fills_path
        #[arg(long)]
        fills: Option<PathBuf>,
    },
    /// Insert venue fills missing from the ledger
    Backfill {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        version: i64,
        #[arg(long)]
        tier: Option<String>,
        #[arg(long)]
        fills: Option<PathBuf>,
    },
    /// Summarise a version and check conservation
    Health {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        version: Option<i64>,
    },
    /// List unmatched sell rows of a version
    Unmatched {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        version: i64,
    },
    /// Realized P&L per symbol
    Pnl {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        version: i64,
    },
    /// Sells whose outcome differs between two versions
    Diff {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
    },
    /// Remaining buy lots derived from a version
    Inventory {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        version: i64,
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Record a filled entry as an open position
    Open {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        price: f64,
        #[arg(long)]
        size: f64,
        #[arg(long)]
        at: Option<String>,
    },
    /// Remove a position after its exit filled
    Close {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        symbol: String,
    },
    /// Run one exit evaluation tick for an open position
    Evaluate {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        price: f64,
        /// Volatility as a percentage of price
        #[arg(long)]
        volatility: Option<f64>,
        /// buy, sell or none
        #[arg(long)]
        signal: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Validate { config } => run_validate(&config),
        other => run_storage_command(other),
    }
}

#[cfg(feature = "sqlite")]
fn run_storage_command(command: Command) -> ExitCode {
    match command {
        Command::Import { config, file } => {
            with_storage(&config, |_, store| run_import(store, &file))
        }
        Command::Allocate {
            config,
            symbols,
            version,
            force,
            since,
        } => with_storage(&config, |cfg, store| {
            let since = since.as_deref().map(parse_when).transpose()?;
            let request = ComputeRequest {
                scope: AllocationScope::parse(symbols.as_deref().unwrap_or("")),
                version,
                force,
                since,
            };
            let run = AllocationEngine::new(store, store)
                .with_epsilon(build_epsilon(cfg))
                .compute(&request);
            print_run(&run);
            Ok(run_exit_code(&run))
        }),
        Command::Retry { config, batch } => with_storage(&config, |cfg, store| {
            let run = AllocationEngine::new(store, store)
                .with_epsilon(build_epsilon(cfg))
                .retry_failed(&batch)?;
            print_run(&run);
            Ok(run_exit_code(&run))
        }),
        Command::Reconcile {
            config,
            version,
            tier,
            fills,
        } => with_storage(&config, |cfg, store| {
            let tier = parse_tier(tier.as_deref())?;
            let venue = CsvFillsAdapter::new(resolve_fills_path(fills.as_deref(), cfg)?);
            let reconciler = Reconciler::new(store, store, &venue, build_reconcile_config(cfg));
            let discrepancies = reconciler.reconcile(version, tier)?;
            print_discrepancies(&discrepancies);
            Ok(ExitCode::SUCCESS)
        }),
        Command::Backfill {
            config,
            version,
            tier,
            fills,
        } => with_storage(&config, |cfg, store| {
            let tier = parse_tier(tier.as_deref())?;
            let venue = CsvFillsAdapter::new(resolve_fills_path(fills.as_deref(), cfg)?);
            let reconciler = Reconciler::new(store, store, &venue, build_reconcile_config(cfg));
            let discrepancies = reconciler.reconcile(version, tier)?;
            let report = reconciler.backfill(&discrepancies)?;
            println!("inserted:        {}", report.inserted);
            println!("already present: {}", report.already_present);
            println!("ambiguous:       {}", report.ambiguous.len());
            for amb in &report.ambiguous {
                println!(
                    "  {} {} {} @ {} at {} collides with ledger trade {}",
                    amb.fill.symbol,
                    amb.fill.fill_id,
                    amb.fill.size,
                    amb.fill.price,
                    format_timestamp(&amb.fill.executed_at),
                    amb.conflicting_trade_id
                );
            }
            println!("rejected:        {}", report.rejected.len());
            for rej in &report.rejected {
                println!("  {} {}: {}", rej.fill.symbol, rej.fill.fill_id, rej.reason);
            }
            if report.inserted > 0 {
                info!(
                    version,
                    inserted = report.inserted,
                    "ledger changed; run `lotwarden allocate` to produce a new version"
                );
            }
            Ok(ExitCode::SUCCESS)
        }),
        Command::Health { config, version } => with_storage(&config, |cfg, store| {
            let version = match version {
                Some(v) => v,
                None => match AllocationStorePort::latest_version(store)? {
                    Some(v) => v,
                    None => {
                        println!("no allocation versions yet");
                        return Ok(ExitCode::SUCCESS);
                    }
                },
            };
            let summary = diagnostics::health_summary(store, store, version, build_epsilon(cfg))?;
            print_health(&summary);
            Ok(ExitCode::SUCCESS)
        }),
        Command::Unmatched { config, version } => with_storage(&config, |_, store| {
            let rows = diagnostics::unmatched_sells(store, version)?;
            for row in &rows {
                println!(
                    "{}\t{}\t{}\t{}",
                    row.symbol,
                    row.sell_trade_id,
                    row.allocated_size,
                    row.batch_id
                );
            }
            eprintln!("{} unmatched rows at version {}", rows.len(), version);
            Ok(ExitCode::SUCCESS)
        }),
        Command::Pnl { config, version } => with_storage(&config, |_, store| {
            let rows = store.list_allocations(version, None)?;
            let per_symbol = diagnostics::pnl_by_symbol(&rows);
            for p in &per_symbol {
                let sign = if p.realized_pnl >= 0.0 { "+" } else { "" };
                println!(
                    "{}:  {}{:.2}  {} matched, {} unmatched rows, {} sells ({} short), {:.1}% win rate",
                    p.symbol,
                    sign,
                    p.realized_pnl,
                    p.matched_rows,
                    p.unmatched_rows,
                    p.sells,
                    p.sells_with_unmatched,
                    p.win_rate * 100.0
                );
            }
            let total: f64 = per_symbol.iter().map(|p| p.realized_pnl).sum();
            println!("total: {total:.2}");
            Ok(ExitCode::SUCCESS)
        }),
        Command::Diff { config, from, to } => with_storage(&config, |cfg, store| {
            let diffs = diagnostics::diff_versions(store, from, to, build_epsilon(cfg))?;
            let show = |t: Option<diagnostics::SellTotals>| match t {
                Some(t) => format!(
                    "matched={} unmatched={} pnl={:.4}",
                    t.matched_size, t.unmatched_size, t.pnl
                ),
                None => "absent".to_string(),
            };
            for d in &diffs {
                println!(
                    "{} {}: v{} {} -> v{} {}",
                    d.symbol,
                    d.sell_trade_id,
                    from,
                    show(d.from),
                    to,
                    show(d.to)
                );
            }
            eprintln!("{} sells differ between v{} and v{}", diffs.len(), from, to);
            Ok(ExitCode::SUCCESS)
        }),
        Command::Inventory {
            config,
            version,
            symbol,
        } => with_storage(&config, |cfg, store| {
            let symbol = symbol.map(|s| s.to_uppercase());
            let lots = diagnostics::inventory(
                store,
                store,
                version,
                symbol.as_deref(),
                build_epsilon(cfg),
            )?;
            for lot in &lots {
                println!(
                    "{}\t{}\t{}\t{}/{}\t@ {}",
                    lot.symbol,
                    lot.trade_id,
                    format_timestamp(&lot.executed_at),
                    lot.remaining,
                    lot.size,
                    lot.price
                );
            }
            Ok(ExitCode::SUCCESS)
        }),
        Command::Open {
            config,
            symbol,
            price,
            size,
            at,
        } => with_storage(&config, |_, store| {
            let entry_time = at.as_deref().map(parse_when).transpose()?.unwrap_or_else(Utc::now);
            run_open(store, &symbol.to_uppercase(), price, size, entry_time)
        }),
        Command::Close { config, symbol } => with_storage(&config, |_, store| {
            let symbol = symbol.to_uppercase();
            let book = PositionBook::from_positions(store.load_positions()?);
            let closed = book.close(&symbol)?;
            store.remove_position(&symbol)?;
            println!(
                "closed {} ({} @ {}, opened {})",
                closed.symbol,
                closed.size,
                closed.entry_price,
                format_timestamp(&closed.entry_time)
            );
            Ok(ExitCode::SUCCESS)
        }),
        Command::Evaluate {
            config,
            symbol,
            price,
            volatility,
            signal,
        } => with_storage(&config, |cfg, store| {
            let symbol = symbol.to_uppercase();
            let now = Utc::now();
            let mut feed = QuoteFeedAdapter::new().with_price(&symbol, price);
            if let Some(v) = volatility {
                feed = feed.with_volatility(&symbol, v);
            }
            if let Some(s) = signal.as_deref() {
                let signal: Signal = s.parse().map_err(|reason| LedgerError::Feed {
                    symbol: symbol.clone(),
                    reason,
                })?;
                feed = feed.with_signal(&symbol, SignalReading { signal, as_of: now });
            }
            run_evaluate(store, &feed, build_exit_config(cfg), &symbol, now)
        }),
        Command::Validate { config } => run_validate(&config),
    }
}

#[cfg(not(feature = "sqlite"))]
fn run_storage_command(_command: Command) -> ExitCode {
    eprintln!("error: sqlite feature is required for this command");
    ExitCode::from(1)
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

/// Load and validate the config, open storage, run `f`.
#[cfg(feature = "sqlite")]
fn with_storage<F>(config_path: &Path, f: F) -> ExitCode
where
    F: FnOnce(
        &FileConfigAdapter,
        &crate::adapters::sqlite_adapter::SqliteAdapter,
    ) -> Result<ExitCode, LedgerError>,
{
    use crate::adapters::sqlite_adapter::SqliteAdapter;

    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if let Err(e) = validate_all(&config) {
        eprintln!("error: {e}");
        return (&e).into();
    }

    let result = SqliteAdapter::from_config(&config).and_then(|store| {
        store.initialize_schema()?;
        f(&config, &store)
    });
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

fn run_import<S: TradeLedgerPort>(store: &S, file: &Path) -> Result<ExitCode, LedgerError> {
    let trades = read_trades_csv(file)?;
    let inserted = store.insert_trades(&trades)?;
    info!(
        file = %file.display(),
        read = trades.len(),
        inserted,
        "import finished"
    );
    println!(
        "{} trades read, {} inserted, {} already present",
        trades.len(),
        inserted,
        trades.len() - inserted
    );
    Ok(ExitCode::SUCCESS)
}

fn run_open<S: PositionStorePort>(
    store: &S,
    symbol: &str,
    price: f64,
    size: f64,
    entry_time: DateTime<Utc>,
) -> Result<ExitCode, LedgerError> {
    if !(price.is_finite() && price > 0.0 && size.is_finite() && size > 0.0) {
        return Err(LedgerError::InvalidTrade {
            trade_id: format!("{symbol} entry"),
            reason: "price and size must be positive".to_string(),
        });
    }
    let book = PositionBook::from_positions(store.load_positions()?);
    let position = Position::open(symbol, price, size, entry_time);
    book.open(position.clone())?;
    store.save_position(&position)?;
    println!(
        "opened {} {} @ {} at {}",
        position.symbol,
        position.size,
        position.entry_price,
        format_timestamp(&position.entry_time)
    );
    Ok(ExitCode::SUCCESS)
}

fn run_evaluate<S: PositionStorePort + Sync>(
    store: &S,
    feed: &QuoteFeedAdapter,
    exit_config: ExitConfig,
    symbol: &str,
    now: DateTime<Utc>,
) -> Result<ExitCode, LedgerError> {
    let book = PositionBook::from_positions(store.load_positions()?);
    let monitor = PositionMonitor::new(&book, feed, feed, exit_config).with_store(store);
    let report = monitor.tick(symbol, now)?;

    println!("decision: {}", report.decision.kind());
    println!("reason:   {}", report.decision.reason());
    if let Some(urgency) = report.decision.urgency() {
        println!("urgency:  {urgency:?}");
    }
    for note in &report.degraded {
        println!("degraded: {note}");
    }
    if let Some(pos) = book.get(symbol) {
        println!(
            "state:    peak={} trailing={} stop={}",
            pos.peak_price,
            pos.trailing_active,
            pos.stop_price
                .map_or_else(|| "-".to_string(), |s| format!("{s:.4}"))
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Validating config: {}", config_path.display());
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if let Err(e) = validate_all(&config) {
        eprintln!("error: {e}");
        return (&e).into();
    }

    let exit = build_exit_config(&config);
    let rec = build_reconcile_config(&config);
    println!("epsilon:                  {:e}", build_epsilon(&config));
    println!("hard stop:                {}%", exit.hard_stop_pct);
    println!("soft stop:                {}%", exit.soft_stop_pct);
    println!("trailing activation:      {}%", exit.trailing_activation_pct);
    println!(
        "trailing distance:        {} x volatility, clamped to [{}%, {}%]",
        exit.trailing_volatility_multiplier,
        exit.trailing_min_distance_pct,
        exit.trailing_max_distance_pct
    );
    println!("signal max age:           {}s", exit.signal_max_age_secs);
    println!("signal exit fee:          {}%", exit.signal_exit_fee_pct);
    println!("round-trip window:        {}s", rec.round_trip_window_secs);
    println!("fingerprint tolerance:    {}s", rec.fingerprint_tolerance_secs);
    eprintln!("\nConfiguration is valid.");
    ExitCode::SUCCESS
}

pub fn build_epsilon(config: &dyn ConfigPort) -> f64 {
    config.get_double("allocation", "epsilon", DEFAULT_EPSILON)
}

pub fn build_exit_config(config: &dyn ConfigPort) -> ExitConfig {
    let d = ExitConfig::default();
    ExitConfig {
        hard_stop_pct: config.get_double("exit", "hard_stop_pct", d.hard_stop_pct),
        soft_stop_pct: config.get_double("exit", "soft_stop_pct", d.soft_stop_pct),
        trailing_activation_pct: config.get_double(
            "exit",
            "trailing_activation_pct",
            d.trailing_activation_pct,
        ),
        trailing_volatility_multiplier: config.get_double(
            "exit",
            "trailing_volatility_multiplier",
            d.trailing_volatility_multiplier,
        ),
        trailing_min_distance_pct: config.get_double(
            "exit",
            "trailing_min_distance_pct",
            d.trailing_min_distance_pct,
        ),
        trailing_max_distance_pct: config.get_double(
            "exit",
            "trailing_max_distance_pct",
            d.trailing_max_distance_pct,
        ),
        default_volatility_pct: config.get_double(
            "exit",
            "default_volatility_pct",
            d.default_volatility_pct,
        ),
        signal_max_age_secs: config.get_int("exit", "signal_max_age_secs", d.signal_max_age_secs),
        signal_exit_fee_pct: config.get_double(
            "exit",
            "signal_exit_fee_pct",
            d.signal_exit_fee_pct,
        ),
    }
}

pub fn build_reconcile_config(config: &dyn ConfigPort) -> ReconcileConfig {
    let d = ReconcileConfig::default();
    ReconcileConfig {
        round_trip_window_secs: config.get_int(
            "reconciliation",
            "round_trip_window_secs",
            d.round_trip_window_secs,
        ),
        fingerprint_tolerance_secs: config.get_int(
            "reconciliation",
            "fingerprint_tolerance_secs",
            d.fingerprint_tolerance_secs,
        ),
        epsilon: build_epsilon(config),
    }
}

pub fn resolve_fills_path(
    fills_override: Option<&Path>,
    config: &dyn ConfigPort,
) -> Result<PathBuf, LedgerError> {
    if let Some(p) = fills_override {
        return Ok(p.to_path_buf());
    }
    config
        .require_string("reconciliation", "fills_path")
        .map(PathBuf::from)
}

/// Accept a full timestamp or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_when(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    let value = value.trim();
    if let Ok(ts) = parse_timestamp(value) {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| LedgerError::ConfigInvalid {
            section: "cli".into(),
            key: "timestamp".into(),
            reason: format!("cannot parse '{value}', expected RFC 3339 or YYYY-MM-DD"),
        })
}

pub fn parse_tier(value: Option<&str>) -> Result<Option<Tier>, LedgerError> {
    value
        .map(|s| {
            s.parse::<Tier>().map_err(|reason| LedgerError::ConfigInvalid {
                section: "cli".into(),
                key: "tier".into(),
                reason,
            })
        })
        .transpose()
}

fn run_exit_code(run: &ComputationRun) -> ExitCode {
    match run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Partial | RunStatus::Failed | RunStatus::Running => {
            warn!(
                batch_id = %run.batch_id,
                status = %run.status,
                "run did not complete; use `lotwarden retry --batch` for failed symbols"
            );
            ExitCode::FAILURE
        }
    }
}

fn print_run(run: &ComputationRun) {
    println!("batch:        {}", run.batch_id);
    println!("version:      {}", run.version);
    println!("scope:        {}", run.scope);
    println!("status:       {}", run.status);
    println!("buys:         {}", run.buys_processed);
    println!("sells:        {}", run.sells_processed);
    println!("allocations:  {}", run.allocations_created);
    println!("unmatched:    {}", run.unmatched_sells);
    println!("total P&L:    {:.2}", run.total_pnl);
    println!("computed:     {}", run.symbols_computed.join(","));
    if !run.symbols_skipped.is_empty() {
        println!("skipped:      {}", run.symbols_skipped.join(","));
    }
    for failure in &run.failures {
        println!("failed:       {} ({})", failure.symbol, failure.reason);
    }
    if let (Some(err), true) = (&run.error, run.failures.is_empty()) {
        println!("error:        {err}");
    }
}

fn print_discrepancies(discrepancies: &[Discrepancy]) {
    for d in discrepancies {
        println!(
            "{}\t{}\t{}\t{}\tunmatched={}/{}\tinventory={}\tcandidates={}",
            d.symbol,
            d.sell_trade_id,
            format_timestamp(&d.sell_executed_at),
            d.tier,
            d.unmatched_size,
            d.sell_size,
            d.inventory_at_sell,
            d.missing_fills.len()
        );
        if let Some(hint) = &d.round_trip_hint {
            println!("\thint: {hint}");
        }
    }
    eprintln!("{} discrepancies", discrepancies.len());
}

fn print_health(s: &diagnostics::HealthSummary) {
    println!("version:          {}", s.version);
    println!("symbols:          {}", s.symbols);
    println!("matched rows:     {}", s.matched_rows);
    println!("unmatched rows:   {}", s.unmatched_rows);
    println!("unmatched size:   {}", s.unmatched_size);
    println!("total P&L:        {:.2}", s.total_pnl);
    println!("sells checked:    {}", s.sells_checked);
    println!("not in version:   {}", s.sells_not_covered);
    println!("conservation:     {} breaches", s.breaches.len());
    for b in &s.breaches {
        println!(
            "  {} {}: size {} allocated {}",
            b.symbol, b.sell_trade_id, b.sell_size, b.allocated
        );
    }
    println!("rows per version:");
    for (v, n) in &s.rows_per_version {
        println!("  v{v}: {n}");
    }
    println!("healthy:          {}", s.is_healthy());
}
