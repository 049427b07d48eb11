//! Batch tool: reconcile fitment observations into consensus fitments.
//!
//! Reads observations from a JSON file and keeps consensus records and
//! conflicts in a JSON state file between runs. `--list-conflicts` and
//! `--auto-resolve` work on the stored conflicts; `--part-number` narrows them
//! to one part number.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clap::{ArgGroup, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use fitment_consensus::config;
use fitment_consensus::engine::{BatchSummary, CandidatePlan, ConflictSummary, PartPlan};
use fitment_consensus::{
    ConfigError, ConflictFilter, ConflictStatus, ConsensusConfig, ConsensusEngine,
    ConsensusError, ConsensusResult, InMemoryConsensusSink, InMemoryObservationStore,
    ProcessResult, ResolveOutcome,
};

const DEFAULT_CONFLICT_LIMIT: usize = 50;

const MODES: [&str; 5] = [
    "all",
    "new_data_only",
    "stats_only",
    "auto_resolve",
    "list_conflicts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StatusArg {
    Pending,
    Resolved,
    Dismissed,
    Any,
}

impl StatusArg {
    fn status(self) -> Option<ConflictStatus> {
        match self {
            Self::Pending => Some(ConflictStatus::Pending),
            Self::Resolved => Some(ConflictStatus::Resolved),
            Self::Dismissed => Some(ConflictStatus::Dismissed),
            Self::Any => None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    version,
    rename_all = "kebab",
    about = "Reconcile marketplace fitment observations into consensus fitments"
)]
#[command(group(ArgGroup::new("mode").args(MODES)))]
#[command(group(ArgGroup::new("conflict_mode").args(["auto_resolve", "list_conflicts"])))]
struct Args {
    /// JSON array of observations.
    #[arg(long, value_name = "FILE")]
    observations: PathBuf,

    /// Consensus state file; created when missing.
    #[arg(long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Process a single part number, or narrow conflict modes to it.
    #[arg(
        long,
        value_name = "PART",
        required_unless_present_any = MODES,
        conflicts_with_all = ["all", "new_data_only", "stats_only"]
    )]
    part_number: Option<String>,

    /// Process every part number with enough observations.
    #[arg(long)]
    all: bool,

    /// Process part numbers with observations newer than their consensus.
    #[arg(long)]
    new_data_only: bool,

    /// Minimum observations for a part number to be processed.
    #[arg(long, default_value_t = 2)]
    min_listings: usize,

    /// Report what would happen without writing.
    #[arg(long)]
    dry_run: bool,

    /// Print processing statistics only.
    #[arg(long)]
    stats_only: bool,

    /// Run the auto-resolution rules over PENDING conflicts.
    #[arg(long)]
    auto_resolve: bool,

    /// List stored conflicts with per-category and per-part counts.
    #[arg(long)]
    list_conflicts: bool,

    /// Conflict status to list [default: pending].
    #[arg(long, value_enum, requires = "list_conflicts")]
    status: Option<StatusArg>,

    /// Conflicts to print in detail [default: 50].
    #[arg(long, requires = "list_conflicts")]
    limit: Option<usize>,

    /// Write the listed conflicts as a JSON report.
    #[arg(long, value_name = "FILE", requires = "list_conflicts")]
    report: Option<PathBuf>,

    /// Only conflicts created more than this many days ago.
    #[arg(
        long,
        value_name = "DAYS",
        requires = "conflict_mode",
        value_parser = clap::value_parser!(i64).range(0..)
    )]
    older_than_days: Option<i64>,

    /// Worker threads for batch runs.
    #[arg(long)]
    workers: Option<usize>,

    /// Log at info level.
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> ConsensusResult<ConsensusConfig> {
    let mut cfg = match &args.config {
        Some(path) => config::load(path)?,
        None => ConsensusConfig::default(),
    };
    if let Some(workers) = args.workers {
        cfg = cfg.with_workers(workers);
    }
    cfg = cfg.with_min_listings(args.min_listings);
    cfg.validate()?;
    Ok(cfg)
}

fn print_plan(plan: &PartPlan) {
    println!("Part number: {} (dry run)", plan.part_number);
    println!(
        "  Observations: {} ({} malformed), quality model {}",
        plan.observations_total, plan.skipped_observations, plan.quality_model
    );
    for group in &plan.groups {
        println!(
            "  {} - {} listings, weight {:.2}",
            group.signature, group.member_count, group.weight
        );
    }
    match (&plan.outcome, plan.effective_resolution()) {
        (ResolveOutcome::InsufficientData { observed, required }, _) => {
            println!("  Skipped: insufficient data ({observed} of {required} observations)");
        }
        (_, Some(r)) => {
            println!(
                "  Would record: {} - score {} ({}), share {:.2}",
                r.signature, r.confidence_score, r.status, r.dominant_share
            );
        }
        (_, None) => {}
    }
    if let Some(adjustment) = &plan.adjustment {
        println!("  Reviewed adjustment applied: {adjustment:?}");
    }
    if let Some(conflict) = &plan.conflict {
        println!("  Would flag: {}", conflict.description);
    }
}

fn print_candidates(plan: &CandidatePlan) {
    println!(
        "Would process {} part numbers with >= {} listings{} (dry run)",
        plan.candidates.len(),
        plan.min_listings,
        if plan.new_data_only { " and new data" } else { "" }
    );
    for bucket in &plan.histogram {
        println!("  {:>9} listings: {} part numbers", bucket.label, bucket.count);
    }
}

fn print_result(result: &ProcessResult) {
    match (&result.reason, result.status) {
        (Some(reason), _) => println!("{}: skipped, {reason}", result.part_number),
        (None, Some(status)) => println!(
            "{}: {status}, {} conflict(s), {} malformed observation(s)",
            result.part_number, result.conflicts, result.skipped_observations
        ),
        (None, None) => println!("{}: no result", result.part_number),
    }
}

fn print_summary(summary: &BatchSummary) {
    println!("Consensus processing complete:");
    println!("  Candidates: {}", summary.candidates);
    println!("  Parts processed: {}", summary.total_parts_processed);
    println!("  Fitments created/updated: {}", summary.total_fitments_processed);
    println!("  Conflicts identified: {}", summary.total_conflicts_identified);
    println!("  Skipped (insufficient data): {}", summary.skipped);
    println!("  Malformed observations: {}", summary.skipped_observations);
    println!("  Failed: {}", summary.failed.len());
    for failure in &summary.failed {
        println!("    {}: {}", failure.part_number, failure.error);
    }
    if summary.cancelled {
        println!("  Cancelled with {} part numbers not started", summary.not_started());
    }
}

fn print_stats(engine: &ConsensusEngine) -> ConsensusResult<()> {
    let stats = engine.get_processing_stats()?;
    println!("Processing statistics:");
    println!("  Observations: {}", stats.observations_total);
    println!("  Unique part numbers: {}", stats.unique_part_numbers);
    println!("  Consensus fitments: {}", stats.consensus_total);
    println!("    High confidence: {}", stats.high_confidence_count);
    println!("    Medium confidence: {}", stats.medium_confidence_count);
    println!("    Low confidence: {}", stats.low_confidence_count);
    println!("    Needs review: {}", stats.needs_review_count);
    println!(
        "  Conflicts: {} pending, {} resolved, {} dismissed",
        stats.pending_conflicts, stats.resolved_conflicts, stats.dismissed_conflicts
    );
    println!("  High confidence: {:.2}%", stats.high_confidence_percentage);
    println!("  Production ready: {:.2}%", stats.production_ready_percentage);
    Ok(())
}

/// Instant `days` days before `now`, or a config error when out of range.
fn cutoff(now: DateTime<Utc>, days: i64) -> ConsensusResult<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| {
            ConsensusError::Config(ConfigError::Invalid {
                message: format!("--older-than-days {days} is out of range"),
            })
        })
}

fn conflict_filter(
    args: &Args,
    status: Option<ConflictStatus>,
    now: DateTime<Utc>,
) -> ConsensusResult<ConflictFilter> {
    let mut filter = ConflictFilter::any().with_status(status);
    if let Some(part) = &args.part_number {
        filter = filter.for_part(part.as_str());
    }
    if let Some(days) = args.older_than_days {
        filter = filter.created_before(cutoff(now, days)?);
    }
    Ok(filter)
}

fn print_conflicts(summary: &ConflictSummary, limit: usize) {
    if summary.total == 0 {
        println!("No conflicts found matching the criteria");
        return;
    }
    println!("Found {} conflicts", summary.total);
    println!("Top part numbers by conflict count:");
    for part in &summary.top_parts {
        println!("  {}: {} conflicts", part.part_number, part.conflicts);
    }
    println!("Conflict categories:");
    for (category, count) in &summary.by_category {
        println!("  {category}: {count}");
    }
    println!("Average age: {:.1} days", summary.average_age_days);

    let shown = summary.conflicts.len().min(limit);
    for (n, entry) in summary.conflicts.iter().take(limit).enumerate() {
        let c = &entry.conflict;
        println!("--- Conflict {}/{shown} ---", n + 1);
        println!("  Part number: {}", c.part_number);
        println!("  Category: {}", c.category);
        println!("  Description: {}", c.description);
        println!(
            "  Created: {} ({} days ago)",
            c.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.age_days
        );
        println!("  Status: {}", c.status);
        println!("  Listings: {}", c.listing_refs.len());
        if let Some(by) = &c.resolved_by {
            println!("  Reviewed by: {by}");
        }
        if let Some(notes) = &c.resolution_notes {
            println!("  Notes: {notes}");
        }
    }
}

fn list_conflicts(engine: &ConsensusEngine, args: &Args) -> ConsensusResult<()> {
    let now = Utc::now();
    let status = args.status.unwrap_or(StatusArg::Pending).status();
    let filter = conflict_filter(args, status, now)?;
    let summary = engine.conflict_summary(&filter, now)?;
    print_conflicts(&summary, args.limit.unwrap_or(DEFAULT_CONFLICT_LIMIT));

    if let Some(path) = &args.report {
        let body = serde_json::to_vec_pretty(&summary)
            .map_err(|e| ConsensusError::internal(format!("failed to encode report: {e}")))?;
        std::fs::write(path, body).map_err(|e| {
            ConsensusError::internal(format!("failed to write {}: {e}", path.display()))
        })?;
        println!("Conflict report written to {}", path.display());
    }
    Ok(())
}

fn auto_resolve(engine: &ConsensusEngine, args: &Args) -> ConsensusResult<()> {
    let filter = conflict_filter(args, Some(ConflictStatus::Pending), Utc::now())?;

    if args.dry_run {
        let decisions = engine.preview_auto_resolve(&filter)?;
        println!("Would examine {} pending conflicts (dry run):", decisions.len());
        for (conflict, decision) in decisions {
            println!(
                "  {} [{}]: {} - {}",
                conflict.part_number, conflict.category, decision.action, decision.notes
            );
        }
        return Ok(());
    }

    let summary = engine.auto_resolve(&filter)?;
    println!("Auto-resolution complete:");
    println!("  Examined: {}", summary.examined);
    println!("  Resolved: {}", summary.resolved);
    println!("  Dismissed: {}", summary.dismissed);
    println!("  Left for manual review: {}", summary.manual);
    println!("  Failed: {}", summary.failed);
    Ok(())
}

fn save_state(sink: &InMemoryConsensusSink, path: Option<&Path>) -> ConsensusResult<()> {
    if let Some(path) = path {
        sink.save_json(path).map_err(ConsensusError::from_storage)?;
        tracing::info!(path = %path.display(), "State saved.");
    }
    Ok(())
}

fn run(args: &Args) -> ConsensusResult<()> {
    let cfg = load_config(args)?;
    let store = Arc::new(
        InMemoryObservationStore::load_json(&args.observations)
            .map_err(ConsensusError::from_storage)?,
    );
    let sink = Arc::new(match &args.state {
        Some(path) => {
            InMemoryConsensusSink::load_json_or_default(path).map_err(ConsensusError::from_storage)?
        }
        None => InMemoryConsensusSink::new(),
    });
    let engine = ConsensusEngine::new(store, sink.clone(), cfg);

    if args.stats_only {
        return print_stats(&engine);
    }

    if args.list_conflicts {
        return list_conflicts(&engine, args);
    }

    if args.auto_resolve {
        auto_resolve(&engine, args)?;
        if !args.dry_run {
            save_state(&sink, args.state.as_deref())?;
        }
        return Ok(());
    }

    if let Some(part) = &args.part_number {
        if args.dry_run {
            print_plan(&engine.plan_part_number(part)?);
            return Ok(());
        }
        let result = engine.process_part_number(part)?;
        print_result(&result);
        return save_state(&sink, args.state.as_deref());
    }

    if args.dry_run {
        print_candidates(&engine.plan_candidates(args.min_listings, args.new_data_only)?);
        return Ok(());
    }

    let summary = if args.new_data_only {
        engine.process_new_data_only(args.min_listings)?
    } else {
        engine.process_all(args.min_listings)?
    };
    print_summary(&summary);
    save_state(&sink, args.state.as_deref())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Consensus run failed.");
            eprintln!("fitment-consensus: {err}");
            ExitCode::FAILURE
        }
    }
}
