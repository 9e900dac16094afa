use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vm_harness::catalog::Catalog;
use vm_harness::cli::{
    CheckArgs, Command, DiffArgs, HistoryArgs, InitConfigArgs, PromoteArgs, RootArgs, RunArgs,
};
use vm_harness::config;
use vm_harness::extract::Extractor;
use vm_harness::orchestrator::cancel::CancelToken;
use vm_harness::orchestrator::Orchestrator;
use vm_harness::pool::SessionPool;
use vm_harness::report::diff::{diff_reports, ReportDiff};
use vm_harness::report::persist::{
    append_history, load_report, promote, read_history, write_diff, write_report, HistoryEntry,
    OutputPaths,
};
use vm_harness::report::table::{render_table, summary_line};
use vm_harness::runner::ScriptRunner;
use vm_harness::signal;

const EXIT_INFRASTRUCTURE: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let args = RootArgs::parse();
    init_tracing(args.verbose);

    let result = match args.command {
        Command::Run(args) => cmd_run(args),
        Command::Check(args) => cmd_check(args),
        Command::Diff(args) => cmd_diff(args),
        Command::Promote(args) => cmd_promote(args),
        Command::History(args) => cmd_history(args),
        Command::InitConfig(args) => cmd_init_config(args),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_INFRASTRUCTURE)
        }
    }
}

fn load_catalog(path: &std::path::Path, only: &[String]) -> Result<Catalog> {
    let catalog =
        Catalog::load(path).with_context(|| format!("load catalog {}", path.display()))?;
    if only.is_empty() {
        return Ok(catalog);
    }
    Ok(catalog.select(only)?)
}

fn cmd_run(args: RunArgs) -> Result<u8> {
    let catalog = load_catalog(&args.catalog, &args.cases)?;
    let (config, config_path) = config::load_effective(args.config.as_deref())?;
    let engine = config.build_engine()?;
    tracing::info!(
        catalog = %args.catalog.display(),
        config = %config_path.as_ref().map_or("<defaults>".to_string(), |p| p.display().to_string()),
        engine = %engine.describe(),
        cases = catalog.len(),
        expectations = catalog.expectation_count(),
        "starting verification run"
    );

    if !signal::install_sigint_handler() {
        tracing::warn!("could not install SIGINT handler; Ctrl-C will terminate immediately");
    }
    let pool = SessionPool::new(engine, config.pool_config());
    let concurrency = args.concurrency.unwrap_or(config.pool.capacity);
    let orchestrator = Orchestrator::new(
        pool,
        ScriptRunner::new(config.runner_config()),
        Extractor::new(config.execution.query_template.clone()),
        concurrency,
    )
    .with_retry(config.retry_policy())
    .with_cancel(CancelToken::with_external(&signal::INTERRUPTED))
    .fail_fast(args.fail_fast || config.fail_fast);

    let report = orchestrator.run(&catalog);

    let paths = OutputPaths::new(&args.out);
    write_report(&paths, &report)?;
    let diff = match &args.baseline {
        Some(baseline) if baseline.is_file() => {
            let previous = load_report(baseline)?;
            let diff = diff_reports(&previous, &report);
            write_diff(&paths, &diff)?;
            Some(diff)
        }
        Some(baseline) => {
            tracing::warn!(baseline = %baseline.display(), "baseline not found; skipping diff");
            None
        }
        None => None,
    };
    append_history(&paths, &HistoryEntry::from_report(&report, diff.as_ref()))?;
    if args.promote {
        if let Some(baseline) = &args.baseline {
            promote(&paths.report_path(), baseline)?;
        }
    }

    if args.json {
        let text = serde_json::to_string_pretty(&report).context("serialize run report")?;
        println!("{text}");
    } else {
        print!("{}", render_table(&report));
        if let Some(diff) = &diff {
            print_diff(diff);
        }
    }

    if signal::interrupted() {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(u8::try_from(report.exit_code()).unwrap_or(EXIT_INFRASTRUCTURE))
}

fn cmd_check(args: CheckArgs) -> Result<u8> {
    let catalog = load_catalog(&args.catalog, &[])?;
    let (config, config_path) = config::load_effective(args.config.as_deref())?;
    let engine = config.build_engine()?;
    println!(
        "catalog ok: {} cases, {} expected values",
        catalog.len(),
        catalog.expectation_count()
    );
    println!(
        "config ok: {} (engine {}, capacity {})",
        config_path.map_or("<defaults>".to_string(), |p| p.display().to_string()),
        engine.describe(),
        config.pool.capacity
    );
    Ok(0)
}

fn print_diff(diff: &ReportDiff) {
    let s = &diff.summary;
    println!(
        "\nbaseline diff: {} regression, {} fixed, {} still_failing, {} unchanged, {} new, {} removed",
        s.regression, s.fixed, s.still_failing, s.unchanged, s.new, s.removed
    );
    for entry in diff.changes() {
        println!(
            "  {} {}/{}: {} -> {}",
            entry.kind.as_str().to_ascii_uppercase(),
            entry.case_id,
            entry.label,
            entry.baseline.map_or("-", |v| v.as_str()),
            entry.current.map_or("-", |v| v.as_str())
        );
    }
}

fn cmd_diff(args: DiffArgs) -> Result<u8> {
    let baseline = load_report(&args.baseline)?;
    let current = load_report(&args.current)?;
    let diff = diff_reports(&baseline, &current);
    if let Some(out) = &args.out {
        write_diff(&OutputPaths::new(out), &diff)?;
    }
    if args.json {
        let text = serde_json::to_string_pretty(&diff).context("serialize diff")?;
        println!("{text}");
    } else {
        print_diff(&diff);
    }
    if args.fail_on_regression && diff.has_regressions() {
        return Ok(1);
    }
    Ok(0)
}

fn cmd_promote(args: PromoteArgs) -> Result<u8> {
    promote(&args.report, &args.baseline)?;
    println!(
        "promoted {} to {}",
        args.report.display(),
        args.baseline.display()
    );
    Ok(0)
}

fn cmd_history(args: HistoryArgs) -> Result<u8> {
    let paths = OutputPaths::new(&args.out);
    let entries = read_history(&paths.history_path())?;
    let skip = args.limit.map_or(0, |limit| entries.len().saturating_sub(limit));
    if args.json {
        let text =
            serde_json::to_string_pretty(&entries[skip..]).context("serialize run history")?;
        println!("{text}");
        return Ok(0);
    }
    for entry in &entries[skip..] {
        let regressions = entry
            .regressions
            .map_or_else(String::new, |count| format!(", {count} regressions"));
        println!(
            "{}  {}{}  {}{}",
            entry.generated_at_epoch_ms,
            entry.verdict,
            if entry.aborted { " (aborted)" } else { "" },
            summary_line(&entry.summary),
            regressions
        );
    }
    Ok(0)
}

fn cmd_init_config(args: InitConfigArgs) -> Result<u8> {
    let path = match args.path {
        Some(path) => path,
        None => config::user_config_path()
            .ok_or_else(|| anyhow!("no user config directory; pass --path"))?,
    };
    config::write_default_config(&path, args.force)?;
    println!("wrote {}", path.display());
    Ok(0)
}
