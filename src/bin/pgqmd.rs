//! pgqmd - PostgreSQL query metrics collector daemon.
//!
//! Polls `pg_stat_statements` at a fixed interval and writes query metrics
//! payloads and full-query-text events as JSON lines.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgqm::collector::PgSource;
use pgqm::collector::statements::{CycleOutcome, StatementMetricsJob};
use pgqm::config::StatementMetricsConfig;
use pgqm::diagnostics::TracingSink;
use pgqm::obfuscate::LiteralObfuscator;
use pgqm::sink::JsonLinesSink;

/// PostgreSQL query metrics collector daemon.
#[derive(Parser, Debug)]
#[command(name = "pgqmd", about = "PostgreSQL query metrics collector daemon", version)]
struct Args {
    /// JSON settings file. Command line options override its values.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Collection interval in seconds.
    #[arg(short, long, env = "PGQM_INTERVAL")]
    interval: Option<f64>,

    /// Database to connect to. Defaults to PGDATABASE.
    #[arg(long, env = "PGQM_DBNAME")]
    dbname: Option<String>,

    /// Only collect statements executed in the connected database.
    #[arg(long, env = "PGQM_DBSTRICT")]
    dbstrict: bool,

    /// View exposing pg_stat_statements columns.
    #[arg(long, env = "PGQM_VIEW")]
    view: Option<String>,

    /// Global tag (key:value). Repeat or separate with commas.
    #[arg(short, long = "tag", env = "PGQM_TAGS", value_delimiter = ',')]
    tags: Vec<String>,

    /// Host name reported in payloads.
    #[arg(long, env = "PGQM_HOST")]
    host: Option<String>,

    /// Full query text events per query identity per hour.
    #[arg(long, env = "PGQM_SAMPLES_PER_HOUR")]
    samples_per_hour: Option<f64>,

    /// Capacity of the full query text rate limiting cache.
    #[arg(long)]
    cache_size: Option<usize>,

    /// Maximum rows fetched from the statistics view per cycle.
    #[arg(long)]
    limit: Option<u32>,

    /// Output file for JSON lines. Defaults to stdout.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Connect with TLS.
    #[arg(long, env = "PGQM_TLS")]
    tls: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgqmd", "pgqm"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Settings file (if any) overlaid with command line options.
fn build_config(args: &Args, database: &str) -> Result<StatementMetricsConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| format!("cannot parse {}: {e}", path.display()))?
        }
        None => StatementMetricsConfig::default(),
    };

    config.dbname = database.to_string();
    config.dbstrict |= args.dbstrict;
    if let Some(interval) = args.interval {
        config.collection_interval = interval;
    }
    if let Some(view) = &args.view {
        config.pg_stat_statements_view = view.clone();
    }
    if !args.tags.is_empty() {
        config.tags = args.tags.clone();
    }
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(rate) = args.samples_per_hour {
        config.full_statement_text_samples_per_hour_per_query = rate;
    }
    if let Some(size) = args.cache_size {
        config.full_statement_text_cache_max_size = size;
    }
    if let Some(limit) = args.limit {
        config.statements_limit = limit;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn open_output(path: Option<&PathBuf>) -> io::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(Box::new(io::LineWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);
    info!("pgqmd {} starting", env!("CARGO_PKG_VERSION"));

    let source = match PgSource::from_env() {
        Ok(source) => source.with_tls(args.tls),
        Err(e) => {
            error!("PostgreSQL connection settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut source = match &args.dbname {
        Some(dbname) => source.for_database(dbname),
        None => source,
    };

    let config = match build_config(&args, source.database()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Config: interval={:?}, database={}, view={}, dbstrict={}",
        config.collection_interval(),
        config.dbname,
        config.pg_stat_statements_view,
        config.dbstrict
    );

    // The source reconnects on its own; a failed first attempt is not fatal.
    if let Err(e) = source.try_connect() {
        warn!("PostgreSQL: connection failed ({}), will retry", e);
    }

    let output = match open_output(args.output.as_ref()) {
        Ok(output) => output,
        Err(e) => {
            error!("Cannot open output: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut events = JsonLinesSink::new(output);
    let mut diag = TracingSink;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let interval = config.collection_interval();
    let mut job = match StatementMetricsJob::new(source, LiteralObfuscator::new(), config) {
        Ok(job) => job.with_shutdown_flag(running.clone()),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting collection loop");
    let mut cycles: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        cycles += 1;

        match job.run_cycle(&mut diag, &mut events) {
            CycleOutcome::Emitted { rows, fqt_events } => {
                info!("Cycle #{}: {} rows, {} full text events", cycles, rows, fqt_events);
            }
            CycleOutcome::NoRows => debug!("Cycle #{}: nothing to report", cycles),
            CycleOutcome::Cancelled => break,
            CycleOutcome::Failed => {
                if let Some(e) = job.source().last_error() {
                    warn!("PostgreSQL: {}", e);
                }
            }
        }

        // Fixed rate: sleep the rest of the interval, checking for shutdown.
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval.saturating_sub(started.elapsed());
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["pgqmd"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn command_line_overrides_defaults() {
        let args = args(&[
            "--interval",
            "15",
            "--tag",
            "env:prod,team:db",
            "--samples-per-hour",
            "4",
            "--dbstrict",
        ]);
        let config = build_config(&args, "app").unwrap();

        assert_eq!(config.dbname, "app");
        assert!(config.dbstrict);
        assert_eq!(config.collection_interval(), Duration::from_secs(15));
        assert_eq!(config.tags, vec!["env:prod", "team:db"]);
        assert_eq!(config.full_statement_text_ttl(), Duration::from_secs(900));
    }

    #[test]
    fn settings_file_is_overlaid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"statements_limit": 50, "host": "db-7"}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = build_config(&args(&["--config", &path, "--limit", "20"]), "app").unwrap();
        assert_eq!(config.statements_limit, 20);
        assert_eq!(config.host, "db-7");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let args = args(&["--samples-per-hour", "0"]);
        assert!(build_config(&args, "app").is_err());
    }
}
