use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use proxy_warden::{
    daemon::{Daemon, DaemonConfig},
    proxy::{
        Anonymity, CycleReport, GeoLocator, ListSource, ProxyStorage, ProxyStore, SqliteStorage, Validator,
        ValidatorConfig,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Keeps harvested proxies validated and graded by anonymity
#[derive(Parser)]
#[command(name = "proxy-warden")]
#[command(about = "Keeps harvested proxies validated and graded by anonymity")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest and validate forever, until Ctrl-C
    Run {
        #[command(flatten)]
        cycle: CycleArgs,
        /// Seconds to sleep between cycles (fractions allowed)
        #[arg(long, default_value = "60", value_parser = parse_seconds)]
        delay: Duration,
    },
    /// Run a single harvest + validation cycle
    Validate {
        #[command(flatten)]
        cycle: CycleArgs,
    },
    /// Print proxies from a saved JSON file
    List {
        /// JSON file written by `run`, `validate` or `export`
        input: PathBuf,
        /// Anonymity levels to keep (elite, anonymous, transparent)
        #[arg(short, long)]
        anonymity: Vec<String>,
        /// Protocols to keep (http, https, socks4, socks5)
        #[arg(short, long)]
        protocol: Vec<String>,
    },
    /// Write the currently valid stored proxies to a JSON file
    Export {
        /// Database file path
        #[arg(short, long, default_value = "proxies.db")]
        database: String,
        /// Output JSON file
        output: PathBuf,
    },
}

#[derive(Args)]
struct CycleArgs {
    /// Proxy lists as `[protocol=]path-or-url` (can specify multiple)
    #[arg(short, long = "list")]
    lists: Vec<String>,
    /// JSON file of previously saved proxies to start from
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Database file path; enables storage sync
    #[arg(short, long)]
    database: Option<String>,
    /// Merge stored proxies into the working set every cycle
    #[arg(long)]
    load: bool,
    /// Drop every stored proxy before the first cycle
    #[arg(long)]
    drop: bool,
    /// Re-check fresh proxies and always judge
    #[arg(short, long)]
    force: bool,
    /// Skip the anonymity judge
    #[arg(long)]
    no_judge: bool,
    /// Check batches concurrently
    #[arg(long)]
    parallel: bool,
    /// Batch size and number of batches in flight
    #[arg(short = 'n', long, default_value = "10")]
    max_workers: usize,
    /// Timeout in seconds for each probe
    #[arg(long, default_value = "10")]
    timeout: u64,
    /// IP-echo service used for liveness checks
    #[arg(long)]
    echo_url: Option<String>,
    /// Judge page used for anonymity grading
    #[arg(long)]
    judge_url: Option<String>,
    /// MaxMind database used to fill unknown countries
    #[arg(long)]
    mmdb: Option<PathBuf>,
    /// Where to write valid proxies after each cycle
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl CycleArgs {
    async fn into_daemon(self, delay: Duration) -> Result<Daemon> {
        let mut config = ValidatorConfig::new()
            .with_force(self.force)
            .with_judge(!self.no_judge)
            .with_parallel(self.parallel)
            .with_max_workers(self.max_workers)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_sync_storage(self.database.is_some());
        if let Some(url) = self.echo_url {
            config = config.with_echo_url(url);
        }
        if let Some(url) = self.judge_url {
            config = config.with_judge_url(url);
        }

        let mut daemon_config = DaemonConfig::new()
            .with_inter_cycle_delay(delay)
            .with_drop_storage_first(self.drop)
            .with_load_from_storage(self.load);
        if let Some(output) = self.output {
            daemon_config = daemon_config.with_output(output);
        }

        let mut validator = Validator::with_http_prober(config)?;
        let storage: Option<Arc<dyn ProxyStorage>> = match &self.database {
            Some(url) => Some(Arc::new(SqliteStorage::new(url).await?)),
            None => None,
        };
        if let Some(storage) = &storage {
            validator = validator.with_storage(Arc::clone(storage));
        }

        let mut store = ProxyStore::new();
        if let Some(input) = &self.input {
            let loaded = store.load_from_file(input)?;
            println!("Loaded {} proxies from {:?}", loaded, input);
        }

        let mut daemon = Daemon::new(daemon_config, validator).with_store(store);
        for arg in &self.lists {
            daemon = daemon.with_source(Box::new(ListSource::from_arg(arg)?));
        }
        if let Some(storage) = storage {
            daemon = daemon.with_storage(storage);
        }
        if let Some(path) = &self.mmdb {
            daemon = daemon.with_geo(GeoLocator::from_path(path)?);
        }

        Ok(daemon)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { cycle, delay } => {
            let mut daemon = cycle.into_daemon(delay).await?;
            daemon.run_forever().await?;
        }
        Commands::Validate { cycle } => {
            if cycle.lists.is_empty() && cycle.input.is_none() && !cycle.load {
                bail!("Nothing to validate: pass --list, --input or --load");
            }
            let mut daemon = cycle.into_daemon(Duration::ZERO).await?;
            let report = daemon.run_cycle().await?;
            print_report(&report);
        }
        Commands::List {
            input,
            anonymity,
            protocol,
        } => {
            let mut store = ProxyStore::new();
            store.load_from_file(&input)?;

            let anonymity = anonymity
                .iter()
                .map(|level| level.parse())
                .collect::<Result<Vec<Anonymity>, _>>()?;
            let anonymity = (!anonymity.is_empty()).then_some(anonymity.as_slice());
            let protocol = (!protocol.is_empty()).then_some(protocol.as_slice());
            let proxies = store.filter_by_names(anonymity, protocol)?;

            if proxies.is_empty() {
                println!("No proxies found.");
            } else {
                for proxy in proxies {
                    println!("{} {} {}", proxy, proxy.anonymity(), proxy.country());
                }
            }
        }
        Commands::Export { database, output } => {
            let storage = SqliteStorage::new(&database).await?;
            let mut store = ProxyStore::new();
            store.load_from_storage(&storage).await?;

            let saved = store.save_to_file(&output)?;
            println!("Saved {} valid proxies to {:?}", saved, output);
        }
    }

    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "Checked {} proxies in {} batches",
        report.selected, report.batches
    );
    println!(
        "Results: {} valid ({} redirecting), {} invalid, {} unexpected errors",
        report.valid, report.redirected, report.invalid, report.unexpected_errors
    );
    println!(
        "Judged: {} elite, {} anonymous, {} transparent, {} failed",
        report.elite, report.anonymous, report.transparent, report.judge_failed
    );
}

/// Parse a non-negative, possibly fractional number of seconds
fn parse_seconds(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("{:?} is not a number of seconds: {}", s, e))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("{:?} must be a non-negative number of seconds", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_seconds("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_seconds("0").unwrap(), Duration::ZERO);
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("NaN").is_err());
        assert!(parse_seconds("1e30").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn test_run_accepts_fractional_delay() {
        let cli = Cli::try_parse_from(["proxy-warden", "run", "--delay", "2.5"]).unwrap();
        match cli.command {
            Commands::Run { delay, .. } => assert_eq!(delay, Duration::from_millis(2500)),
            _ => panic!("expected the run command"),
        }
    }
}
