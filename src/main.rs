//! tidemark CLI - inspect and edit pipeline run state.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tidemark::models::DEFAULT_CONFIG_FILE;
use tidemark::schedule::Transform;
use tidemark::{Config, Schedule, ScheduleService, StateRecord, StateStore, open_store};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(version)]
#[command(about = "Run-state store for resumable recurring data-integration pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// State backend connection string (overrides the configuration file)
    #[arg(long, global = true)]
    uri: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and edit run state
    #[command(subcommand)]
    State(StateCommand),

    /// Manage schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// Validate configuration file and open the state backend
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Subcommand)]
enum StateCommand {
    /// List state ids, optionally filtered by a glob pattern
    List {
        /// Glob pattern, e.g. "gitlab-*"
        pattern: Option<String>,
    },

    /// Print the state stored for an id
    Get { id: String },

    /// Store state for an id (replaces existing state unless --partial)
    Set {
        id: String,

        /// JSON object payload
        json: String,

        /// Merge into the existing state instead of replacing it
        #[arg(long)]
        partial: bool,
    },

    /// Merge a JSON object into the state for an id
    Merge {
        id: String,

        /// JSON object payload
        json: String,
    },

    /// Remove the state for an id
    Clear { id: String },

    /// Remove the state for every id matching a pattern (all ids if omitted)
    ClearAll {
        pattern: Option<String>,

        /// Required when no pattern is given
        #[arg(long)]
        force: bool,
    },

    /// Copy the state of one id onto another
    Copy { src: String, dst: String },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Register a new schedule
    Add(AddSchedule),

    /// List registered schedules
    List,

    /// Show one schedule and its stored state
    Show { name: String },
}

#[derive(Args)]
struct AddSchedule {
    /// Unique schedule name (also its state id)
    name: String,

    /// Extractor plugin
    #[arg(long)]
    extractor: String,

    /// Loader plugin
    #[arg(long)]
    loader: String,

    /// Cron expression or shorthand (@hourly, @daily, ...)
    #[arg(long, default_value = "@daily")]
    interval: String,

    /// Transform mode: run, only or skip
    #[arg(long, default_value = "skip")]
    transform: Transform,

    /// First run covered by the schedule (RFC 3339, defaults to now)
    #[arg(long)]
    start_date: Option<DateTime<Utc>>,

    /// Extra environment, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# tidemark configuration file

[state_backend]
# Connection string; the scheme selects the backend:
#   lmdb://<dir>[?map_size_mb=64]    embedded key-value store (default)
#   sqlite://<file>[?table=state]    one row per id
#   file://<dir>                     one JSON object per id
#   memory://                        in-process, for tests
uri = "lmdb://.tidemark/state"
# Environment variable that overrides uri when set; ${VAR} placeholders
# in uri are expanded too.
uri_env = "TIDEMARK_STATE_BACKEND_URI"

[state_backend.lock]
timeout_secs = 10
poll_interval_ms = 25
lease_ttl_secs = 60  # SQLite leases expire after this if the holder dies

[[schedules]]
name = "gitlab-to-postgres"
extractor = "tap-gitlab"
loader = "target-postgres"
transform = "skip"
interval = "@daily"
start_date = "2024-01-01T00:00:00Z"
env = { TAP_GITLAB_PROJECTS = "acme/app" }
"#;
    println!("{example}");
}

fn load_config(path: &Path, uri: Option<String>) -> Result<Config> {
    let mut config = Config::from_file_or_default(path)
        .with_context(|| format!("Failed to load config from {path:?}"))?;

    // Override the backend from CLI
    if let Some(uri) = uri {
        config.state_backend.uri = uri;
        config.state_backend.uri_env = None;
    }
    Ok(config)
}

fn open(config: &Config) -> Result<Box<dyn StateStore>> {
    open_store(&config.state_backend).context("Failed to open state backend")
}

fn parse_payload(id: &str, json: &str, complete: bool) -> Result<StateRecord> {
    let value: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("Invalid JSON for state '{id}'"))?;
    Ok(StateRecord::from_json(id, value, complete)?)
}

fn print_record(record: &StateRecord) -> Result<()> {
    let doc = serde_json::json!({
        "id": record.id,
        "complete": record.complete,
        "payload": record.payload,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

/// One tab-separated line per schedule for `schedule list`.
fn schedule_line(schedule: &Schedule) -> String {
    format!(
        "{}\t{} -> {}\t{}\ttransform={}",
        schedule.name, schedule.extractor, schedule.loader, schedule.interval, schedule.transform
    )
}

fn run_state(command: StateCommand, config: &Config) -> Result<()> {
    let store = open(config)?;

    match command {
        StateCommand::List { pattern } => {
            for id in store.list(pattern.as_deref())? {
                println!("{id}");
            }
        }

        StateCommand::Get { id } => match store.get(&id)? {
            Some(record) => print_record(&record)?,
            None => bail!("No state found for '{id}'"),
        },

        StateCommand::Set { id, json, partial } => {
            store.set(parse_payload(&id, &json, !partial)?)?;
            info!("State for '{id}' saved");
        }

        StateCommand::Merge { id, json } => {
            store.set(parse_payload(&id, &json, false)?)?;
            info!("State for '{id}' merged");
        }

        StateCommand::Clear { id } => {
            store.clear(&id)?;
            info!("State for '{id}' cleared");
        }

        StateCommand::ClearAll { pattern, force } => {
            if pattern.is_none() && !force {
                bail!("Refusing to clear every state id without --force");
            }
            let cleared = store.clear_all(pattern.as_deref())?;
            info!("Cleared {cleared} state id(s)");
        }

        StateCommand::Copy { src, dst } => {
            if !store.copy(&src, &dst)? {
                bail!("No state found for '{src}'");
            }
            info!("Copied state from '{src}' to '{dst}'");
        }
    }

    Ok(())
}

fn run_schedule(command: ScheduleCommand, config_path: &Path, config: &Config) -> Result<()> {
    let service = ScheduleService::new(config_path);

    match command {
        ScheduleCommand::Add(args) => {
            let mut schedule =
                Schedule::new(args.name, args.extractor, args.loader, args.interval);
            schedule.transform = args.transform;
            schedule.start_date = args.start_date;
            schedule.env = args.env.into_iter().collect::<BTreeMap<_, _>>();

            let schedule = service.add(schedule)?;
            info!("Schedule '{}' added to {config_path:?}", schedule.name);
        }

        ScheduleCommand::List => {
            for schedule in service.schedules()? {
                println!("{}", schedule_line(&schedule));
            }
        }

        ScheduleCommand::Show { name } => {
            let schedule = service.find(&name)?;
            println!("{}", toml::to_string_pretty(&schedule)?);

            let store = open(config)?;
            match store.get(schedule.state_id())? {
                Some(record) => print_record(&record)?,
                None => println!("# no state stored yet"),
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            for schedule in &config.schedules {
                schedule
                    .validate()
                    .with_context(|| format!("Invalid schedule '{}'", schedule.name))?;
            }
            let store = open(&config)?;

            info!("Configuration is valid");
            info!("  Backend: {} ({})", store.kind(), store.kind().label());
            info!("  Lock timeout: {:?}", config.state_backend.lock.timeout());
            info!("  Schedules: {}", config.schedules.len());
        }

        Commands::State(command) => {
            let config = load_config(&cli.config, cli.uri)?;
            run_state(command, &config)?;
        }

        Commands::Schedule(command) => {
            let config = load_config(&cli.config, cli.uri)?;
            run_schedule(command, &cli.config, &config)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_line_is_plain_ascii() {
        let schedule = Schedule::new("nightly", "tap-gitlab", "target-postgres", "@daily");
        let line = schedule_line(&schedule);
        assert_eq!(
            line,
            "nightly\ttap-gitlab -> target-postgres\t@daily\ttransform=skip"
        );
        assert!(line.is_ascii());
    }

    #[test]
    fn test_env_pair_parsing() {
        assert_eq!(
            parse_env_pair("KEY=a=b").unwrap(),
            ("KEY".to_string(), "a=b".to_string())
        );
        assert!(parse_env_pair("=value").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }
}
