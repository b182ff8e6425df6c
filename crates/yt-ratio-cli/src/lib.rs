//! Command surface for the ratio ranking store.
//!
//! Hosts that embed the rankings should go through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for a single [`Command`] against a database path.
//! - [`run_command`] for execution against an open [`SqliteRatioStore`].

mod format;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::level_filters::LevelFilter;
use yt_ratio_core::{Bucket, RankingConfig, VideoObservation, VideoRecord, DEFAULT_NAMESPACE};
use yt_ratio_store_sqlite::{SqliteRatioStore, StoreStatus};

#[derive(Debug, Parser)]
#[command(name = "ytr")]
#[command(about = "Like/dislike ratio rankings for watched videos")]
pub struct Cli {
    #[arg(long, default_value = "./yt_ratio.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    #[command(flatten)]
    ranking: RankingArgs,

    /// Raise log verbosity (-v info, -vv debug). Logs go to stderr.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct RankingArgs {
    /// JSON file with `floor`, `factor` and `max_per_bucket`.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    floor: Option<u64>,
    #[arg(long)]
    factor: Option<f64>,
    #[arg(long)]
    max_per_bucket: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Observe(ObserveArgs),
    Rankings {
        #[command(subcommand)]
        command: RankingsCommand,
    },
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
    Status(JsonArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct ObserveArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long, allow_negative_numbers = true)]
    views: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    likes: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    dislikes: Option<i64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RankingsCommand {
    Show(JsonArgs),
}

#[derive(Debug, Subcommand)]
pub enum RecordsCommand {
    List(JsonArgs),
    Show(RecordsShowArgs),
}

#[derive(Debug, Args)]
pub struct RecordsShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

/// Installs the stderr log subscriber. Safe to call more than once.
pub fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the configuration is invalid, the store cannot be
/// opened or migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli.ranking)?;
    run_with_db(&cli.db, &cli.namespace, &config, cli.command)
}

/// Executes one command against the `SQLite` database at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(
    db_path: &Path,
    namespace: &str,
    config: &RankingConfig,
    command: Command,
) -> Result<()> {
    if let Command::Config {
        command: ConfigCommand::Show,
    } = command
    {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let mut store = SqliteRatioStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store, namespace, config)
}

/// Executes one command against an open store handle.
///
/// # Errors
/// Returns an error when the observation is rejected or a read/write fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteRatioStore,
    namespace: &str,
    config: &RankingConfig,
) -> Result<()> {
    match command {
        Command::Observe(args) => run_observe(args, store, namespace, config),
        Command::Rankings {
            command: RankingsCommand::Show(args),
        } => {
            let buckets = store.rankings(namespace, config)?;
            if args.json {
                let payload =
                    build_rankings_json_payload(namespace, config, &buckets, OffsetDateTime::now_utc())?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                format::print_rankings(&buckets);
            }
            Ok(())
        }
        Command::Records { command } => run_records(command, store, namespace),
        Command::Status(args) => {
            let status = store.status(namespace, config)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(())
        }
    }
}

fn run_observe(
    args: ObserveArgs,
    store: &mut SqliteRatioStore,
    namespace: &str,
    config: &RankingConfig,
) -> Result<()> {
    let json = args.json;
    let observation = VideoObservation {
        id: args.id,
        title: args.title,
        view_count: args.views,
        likes: args.likes,
        dislikes: args.dislikes,
    };

    let Some(outcome) = store.observe(namespace, Some(observation), config)? else {
        return Err(anyhow!(
            "internal dispatch error: observe returned no outcome for a present observation"
        ));
    };

    if json {
        let payload = ObserveJsonPayload {
            contract_version: "observe.v1".to_string(),
            namespace: namespace.to_string(),
            ratio: outcome.ratio(),
            retained: outcome.retained,
            removed_ids: outcome.removed_ids.clone(),
            record: outcome.record.clone(),
            rankings: build_rankings_json_payload(
                namespace,
                config,
                &outcome.buckets,
                OffsetDateTime::now_utc(),
            )?,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!(
            "ratio: {} ({})",
            format::ratio(outcome.ratio()),
            if outcome.retained {
                "stored"
            } else {
                "below retention cap, not stored"
            }
        );
        if !outcome.removed_ids.is_empty() {
            println!("pruned: {}", outcome.removed_ids.join(", "));
        }
        println!();
        format::print_rankings(&outcome.buckets);
    }

    Ok(())
}

fn run_records(command: RecordsCommand, store: &SqliteRatioStore, namespace: &str) -> Result<()> {
    let records = store.load_records(namespace)?;
    match command {
        RecordsCommand::List(args) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(records.records())?);
            } else {
                format::print_records(records.records());
            }
            Ok(())
        }
        RecordsCommand::Show(args) => {
            let Some(record) = records.get(&args.id) else {
                return Err(anyhow!("record not found for {} in {namespace}", args.id));
            };
            println!("{}", serde_json::to_string_pretty(record)?);
            Ok(())
        }
    }
}

/// Builds the effective config: file (or defaults), then flag overrides.
fn resolve_config(args: &RankingArgs) -> Result<RankingConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("config file must be valid JSON: {}", path.display()))?;
            RankingConfig::from_json(&value)
                .map_err(|err| anyhow!("invalid config file {}: {err}", path.display()))?
        }
        None => RankingConfig::v1(),
    };

    if let Some(floor) = args.floor {
        config.floor = floor;
    }
    if let Some(factor) = args.factor {
        config.factor = factor;
    }
    if let Some(max_per_bucket) = args.max_per_bucket {
        config.max_per_bucket = max_per_bucket;
    }

    config
        .validate()
        .map_err(|err| anyhow!("invalid ranking configuration: {err}"))?;
    Ok(config)
}

fn print_status(status: &StoreStatus) {
    println!(
        "contract={} namespace={} present={} blob_bytes={} updated_at={}",
        status.contract_version,
        status.namespace,
        if status.present { "yes" } else { "no" },
        status.blob_bytes,
        status.updated_at.as_deref().unwrap_or("n/a")
    );
    println!(
        "records={} ranked={} buckets={}",
        status.record_count, status.ranked_count, status.bucket_count
    );
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RankingsJsonPayload {
    contract_version: String,
    generated_at: String,
    namespace: String,
    config: RankingConfig,
    rankings: Vec<Bucket>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ObserveJsonPayload {
    contract_version: String,
    namespace: String,
    ratio: f64,
    retained: bool,
    removed_ids: Vec<String>,
    record: VideoRecord,
    rankings: RankingsJsonPayload,
}

fn build_rankings_json_payload(
    namespace: &str,
    config: &RankingConfig,
    buckets: &[Bucket],
    generated_at: OffsetDateTime,
) -> Result<RankingsJsonPayload> {
    Ok(RankingsJsonPayload {
        contract_version: "rankings.v1".to_string(),
        generated_at: generated_at
            .format(&Rfc3339)
            .context("failed to format generated_at")?,
        namespace: namespace.to_string(),
        config: *config,
        rankings: buckets.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use serde_json::json;
    use std::fs;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn temp_db(label: &str) -> (PathBuf, String) {
        let path = std::env::temp_dir().join(format!("ytr-{label}-{}.sqlite3", Ulid::new()));
        let as_str = match path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        (path, as_str)
    }

    fn observe_args(db: &str, id: &str, views: &str, likes: &str, dislikes: &str) -> Vec<String> {
        [
            "ytr",
            "--db",
            db,
            "--max-per-bucket",
            "2",
            "observe",
            "--id",
            id,
            "--title",
            &format!("video {id}"),
            "--views",
            views,
            "--likes",
            likes,
            "--dislikes",
            dislikes,
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    #[test]
    fn resolve_config_applies_file_then_flag_overrides() {
        let path = std::env::temp_dir().join(format!("ytr-config-{}.json", Ulid::new()));
        must(fs::write(&path, r#"{"floor": 50, "factor": 4.0}"#).map_err(Into::into));

        let config = must(resolve_config(&RankingArgs {
            config: Some(path.clone()),
            floor: None,
            factor: None,
            max_per_bucket: Some(3),
        }));
        assert_eq!(config.floor, 50);
        assert!((config.factor - 4.0).abs() < f64::EPSILON);
        assert_eq!(config.max_per_bucket, 3);

        let overridden = must(resolve_config(&RankingArgs {
            config: Some(path.clone()),
            floor: Some(1_000),
            factor: None,
            max_per_bucket: None,
        }));
        assert_eq!(overridden.floor, 1_000);
        assert_eq!(overridden.max_per_bucket, 10);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn resolve_config_rejects_invalid_scale() {
        let result = resolve_config(&RankingArgs {
            factor: Some(0.0),
            ..RankingArgs::default()
        });
        let err = match result {
            Ok(_) => panic!("expected invalid factor to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("invalid ranking configuration"));
    }

    #[test]
    fn rankings_json_contract_is_stable_v1() {
        let generated_at = match OffsetDateTime::parse("2026-02-07T12:00:00Z", &Rfc3339) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        };
        let bucket = Bucket {
            lower: 100,
            upper: 1_000,
            entries: vec![VideoRecord::new("abc", "A video", 150, 10, 0)],
        };

        let payload = must(build_rankings_json_payload(
            DEFAULT_NAMESPACE,
            &RankingConfig::v1(),
            &[bucket],
            generated_at,
        ));
        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "rankings.v1",
                "generated_at": "2026-02-07T12:00:00Z",
                "namespace": "us-yt-ratio",
                "config": {
                    "floor": 100,
                    "factor": 10.0,
                    "max_per_bucket": 10
                },
                "rankings": [
                    {
                        "lower": 100,
                        "upper": 1000,
                        "entries": [
                            {
                                "id": "abc",
                                "title": "A video",
                                "viewCount": 150,
                                "likes": 10,
                                "dislikes": 0,
                                "ratio": 10.0
                            }
                        ]
                    }
                ]
            })
        );
    }

    #[test]
    fn cli_end_to_end_observe_prune_and_show() {
        let (db_path, db) = temp_db("e2e");

        must(execute_cli(observe_args(&db, "a", "150", "10", "2")));
        must(execute_cli(observe_args(&db, "b", "150", "20", "4")));
        must(execute_cli(observe_args(&db, "c", "5000", "9", "1")));
        must(execute_cli(observe_args(&db, "d", "900", "1", "50")));

        for args in [
            vec!["ytr", "--db", &db, "rankings", "show", "--json"],
            vec!["ytr", "--db", &db, "rankings", "show"],
            vec!["ytr", "--db", &db, "records", "list"],
            vec!["ytr", "--db", &db, "records", "show", "--id", "a"],
            vec!["ytr", "--db", &db, "status", "--json"],
        ] {
            must(execute_cli(args.iter().map(ToString::to_string).collect()));
        }

        let missing = execute_cli(
            ["ytr", "--db", &db, "records", "show", "--id", "d"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        );
        assert!(missing.is_err());

        let store = must(SqliteRatioStore::open(&db_path));
        must(store.migrate());
        let records = must(store.load_records(DEFAULT_NAMESPACE));
        let ids: Vec<&str> = records.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn ineligible_observation_fails_without_writing() {
        let (db_path, db) = temp_db("ineligible");

        let negative = execute_cli(observe_args(&db, "a", "-5", "10", "2"));
        let err = match negative {
            Ok(()) => panic!("negative view count must be rejected"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("ineligible record"));

        let mut missing_likes = observe_args(&db, "b", "150", "10", "2");
        missing_likes.truncate(missing_likes.len() - 4);
        missing_likes.extend(["--dislikes".to_string(), "2".to_string()]);
        assert!(execute_cli(missing_likes).is_err());

        let store = must(SqliteRatioStore::open(&db_path));
        must(store.migrate());
        assert!(must(store.get_value(DEFAULT_NAMESPACE)).is_none());

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn stable_embed_api_runs_against_open_store() {
        let (db_path, _) = temp_db("embed");
        let config = RankingConfig::v1();

        must(run_with_db(
            &db_path,
            "embedded",
            &config,
            Command::Observe(ObserveArgs {
                id: "abc".to_string(),
                title: "embedded".to_string(),
                views: Some(1_500),
                likes: Some(30),
                dislikes: Some(0),
                json: true,
            }),
        ));

        let mut store = must(SqliteRatioStore::open(&db_path));
        must(store.migrate());
        must(run_command(
            Command::Rankings {
                command: RankingsCommand::Show(JsonArgs { json: true }),
            },
            &mut store,
            "embedded",
            &config,
        ));

        let buckets = must(store.rankings("embedded", &config));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].lower, 1_000);
        assert!((buckets[0].entries[0].ratio - 30.0).abs() < f64::EPSILON);
        assert!(must(store.get_value(DEFAULT_NAMESPACE)).is_none());

        let _ = fs::remove_file(&db_path);
    }
}
