use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gitshard::config::{ConfigOverrides, ShardsOverrides};
use gitshard::{
    AdmissionController, ConfigSource, FileConfigSource, GitShardConfig, MemoryConfigSource,
    ShardRouter, TonicDialer,
};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

/// Arguments that are neither flags nor flag values.
fn positional_args() -> Vec<String> {
    const VALUED: &[&str] = &[
        "-c",
        "--config",
        "-a",
        "--addresses",
        "--admission-limit",
        "--watch",
    ];
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if VALUED.contains(&arg.as_str()) {
            args.next();
        } else if !arg.starts_with('-') {
            positional.push(arg);
        }
    }
    positional
}

fn print_help() {
    eprintln!(
        r#"gitshard-probe - show which gitserver shard owns a repository

USAGE:
    gitshard-probe [OPTIONS] [REPO]...

OPTIONS:
    -c, --config <FILE>          Path to config file (TOML)
    -a, --addresses <ADDRS>      Override shard addresses (comma-separated)
        --admission-limit <N>    Override admission limit [default: 500]
        --all                    List every shard with its dial status
        --watch <SECS>           Reload the config file every SECS and re-print
        --json                   Print JSON instead of text
    -h, --help                   Print help

ENVIRONMENT:
    GITSHARD_CONFIG              Path to config file
    GITSHARD_ADMISSION_LIMIT     Admission limit
    GITSHARD_SHARDS__ADDRESSES   Shard addresses, e.g. ["gitserver-0:3178"]
    RUST_LOG                     Log filter [default: info]

CONFIG FILE (gitshard.toml):
    admission_limit = 500

    [shards]
    addresses = ["gitserver-0:3178", "gitserver-1:3178"]

    [shards.pinned]
    "github.com/sourcegraph/sourcegraph" = "gitserver-1:3178"
"#
    );
}

fn report(router: &ShardRouter<TonicDialer>, repos: &[String], all: bool, json: bool) {
    let placements: Vec<_> = repos
        .iter()
        .map(|repo| {
            let placed = router.addr_for_repo(repo).map_err(|e| e.to_string());
            let dial = router.conn_for_repo(repo).err().map(|e| e.to_string());
            (repo, placed, dial)
        })
        .collect();
    let shards = if all { router.addresses() } else { Vec::new() };

    if json {
        let value = serde_json::json!({
            "placements": placements.iter().map(|(repo, placed, dial)| serde_json::json!({
                "repo": repo,
                "address": placed.as_ref().ok(),
                "error": placed.as_ref().err().or(dial.as_ref()),
            })).collect::<Vec<_>>(),
            "shards": shards.iter().map(|shard| serde_json::json!({
                "address": shard.address,
                "error": shard.error.as_ref().map(|e| e.to_string()),
            })).collect::<Vec<_>>(),
            "metrics": router.metrics(),
        });
        println!("{value}");
        return;
    }

    for (repo, placed, dial) in &placements {
        match (placed, dial) {
            (Ok(address), None) => println!("{repo} -> {address}"),
            (Ok(address), Some(err)) => println!("{repo} -> {address} (unavailable: {err})"),
            (Err(err), _) => println!("{repo} -> error: {err}"),
        }
    }
    for shard in &shards {
        match &shard.error {
            None => println!("{}\tok", shard.address),
            Some(err) => println!("{}\t{err}", shard.address),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut overrides = ConfigOverrides::default();
    if let Some(limit) = parse_arg("--admission-limit") {
        overrides.admission_limit = Some(limit.parse()?);
    }
    if let Some(addrs) = parse_arg("--addresses").or_else(|| parse_arg("-a")) {
        overrides.shards = Some(ShardsOverrides {
            addresses: Some(addrs.split(',').map(str::to_string).collect()),
        });
    }
    let watch = parse_arg("--watch")
        .map(|secs| secs.parse::<u64>())
        .transpose()?
        .map(Duration::from_secs);

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("GITSHARD_CONFIG").ok())
        .map(PathBuf::from);
    let config = GitShardConfig::load(config_path.as_deref(), overrides.clone())?;

    let mut poller = None;
    let source: Arc<dyn ConfigSource> = match (&config_path, overrides.shards.is_some()) {
        (Some(path), false) => {
            let file = Arc::new(FileConfigSource::open(path)?);
            if let Some(interval) = watch {
                poller = Some(file.spawn_poller(interval));
            }
            file
        }
        _ => {
            if watch.is_some() {
                tracing::warn!("--watch needs a config file and no --addresses override; ignoring");
            }
            Arc::new(MemoryConfigSource::from_config(&config))
        }
    };

    let admission = Arc::new(AdmissionController::new(config.admission_limit));
    let router = ShardRouter::new(
        source,
        TonicDialer::current(config.dial.clone())?,
        Arc::clone(&admission),
    );

    let repos = positional_args();
    let all = has_flag("--all") || repos.is_empty();
    let json = has_flag("--json");
    report(&router, &repos, all, json);

    let Some(interval) = watch.filter(|_| poller.is_some()) else {
        return Ok(());
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    // The file source notifies on every poll; only print when the table moved.
    let current_table = || router.snapshot().ok().map(|set| set.table().clone());
    let mut last = current_table();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let table = current_table();
                if table != last {
                    last = table;
                    report(&router, &repos, all, json);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some(poller) = poller {
        poller.abort();
    }
    admission.close();
    Ok(())
}
