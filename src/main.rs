use std::path::PathBuf;
use std::sync::Arc;

use tiered_archive_common::{Clock, HotStore, ManualClock, Record, RecordId, SystemClock};
use tiered_archive_migrator::Migrator;
use tiered_archive_policy::{days_before, DAY};
use tiered_archive_proxy::{ProxyError, RehydrationProxy};
use tiered_archive_stores::{MemoryArchiveStore, MemoryHotStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod scenario;

use config::Config;

const USAGE: &str = "\
Usage: tiered-archive [--config <file.toml>] <command>

Commands:
  demo                         in-memory walkthrough of archive and rehydration
  migrate                      run one migration pass against the configured stores
  get <id>                     look a record up through the proxy
  put <id> <age_days> [json]   write a record to the hot store, as the upstream would
  serve                        migrate periodically until Ctrl-C
  scenario <file.toml>         run a scripted scenario against in-memory stores";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_flag_string(&args, "--config").map(PathBuf::from);
    let positional = positional_args(&args, &["--config"]);
    let cmd = positional.first().map(|s| s.as_str()).unwrap_or("demo");

    let config = Config::load(config_path.as_deref())?;

    match cmd {
        "demo" => run_demo(&config).await?,
        "migrate" => run_migrate(&config).await?,
        "get" => {
            let Some(id) = positional.get(1) else {
                usage_exit();
            };
            run_get(&config, id).await?;
        }
        "put" => {
            let (Some(id), Some(age_days)) = (positional.get(1), positional.get(2)) else {
                usage_exit();
            };
            let age_days: u64 = age_days.parse()?;
            run_put(&config, id, age_days, positional.get(3).map(|s| s.as_str())).await?;
        }
        "serve" => run_serve(&config).await?,
        "scenario" => {
            let Some(path) = positional.get(1) else {
                usage_exit();
            };
            scenario::run_scenario_cli(path, &config).await?;
        }
        _ => usage_exit(),
    }

    Ok(())
}

fn usage_exit() -> ! {
    eprintln!("{USAGE}");
    std::process::exit(1);
}

fn parse_flag_string(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Arguments that are neither a known flag nor a flag's value.
fn positional_args(args: &[String], flags_with_values: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
        } else if flags_with_values.contains(&arg.as_str()) {
            skip_next = true;
        } else {
            out.push(arg.clone());
        }
    }
    out
}

async fn run_demo(config: &Config) -> anyhow::Result<()> {
    println!("=== Tiered Archive Demo ===\n");

    let clock = Arc::new(ManualClock::new(SystemClock.now()));
    let hot = Arc::new(MemoryHotStore::new(clock.clone()));
    let archive = Arc::new(MemoryArchiveStore::new());
    let policy = config.tier_policy();

    let migrator = Migrator::new(
        hot.clone(),
        archive.clone(),
        clock.clone(),
        policy,
        config.retry_policy(),
        config.migrator_config(),
    );
    let proxy = RehydrationProxy::new(
        hot.clone(),
        archive.clone(),
        clock.clone(),
        policy,
        config.retry_policy(),
        config.proxy_config(),
    );

    // 1. Upstream writes: one record past the cutoff, one recent.
    let cutoff_days = policy.cutoff().as_secs() / DAY.as_secs();
    let now = clock.now();
    let old = Record::new(
        "acct-1#R1",
        days_before(now, cutoff_days + 1),
        serde_json::json!({"invoice": "R1", "amount": 120.5}),
    );
    let recent = Record::new(
        "acct-1#R3",
        days_before(now, 1),
        serde_json::json!({"invoice": "R3", "amount": 9.99}),
    );
    hot.put(&old, None).await?;
    hot.put(&recent, None).await?;
    println!("Wrote {} ({} days old) and {} (1 day old) to the hot store", old.id, cutoff_days + 1, recent.id);

    // 2. One migration pass.
    let report = migrator.run(&CancellationToken::new()).await?;
    println!("\nMigration: {report}");
    println!("Hot store: {} records, archive: {} blobs", hot.len(), archive.len());

    // 3. Reads are tier-transparent.
    println!();
    for id in [&old.id, &old.id, &recent.id] {
        let found = proxy.lookup(id).await?;
        println!("GET {id} -> served from {} tier: {}", found.tier, found.record.payload);
    }

    // 4. Once the cache copy expires, the archive serves the record again.
    clock.advance(policy.rehydration_ttl());
    let found = proxy.lookup(&old.id).await?;
    println!("GET {} after the rehydration TTL -> served from {} tier", old.id, found.tier);

    // 5. Records absent from both tiers are reported as missing.
    match proxy.get_record(&RecordId::new("acct-1#R2")).await {
        Err(e @ ProxyError::NotFound(_)) => println!("GET acct-1#R2 -> {e}"),
        other => anyhow::bail!("expected acct-1#R2 to be missing, got {other:?}"),
    }

    println!("\nProxy stats: {:?}", proxy.stats());
    println!("\nDemo complete.");
    Ok(())
}

async fn run_migrate(config: &Config) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let migrator = Migrator::new(
        config.open_hot_store(clock.clone())?,
        config.open_archive_store()?,
        clock,
        config.tier_policy(),
        config.retry_policy(),
        config.migrator_config(),
    );

    match migrator.run(&CancellationToken::new()).await {
        Ok(report) => {
            println!("{report}");
            for failed in &report.failed {
                println!("  failed {}: {}", failed.id, failed.reason);
            }
            Ok(())
        }
        Err(e) => {
            if let Some(report) = e.report() {
                println!("{report}");
            }
            Err(e.into())
        }
    }
}

async fn run_get(config: &Config, id: &str) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let proxy = RehydrationProxy::new(
        config.open_hot_store(clock.clone())?,
        config.open_archive_store()?,
        clock,
        config.tier_policy(),
        config.retry_policy(),
        config.proxy_config(),
    );

    let found = proxy.lookup(&RecordId::new(id)).await?;
    println!("tier: {}", found.tier);
    println!("{}", serde_json::to_string_pretty(&found.record)?);
    Ok(())
}

async fn run_put(config: &Config, id: &str, age_days: u64, payload: Option<&str>) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hot = config.open_hot_store(clock.clone())?;

    let payload = match payload {
        Some(text) => serde_json::from_str(text)?,
        None => serde_json::json!({ "id": id }),
    };
    let timestamp = days_before(clock.now(), age_days);
    let record = Record::new(id, timestamp, payload);
    hot.put(&record, None).await?;
    println!("wrote {} (timestamp {timestamp})", record.id);
    Ok(())
}

async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let migrator = Migrator::new(
        config.open_hot_store(clock.clone())?,
        config.open_archive_store()?,
        clock,
        config.tier_policy(),
        config.retry_policy(),
        config.migrator_config(),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        shutdown.cancel();
    });

    let every = config.migration_interval();
    tracing::info!(interval_secs = every.as_secs(), "serving periodic migration");
    migrator.run_periodic(every, cancel).await;
    Ok(())
}
