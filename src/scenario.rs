use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tiered_archive_common::{Clock, HotStore, ManualClock, Record, RecordId, Tier, Timestamp};
use tiered_archive_migrator::Migrator;
use tiered_archive_policy::{days_before, DAY};
use tiered_archive_proxy::{ProxyError, RehydrationProxy};
use tiered_archive_stores::{MemoryArchiveStore, MemoryHotStore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Scenario clocks start here so runs are reproducible.
const SCENARIO_EPOCH: Timestamp = 1_700_000_000_000;

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub meta: ScenarioMeta,
    pub steps: Vec<ScenarioStep>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op")]
pub enum ScenarioStep {
    /// Upstream write of a record that is `age_days` old.
    #[serde(rename = "put")]
    Put {
        id: String,
        #[serde(default)]
        age_days: u64,
        payload: Option<toml::Value>,
    },
    #[serde(rename = "advance")]
    Advance {
        #[serde(default)]
        days: u64,
        #[serde(default)]
        secs: u64,
    },
    #[serde(rename = "migrate")]
    Migrate,
    #[serde(rename = "get")]
    Get { id: String },
    #[serde(rename = "expect_tier")]
    ExpectTier { id: String, tier: Tier },
    #[serde(rename = "expect_not_found")]
    ExpectNotFound { id: String },
    #[serde(rename = "expect_counts")]
    ExpectCounts {
        hot: Option<usize>,
        archive: Option<usize>,
    },
    #[serde(rename = "repeat")]
    Repeat { count: u64, steps: Vec<ScenarioStep> },
}

/// Outcome of a scripted run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScenarioSummary {
    pub steps: u64,
    pub expectations: u64,
}

struct ScenarioWorld {
    clock: Arc<ManualClock>,
    hot: Arc<MemoryHotStore>,
    archive: Arc<MemoryArchiveStore>,
    migrator: Migrator,
    proxy: RehydrationProxy,
    summary: ScenarioSummary,
}

/// Run a scenario from the CLI.
pub async fn run_scenario_cli(scenario_path: &str, config: &Config) -> anyhow::Result<()> {
    let toml_content = std::fs::read_to_string(scenario_path)?;
    let scenario: Scenario = toml::from_str(&toml_content)?;

    println!("=== Scenario: {} ===", scenario.meta.name);
    if let Some(ref desc) = scenario.meta.description {
        println!("{desc}");
    }

    let summary = run_scenario(&scenario, config).await?;
    println!(
        "\nScenario complete: {} steps, {} expectations met.",
        summary.steps, summary.expectations
    );
    Ok(())
}

/// Run `scenario` against in-memory stores and a manual clock. Store
/// settings in `config` are ignored; policy, retry, migration and proxy
/// settings apply.
pub async fn run_scenario(scenario: &Scenario, config: &Config) -> anyhow::Result<ScenarioSummary> {
    let clock = Arc::new(ManualClock::new(SCENARIO_EPOCH));
    let hot = Arc::new(MemoryHotStore::new(clock.clone()));
    let archive = Arc::new(MemoryArchiveStore::new());

    let mut migrator_config = config.migrator_config();
    migrator_config.cursor_path = None;
    let migrator = Migrator::new(
        hot.clone(),
        archive.clone(),
        clock.clone(),
        config.tier_policy(),
        config.retry_policy(),
        migrator_config,
    );
    let mut proxy_config = config.proxy_config();
    // Wall-clock deadlines make no sense under a manual clock.
    proxy_config.request_timeout = None;
    let proxy = RehydrationProxy::new(
        hot.clone(),
        archive.clone(),
        clock.clone(),
        config.tier_policy(),
        config.retry_policy(),
        proxy_config,
    );

    let mut world = ScenarioWorld {
        clock,
        hot,
        archive,
        migrator,
        proxy,
        summary: ScenarioSummary::default(),
    };
    execute_steps(&scenario.steps, &mut world).await?;
    Ok(world.summary)
}

fn execute_steps<'a>(
    steps: &'a [ScenarioStep],
    world: &'a mut ScenarioWorld,
) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + 'a>> {
    Box::pin(async move {
        for step in steps {
            execute_step(step, world).await?;
        }
        Ok(())
    })
}

async fn execute_step(step: &ScenarioStep, world: &mut ScenarioWorld) -> anyhow::Result<()> {
    world.summary.steps += 1;
    match step {
        ScenarioStep::Put { id, age_days, payload } => {
            let timestamp = days_before(world.clock.now(), *age_days);
            let payload = match payload {
                Some(value) => serde_json::to_value(value)?,
                None => serde_json::json!({ "id": id }),
            };
            let record = Record::new(id.as_str(), timestamp, payload);
            world.hot.put(&record, None).await?;
            println!("  PUT {id} (age {age_days}d)");
        }
        ScenarioStep::Advance { days, secs } => {
            let by = (DAY * u32::try_from(*days)?).saturating_add(Duration::from_secs(*secs));
            world.clock.advance(by);
            println!("  ADVANCE {days}d {secs}s");
        }
        ScenarioStep::Migrate => {
            let report = world.migrator.run(&CancellationToken::new()).await?;
            println!("  MIGRATE -> {report}");
        }
        ScenarioStep::Get { id } => match world.proxy.lookup(&RecordId::new(id.as_str())).await {
            Ok(found) => println!("  GET {id} -> {} {}", found.tier, found.record.payload),
            Err(e) => println!("  GET {id} -> Error: {e}"),
        },
        ScenarioStep::ExpectTier { id, tier } => {
            let found = world.proxy.lookup(&RecordId::new(id.as_str())).await?;
            anyhow::ensure!(
                found.tier == *tier,
                "expected {id} from the {tier} tier, got {}",
                found.tier
            );
            world.summary.expectations += 1;
            println!("  EXPECT {id} served from {tier}: ok");
        }
        ScenarioStep::ExpectNotFound { id } => {
            match world.proxy.lookup(&RecordId::new(id.as_str())).await {
                Err(ProxyError::NotFound(_)) => {}
                Ok(found) => anyhow::bail!("expected {id} to be absent, found it in the {} tier", found.tier),
                Err(e) => return Err(e.into()),
            }
            world.summary.expectations += 1;
            println!("  EXPECT {id} not found: ok");
        }
        ScenarioStep::ExpectCounts { hot, archive } => {
            if let Some(expected) = hot {
                let actual = world.hot.len();
                anyhow::ensure!(actual == *expected, "expected {expected} hot records, found {actual}");
            }
            if let Some(expected) = archive {
                let actual = world.archive.len();
                anyhow::ensure!(actual == *expected, "expected {expected} archived records, found {actual}");
            }
            world.summary.expectations += 1;
            println!("  EXPECT counts: ok");
        }
        ScenarioStep::Repeat { count, steps } => {
            println!("  repeat {count}x:");
            for _ in 0..*count {
                execute_steps(steps, world).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> Config {
        Config::parse("[retry]\nmax_attempts = 1").unwrap()
    }

    #[tokio::test]
    async fn test_archive_and_rehydrate_scenario() {
        let scenario: Scenario = toml::from_str(
            r#"
            [meta]
            name = "aged record"

            [[steps]]
            op = "put"
            id = "R1"
            age_days = 91
            payload = { amount = 40 }

            [[steps]]
            op = "put"
            id = "R3"
            age_days = 1

            [[steps]]
            op = "migrate"

            [[steps]]
            op = "expect_counts"
            hot = 1
            archive = 1

            [[steps]]
            op = "expect_tier"
            id = "R1"
            tier = "Cold"

            [[steps]]
            op = "expect_tier"
            id = "R1"
            tier = "Hot"

            [[steps]]
            op = "advance"
            secs = 3600

            [[steps]]
            op = "expect_tier"
            id = "R1"
            tier = "Cold"

            [[steps]]
            op = "expect_not_found"
            id = "R2"
            "#,
        )
        .unwrap();

        let summary = run_scenario(&scenario, &memory_config()).await.unwrap();
        assert_eq!(summary.steps, 9);
        assert_eq!(summary.expectations, 5);
    }

    #[tokio::test]
    async fn test_failed_expectation_is_an_error() {
        let scenario: Scenario = toml::from_str(
            r#"
            [meta]
            name = "young record stays hot"

            [[steps]]
            op = "put"
            id = "R1"
            age_days = 10

            [[steps]]
            op = "migrate"

            [[steps]]
            op = "expect_counts"
            archive = 1
            "#,
        )
        .unwrap();

        let err = run_scenario(&scenario, &memory_config()).await.unwrap_err();
        assert!(err.to_string().contains("archived records"));
    }

    #[tokio::test]
    async fn test_huge_age_clamps_to_epoch() {
        let scenario: Scenario = toml::from_str(
            r#"
            [meta]
            name = "ancient record"

            [[steps]]
            op = "put"
            id = "R1"
            age_days = 9223372036854775807

            [[steps]]
            op = "migrate"

            [[steps]]
            op = "expect_counts"
            hot = 0
            archive = 1
            "#,
        )
        .unwrap();

        let summary = run_scenario(&scenario, &memory_config()).await.unwrap();
        assert_eq!(summary.expectations, 1);
    }

    #[tokio::test]
    async fn test_repeat_runs_nested_steps() {
        let scenario: Scenario = toml::from_str(
            r#"
            [meta]
            name = "repeat"

            [[steps]]
            op = "repeat"
            count = 3

            [[steps.steps]]
            op = "advance"
            days = 1
            "#,
        )
        .unwrap();

        let summary = run_scenario(&scenario, &memory_config()).await.unwrap();
        assert_eq!(summary.steps, 4);
    }
}
