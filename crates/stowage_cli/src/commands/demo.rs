//! Demo command implementation.
//!
//! Replays the tutorial: a taco with ingredients, a table saved with a
//! callback, a user sign-up, a burrito with a picture, and a query for
//! tacos. Requests travel as CBOR through the loopback transport to an
//! in-memory backend.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{FileValue, Query};
use stowage_sync::{
    Client, EndpointConfig, HttpEndpoint, LoopbackClient, MemoryEndpoint, QueueStats,
    RetryConfig, SaveReceipt, SyncConfig, SyncResult, Transition,
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

const SERVER_URL: &str = "memory://backend/1";
const APPLICATION_ID: &str = "stowage-demo";
const CLIENT_KEY: &str = "demo-client-key";

/// Tuning for a demo run.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Requests the backend fails before recovering.
    pub fail_first: u32,
    /// Attempts per operation.
    pub max_attempts: u32,
    /// Operations in flight at once.
    pub concurrency: usize,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            fail_first: 0,
            max_attempts: 5,
            concurrency: 4,
        }
    }
}

/// Result of a demo run.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    /// One entry per save or sign-up.
    pub steps: Vec<StepReport>,
    /// The final query.
    pub query: QueryReport,
    /// Queue counters at the end of the run.
    pub stats: StatsReport,
}

/// Outcome of one save or sign-up.
#[derive(Debug, Serialize)]
pub struct StepReport {
    /// What the step did.
    pub step: &'static str,
    /// Class of the saved entity.
    pub class_name: String,
    /// How it ended.
    pub outcome: Outcome,
}

/// How a step ended.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    /// The remote accepted the entity.
    Saved {
        /// Assigned object id.
        object_id: String,
        /// Attempts made.
        attempts: u32,
    },
    /// The step failed.
    Failed {
        /// Error message.
        error: String,
    },
}

impl From<SyncResult<SaveReceipt>> for Outcome {
    fn from(result: SyncResult<SaveReceipt>) -> Self {
        match result {
            Ok(receipt) => Outcome::Saved {
                object_id: receipt.object_id.to_string(),
                attempts: receipt.attempts,
            },
            Err(err) => Outcome::Failed {
                error: err.to_string(),
            },
        }
    }
}

/// Result of the tutorial query.
#[derive(Debug, Serialize)]
pub struct QueryReport {
    /// Queried class.
    pub class_name: String,
    /// Matching objects.
    pub matches: Vec<MatchReport>,
    /// Set if the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One query match.
#[derive(Debug, Serialize)]
pub struct MatchReport {
    /// Remote object id.
    pub object_id: String,
    /// The `name` field, if present.
    pub name: Option<String>,
}

/// Queue counters.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    /// Operations accepted.
    pub enqueued: u64,
    /// Operations that succeeded.
    pub succeeded: u64,
    /// Operations that failed.
    pub failed: u64,
    /// Retries scheduled.
    pub retries: u64,
}

impl From<QueueStats> for StatsReport {
    fn from(stats: QueueStats) -> Self {
        Self {
            enqueued: stats.enqueued,
            succeeded: stats.succeeded,
            failed: stats.failed,
            retries: stats.retries,
        }
    }
}

/// Runs the demo command.
pub fn run(options: &DemoOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if format != "text" && format != "json" {
        return Err(format!("Unknown format: {format}").into());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(replay(options))?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}

/// Replays the tutorial and reports what happened.
pub async fn replay(options: &DemoOptions) -> SyncResult<DemoReport> {
    let backend = Arc::new(MemoryEndpoint::new().with_credentials(APPLICATION_ID, CLIENT_KEY));
    backend.fail_next(options.fail_first);

    let endpoint = HttpEndpoint::new(
        EndpointConfig::new(SERVER_URL, APPLICATION_ID, CLIENT_KEY),
        LoopbackClient::new(Arc::clone(&backend)),
    );
    let retry = RetryConfig::new(options.max_attempts).with_initial_delay(Duration::from_millis(20));
    let config = SyncConfig::new()
        .with_max_concurrency(options.concurrency)
        .with_retry(retry);
    let client = Client::new(config, endpoint);

    let logger = tokio::spawn(log_transitions(client.queue().subscribe()));
    let mut steps = Vec::new();

    let mut taco = client.create_entity("Food")?;
    taco.set("name", "taco")?;
    taco.set("ingredients", vec!["corn", "lettuce", "salsa", "beef"])?;
    steps.push(StepReport {
        step: "save",
        class_name: taco.class_name().to_string(),
        outcome: client.save(&taco)?.wait().await.into(),
    });

    let mut table = client.create_entity("Furniture")?;
    table.set("name", "table")?;
    let (tx, rx) = oneshot::channel();
    client.save_with_callback(&table, move |outcome| {
        if let Ok(receipt) = &outcome {
            info!(object_id = %receipt.object_id, "table saved");
        }
        let _ = tx.send(outcome);
    })?;
    let outcome = match rx.await {
        Ok(result) => result.into(),
        Err(_) => Outcome::Failed {
            error: "callback was not invoked".into(),
        },
    };
    steps.push(StepReport {
        step: "save with callback",
        class_name: table.class_name().to_string(),
        outcome,
    });

    let user = client.create_user("Jeremy", "password")?;
    steps.push(StepReport {
        step: "sign up",
        class_name: user.class_name().to_string(),
        outcome: client.sign_up(&user)?.wait().await.into(),
    });

    let mut burrito = client.create_entity("Food")?;
    burrito.set("name", "burrito")?;
    let picture = FileValue::new("burrito.jpg", "image/jpeg", demo_picture())?;
    burrito.set("picture", picture)?;
    steps.push(StepReport {
        step: "save with file",
        class_name: burrito.class_name().to_string(),
        outcome: client.save(&burrito)?.wait().await.into(),
    });

    let query = Query::new("Food")?
        .where_equal_to("name", "taco")
        .order_by_ascending("name");
    let query = match client.query(&query).await {
        Ok(results) => QueryReport {
            class_name: query.class_name().to_string(),
            matches: results
                .iter()
                .map(|entity| MatchReport {
                    object_id: entity.id(),
                    name: entity.get_text("name").map(str::to_string),
                })
                .collect(),
            error: None,
        },
        Err(err) => QueryReport {
            class_name: query.class_name().to_string(),
            matches: Vec::new(),
            error: Some(err.to_string()),
        },
    };

    client.shutdown().await;
    logger.abort();

    Ok(DemoReport {
        steps,
        query,
        stats: client.queue().stats().into(),
    })
}

async fn log_transitions(mut transitions: broadcast::Receiver<Transition>) {
    loop {
        match transitions.recv().await {
            Ok(t) => debug!(
                operation = %t.operation,
                key = %t.key,
                from = ?t.from,
                to = ?t.to,
                "transition"
            ),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "transition log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// A JPEG header followed by a few bytes of padding.
fn demo_picture() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
    bytes.resize(32, 0);
    bytes
}

fn print_text(report: &DemoReport) {
    println!("Stowage demo");
    println!("============");
    for step in &report.steps {
        match &step.outcome {
            Outcome::Saved {
                object_id,
                attempts,
            } => println!(
                "  {:<20} {:<10} saved as {} ({} attempt{})",
                step.step,
                step.class_name,
                object_id,
                attempts,
                if *attempts == 1 { "" } else { "s" }
            ),
            Outcome::Failed { error } => {
                println!("  {:<20} {:<10} FAILED: {}", step.step, step.class_name, error)
            }
        }
    }

    println!();
    match &report.query.error {
        Some(error) => println!("Query {} failed: {}", report.query.class_name, error),
        None => {
            println!(
                "Query {} where name = taco: {} match(es)",
                report.query.class_name,
                report.query.matches.len()
            );
            for found in &report.query.matches {
                println!(
                    "  {} {}",
                    found.object_id,
                    found.name.as_deref().unwrap_or("-")
                );
            }
        }
    }

    println!();
    println!(
        "Queue: {} enqueued, {} succeeded, {} failed, {} retries",
        report.stats.enqueued, report.stats.succeeded, report.stats.failed, report.stats.retries
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(outcome: &Outcome) -> Option<u32> {
        match outcome {
            Outcome::Saved { attempts, .. } => Some(*attempts),
            Outcome::Failed { .. } => None,
        }
    }

    #[tokio::test]
    async fn replay_saves_everything() {
        let report = replay(&DemoOptions::default()).await.unwrap();
        assert_eq!(report.steps.len(), 4);
        assert!(report.steps.iter().all(|s| saved(&s.outcome) == Some(1)));
        assert_eq!(report.query.matches.len(), 1);
        assert_eq!(report.query.matches[0].name.as_deref(), Some("taco"));
        assert_eq!(report.stats.succeeded, 4);
        assert_eq!(report.stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_recovers_from_early_failures() {
        let options = DemoOptions {
            fail_first: 2,
            ..DemoOptions::default()
        };
        let report = replay(&options).await.unwrap();
        assert_eq!(saved(&report.steps[0].outcome), Some(3));
        assert_eq!(report.stats.retries, 2);
        assert_eq!(report.stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_reports_exhausted_retries() {
        let options = DemoOptions {
            fail_first: 2,
            max_attempts: 2,
            ..DemoOptions::default()
        };
        let report = replay(&options).await.unwrap();
        assert!(matches!(report.steps[0].outcome, Outcome::Failed { .. }));
        assert!(saved(&report.steps[1].outcome).is_some());
        assert_eq!(report.stats.failed, 1);
    }

    #[test]
    fn report_serializes_with_status_tags() {
        let report = DemoReport {
            steps: vec![StepReport {
                step: "save",
                class_name: "Food".into(),
                outcome: Outcome::Failed {
                    error: "boom".into(),
                },
            }],
            query: QueryReport {
                class_name: "Food".into(),
                matches: Vec::new(),
                error: None,
            },
            stats: QueueStats::default().into(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][0]["outcome"]["status"], "failed");
        assert!(json["query"].get("error").is_none());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(run(&DemoOptions::default(), "yaml").is_err());
    }
}
