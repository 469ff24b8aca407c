//! Relay message router server.
//!
//! Wires the routing core together from configuration: pools, queue
//! consumers, the HTTP mediator with per-target circuit breakers, the
//! visibility extender, and (optionally) Redis-based hot standby. With
//! standby enabled, consumers start only on the primary; losing the lock
//! stops consumption, and failing to reacquire it within one TTL exits
//! the process non-zero so the orchestrator reschedules it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use relay_config::AppConfig;
use relay_core::RouterConfig;
use relay_queue::{MessageSink, QueueConsumer, VisibilityProfile};
use relay_router::{
    spawn_breaker_maintenance, spawn_queue_metrics_publisher, spawn_visibility_extender,
    spawn_warning_cleanup, CircuitBreakerRegistry, HttpMediator, HttpMediatorConfig,
    QueueManager, VisibilityExtender, WarningService, WarningServiceConfig,
};
use relay_standby::{LeaderElection, LeaderElectionConfig, LeadershipStatus, StandbyGate};

#[tokio::main]
async fn main() -> Result<()> {
    relay_core::logging::init_logging();

    info!("Starting relay message router");

    let config = AppConfig::load().context("failed to load configuration")?;
    if config.pools.is_empty() {
        warn!("No pools configured - every inbound message will bounce");
    }

    // Shared services.
    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let breakers = Arc::new(
        CircuitBreakerRegistry::new(config.circuit_breaker.clone())
            .with_warning_service(warnings.clone()),
    );
    let extender = Arc::new(VisibilityExtender::new(&config.lifecycle));
    extender.set_warning_service(warnings.clone());

    let mediator = Arc::new(
        HttpMediator::with_config(
            HttpMediatorConfig::from(&config.mediator.http),
            breakers.clone(),
        )
        .context("failed to build HTTP mediator")?
        .with_warning_service(warnings.clone()),
    );

    let manager = Arc::new(
        QueueManager::new(mediator, breakers.clone(), extender.clone())
            .with_warning_service(warnings.clone()),
    );
    manager
        .apply_config(&RouterConfig {
            pools: config.pools.clone(),
            queues: config.queues.clone(),
        })
        .context("failed to apply pool configuration")?;

    // Standby gate: only the primary consumes.
    let election = if config.standby.enabled {
        let election_config = LeaderElectionConfig::new(config.standby.redis_url.clone())
            .with_lock_key(config.standby.lock_key.clone())
            .with_instance_id(config.standby.instance_id.clone())
            .with_lock_ttl_seconds(config.standby.lock_ttl_seconds);

        let election = Arc::new(
            LeaderElection::new(election_config)
                .await
                .context("failed to connect to the lock store")?,
        );
        election
            .clone()
            .start()
            .await
            .context("failed to start leader election")?;
        Some(election)
    } else {
        info!("Standby disabled - this instance always consumes");
        None
    };

    let gate = match election.clone() {
        Some(e) => StandbyGate::new(e),
        None => StandbyGate::disabled(),
    };

    if gate.is_enabled() {
        info!("Waiting for leadership before starting consumers");
        if gate.wait_for_leadership().await == LeadershipStatus::Failed {
            bail!("leader election failed before startup");
        }
        info!("Acquired leadership");
    }

    // Background lifecycle tasks.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    spawn_visibility_extender(extender.clone(), shutdown_tx.clone());
    spawn_breaker_maintenance(breakers.clone(), Duration::from_secs(300), shutdown_tx.clone());
    spawn_warning_cleanup(warnings.clone(), Duration::from_secs(300), shutdown_tx.clone());

    // Consumers. The metrics publisher is tied to the consumer set and is
    // restarted whenever that set is rebuilt.
    let mut consumers = build_consumers(&config, manager.clone()).await?;
    start_consumers(&consumers).await?;
    let mut metrics_shutdown = spawn_metrics_publisher(&consumers, &config);

    info!(
        pools = config.pools.len(),
        queues = consumers.len(),
        standby = config.standby.enabled,
        "Relay router is running"
    );

    // Main supervision loop: shutdown signals and leadership changes.
    let mut status_rx = gate.subscribe();
    let mut exit_code = 0;

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                break;
            }
            changed = watch_leadership(&mut status_rx) => {
                match changed {
                    LeadershipStatus::Failed => {
                        error!("Lost leadership and could not reacquire - exiting for restart");
                        exit_code = 1;
                        break;
                    }
                    LeadershipStatus::Follower | LeadershipStatus::Unknown => {
                        warn!("Leadership lost - stopping consumers");
                        stop_consumers(&consumers).await;
                        let status = gate.wait_for_leadership().await;
                        if status == LeadershipStatus::Failed {
                            error!("Could not reacquire leadership - exiting for restart");
                            exit_code = 1;
                            break;
                        }
                        info!("Leadership reacquired - restarting consumers");
                        consumers = build_consumers(&config, manager.clone()).await?;
                        start_consumers(&consumers).await?;
                        let _ = metrics_shutdown.send(());
                        metrics_shutdown = spawn_metrics_publisher(&consumers, &config);
                    }
                    LeadershipStatus::Leader => {}
                }
            }
        }
    }

    // Graceful shutdown: stop intake, drain, release the lock.
    let _ = shutdown_tx.send(());
    let _ = metrics_shutdown.send(());
    stop_consumers(&consumers).await;
    manager
        .shutdown(Duration::from_secs(config.shutdown.grace_seconds))
        .await;
    if let Some(election) = election {
        election.shutdown().await;
    }

    info!("Relay router stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn metrics_poll_interval(config: &AppConfig) -> Duration {
    let seconds = config
        .queues
        .iter()
        .map(|q| q.metrics_poll_interval_seconds)
        .min()
        .unwrap_or(30)
        .max(1);
    Duration::from_secs(seconds)
}

/// Spawn a queue-depth publisher for the current consumer set; returns the
/// sender that stops it when the set is rebuilt.
fn spawn_metrics_publisher(
    consumers: &[Arc<dyn QueueConsumer>],
    config: &AppConfig,
) -> tokio::sync::broadcast::Sender<()> {
    let (tx, _) = tokio::sync::broadcast::channel::<()>(1);
    spawn_queue_metrics_publisher(consumers.to_vec(), metrics_poll_interval(config), tx.clone());
    tx
}

async fn build_consumers(
    config: &AppConfig,
    sink: Arc<QueueManager>,
) -> Result<Vec<Arc<dyn QueueConsumer>>> {
    let visibility = VisibilityProfile {
        fast_fail_seconds: config.mediator.http.fast_fail_visibility_seconds,
        default_delay_seconds: config.mediator.http.default_visibility_delay_seconds,
    };

    let mut consumers: Vec<Arc<dyn QueueConsumer>> = Vec::with_capacity(config.queues.len());
    for queue in &config.queues {
        let sink: Arc<dyn MessageSink> = sink.clone();
        let consumer: Arc<dyn QueueConsumer> = match queue.kind.as_str() {
            "memory" => Arc::new(
                relay_queue::memory::MemoryQueue::new(&queue.name, sink)
                    .with_visibility_profile(visibility)
                    .with_connections(queue.connections)
                    .with_receive_timeout(Duration::from_millis(queue.receive_timeout_ms)),
            ),
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect(&format!("sqlite://{}?mode=rwc", queue.uri))
                    .await
                    .with_context(|| format!("failed to open SQLite queue [{}]", queue.name))?;
                let sqlite = relay_queue::sqlite::SqliteQueue::new(pool, &queue.name, sink)
                    .with_visibility_profile(visibility)
                    .with_connections(queue.connections)
                    .with_receive_timeout(Duration::from_millis(queue.receive_timeout_ms));
                relay_queue::EmbeddedQueue::init_schema(&sqlite)
                    .await
                    .with_context(|| format!("failed to init SQLite queue [{}]", queue.name))?;
                Arc::new(sqlite)
            }
            #[cfg(feature = "sqs")]
            "sqs" => {
                let aws_config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let client = aws_sdk_sqs::Client::new(&aws_config);
                Arc::new(
                    relay_queue::sqs::SqsQueueConsumer::connect(client, queue.uri.clone(), sink)
                        .await
                        .with_context(|| format!("failed to connect SQS queue [{}]", queue.name))?
                        .with_visibility_profile(visibility)
                        .with_receive_visibility_seconds(
                            config.mediator.http.default_visibility_delay_seconds,
                        )
                        .with_connections(queue.connections),
                )
            }
            other => bail!(
                "queue [{}] has unsupported kind [{}] in this build",
                queue.name,
                other
            ),
        };
        consumers.push(consumer);
    }

    Ok(consumers)
}

async fn start_consumers(consumers: &[Arc<dyn QueueConsumer>]) -> Result<()> {
    for consumer in consumers {
        consumer
            .start()
            .await
            .with_context(|| format!("failed to start consumer [{}]", consumer.queue_identifier()))?;
        info!(queue = %consumer.queue_identifier(), "Consumer started");
    }
    Ok(())
}

async fn stop_consumers(consumers: &[Arc<dyn QueueConsumer>]) {
    for consumer in consumers {
        consumer.stop().await;
    }
}

/// Resolve on any leadership status change.
async fn watch_leadership(
    status_rx: &mut Option<tokio::sync::watch::Receiver<LeadershipStatus>>,
) -> LeadershipStatus {
    match status_rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Election task gone; treat as a terminal failure.
                return LeadershipStatus::Failed;
            }
            *rx.borrow()
        }
        // Standby disabled: never resolves.
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
