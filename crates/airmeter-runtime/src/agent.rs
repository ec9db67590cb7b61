//! [`Agent`] – process-level assembly of the coordination loop.
//!
//! [`Agent::start`] performs the startup sequence:
//!
//! 1. Connect to the bus (when configured) with bounded retry.  Failure is
//!    fatal and returned to the caller.
//! 2. Start the optional diagnostics subscriber, which logs every message
//!    seen on a filter.
//! 3. Spawn the [`CoordinationLoop`] and the bus teardown watcher.
//!
//! Every task runs on one [`TaskTracker`].  [`Agent::wait`] waits for the loop
//! to stop, then for every tracked task, then cleans up the sensor.
//!
//! The teardown watcher disconnects the bus exactly once, after the shutdown
//! token is cancelled *and* the loop has released its completion token, so a
//! publish in progress is never cut off.

use std::future::Future;
use std::sync::Arc;

use airmeter_hal::Sampler;
use airmeter_middleware::{BackoffPolicy, BusClient, BusConnector, connect_with_retry};
use airmeter_types::AirError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::{
    CommandSender, DEFAULT_COMMAND_DEPTH, DEFAULT_MAX_PENDING_READS, command_channel,
};
use crate::coordinator::{CoordinationLoop, LoopConfig, LoopExit, LoopOutcome};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// How to reach the message bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusSettings {
    /// e.g. `tcp://localhost:1883` or `ws://localhost:9090`
    pub endpoint: String,
    /// Client identity announced to the broker.
    pub identity: String,
    pub backoff: BackoffPolicy,
    /// When set, log every message seen on this filter.
    pub diagnostics_filter: Option<String>,
}

impl BusSettings {
    /// Settings with a fresh random identity and the default backoff.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: Uuid::new_v4().to_string(),
            backoff: BackoffPolicy::default(),
            diagnostics_filter: None,
        }
    }
}

/// Immutable agent configuration, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub loop_config: LoopConfig,
    /// `None` runs without a bus; readings are only logged.
    pub bus: Option<BusSettings>,
    pub command_depth: usize,
    pub max_pending_reads: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            loop_config: LoopConfig::default(),
            bus: None,
            command_depth: DEFAULT_COMMAND_DEPTH,
            max_pending_reads: DEFAULT_MAX_PENDING_READS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

pub struct Agent {
    commands: CommandSender,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    coordinator: JoinHandle<LoopOutcome>,
}

impl Agent {
    /// Connect, spawn, and return a handle to the running agent.
    ///
    /// # Errors
    ///
    /// Returns the last connection error when the bus cannot be reached
    /// within the retry budget, or [`AirError::Connect`] when the shutdown
    /// token is cancelled while still connecting.
    pub async fn start(
        config: Arc<AgentConfig>,
        sensor: Box<dyn Sampler>,
        connector: &dyn BusConnector,
        shutdown: CancellationToken,
    ) -> Result<Self, AirError> {
        let tracker = TaskTracker::new();

        let bus = match &config.bus {
            Some(settings) => {
                let client = tokio::select! {
                    result = connect_with_retry(
                        connector,
                        &settings.endpoint,
                        &settings.identity,
                        &settings.backoff,
                    ) => result?,
                    _ = shutdown.cancelled() => {
                        return Err(AirError::Connect(
                            "shutdown requested while connecting".to_string(),
                        ));
                    }
                };
                if let Some(filter) = &settings.diagnostics_filter {
                    spawn_diagnostics(&tracker, client.as_ref(), filter, shutdown.clone()).await;
                }
                Some(client)
            }
            None => {
                info!("no bus configured; readings will only be logged");
                None
            }
        };

        let (commands, receiver) = command_channel(config.command_depth, config.max_pending_reads);
        let loop_done = CancellationToken::new();

        let coordinator = {
            let loop_done = loop_done.clone();
            let run = CoordinationLoop::new(
                config.loop_config.clone(),
                sensor,
                bus.clone(),
                receiver,
                shutdown.clone(),
            )
            .run();
            tracker.spawn(async move {
                // Released even if the loop panics.
                let _done = loop_done.drop_guard();
                run.await
            })
        };

        if let Some(client) = bus {
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                shutdown.cancelled().await;
                loop_done.cancelled().await;
                match client.disconnect().await {
                    Ok(()) => info!("bus connection closed"),
                    Err(e) => warn!(error = %e, "bus disconnect failed"),
                }
            });
        }

        Ok(Self {
            commands,
            shutdown,
            tracker,
            coordinator,
        })
    }

    /// A handle for submitting commands to the loop.
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run an auxiliary task (e.g. the HTTP front end) that [`Agent::wait`]
    /// will wait for.  The task must stop on its own once the shutdown token
    /// is cancelled.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Wait for an orderly stop and clean up the sensor.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::Channel`] if the coordination loop panicked.  The
    /// remaining tasks are still shut down and awaited first.
    pub async fn wait(self) -> Result<LoopExit, AirError> {
        let Self {
            commands,
            shutdown,
            tracker,
            coordinator,
        } = self;
        // Our own sender must not keep the command channel open.
        drop(commands);

        let joined = coordinator.await;
        // Whatever stopped the loop, everything else stops too.
        shutdown.cancel();
        tracker.close();
        tracker.wait().await;

        let outcome = joined.map_err(|e| AirError::Channel(format!("coordination loop failed: {e}")))?;

        if let Some(mut sensor) = outcome.sensor {
            match tokio::task::spawn_blocking(move || sensor.cleanup()).await {
                Ok(Ok(())) => info!("sensor cleaned up"),
                Ok(Err(e)) => warn!(error = %e, "sensor cleanup failed"),
                Err(e) => warn!(error = %e, "sensor cleanup task failed"),
            }
        }

        info!(exit = ?outcome.exit, "agent stopped");
        Ok(outcome.exit)
    }
}

async fn spawn_diagnostics(
    tracker: &TaskTracker,
    client: &dyn BusClient,
    filter: &str,
    shutdown: CancellationToken,
) {
    let mut subscriber = match client.subscribe(filter).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            warn!(filter, error = %e, "diagnostics subscription failed");
            return;
        }
    };
    info!(filter, "diagnostics subscriber started");

    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscriber.recv() => match message {
                    Some(message) => info!(
                        topic = %message.topic,
                        id = %message.id,
                        payload = %message.payload,
                        "bus message"
                    ),
                    None => break,
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use airmeter_middleware::{LocalConnector, TopicSubscriber};
    use airmeter_types::Payload;
    use async_trait::async_trait;

    const STUB: &str = r#"{"Temperature":20}"#;

    struct StubSampler {
        cleaned: Arc<AtomicBool>,
    }

    impl Sampler for StubSampler {
        fn sample(&mut self) -> Result<Payload, AirError> {
            Ok(Payload::from(STUB))
        }

        fn cleanup(&mut self) -> Result<(), AirError> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stub() -> (Box<dyn Sampler>, Arc<AtomicBool>) {
        let cleaned = Arc::new(AtomicBool::new(false));
        (
            Box::new(StubSampler {
                cleaned: cleaned.clone(),
            }),
            cleaned,
        )
    }

    fn config(bus: Option<BusSettings>) -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            loop_config: LoopConfig {
                interval: Duration::from_millis(10),
                topic: "airmeter/home".to_string(),
            },
            bus,
            ..AgentConfig::default()
        })
    }

    /// Client that counts disconnects.
    struct CountingClient {
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BusClient for CountingClient {
        async fn publish(&self, _topic: &str, _payload: Payload) -> Result<(), AirError> {
            Ok(())
        }

        async fn subscribe(&self, _filter: &str) -> Result<TopicSubscriber, AirError> {
            Err(AirError::Connect("unsupported".to_string()))
        }

        async fn disconnect(&self) -> Result<(), AirError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingConnector {
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BusConnector for CountingConnector {
        async fn connect(&self, _endpoint: &str, _identity: &str) -> Result<Arc<dyn BusClient>, AirError> {
            Ok(Arc::new(CountingClient {
                disconnects: self.disconnects.clone(),
            }))
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl BusConnector for RefusingConnector {
        async fn connect(&self, endpoint: &str, _identity: &str) -> Result<Arc<dyn BusClient>, AirError> {
            Err(AirError::Connect(format!("{endpoint} refused")))
        }
    }

    #[tokio::test]
    async fn shutdown_command_runs_full_teardown() -> Result<(), Box<dyn std::error::Error>> {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            disconnects: disconnects.clone(),
        };
        let (sensor, cleaned) = stub();
        let shutdown = CancellationToken::new();

        let agent = Agent::start(
            config(Some(BusSettings::new("ws://broker:9090"))),
            sensor,
            &connector,
            shutdown.clone(),
        )
        .await?;
        agent.commands().submit("shutdown", BTreeMap::new()).await?;

        let exit = tokio::time::timeout(Duration::from_secs(5), agent.wait()).await??;
        assert_eq!(exit, LoopExit::ShutdownRequested);
        assert!(shutdown.is_cancelled());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(cleaned.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn readings_flow_to_local_bus() -> Result<(), Box<dyn std::error::Error>> {
        let connector = LocalConnector::default();
        let mut watcher = connector.bus().subscribe("airmeter/#");
        let (sensor, _) = stub();
        let shutdown = CancellationToken::new();

        let agent = Agent::start(
            config(Some(BusSettings::new("local"))),
            sensor,
            &connector,
            shutdown.clone(),
        )
        .await?;

        let message = tokio::time::timeout(Duration::from_secs(2), watcher.recv())
            .await?
            .ok_or("bus closed")?;
        assert_eq!(message.topic, "airmeter/home");
        assert_eq!(message.payload.as_bytes(), STUB.as_bytes());

        let reading = agent.commands().request_reading(Duration::from_secs(2)).await?;
        assert_eq!(reading.as_bytes(), STUB.as_bytes());

        shutdown.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), agent.wait()).await??;
        assert_eq!(exit, LoopExit::Cancelled);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_bus_is_fatal() {
        let (sensor, _) = stub();
        let mut settings = BusSettings::new("ws://nowhere:9090");
        settings.backoff = BackoffPolicy {
            base_delay: Duration::from_millis(10),
            ..BackoffPolicy::default()
        };

        let result = Agent::start(
            config(Some(settings)),
            sensor,
            &RefusingConnector,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(AirError::Connect(_))));
    }

    #[tokio::test]
    async fn runs_without_bus() -> Result<(), Box<dyn std::error::Error>> {
        let (sensor, cleaned) = stub();
        let shutdown = CancellationToken::new();
        let agent = Agent::start(config(None), sensor, &RefusingConnector, shutdown.clone()).await?;

        let reading = agent.commands().request_reading(Duration::from_secs(2)).await?;
        assert_eq!(reading.as_bytes(), STUB.as_bytes());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), agent.wait()).await??;
        assert!(cleaned.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn auxiliary_tasks_are_awaited() -> Result<(), Box<dyn std::error::Error>> {
        let (sensor, _) = stub();
        let shutdown = CancellationToken::new();
        let agent = Agent::start(config(None), sensor, &RefusingConnector, shutdown.clone()).await?;

        let finished = Arc::new(AtomicBool::new(false));
        {
            let finished = finished.clone();
            let token = agent.shutdown_token();
            agent.spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.store(true, Ordering::SeqCst);
            });
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), agent.wait()).await??;
        assert!(finished.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn diagnostics_subscriber_sees_own_publishes() -> Result<(), Box<dyn std::error::Error>> {
        let connector = LocalConnector::default();
        let mut settings = BusSettings::new("local");
        settings.diagnostics_filter = Some("airmeter/+".to_string());
        let (sensor, _) = stub();
        let shutdown = CancellationToken::new();

        let agent = Agent::start(config(Some(settings)), sensor, &connector, shutdown.clone()).await?;
        // Diagnostics subscriber plus nothing else.
        assert_eq!(connector.bus().receiver_count(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), agent.wait()).await??;
        Ok(())
    }
}
