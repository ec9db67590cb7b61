//! [`CoordinationLoop`] – the single scheduler that owns the sensor.
//!
//! The loop multiplexes three event sources through one `tokio::select!`
//! and handles exactly one event at a time.  Sources are polled in order:
//! cancellation, then commands, then the timer, so a queued `"shutdown"` is
//! never held back by overdue ticks.
//!
//! | Event              | Action                                                        |
//! |--------------------|---------------------------------------------------------------|
//! | timer tick         | sample; publish to the configured topic (or log when no bus)  |
//! | `"reading"`        | sample; deliver the payload on the command's reply channel    |
//! | `"shutdown"`       | cancel the shutdown token and stop                            |
//! | other command      | log as unrecognized and continue                              |
//! | shutdown cancelled | stop                                                          |
//!
//! Samples run on the blocking pool and are awaited in place, so no two
//! sensor accesses ever overlap and no other event is serviced while one is in
//! progress.  Cancellation is observed between events, never in the middle of
//! a sample or a publish.
//!
//! The first tick fires one interval after start; ticks missed while a sample
//! or publish was in progress are skipped rather than replayed.
//!
//! When every [`CommandSender`][crate::command::CommandSender] has been
//! dropped the loop stops polling commands but keeps ticking until the
//! shutdown token is cancelled.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use airmeter_hal::Sampler;
use airmeter_middleware::BusClient;
use airmeter_types::{AirError, CommandName, Payload};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandReceiver};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Static loop parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Period between scheduled samples.
    pub interval: Duration,
    /// Topic every scheduled reading is published to.
    pub topic: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            topic: "airmeter/home".to_string(),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A `"shutdown"` command was received.
    ShutdownRequested,
    /// The shutdown token was cancelled by someone else.
    Cancelled,
}

/// What the loop hands back when it stops.
pub struct LoopOutcome {
    pub exit: LoopExit,
    /// The sensor, returned for cleanup.  `None` only if a sample panicked.
    pub sensor: Option<Box<dyn Sampler>>,
}

pub struct CoordinationLoop {
    config: LoopConfig,
    sensor: Option<Box<dyn Sampler>>,
    bus: Option<Arc<dyn BusClient>>,
    commands: CommandReceiver,
    shutdown: CancellationToken,
}

impl CoordinationLoop {
    pub fn new(
        config: LoopConfig,
        sensor: Box<dyn Sampler>,
        bus: Option<Arc<dyn BusClient>>,
        commands: CommandReceiver,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            sensor: Some(sensor),
            bus,
            commands,
            shutdown,
        }
    }

    /// Drive the loop until shutdown.
    pub async fn run(mut self) -> LoopOutcome {
        let period = self.config.interval.max(MIN_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;

        info!(
            interval_ms = period.as_millis() as u64,
            topic = %self.config.topic,
            bus = self.bus.is_some(),
            "coordination loop started"
        );

        let exit = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    break LoopExit::Cancelled;
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if let ControlFlow::Break(exit) = self.on_command(command).await {
                            break exit;
                        }
                    }
                    None => {
                        debug!("all command senders dropped; ticking until shutdown");
                        commands_open = false;
                    }
                },
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        };

        info!(exit = ?exit, "coordination loop stopped");
        LoopOutcome {
            exit,
            sensor: self.sensor,
        }
    }

    async fn on_tick(&mut self) {
        let payload = match self.sample().await {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "scheduled sample failed");
                return;
            }
        };

        match &self.bus {
            Some(bus) => {
                if let Err(e) = bus.publish(&self.config.topic, payload).await {
                    error!(topic = %self.config.topic, error = %e, "publish failed");
                }
            }
            None => info!(reading = %payload, "reading"),
        }
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<LoopExit> {
        debug!(command = %command.name, args = ?command.args, "command received");
        match command.name {
            CommandName::Shutdown => {
                info!("shutdown requested");
                self.shutdown.cancel();
                ControlFlow::Break(LoopExit::ShutdownRequested)
            }
            CommandName::Reading => {
                match self.sample().await {
                    Ok(payload) => match command.reply {
                        Some(reply) => {
                            if reply.send(payload).is_err() {
                                debug!("reading requester went away; reply discarded");
                            }
                        }
                        None => debug!(reading = %payload, "reading without reply channel discarded"),
                    },
                    // Dropping the reply tells the requester nothing is coming.
                    Err(e) => error!(error = %e, "requested sample failed"),
                }
                ControlFlow::Continue(())
            }
            CommandName::Unrecognized(name) => {
                error!(command = %name, "unrecognized command");
                ControlFlow::Continue(())
            }
        }
    }

    /// Run one sample on the blocking pool and wait for it.
    async fn sample(&mut self) -> Result<Payload, AirError> {
        let Some(mut sensor) = self.sensor.take() else {
            return Err(AirError::SensorRead("sensor unavailable".to_string()));
        };

        match tokio::task::spawn_blocking(move || {
            let result = sensor.sample();
            (sensor, result)
        })
        .await
        {
            Ok((sensor, result)) => {
                self.sensor = Some(sensor);
                result
            }
            Err(e) => {
                warn!(error = %e, "sensor task aborted; sensor lost");
                Err(AirError::SensorRead(format!("sample task failed: {e}")))
            }
        }
    }
}
