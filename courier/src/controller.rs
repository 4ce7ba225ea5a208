//! Process lifecycle
//!
//! The [`Controller`] owns the dispatch service and every background task
//! started for it. Shutdown is broadcast as [`Signal::Shutdown`]; once all
//! tasks have stopped, [`Signal::Finalised`] follows.

use std::{future::Future, sync::Arc, time::Duration};

use courier_common::{
    ScheduledTask, Signal, internal,
    task::{self, CancellationToken},
};
use courier_dispatch::DispatchService;
use courier_metrics::{LogAlertSink, Metrics};
use tokio::sync::broadcast;

use crate::config::CourierConfig;

const SIGNAL_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct Controller {
    service: Arc<DispatchService>,
    signals: broadcast::Sender<Signal>,
    token: CancellationToken,
}

impl Controller {
    /// Build the metrics container and the dispatch service from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a transport or
    /// store cannot be constructed.
    pub fn new(config: &CourierConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new(config.metrics.clone(), Arc::new(LogAlertSink))?);
        let service = DispatchService::from_config(&config.dispatch, metrics)?;

        Ok(Self::with_service(Arc::new(service)))
    }

    #[must_use]
    pub fn with_service(service: Arc<DispatchService>) -> Self {
        let (signals, _receiver) = broadcast::channel(SIGNAL_CAPACITY);

        Self {
            service,
            signals,
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn service(&self) -> &Arc<DispatchService> {
        &self.service
    }

    /// Receive lifecycle signals from this controller
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// A handle that can request shutdown from anywhere, by sending
    /// [`Signal::Shutdown`]
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<Signal> {
        self.signals.clone()
    }

    /// Start the recovery loop and, when enabled, the periodic alert tick
    #[must_use]
    pub fn spawn_tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks = vec![self.service.spawn_recovery(self.token.child_token())];

        let metrics = Arc::clone(self.service.metrics());
        if metrics.config().enabled {
            let period = Duration::from_secs(metrics.config().tick_interval_secs);
            tasks.push(ScheduledTask::spawn(
                "metrics-tick",
                period,
                self.token.child_token(),
                move || {
                    let metrics = Arc::clone(&metrics);
                    async move {
                        metrics.tick();
                    }
                },
            ));
        }

        tasks
    }

    /// Run until CTRL+C or SIGTERM, or until [`Signal::Shutdown`] is sent
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed or a
    /// background task panicked.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        self.run_until(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    internal!(level = INFO, "CTRL+C entered, shutting down");
                }
                _ = terminate.recv() => {
                    internal!(level = INFO, "Terminate Signal received, shutting down");
                }
            }
        })
        .await
    }

    /// Run until `stop` resolves or [`Signal::Shutdown`] is sent, then stop
    /// every background task
    ///
    /// # Errors
    ///
    /// Returns an error if a background task panicked.
    pub async fn run_until<F>(self, stop: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut receiver = self.signals.subscribe();
        let tasks = self.spawn_tasks();

        internal!(
            level = INFO,
            providers = self.service.registry().len(),
            tasks = tasks.len(),
            "Controller running"
        );

        tokio::select! {
            () = stop => {
                self.signals.send(Signal::Shutdown).ok();
            }
            () = wait_for_shutdown(&mut receiver) => {}
        }

        internal!(level = INFO, "Shutting down...");

        self.token.cancel();
        let result = task::shutdown_all(tasks).await;

        self.signals.send(Signal::Finalised).ok();
        internal!(level = INFO, "Shutdown complete");

        result?;
        Ok(())
    }
}

async fn wait_for_shutdown(receiver: &mut broadcast::Receiver<Signal>) {
    loop {
        match receiver.recv().await {
            Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(signal) => tracing::debug!("Received {signal:?}"),
            Err(e) => tracing::debug!("Received: {e:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_dispatch::{ManualClock, Provider, RateLimitConfig, ScriptedTransport};
    use courier_metrics::{MetricsConfig, RecordingAlertSink};
    use pretty_assertions::assert_eq;

    use super::*;

    fn controller(metrics_enabled: bool) -> Controller {
        let metrics = Arc::new(
            Metrics::new(
                MetricsConfig {
                    enabled: metrics_enabled,
                    ..MetricsConfig::default()
                },
                Arc::new(RecordingAlertSink::new()),
            )
            .unwrap(),
        );

        let service = DispatchService::builder()
            .provider(
                Provider::new("a", Arc::new(ScriptedTransport::accepting()), 1, 1.0, true),
                RateLimitConfig::default(),
            )
            .clock(Arc::new(ManualClock::at_unix_secs(1_000)))
            .metrics(metrics)
            .build()
            .unwrap();

        Controller::with_service(Arc::new(service))
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_follow_metrics_switch() {
        let enabled = controller(true);
        let tasks = enabled.spawn_tasks();
        assert_eq!(
            tasks.iter().map(ScheduledTask::name).collect::<Vec<_>>(),
            vec!["health-recovery", "metrics-tick"]
        );
        task::shutdown_all(tasks).await.unwrap();

        let disabled = controller(false);
        let tasks = disabled.spawn_tasks();
        assert_eq!(tasks.len(), 1);
        task::shutdown_all(tasks).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_future_finalises() {
        let controller = controller(true);
        let mut receiver = controller.subscribe();

        controller.run_until(async {}).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap(), Signal::Shutdown);
        assert_eq!(receiver.recv().await.unwrap(), Signal::Finalised);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_shutdown() {
        let controller = controller(true);
        let handle = controller.shutdown_handle();
        let mut receiver = controller.subscribe();

        let running = tokio::spawn(controller.run_until(std::future::pending()));
        tokio::time::sleep(Duration::from_secs(120)).await;

        handle.send(Signal::Shutdown).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(receiver.recv().await.unwrap(), Signal::Shutdown);
        assert_eq!(receiver.recv().await.unwrap(), Signal::Finalised);
    }
}
