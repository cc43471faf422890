// Periodic liveness reports to the registry

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use toska_discovery::{HealthState, RegistryClient};
use tracing::{Instrument, Span, debug, info, warn};

const HEARTBEAT_NOTE: &str = "heartbeat";
const MIN_INTERVAL: Duration = Duration::from_millis(1);
// Matches the bound tokio puts on oversized sleeps
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Sends a healthy report every `interval` until stopped.
///
/// The first report goes out one interval after [`spawn`](Self::spawn).
/// Failed or slow reports are logged and the loop carries on; only
/// cancellation ends it.
pub struct HeartbeatLoop {
    client: Arc<dyn RegistryClient>,
    service_id: String,
    interval: Duration,
    call_timeout: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        service_id: impl Into<String>,
        interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                clamped_to_ms = MIN_INTERVAL.as_millis() as u64,
                "Heartbeat interval is zero, clamping"
            );
            MIN_INTERVAL
        } else {
            interval
        };

        Self {
            client,
            service_id: service_id.into(),
            interval,
            call_timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the loop in a task bound to the caller's span.
    pub fn spawn(self) -> HeartbeatHandle {
        let token = CancellationToken::new();
        let gate = Arc::new(RwLock::new(()));

        let task = tokio::spawn(
            self.run(token.clone(), gate.clone())
                .instrument(Span::current()),
        );

        HeartbeatHandle { token, gate, task }
    }

    async fn run(self, token: CancellationToken, gate: Arc<RwLock<()>>) -> u64 {
        let now = Instant::now();
        let first = now
            .checked_add(self.interval)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            service_id = %self.service_id,
            interval_ms = self.interval.as_millis() as u64,
            "Heartbeat started"
        );

        let mut sent = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // An in-flight report is abandoned as soon as the token fires.
            let beat = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                beat = self.beat(&token, &gate) => beat,
            };

            if beat {
                sent += 1;
            }
        }

        info!(service_id = %self.service_id, sent, "Heartbeat stopped");
        sent
    }

    async fn beat(&self, token: &CancellationToken, gate: &RwLock<()>) -> bool {
        let _in_flight = gate.read().await;
        if token.is_cancelled() {
            return false;
        }

        let report = self
            .client
            .report_health(&self.service_id, HealthState::Healthy, HEARTBEAT_NOTE);

        match tokio::time::timeout(self.call_timeout, report).await {
            Ok(Ok(true)) => debug!(service_id = %self.service_id, "Heartbeat acknowledged"),
            Ok(Ok(false)) => {
                warn!(service_id = %self.service_id, "Heartbeat not acknowledged by registry")
            }
            Ok(Err(e)) => warn!(service_id = %self.service_id, error = %e, "Heartbeat failed"),
            Err(_) => warn!(
                service_id = %self.service_id,
                timeout_ms = self.call_timeout.as_millis() as u64,
                "Heartbeat timed out"
            ),
        }
        true
    }
}

/// Control over a running [`HeartbeatLoop`].
#[derive(Debug)]
pub struct HeartbeatHandle {
    token: CancellationToken,
    gate: Arc<RwLock<()>>,
    task: JoinHandle<u64>,
}

impl HeartbeatHandle {
    /// Ask the loop to stop. Does not wait.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the loop and return once no report is in flight.
    ///
    /// After this returns, no further report can start.
    pub async fn fence(&self) {
        self.stop();
        let _fenced = self.gate.write().await;
    }

    /// Stop the loop and wait for its task, returning the number of reports
    /// it completed.
    pub async fn join(self) -> u64 {
        self.stop();
        match self.task.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(error = %e, "Heartbeat task ended abnormally");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toska_discovery::{
        CallPhase, CallRecord, InMemoryRegistry, RegistryCall, RegistryConnector,
    };

    async fn client(registry: &InMemoryRegistry) -> Arc<dyn RegistryClient> {
        registry.connect("memory").await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let registry = InMemoryRegistry::new();
        let heartbeat = HeartbeatLoop::new(
            client(&registry).await,
            "svc-1",
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(registry.heartbeats_started(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.heartbeats_started(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(heartbeat.join().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let registry = InMemoryRegistry::new();
        registry.fail_heartbeats(true);

        let heartbeat = HeartbeatLoop::new(
            client(&registry).await,
            "svc-1",
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(registry.heartbeats_started(), 3);

        registry.fail_heartbeats(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(heartbeat.join().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reports_time_out_and_skip_missed_ticks() {
        let registry = InMemoryRegistry::new();
        registry.set_heartbeat_latency(Duration::from_secs(10));

        let heartbeat = HeartbeatLoop::new(
            client(&registry).await,
            "svc-1",
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
        .spawn();

        // Ticks at 1s and 4s; the ones missed while a report hung are dropped.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(registry.heartbeats_started(), 2);

        heartbeat.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fence_abandons_in_flight_report() {
        let registry = InMemoryRegistry::new();
        registry.set_heartbeat_latency(Duration::from_secs(60));

        let heartbeat = HeartbeatLoop::new(
            client(&registry).await,
            "svc-1",
            Duration::from_secs(1),
            Duration::from_secs(120),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.heartbeats_started(), 1);

        let started = Instant::now();
        heartbeat.fence().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(heartbeat.is_stopped());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registry.heartbeats_started(), 1);

        let finished = registry
            .calls()
            .into_iter()
            .filter(|r: &CallRecord| {
                r.phase == CallPhase::Finished
                    && matches!(r.call, RegistryCall::ReportHealth { .. })
            })
            .count();
        assert_eq!(finished, 0);

        assert_eq!(heartbeat.join().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick() {
        let registry = InMemoryRegistry::new();
        let heartbeat = HeartbeatLoop::new(
            client(&registry).await,
            "svc-1",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .spawn();

        heartbeat.stop();
        assert_eq!(heartbeat.join().await, 0);
        assert_eq!(registry.heartbeats_started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_interval_never_ticks() {
        let registry = InMemoryRegistry::new();
        let heartbeat = HeartbeatLoop::new(
            client(&registry).await,
            "svc-1",
            Duration::MAX,
            Duration::from_secs(5),
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(86400)).await;
        assert!(!heartbeat.task.is_finished());
        assert_eq!(registry.heartbeats_started(), 0);

        heartbeat.stop();
        assert_eq!(heartbeat.task.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let registry = InMemoryRegistry::new();
        let heartbeat = HeartbeatLoop::new(
            client(&registry).await,
            "svc-1",
            Duration::ZERO,
            Duration::from_secs(5),
        );
        assert_eq!(heartbeat.interval(), MIN_INTERVAL);

        let handle = heartbeat.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.join().await >= 5);
    }
}
