//! Link supervisor - keeps one sensor session alive and feeds the alert
//!
//! States: `Disconnected -> Connecting -> Subscribed -> Receiving -> Disconnected`
//!
//! - The first connect and every subscribe are fatal on failure.
//! - A lost link silences the alert at once, then reconnects after a fixed
//!   backoff, as long as the [`ReconnectPolicy`] has attempts left. A failed
//!   reconnect uses up an attempt.
//! - A payload that fails to decode is logged and dropped; the session carries on.

use crate::domain::types::{AlertTarget, DistanceSample};
use crate::infra::config::{Config, ReconnectPolicy};
use crate::infra::metrics::LinkStats;
use crate::io::transport::{NotifySetup, Received, Session, Transport, TransportError};
use crate::services::alert_driver::AlertSink;
use crate::services::policy::target_for_sample;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest wait for a transport to tear down a session
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub address: String,
    pub notify: NotifySetup,
    /// Bounded wait per receive poll
    pub receive_timeout: Duration,
    pub backoff: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SupervisorConfig {
    pub fn new(address: &str, config: &Config) -> Self {
        Self {
            address: address.to_string(),
            notify: NotifySetup::notifications(config.service_uuid(), config.characteristic_uuid()),
            receive_timeout: config.receive_timeout(),
            backoff: config.reconnect_backoff(),
            reconnect: config.reconnect_policy(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Receiving => "receiving",
        }
    }
}

/// Why a run ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Shutdown,
    ReconnectsExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Initial connection failed: {0}")]
    Connect(#[source] TransportError),

    #[error("Notification setup failed: {0}")]
    Subscribe(#[source] TransportError),

    #[error("Alert driver stopped on an output failure")]
    AlertFailed,
}

impl SupervisorError {
    /// Errors raised before the first session was receiving
    pub fn is_setup_error(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Subscribe(_))
    }
}

enum SessionEnd {
    LinkLost(String),
    Shutdown,
    AlertFailed,
}

enum EstablishError {
    Connect(TransportError),
    Subscribe(TransportError),
}

async fn close_session<S: Session>(session: &mut S) {
    if tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
        warn!(timeout_ms = %CLOSE_TIMEOUT.as_millis(), "link_close_timed_out");
    }
}

/// Resolves once the shutdown flag is true. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct LinkSupervisor<T: Transport, A: AlertSink> {
    transport: T,
    alert: A,
    config: SupervisorConfig,
    stats: Arc<LinkStats>,
    state: LinkState,
    last_target: AlertTarget,
}

impl<T: Transport, A: AlertSink> LinkSupervisor<T, A> {
    pub fn new(transport: T, alert: A, config: SupervisorConfig, stats: Arc<LinkStats>) -> Self {
        Self {
            transport,
            alert,
            config,
            stats,
            state: LinkState::Disconnected,
            last_target: AlertTarget::Idle,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Run until shutdown, a fatal error, or the reconnect policy runs out.
    ///
    /// The alert is left idle whenever this returns.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SupervisorExit, SupervisorError> {
        let result = self.supervise(&mut shutdown).await;
        self.silence();
        self.set_state(LinkState::Disconnected);
        result
    }

    async fn supervise(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SupervisorExit, SupervisorError> {
        let established = tokio::select! {
            established = self.establish() => established,
            _ = shutdown_requested(shutdown) => return Ok(SupervisorExit::Shutdown),
        };
        let mut session = match established {
            Ok(session) => session,
            Err(EstablishError::Connect(e)) => {
                error!(address = %self.config.address, error = %e, "link_connect_failed");
                return Err(SupervisorError::Connect(e));
            }
            Err(EstablishError::Subscribe(e)) => return Err(self.subscribe_failed(e)),
        };
        let mut reconnects: u32 = 0;

        loop {
            let end = self.pump(&mut session, shutdown).await;
            if let SessionEnd::LinkLost(reason) = &end {
                self.silence();
                self.stats.record_link_loss();
                warn!(address = %self.config.address, reason = %reason, "link_lost");
            }
            close_session(&mut session).await;
            self.set_state(LinkState::Disconnected);

            match end {
                SessionEnd::Shutdown => return Ok(SupervisorExit::Shutdown),
                SessionEnd::AlertFailed => return Err(self.alert_failed()),
                SessionEnd::LinkLost(_) => {}
            }

            session = loop {
                if self.alert.is_failed() {
                    return Err(self.alert_failed());
                }
                if !self.config.reconnect.allows(reconnects) {
                    warn!(attempts = reconnects, "link_reconnects_exhausted");
                    return Ok(SupervisorExit::ReconnectsExhausted { attempts: reconnects });
                }

                info!(backoff_ms = %self.config.backoff.as_millis(), "link_reconnect_backoff");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.backoff) => {}
                    _ = shutdown_requested(shutdown) => return Ok(SupervisorExit::Shutdown),
                }
                if self.alert.is_failed() {
                    return Err(self.alert_failed());
                }

                reconnects += 1;
                self.stats.record_reconnect_attempt();
                info!(attempt = reconnects, address = %self.config.address, "link_reconnecting");

                let established = tokio::select! {
                    established = self.establish() => established,
                    _ = shutdown_requested(shutdown) => return Ok(SupervisorExit::Shutdown),
                };
                match established {
                    Ok(session) => break session,
                    Err(EstablishError::Connect(e)) => {
                        self.set_state(LinkState::Disconnected);
                        warn!(attempt = reconnects, error = %e, "link_reconnect_failed");
                    }
                    Err(EstablishError::Subscribe(e)) => return Err(self.subscribe_failed(e)),
                }
            };
        }
    }

    async fn establish(&mut self) -> Result<T::Session, EstablishError> {
        self.set_state(LinkState::Connecting);
        info!(address = %self.config.address, "link_connecting");

        let mut session =
            self.transport.connect(&self.config.address).await.map_err(EstablishError::Connect)?;
        info!(address = %self.config.address, "link_connected");

        if let Err(e) = session.subscribe(&self.config.notify).await {
            close_session(&mut session).await;
            return Err(EstablishError::Subscribe(e));
        }

        self.set_state(LinkState::Subscribed);
        self.stats.record_session();
        Ok(session)
    }

    async fn pump(
        &mut self,
        session: &mut T::Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        self.set_state(LinkState::Receiving);
        info!("link_waiting_for_notifications");

        loop {
            if self.alert.is_failed() {
                return SessionEnd::AlertFailed;
            }

            let received = tokio::select! {
                received = session.receive(self.config.receive_timeout) => received,
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
            };

            match received {
                Received::Notification(payload) => self.handle_notification(&payload),
                Received::Timeout => {
                    self.stats.record_quiet_poll();
                    debug!("link_no_notifications_waiting");
                }
                Received::LinkLost(reason) => return SessionEnd::LinkLost(reason),
            }
        }
    }

    fn handle_notification(&mut self, payload: &[u8]) {
        self.stats.record_notification();

        let sample = match DistanceSample::decode(payload) {
            Ok(sample) => sample,
            Err(e) => {
                self.stats.record_decode_failure();
                warn!(error = %e, len = payload.len(), "notification_decode_failed");
                return;
            }
        };

        let target = target_for_sample(sample);
        debug!(distance = %sample, target = %target, "distance_received");
        if target != self.last_target {
            info!(distance = %sample, from = %self.last_target, to = %target, "alert_target_changed");
            self.last_target = target;
        }
        self.alert.set_target(target);
    }

    fn alert_failed(&self) -> SupervisorError {
        error!("alert_driver_failed_aborting");
        SupervisorError::AlertFailed
    }

    fn subscribe_failed(&self, e: TransportError) -> SupervisorError {
        error!(
            service = %self.config.notify.service,
            characteristic = %self.config.notify.characteristic,
            error = %e,
            "link_subscribe_failed"
        );
        SupervisorError::Subscribe(e)
    }

    fn silence(&mut self) {
        self.alert.silence();
        self.last_target = AlertTarget::Idle;
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!(from = %self.state.as_str(), to = %state.as_str(), "link_state");
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::replay::{ReplayTransport, SessionScript};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Target(AlertTarget),
        Silence,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<Call>>>,
        silenced_at: Arc<Mutex<Vec<Instant>>>,
        failed: Arc<AtomicBool>,
        /// Report a render failure from the first silence on
        fail_on_silence: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn first_silence(&self) -> Option<Instant> {
            self.silenced_at.lock().first().copied()
        }

        fn targets(&self) -> Vec<AlertTarget> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Target(t) => Some(t),
                    Call::Silence => None,
                })
                .collect()
        }
    }

    impl AlertSink for RecordingSink {
        fn set_target(&self, target: AlertTarget) {
            self.calls.lock().push(Call::Target(target));
        }

        fn silence(&self) {
            self.calls.lock().push(Call::Silence);
            self.silenced_at.lock().push(Instant::now());
            if self.fail_on_silence.load(Ordering::SeqCst) {
                self.failed.store(true, Ordering::SeqCst);
            }
        }

        fn is_failed(&self) -> bool {
            self.failed.load(Ordering::SeqCst)
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn blink(v: u64) -> AlertTarget {
        AlertTarget::Blinking(ms(v))
    }

    fn test_config(reconnect: ReconnectPolicy) -> SupervisorConfig {
        SupervisorConfig {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            notify: NotifySetup::default(),
            receive_timeout: ms(20),
            backoff: ms(20),
            reconnect,
        }
    }

    fn supervisor(
        sessions: Vec<SessionScript>,
        reconnect: ReconnectPolicy,
    ) -> (LinkSupervisor<ReplayTransport, RecordingSink>, RecordingSink, Arc<LinkStats>) {
        let sink = RecordingSink::default();
        let stats = Arc::new(LinkStats::new());
        let sup = LinkSupervisor::new(
            ReplayTransport::new(sessions),
            sink.clone(),
            test_config(reconnect),
            stats.clone(),
        );
        (sup, sink, stats)
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the whole test
        std::mem::forget(tx);
        rx
    }

    const NO_RECONNECT: ReconnectPolicy = ReconnectPolicy::Bounded { max_attempts: 0 };

    /// Transport whose link drops at once and whose teardown hangs
    #[derive(Clone, Default)]
    struct HangingCloseTransport {
        lost_at: Arc<Mutex<Option<Instant>>>,
    }

    struct HangingCloseSession {
        lost_at: Arc<Mutex<Option<Instant>>>,
    }

    #[async_trait]
    impl Transport for HangingCloseTransport {
        type Session = HangingCloseSession;

        async fn connect(&mut self, _address: &str) -> Result<HangingCloseSession, TransportError> {
            Ok(HangingCloseSession { lost_at: self.lost_at.clone() })
        }
    }

    #[async_trait]
    impl Session for HangingCloseSession {
        async fn subscribe(&mut self, _setup: &NotifySetup) -> Result<(), TransportError> {
            Ok(())
        }

        async fn receive(&mut self, _timeout: Duration) -> Received {
            *self.lost_at.lock() = Some(Instant::now());
            Received::LinkLost("radio gone".to_string())
        }

        async fn close(&mut self) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }

    #[tokio::test]
    async fn test_samples_map_to_targets_in_order() {
        let script = SessionScript::new()
            .sample(3.0)
            .wait(ms(30))
            .sample(7.0)
            .wait(ms(30))
            .sample(20.0)
            .wait(ms(30))
            .sample(-1.0);
        let (mut sup, sink, _stats) = supervisor(vec![script], NO_RECONNECT);

        let exit = sup.run(no_shutdown()).await.unwrap();

        assert_eq!(exit, SupervisorExit::ReconnectsExhausted { attempts: 0 });
        assert_eq!(sink.targets(), vec![blink(200), blink(500), blink(2000), AlertTarget::Idle]);
        assert_eq!(sup.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_fatal() {
        let (mut sup, sink, stats) =
            supervisor(vec![SessionScript::new().failing_connect()], ReconnectPolicy::Unlimited);

        let err = sup.run(no_shutdown()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Connect(_)));
        assert!(err.is_setup_error());
        assert_eq!(stats.snapshot().reconnect_attempts, 0);
        assert_eq!(sink.calls(), vec![Call::Silence]);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_fatal() {
        let transport = ReplayTransport::new([SessionScript::new().failing_subscribe()]);
        let probe = transport.probe();
        let mut sup = LinkSupervisor::new(
            transport,
            RecordingSink::default(),
            test_config(ReconnectPolicy::Unlimited),
            Arc::new(LinkStats::new()),
        );

        let err = sup.run(no_shutdown()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Subscribe(_)));
        assert_eq!(probe.connect_attempts(), 1);
        assert_eq!(probe.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_bad_payload_does_not_end_session() {
        let script = SessionScript::new().raw(&[0x01, 0x02]).sample(5.0);
        let (mut sup, sink, stats) = supervisor(vec![script], NO_RECONNECT);

        sup.run(no_shutdown()).await.unwrap();

        let summary = stats.snapshot();
        assert_eq!(summary.notifications, 2);
        assert_eq!(summary.decode_failures, 1);
        assert_eq!(summary.sessions, 1);
        assert_eq!(sink.targets(), vec![blink(500)]);
    }

    #[tokio::test]
    async fn test_link_lost_silences_then_reconnects_once() {
        let sessions = vec![
            SessionScript::new().sample(3.0).drop_link("out of range"),
            SessionScript::new().sample(7.0),
        ];
        let (mut sup, sink, stats) =
            supervisor(sessions, ReconnectPolicy::Bounded { max_attempts: 1 });

        let exit = sup.run(no_shutdown()).await.unwrap();

        assert_eq!(exit, SupervisorExit::ReconnectsExhausted { attempts: 1 });
        assert_eq!(
            sink.calls(),
            vec![
                Call::Target(blink(200)),
                Call::Silence,
                Call::Target(blink(500)),
                Call::Silence,
                Call::Silence,
            ]
        );
        let summary = stats.snapshot();
        assert_eq!(summary.reconnect_attempts, 1);
        assert_eq!(summary.link_losses, 2);
        assert_eq!(summary.decode_failures, 0);
        assert_eq!(summary.sessions, 2);
    }

    #[tokio::test]
    async fn test_link_lost_silences_before_slow_close() {
        let transport = HangingCloseTransport::default();
        let lost_at = transport.lost_at.clone();
        let sink = RecordingSink::default();
        let mut sup = LinkSupervisor::new(
            transport,
            sink.clone(),
            test_config(NO_RECONNECT),
            Arc::new(LinkStats::new()),
        );

        let started = Instant::now();
        let exit = sup.run(no_shutdown()).await.unwrap();

        assert_eq!(exit, SupervisorExit::ReconnectsExhausted { attempts: 0 });
        let lost_at = lost_at.lock().unwrap();
        let silenced_at = sink.first_silence().unwrap();
        assert!(silenced_at.duration_since(lost_at) < ms(100));
        // The hanging close is abandoned after its timeout
        assert!(started.elapsed() < CLOSE_TIMEOUT + ms(500));
    }

    #[tokio::test]
    async fn test_alert_failure_during_backoff_skips_reconnect() {
        let sessions = vec![
            SessionScript::new().sample(3.0).drop_link("gone"),
            SessionScript::new().sample(5.0),
        ];
        let transport = ReplayTransport::new(sessions);
        let probe = transport.probe();
        let sink = RecordingSink::default();
        sink.fail_on_silence.store(true, Ordering::SeqCst);
        let stats = Arc::new(LinkStats::new());
        let mut sup = LinkSupervisor::new(
            transport,
            sink.clone(),
            test_config(ReconnectPolicy::Unlimited),
            stats.clone(),
        );

        let err = sup.run(no_shutdown()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::AlertFailed));
        assert_eq!(probe.connect_attempts(), 1);
        assert_eq!(stats.snapshot().reconnect_attempts, 0);
        assert_eq!(sink.targets(), vec![blink(200)]);
    }

    #[tokio::test]
    async fn test_failed_reconnect_uses_an_attempt() {
        let sessions = vec![
            SessionScript::new().drop_link("gone"),
            SessionScript::new().failing_connect(),
            SessionScript::new().sample(12.0),
        ];
        let (mut sup, sink, stats) =
            supervisor(sessions, ReconnectPolicy::Bounded { max_attempts: 2 });

        let exit = sup.run(no_shutdown()).await.unwrap();

        assert_eq!(exit, SupervisorExit::ReconnectsExhausted { attempts: 2 });
        assert_eq!(stats.snapshot().reconnect_attempts, 2);
        assert_eq!(sink.targets(), vec![blink(1000)]);
    }

    #[tokio::test]
    async fn test_quiet_periods_are_not_errors() {
        let script = SessionScript::new().wait(ms(70)).sample(1.0);
        let (mut sup, sink, stats) = supervisor(vec![script], NO_RECONNECT);

        sup.run(no_shutdown()).await.unwrap();

        let summary = stats.snapshot();
        assert!(summary.quiet_polls >= 3, "quiet_polls = {}", summary.quiet_polls);
        assert_eq!(summary.link_losses, 1);
        assert_eq!(sink.targets(), vec![blink(200)]);
    }

    #[tokio::test]
    async fn test_shutdown_while_receiving() {
        let script = SessionScript::new().sample(4.0).wait(Duration::from_secs(30));
        let (mut sup, sink, _stats) = supervisor(vec![script], ReconnectPolicy::Unlimited);
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(ms(60)).await;
            tx.send(true).unwrap();
            tx
        });
        let exit = sup.run(rx).await.unwrap();
        let _tx = stopper.await.unwrap();

        assert_eq!(exit, SupervisorExit::Shutdown);
        assert_eq!(sink.calls().last(), Some(&Call::Silence));
    }

    #[tokio::test]
    async fn test_alert_failure_aborts_run() {
        let script = SessionScript::new().sample(4.0).wait(Duration::from_secs(30));
        let (mut sup, sink, _stats) = supervisor(vec![script], ReconnectPolicy::Unlimited);
        sink.failed.store(true, Ordering::SeqCst);

        let err = sup.run(no_shutdown()).await.unwrap_err();

        assert!(matches!(err, SupervisorError::AlertFailed));
        assert!(!err.is_setup_error());
    }

    #[test]
    fn test_supervisor_config_from_config() {
        let config = Config::default();
        let sup_config = SupervisorConfig::new("AA:BB:CC:DD:EE:FF", &config);
        assert_eq!(sup_config.notify, NotifySetup::default());
        assert_eq!(sup_config.receive_timeout, Duration::from_secs(1));
        assert_eq!(sup_config.backoff, Duration::from_secs(5));
        assert_eq!(sup_config.reconnect, ReconnectPolicy::Bounded { max_attempts: 1 });
    }
}
