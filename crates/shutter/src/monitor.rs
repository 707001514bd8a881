//! No-network watch and the emergency close.
//!
//! Outage time accumulates while the link is down (every cycle) and while
//! the link is up but the periodic reachability probe fails (one probe
//! interval per failure). Past the grace period the shutter is driven
//! closed and the network alert blocks further requests until the network
//! comes back.
//!
//! ```text
//! NotNeeded ──outage──▶ Waiting ──grace over──▶ Running ──closed──▶ Completed
//!     ▲                    │                       │
//!     └────network back────┘                       └──hardware alert──▶ Error
//!
//! any state ──MANUAL──▶ Disabled (timer reset)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use observatory_common::events::EventKind;

use crate::config::NetworkConfig;
use crate::motion::{Shutter, TravelOutcome};
use crate::state::EmergencyProcedure;

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Local link (wifi association) is up.
    fn link_up(&self) -> bool;
    /// The probe host answers.
    async fn reachable(&self) -> bool;
}

/// Link state from sysfs, reachability from a bounded TCP connect.
pub struct SystemProbe {
    operstate: PathBuf,
    host: String,
    port: u16,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(cfg: &NetworkConfig) -> Self {
        Self {
            operstate: PathBuf::from(format!("/sys/class/net/{}/operstate", cfg.interface)),
            host: cfg.probe_host.clone(),
            port: cfg.probe_port,
            timeout: Duration::from_millis(cfg.probe_timeout_ms),
        }
    }
}

#[async_trait]
impl NetworkProbe for SystemProbe {
    fn link_up(&self) -> bool {
        std::fs::read_to_string(&self.operstate)
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    }

    async fn reachable(&self) -> bool {
        let addr = (self.host.as_str(), self.port);
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(host = %self.host, "network: probe failed: {e}");
                false
            }
            Err(_) => {
                debug!(host = %self.host, "network: probe timed out");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Escalation state machine
// ---------------------------------------------------------------------------

/// What the network looked like this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// No link; `elapsed` since the previous cycle.
    LinkDown { elapsed: Duration },
    /// Link up and a probe was due; `elapsed` since the previous probe.
    Probed { reachable: bool, elapsed: Duration },
    /// Link up, no probe due.
    Quiet,
}

#[derive(Debug)]
pub struct NetworkWatch {
    max_outage: Duration,
    outage: Duration,
    connected: bool,
    alert: bool,
    state: EmergencyProcedure,
}

impl NetworkWatch {
    pub fn new(auto: bool, link_up: bool, max_outage: Duration) -> Self {
        let state = match (auto, link_up) {
            (false, _) => EmergencyProcedure::Disabled,
            (true, true) => EmergencyProcedure::NotNeeded,
            (true, false) => EmergencyProcedure::Waiting,
        };
        Self {
            max_outage,
            outage: Duration::ZERO,
            connected: link_up,
            alert: false,
            state,
        }
    }

    pub fn state(&self) -> EmergencyProcedure {
        self.state
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn alert(&self) -> bool {
        self.alert
    }

    pub fn outage(&self) -> Duration {
        self.outage
    }

    /// Feed one cycle. Returns true when the grace period is over and the
    /// shutter must be closed.
    pub fn step(&mut self, auto: bool, sample: Sample) -> bool {
        match sample {
            Sample::Probed {
                reachable: true, ..
            } => {
                if auto {
                    self.state = EmergencyProcedure::NotNeeded;
                }
                if !self.connected {
                    info!("network: network found, reset timers");
                    self.alert = false;
                    self.connected = true;
                    self.outage = Duration::ZERO;
                }
            }
            Sample::Probed {
                reachable: false,
                elapsed,
            }
            | Sample::LinkDown { elapsed } => self.lost(auto, elapsed),
            Sample::Quiet => {}
        }

        if !auto {
            self.state = EmergencyProcedure::Disabled;
            self.outage = Duration::ZERO;
            return false;
        }
        if self.connected || self.outage <= self.max_outage {
            return false;
        }
        if self.state == EmergencyProcedure::Waiting {
            warn!("network: too much time without network, starting emergency procedure");
            self.state = EmergencyProcedure::Running;
        }
        self.alert = true;
        true
    }

    fn lost(&mut self, auto: bool, elapsed: Duration) {
        self.connected = false;
        if !auto {
            debug!("network: no network, emergency handling off in manual mode");
            return;
        }
        self.outage += elapsed;
        debug!(secs = self.outage.as_secs(), "network: no network");
        if self.state == EmergencyProcedure::NotNeeded {
            self.state = EmergencyProcedure::Waiting;
        }
    }

    /// The close attempt is in progress.
    pub fn closing(&mut self) {
        self.state = EmergencyProcedure::Running;
    }

    /// Outcome of the escalation once the shutter had its chance to close.
    pub fn settle(&mut self, closed: bool, hardware_alert: bool) {
        if closed {
            self.state = EmergencyProcedure::Completed;
        } else if hardware_alert {
            self.state = EmergencyProcedure::Error;
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

pub struct NetworkMonitor {
    shutter: Arc<Shutter>,
    probe: Arc<dyn NetworkProbe>,
    watch: NetworkWatch,
    probe_interval: Duration,
    last_cycle: Instant,
    /// `None` until the first probe, which is due immediately.
    last_probe: Option<Instant>,
}

impl NetworkMonitor {
    pub fn new(shutter: Arc<Shutter>, probe: Arc<dyn NetworkProbe>, cfg: &NetworkConfig) -> Self {
        let watch = NetworkWatch::new(
            shutter.io().auto(),
            probe.link_up(),
            Duration::from_millis(cfg.max_no_network_ms),
        );
        let monitor = Self {
            shutter,
            probe,
            watch,
            probe_interval: Duration::from_millis(cfg.probe_interval_ms),
            last_cycle: Instant::now(),
            last_probe: None,
        };
        monitor.publish();
        monitor
    }

    async fn sample(&mut self) -> Sample {
        let now = Instant::now();
        let since_cycle = now - self.last_cycle;
        self.last_cycle = now;

        if !self.probe.link_up() {
            return Sample::LinkDown {
                elapsed: since_cycle,
            };
        }
        let since_probe = match self.last_probe {
            Some(t) if now - t <= self.probe_interval => return Sample::Quiet,
            Some(t) => now - t,
            None => self.probe_interval,
        };
        let reachable = self.probe.reachable().await;
        self.last_probe = Some(now);
        Sample::Probed {
            reachable,
            elapsed: since_probe,
        }
    }

    /// One cycle: sample, escalate, mirror the result into the shutter.
    pub async fn tick(&mut self) {
        let sample = self.sample().await;
        let was_connected = self.watch.connected();
        let auto = self.shutter.io().auto();
        let escalate = self.watch.step(auto, sample);

        if was_connected != self.watch.connected() {
            let detail = if self.watch.connected() {
                "network back"
            } else {
                "network lost"
            };
            info!("network: {detail}");
            self.shutter.events().record(EventKind::Network, detail);
        }

        if escalate {
            let io = self.shutter.io();
            if !io.closed() && !io.closing() && !self.shutter.hardware_alert() {
                info!("network: closing shutter");
                self.watch.closing();
                self.publish();
                match self.shutter.emergency_close().await {
                    TravelOutcome::Underway => {}
                    outcome => warn!(?outcome, "network: emergency close did not get going"),
                }
            }
            let closed = self.shutter.io().closed();
            self.watch.settle(closed, self.shutter.hardware_alert());
        }
        self.publish();
    }

    fn publish(&self) {
        let (connected, alert, state) =
            (self.watch.connected(), self.watch.alert(), self.watch.state());
        let changed = self.shutter.with_state(|st| {
            let changed = st.emergency != state;
            st.network_connected = connected;
            st.network_alert = alert;
            st.emergency = state;
            changed
        });
        if changed {
            self.shutter
                .events()
                .record(EventKind::Network, format!("emergency procedure {state:?}"));
        }
    }

    pub async fn run(mut self, period: Duration) {
        info!(period_ms = period.as_millis() as u64, "network: monitor started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ShutterLoop;
    use crate::config::ControlConfig;
    use crate::testkit::{rig, Rig};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    const GRACE: Duration = Duration::from_secs(600);
    const CYCLE: Duration = Duration::from_millis(100);

    struct FakeProbe {
        link: AtomicBool,
        reachable: AtomicBool,
        probes: AtomicUsize,
    }

    impl FakeProbe {
        fn new(link: bool, reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                link: AtomicBool::new(link),
                reachable: AtomicBool::new(reachable),
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NetworkProbe for FakeProbe {
        fn link_up(&self) -> bool {
            self.link.load(Ordering::SeqCst)
        }

        async fn reachable(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.reachable.load(Ordering::SeqCst)
        }
    }

    // -- Watch --------------------------------------------------------------

    #[test]
    fn initial_state_follows_mode_and_link() {
        assert_eq!(
            NetworkWatch::new(true, true, GRACE).state(),
            EmergencyProcedure::NotNeeded
        );
        assert_eq!(
            NetworkWatch::new(true, false, GRACE).state(),
            EmergencyProcedure::Waiting
        );
        assert_eq!(
            NetworkWatch::new(false, false, GRACE).state(),
            EmergencyProcedure::Disabled
        );
    }

    #[test]
    fn outage_escalates_after_grace() {
        let mut watch = NetworkWatch::new(true, true, GRACE);
        let down = Sample::LinkDown {
            elapsed: Duration::from_secs(60),
        };
        for _ in 0..10 {
            assert!(!watch.step(true, down));
        }
        assert_eq!(watch.state(), EmergencyProcedure::Waiting);
        assert!(!watch.alert());

        assert!(watch.step(true, down));
        assert_eq!(watch.state(), EmergencyProcedure::Running);
        assert!(watch.alert());
    }

    #[test]
    fn failed_probes_count_whole_intervals() {
        let mut watch = NetworkWatch::new(true, true, GRACE);
        let failed = Sample::Probed {
            reachable: false,
            elapsed: Duration::from_secs(60),
        };
        for _ in 0..10 {
            assert!(!watch.step(true, failed));
            assert!(!watch.step(true, Sample::Quiet));
        }
        assert!(watch.step(true, failed));
    }

    #[test]
    fn manual_mode_disables_and_resets() {
        let mut watch = NetworkWatch::new(true, true, GRACE);
        let down = Sample::LinkDown {
            elapsed: Duration::from_secs(500),
        };
        watch.step(true, down);
        assert!(!watch.step(false, down));
        assert_eq!(watch.state(), EmergencyProcedure::Disabled);
        assert_eq!(watch.outage(), Duration::ZERO);

        // Back in AUTO the timer starts from zero, and the close still
        // fires once it runs out even though no probe succeeded meanwhile.
        assert!(!watch.step(true, down));
        assert_eq!(watch.state(), EmergencyProcedure::Disabled);
        assert!(watch.step(true, down));
        assert!(watch.alert());
    }

    #[test]
    fn recovery_clears_alert_and_timer() {
        let mut watch = NetworkWatch::new(true, false, GRACE);
        watch.step(
            true,
            Sample::LinkDown {
                elapsed: Duration::from_secs(700),
            },
        );
        assert!(watch.alert());
        watch.step(
            true,
            Sample::Probed {
                reachable: true,
                elapsed: Duration::ZERO,
            },
        );
        assert!(!watch.alert());
        assert!(watch.connected());
        assert_eq!(watch.outage(), Duration::ZERO);
        assert_eq!(watch.state(), EmergencyProcedure::NotNeeded);
    }

    #[test]
    fn settle_reports_completion_or_error() {
        let mut watch = NetworkWatch::new(true, false, GRACE);
        watch.closing();
        watch.settle(false, false);
        assert_eq!(watch.state(), EmergencyProcedure::Running);
        watch.settle(false, true);
        assert_eq!(watch.state(), EmergencyProcedure::Error);
        watch.settle(true, true);
        assert_eq!(watch.state(), EmergencyProcedure::Completed);
    }

    // -- Monitor ------------------------------------------------------------

    fn opened(r: &Rig) {
        r.board.set_input(r.roles.closed_input, false);
        r.board.set_input(r.roles.opened_input, true);
    }

    async fn run_for(mon: &mut NetworkMonitor, total: Duration) {
        let cycles = total.as_millis() / CYCLE.as_millis();
        for _ in 0..cycles {
            sleep(CYCLE).await;
            mon.tick().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_probe_is_immediate_then_periodic() {
        let r = rig().await;
        let probe = FakeProbe::new(true, true);
        let mut mon = NetworkMonitor::new(r.shutter.clone(), probe.clone(), &NetworkConfig::default());
        mon.tick().await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 1);
        run_for(&mut mon, Duration::from_secs(30)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 1);
        run_for(&mut mon, Duration::from_secs(31)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 2);
        assert!(r.shutter.snapshot().network_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn prolonged_outage_closes_the_shutter() {
        let r = rig().await;
        opened(&r);
        let probe = FakeProbe::new(true, true);
        let cfg = NetworkConfig::default();
        let mut mon = NetworkMonitor::new(r.shutter.clone(), probe.clone(), &cfg);
        mon.tick().await;
        assert_eq!(r.shutter.snapshot().emergency, EmergencyProcedure::NotNeeded);

        probe.link.store(false, Ordering::SeqCst);
        run_for(&mut mon, Duration::from_secs(1)).await;
        assert_eq!(r.shutter.snapshot().emergency, EmergencyProcedure::Waiting);
        assert!(!r.shutter.io().moving());

        // The opening switch releases shortly after the close starts.
        r.board
            .script_input(r.roles.opened_input, &[true, true, false]);
        run_for(&mut mon, GRACE).await;
        let st = r.shutter.snapshot();
        assert_eq!(st.emergency, EmergencyProcedure::Running);
        assert!(st.network_alert);
        assert!(r.shutter.io().closing());

        r.board.set_input(r.roles.closed_input, true);
        run_for(&mut mon, Duration::from_millis(200)).await;
        assert_eq!(r.shutter.snapshot().emergency, EmergencyProcedure::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_emergency_close_ends_in_error() {
        let r = rig().await;
        opened(&r);
        let probe = FakeProbe::new(false, false);
        let cfg = NetworkConfig {
            max_no_network_ms: 1000,
            ..NetworkConfig::default()
        };
        let mut mon = NetworkMonitor::new(r.shutter.clone(), probe, &cfg);
        let cl = ShutterLoop::new(r.shutter.clone(), ControlConfig::default());

        run_for(&mut mon, Duration::from_millis(1200)).await;
        assert!(r.shutter.io().closing());
        assert!(!r.shutter.hardware_alert());

        // The stuck close back-dated the watchdog.
        cl.tick().await;
        assert!(r.shutter.hardware_alert());
        run_for(&mut mon, CYCLE).await;
        assert_eq!(r.shutter.snapshot().emergency, EmergencyProcedure::Error);
        assert!(!r.shutter.io().moving());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_never_closes() {
        let r = rig().await;
        opened(&r);
        r.board.set_input(r.roles.auto_input, false);
        let probe = FakeProbe::new(false, false);
        let cfg = NetworkConfig {
            max_no_network_ms: 500,
            ..NetworkConfig::default()
        };
        let mut mon = NetworkMonitor::new(r.shutter.clone(), probe, &cfg);
        run_for(&mut mon, Duration::from_secs(5)).await;
        assert!(!r.shutter.io().moving());
        let st = r.shutter.snapshot();
        assert_eq!(st.emergency, EmergencyProcedure::Disabled);
        assert!(!st.network_alert);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_shutter_is_left_alone() {
        let r = rig().await;
        let probe = FakeProbe::new(false, false);
        let cfg = NetworkConfig {
            max_no_network_ms: 500,
            ..NetworkConfig::default()
        };
        let mut mon = NetworkMonitor::new(r.shutter.clone(), probe, &cfg);
        run_for(&mut mon, Duration::from_secs(1)).await;
        assert!(!r.shutter.io().moving());
        let st = r.shutter.snapshot();
        assert!(st.network_alert);
        assert_eq!(st.emergency, EmergencyProcedure::Completed);
    }
}
