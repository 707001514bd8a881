//! AC-power watch. A short sag is ignored; an outage is declared after a
//! run of consecutive AC-absent samples and reported once, and its end is
//! reported once as well.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use observatory_common::events::EventKind;

use crate::motion::Dome;
use crate::site::SiteHooks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Lost,
    Restored,
}

/// Debounce state, fed one AC sample per cycle.
#[derive(Debug)]
pub struct PowerWatch {
    trip_cycles: u32,
    absent: u32,
    lost: bool,
}

impl PowerWatch {
    pub fn new(trip_cycles: u32) -> Self {
        Self {
            trip_cycles,
            absent: 0,
            lost: false,
        }
    }

    pub fn observe(&mut self, ac_present: bool) -> Option<PowerEvent> {
        if ac_present {
            self.absent = 0;
            if self.lost {
                self.lost = false;
                return Some(PowerEvent::Restored);
            }
            return None;
        }
        self.absent = self.absent.saturating_add(1);
        if !self.lost && self.absent >= self.trip_cycles {
            self.lost = true;
            return Some(PowerEvent::Lost);
        }
        None
    }
}

pub struct PowerMonitor {
    dome: Arc<Dome>,
    hooks: Arc<dyn SiteHooks>,
    watch: PowerWatch,
}

impl PowerMonitor {
    pub fn new(dome: Arc<Dome>, hooks: Arc<dyn SiteHooks>, trip_cycles: u32) -> Self {
        Self {
            dome,
            hooks,
            watch: PowerWatch::new(trip_cycles),
        }
    }

    /// One sample. Only AUTO counts; in MANUAL the operator owns the dome.
    pub async fn tick(&mut self) -> Option<PowerEvent> {
        if !self.dome.io().auto() {
            return None;
        }
        let event = self.watch.observe(self.dome.io().ac_present())?;
        match event {
            PowerEvent::Lost => {
                warn!("power: AC lost, running emergency hook");
                self.dome.set_power_alert(true);
                self.dome.events().record(EventKind::Power, "AC power lost");
                if !self.hooks.power_lost().await {
                    warn!("power: emergency hook reported failure");
                    self.dome
                        .events()
                        .record(EventKind::Error, "power-lost hook failed");
                }
            }
            PowerEvent::Restored => {
                info!("power: AC restored");
                self.dome.set_power_alert(false);
                self.dome
                    .events()
                    .record(EventKind::Power, "AC power restored");
                if !self.hooks.power_restored().await {
                    warn!("power: recovery hook reported failure");
                    self.dome
                        .events()
                        .record(EventKind::Error, "power-restored hook failed");
                }
            }
        }
        Some(event)
    }

    pub async fn run(mut self, period: Duration) {
        info!(period_ms = period.as_millis() as u64, "power: monitor started");
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
    use crate::site::tests::RecordingHooks;
    use crate::testkit::rig;
    use std::sync::atomic::Ordering;

    // -- Debounce -----------------------------------------------------------

    #[test]
    fn short_sag_does_not_trip() {
        let mut watch = PowerWatch::new(10);
        for _ in 0..9 {
            assert_eq!(watch.observe(false), None);
        }
        assert_eq!(watch.observe(true), None);
        for _ in 0..9 {
            assert_eq!(watch.observe(false), None);
        }
    }

    #[test]
    fn outage_reported_once_then_recovery_once() {
        let mut watch = PowerWatch::new(3);
        let events: Vec<_> = [false, false, false, false, false, true, true]
            .into_iter()
            .filter_map(|ac| watch.observe(ac))
            .collect();
        assert_eq!(events, vec![PowerEvent::Lost, PowerEvent::Restored]);
    }

    // -- Monitor ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn outage_invokes_hooks_exactly_once() {
        let r = rig(90).await;
        let hooks = Arc::new(RecordingHooks::default());
        let mut mon = PowerMonitor::new(r.dome.clone(), hooks.clone(), 10);

        r.board.set_input(r.roles.ac_presence_input, false);
        for _ in 0..30 {
            mon.tick().await;
        }
        assert_eq!(hooks.lost.load(Ordering::SeqCst), 1);
        assert!(r.dome.status().power_alert);

        r.board.set_input(r.roles.ac_presence_input, true);
        for _ in 0..5 {
            mon.tick().await;
        }
        assert_eq!(hooks.restored.load(Ordering::SeqCst), 1);
        assert!(!r.dome.status().power_alert);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_is_not_watched() {
        let r = rig(90).await;
        let hooks = Arc::new(RecordingHooks::default());
        let mut mon = PowerMonitor::new(r.dome.clone(), hooks.clone(), 2);
        r.board.set_input(r.roles.auto_input, false);
        r.board.set_input(r.roles.ac_presence_input, false);
        for _ in 0..10 {
            assert_eq!(mon.tick().await, None);
        }
        assert_eq!(hooks.lost.load(Ordering::SeqCst), 0);
    }
}
