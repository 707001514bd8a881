//! Typed command surface of the dome. Every command answers right away:
//! preconditions are checked in a fixed order, the unit lock is taken with
//! a bounded wait, and any physical motion is handed to a background task
//! that keeps holding the lock until the motion bookkeeping is done.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use observatory_common::events::EventKind;
use observatory_common::lock::UnitGuard;
use observatory_common::store;
use observatory_common::ControlError;

use crate::encoder::ConfigReport;
use crate::motion::{arc_distance, Dome};
use crate::state::DomeStatus;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    Abort,
    SlewToAz {
        #[serde(rename = "az-target")]
        az_target: i64,
    },
    Park,
    FindZero,
    EncoderReadconf,
    EncoderWriteconf {
        config: Vec<Value>,
    },
    EncoderResetconf,
    EncoderDisablezero,
    IgniteSwitchboard,
    TurnOff,
    ResetStorage,
    Status,
}

#[derive(Debug)]
pub enum Outcome {
    Done,
    Status(Box<DomeStatus>),
    EncoderConfig(ConfigReport),
}

#[derive(Clone)]
pub struct DomeApi {
    dome: Arc<Dome>,
    lock_wait: Duration,
}

type ApiResult = Result<Outcome, ControlError>;

impl DomeApi {
    pub fn new(dome: Arc<Dome>, lock_wait: Duration) -> Self {
        Self { dome, lock_wait }
    }

    pub async fn execute(&self, cmd: Command) -> ApiResult {
        let result = match cmd {
            Command::Abort => self.abort().await,
            Command::SlewToAz { az_target } => self.slew_to_az(az_target).await,
            Command::Park => self.park().await,
            Command::FindZero => self.find_zero().await,
            Command::EncoderReadconf => self
                .dome
                .encoder()
                .read_config()
                .await
                .map(Outcome::EncoderConfig),
            Command::EncoderWriteconf { ref config } => self.encoder_writeconf(config).await,
            Command::EncoderResetconf => self.encoder_resetconf().await,
            Command::EncoderDisablezero => self.encoder_disablezero().await,
            Command::IgniteSwitchboard => self.ignite_switchboard().await,
            Command::TurnOff => self.turn_off().await,
            Command::ResetStorage => self.reset_storage().await,
            Command::Status => Ok(Outcome::Status(Box::new(self.dome.status()))),
        };
        if let Err(e) = &result {
            info!(?cmd, "api: command rejected: {e}");
        }
        result
    }

    async fn acquire(&self) -> Result<UnitGuard, ControlError> {
        self.dome.lock().acquire(self.lock_wait).await
    }

    fn require_auto(&self) -> Result<(), ControlError> {
        if self.dome.io().auto() {
            Ok(())
        } else {
            Err(ControlError::ManualMode)
        }
    }

    fn require_ac(&self) -> Result<(), ControlError> {
        if self.dome.io().ac_present() {
            Ok(())
        } else {
            Err(ControlError::NoAc)
        }
    }

    fn require_switchboard(&self) -> Result<(), ControlError> {
        if self.dome.io().switchboard_on() {
            Ok(())
        } else {
            Err(ControlError::SwitchboardOff)
        }
    }

    // ── Motion commands ─────────────────────────────────────────────

    async fn abort(&self) -> ApiResult {
        self.require_auto()?;
        self.require_switchboard()?;
        let guard = self.acquire().await?;
        self.dome.clear_intents();
        self.dome.events().record(EventKind::Motion, "abort requested");
        if self.dome.io().moving() {
            let dome = Arc::clone(&self.dome);
            tokio::spawn(async move {
                dome.stop_slewing(&guard).await;
            });
        }
        Ok(Outcome::Done)
    }

    async fn slew_to_az(&self, az: i64) -> ApiResult {
        self.require_auto()?;
        self.require_ac()?;
        self.require_switchboard()?;
        if self.dome.finding_zero() {
            return Err(ControlError::FindingZero);
        }
        if self.dome.finding_park() {
            return Err(ControlError::Parking);
        }
        let target = match i32::try_from(az) {
            Ok(t) if (0..=360).contains(&t) => t,
            _ => return Err(ControlError::OutOfBounds),
        };
        let guard = self.acquire().await?;
        let dome = Arc::clone(&self.dome);
        tokio::spawn(async move {
            dome.start_slewing(&guard, target).await;
        });
        Ok(Outcome::Done)
    }

    async fn park(&self) -> ApiResult {
        self.require_auto()?;
        self.require_ac()?;
        self.require_switchboard()?;
        if self.dome.finding_zero() {
            return Err(ControlError::FindingZero);
        }
        if self.dome.finding_park() || self.dome.parked() {
            return Ok(Outcome::Done);
        }
        let guard = self.acquire().await?;
        let cfg = self.dome.motion_config();
        let near = arc_distance(self.dome.current_az(), cfg.park_azimuth)
            < cfg.park_request_tolerance;
        if !self.dome.io().moving() && near {
            info!("api: already at park position, setting flag");
            self.dome.set_park(&guard, true).await;
            return Ok(Outcome::Done);
        }
        let dome = Arc::clone(&self.dome);
        tokio::spawn(async move {
            dome.park(&guard).await;
        });
        Ok(Outcome::Done)
    }

    async fn find_zero(&self) -> ApiResult {
        self.require_auto()?;
        self.require_ac()?;
        self.require_switchboard()?;
        if self.dome.io().moving() {
            return Err(ControlError::Moving);
        }
        let _guard = self.acquire().await?;
        self.dome.request_zero();
        self.dome
            .events()
            .record(EventKind::Motion, "find zero requested");
        Ok(Outcome::Done)
    }

    // ── Encoder maintenance ─────────────────────────────────────────

    /// Encoder settings are only touched by an operator at the panel.
    fn check_encoder_maintenance(&self) -> Result<(), ControlError> {
        if self.dome.io().auto() {
            return Err(ControlError::AutoMode);
        }
        self.require_ac()?;
        if self.dome.io().moving() {
            return Err(ControlError::Moving);
        }
        Ok(())
    }

    async fn encoder_writeconf(&self, config: &[Value]) -> ApiResult {
        self.check_encoder_maintenance()?;
        let bytes = config
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| ControlError::InvalidConfig("type must be byte (uint8_t)".into()))?;
        let payload = <[u8; 7]>::try_from(bytes.as_slice())
            .map_err(|_| ControlError::InvalidConfig("config must be of 7 bytes".into()))?;
        self.dome.encoder().write_config(&payload).await?;
        info!(config = ?payload, "api: encoder config written");
        self.dome
            .events()
            .record(EventKind::System, format!("encoder config written {payload:?}"));
        Ok(Outcome::Done)
    }

    async fn encoder_resetconf(&self) -> ApiResult {
        self.check_encoder_maintenance()?;
        self.dome.encoder().reset_config().await?;
        self.dome
            .events()
            .record(EventKind::System, "encoder config reset to factory");
        Ok(Outcome::Done)
    }

    async fn encoder_disablezero(&self) -> ApiResult {
        self.check_encoder_maintenance()?;
        self.dome.encoder().disable_zero().await?;
        self.dome
            .events()
            .record(EventKind::System, "encoder zero disabled");
        Ok(Outcome::Done)
    }

    // ── System ──────────────────────────────────────────────────────

    async fn ignite_switchboard(&self) -> ApiResult {
        let guard = self.acquire().await?;
        if !self.dome.switchboard_ignited() {
            let dome = Arc::clone(&self.dome);
            tokio::spawn(async move {
                dome.ignite_switchboard(&guard).await;
            });
        }
        Ok(Outcome::Done)
    }

    async fn turn_off(&self) -> ApiResult {
        self.require_auto()?;
        self.require_ac()?;
        let guard = self.acquire().await?;
        let dome = Arc::clone(&self.dome);
        tokio::spawn(async move {
            dome.shut_down(&guard).await;
        });
        Ok(Outcome::Done)
    }

    async fn reset_storage(&self) -> ApiResult {
        if self.dome.io().moving() {
            return Err(ControlError::Moving);
        }
        self.require_ac()?;
        let _guard = self.acquire().await?;
        store::reset(&**self.dome.store()).await.map_err(|e| {
            warn!("api: storage reset failed: {e:#}");
            ControlError::from(e)
        })?;
        info!("api: storage reset, defaults apply at next start");
        self.dome
            .events()
            .record(EventKind::System, "storage reset requested");
        Ok(Outcome::Done)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{Movement, KEY_PARK};
    use crate::arbiter::ControlLoop;
    use crate::config::ControlConfig;
    use crate::site::tests::RecordingHooks;
    use crate::testkit::{rig, Rig};
    use observatory_common::board::RelayBank;
    use proptest::prelude::*;
    use observatory_common::store::{Store, INITIALIZED_KEY};
    use tokio::time::sleep;

    fn api(r: &Rig) -> DomeApi {
        DomeApi::new(r.dome.clone(), Duration::from_millis(300))
    }

    fn cmd(json: &str) -> Command {
        serde_json::from_str(json).unwrap()
    }

    async fn settle() {
        sleep(Duration::from_secs(2)).await;
    }

    // -- Parsing ------------------------------------------------------------

    #[test]
    fn commands_parse_from_wire_names() {
        assert!(matches!(
            cmd(r#"{"cmd":"slew-to-az","az-target":120}"#),
            Command::SlewToAz { az_target: 120 }
        ));
        assert!(matches!(cmd(r#"{"cmd":"find-zero"}"#), Command::FindZero));
        assert!(matches!(
            cmd(r#"{"cmd":"encoder-disablezero"}"#),
            Command::EncoderDisablezero
        ));
    }

    #[test]
    fn slew_without_target_is_a_syntax_error() {
        assert!(serde_json::from_str::<Command>(r#"{"cmd":"slew-to-az"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"cmd":"dance"}"#).is_err());
    }

    // -- Slew ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn slew_answers_then_moves() {
        let r = rig(0).await;
        let out = api(&r).execute(Command::SlewToAz { az_target: 45 }).await;
        assert!(matches!(out, Ok(Outcome::Done)));
        settle().await;
        assert_eq!(r.dome.io().movement(), Movement::Cw);
        assert_eq!(r.dome.target_az(), 45);
        assert!(!r.dome.lock().is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn slew_rejections_in_order() {
        let r = rig(0).await;
        let api = api(&r);
        let slew = || Command::SlewToAz { az_target: 45 };

        r.board.set_input(r.roles.ac_presence_input, false);
        r.board.set_input(r.roles.auto_input, false);
        assert_eq!(api.execute(slew()).await.unwrap_err(), ControlError::ManualMode);

        r.board.set_input(r.roles.auto_input, true);
        assert_eq!(api.execute(slew()).await.unwrap_err(), ControlError::NoAc);

        r.board.set_input(r.roles.ac_presence_input, true);
        r.board.set_input(r.roles.switchboard_status_input, false);
        assert_eq!(
            api.execute(slew()).await.unwrap_err(),
            ControlError::SwitchboardOff
        );

        r.board.set_input(r.roles.switchboard_status_input, true);
        r.dome.request_zero();
        assert_eq!(api.execute(slew()).await.unwrap_err(), ControlError::FindingZero);
        r.dome.clear_intents();

        assert_eq!(
            api.execute(Command::SlewToAz { az_target: 361 })
                .await
                .unwrap_err(),
            ControlError::OutOfBounds
        );
        assert_eq!(
            api.execute(Command::SlewToAz { az_target: -1 })
                .await
                .unwrap_err(),
            ControlError::OutOfBounds
        );
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_reported_as_mutex_acquired() {
        let r = rig(0).await;
        let _held = r.dome.lock().acquire_blocking().await;
        let err = api(&r)
            .execute(Command::SlewToAz { az_target: 45 })
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::LockBusy);
        assert_eq!(err.to_string(), "mutex acquired");
    }

    // -- Abort --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn abort_stops_and_clears_intents() {
        let r = rig(0).await;
        let api = api(&r);
        api.execute(Command::Park).await.unwrap();
        settle().await;
        assert!(r.dome.finding_park());
        api.execute(Command::Abort).await.unwrap();
        assert!(!r.dome.finding_park());
        settle().await;
        assert_eq!(r.dome.io().movement(), Movement::Idle);
        assert!(!r.dome.parked());
    }

    // -- Park ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn park_near_position_sets_flag_without_motion() {
        let r = rig(91).await;
        api(&r).execute(Command::Park).await.unwrap();
        assert!(r.dome.parked());
        assert_eq!(r.dome.io().movement(), Movement::Idle);
        assert_eq!(r.store.durable(KEY_PARK).as_deref(), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn park_while_parking_is_done() {
        let r = rig(0).await;
        let api = api(&r);
        api.execute(Command::Park).await.unwrap();
        settle().await;
        assert!(matches!(api.execute(Command::Park).await, Ok(Outcome::Done)));
        assert_eq!(
            api.execute(Command::SlewToAz { az_target: 10 })
                .await
                .unwrap_err(),
            ControlError::Parking
        );
    }

    // -- Find zero ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn find_zero_rejected_while_moving() {
        let r = rig(0).await;
        let api = api(&r);
        api.execute(Command::SlewToAz { az_target: 100 }).await.unwrap();
        settle().await;
        assert_eq!(
            api.execute(Command::FindZero).await.unwrap_err(),
            ControlError::Moving
        );
    }

    #[tokio::test(start_paused = true)]
    async fn find_zero_only_sets_intent() {
        let r = rig(0).await;
        api(&r).execute(Command::FindZero).await.unwrap();
        assert!(r.dome.finding_zero());
        assert_eq!(r.dome.io().movement(), Movement::Idle);
        assert_eq!(r.dome.status().dome_azimuth, -1);
    }

    // -- Encoder maintenance ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn encoder_writes_need_manual_mode() {
        let r = rig(0).await;
        let err = api(&r)
            .execute(Command::EncoderResetconf)
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::AutoMode);
    }

    #[tokio::test(start_paused = true)]
    async fn writeconf_validates_bytes() {
        let r = rig(0).await;
        r.board.set_input(r.roles.auto_input, false);
        let api = api(&r);

        let err = api
            .execute(cmd(r#"{"cmd":"encoder-writeconf","config":[1,2,3,4,5,6,300]}"#))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ControlError::InvalidConfig("type must be byte (uint8_t)".into())
        );

        let err = api
            .execute(cmd(r#"{"cmd":"encoder-writeconf","config":[1,2,3]}"#))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ControlError::InvalidConfig("config must be of 7 bytes".into())
        );

        api.execute(cmd(
            r#"{"cmd":"encoder-writeconf","config":[4,5,160,1,14,0,32]}"#,
        ))
        .await
        .unwrap();
        assert_eq!(r.sim.config(), [4, 5, 160, 1, 14, 0, 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn readconf_reports_decoded_config() {
        let r = rig(0).await;
        let Ok(Outcome::EncoderConfig(report)) =
            api(&r).execute(Command::EncoderReadconf).await
        else {
            panic!("expected a config report");
        };
        assert!(report.valid);
        assert_eq!(report.decoded.zero_azimuth, 248);
    }

    #[tokio::test(start_paused = true)]
    async fn disablezero_reaches_encoder() {
        let r = rig(0).await;
        r.board.set_input(r.roles.auto_input, false);
        api(&r).execute(Command::EncoderDisablezero).await.unwrap();
        assert!(r.sim.zero_disabled());
    }

    // -- System -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn ignite_is_idempotent_when_already_ignited() {
        let r = rig(0).await;
        assert!(r.dome.switchboard_ignited());
        api(&r).execute(Command::IgniteSwitchboard).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(!r.board.relay(r.roles.switchboard_relay));
    }

    #[tokio::test(start_paused = true)]
    async fn turn_off_releases_relays() {
        let r = rig(0).await;
        let api = api(&r);
        api.execute(Command::SlewToAz { az_target: 100 }).await.unwrap();
        settle().await;
        api.execute(Command::TurnOff).await.unwrap();
        settle().await;
        assert!(!r.dome.io().moving());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_storage_clears_initialised_marker() {
        let r = rig(0).await;
        api(&r).execute(Command::ResetStorage).await.unwrap();
        assert_eq!(r.store.load(INITIALIZED_KEY).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_position() {
        let r = rig(123).await;
        let Ok(Outcome::Status(status)) = api(&r).execute(Command::Status).await else {
            panic!("expected status");
        };
        assert_eq!(status.dome_azimuth, 123);
        assert!(status.optoin.auto);
    }

    // -- Relay exclusion ----------------------------------------------------

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn motor_relays_never_overlap(
            targets in proptest::collection::vec(0i64..=360, 1..10),
            aborts in proptest::collection::vec(any::<bool>(), 10),
            gaps in proptest::collection::vec(0u64..900, 10),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let r = rig(0).await;
                let api = api(&r);
                let hooks = Arc::new(RecordingHooks::default());
                let mut cl = ControlLoop::new(r.dome.clone(), hooks, ControlConfig::default());
                for (i, target) in targets.iter().copied().enumerate() {
                    let a = api.clone();
                    tokio::spawn(async move {
                        let _ = a.execute(Command::SlewToAz { az_target: target }).await;
                    });
                    if aborts[i] {
                        let a = api.clone();
                        tokio::spawn(async move {
                            let _ = a.execute(Command::Abort).await;
                        });
                    }
                    cl.tick().await;
                    sleep(Duration::from_millis(gaps[i])).await;
                }
                for _ in 0..20 {
                    cl.tick().await;
                }
                assert_eq!(r.board.overlaps(), 0);
            });
        }
    }
}
