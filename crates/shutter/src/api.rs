//! Typed command surface of the shutter. Requests are checked and answered
//! right away; an accepted open/close then runs in the background, waiting
//! for the unit lock as long as it takes.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use observatory_common::events::EventKind;
use observatory_common::lock::UnitGuard;
use observatory_common::store;
use observatory_common::ControlError;

use crate::motion::{Shutter, Travel};
use crate::state::ShutterReport;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    Abort,
    Open,
    Close,
    LockMovement,
    UnlockMovement,
    ResetAlertStatus,
    ResetStorage,
    Status,
}

#[derive(Debug)]
pub enum Outcome {
    Done,
    Status(Box<ShutterReport>),
}

#[derive(Clone)]
pub struct ShutterApi {
    shutter: Arc<Shutter>,
    lock_wait: Duration,
}

type ApiResult = Result<Outcome, ControlError>;

impl ShutterApi {
    pub fn new(shutter: Arc<Shutter>, lock_wait: Duration) -> Self {
        Self { shutter, lock_wait }
    }

    pub async fn execute(&self, cmd: Command) -> ApiResult {
        let result = match cmd {
            Command::Abort => self.abort().await,
            Command::Open => self.travel(Travel::Open),
            Command::Close => self.travel(Travel::Close),
            Command::LockMovement => {
                self.shutter.set_lock_movement(true);
                Ok(Outcome::Done)
            }
            Command::UnlockMovement => {
                self.shutter.set_lock_movement(false);
                Ok(Outcome::Done)
            }
            Command::ResetAlertStatus => self.reset_alert().await,
            Command::ResetStorage => self.reset_storage().await,
            Command::Status => Ok(Outcome::Status(Box::new(self.shutter.report()))),
        };
        if let Err(e) = &result {
            info!(?cmd, "api: command rejected: {e}");
        }
        result
    }

    async fn acquire(&self) -> Result<UnitGuard, ControlError> {
        self.shutter.lock().acquire(self.lock_wait).await
    }

    async fn abort(&self) -> ApiResult {
        if !self.shutter.io().auto() {
            return Err(ControlError::ManualMode);
        }
        let guard = self.acquire().await?;
        self.shutter.force_stop(&guard);
        self.shutter.events().record(EventKind::Motion, "abort");
        Ok(Outcome::Done)
    }

    fn travel(&self, travel: Travel) -> ApiResult {
        if !self.shutter.check_request(travel)? {
            return Ok(Outcome::Done);
        }
        let shutter = Arc::clone(&self.shutter);
        tokio::spawn(async move {
            let guard = shutter.lock().acquire_blocking().await;
            // An earlier request may have started the same travel meanwhile.
            match shutter.check_request(travel) {
                Ok(true) => {
                    shutter.drive(&guard, travel).await;
                }
                Ok(false) => debug!(%travel, "api: already under way, nothing to do"),
                Err(e) => info!(%travel, "api: request dropped: {e}"),
            }
        });
        Ok(Outcome::Done)
    }

    async fn reset_alert(&self) -> ApiResult {
        let guard = self.acquire().await?;
        self.shutter.reset_alert(&guard).await;
        Ok(Outcome::Done)
    }

    async fn reset_storage(&self) -> ApiResult {
        if self.shutter.hardware_alert() {
            return Err(ControlError::HardwareAlert);
        }
        if self.shutter.io().moving() {
            return Err(ControlError::Moving);
        }
        let _guard = self.acquire().await?;
        store::reset(&**self.shutter.store()).await.map_err(|e| {
            warn!("api: storage reset failed: {e:#}");
            ControlError::from(e)
        })?;
        info!("api: storage reset, defaults apply at next start");
        self.shutter
            .events()
            .record(EventKind::System, "storage reset requested");
        Ok(Outcome::Done)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
