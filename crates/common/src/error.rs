use serde::Serialize;
use thiserror::Error;

/// Every way a control operation can be refused or fail without taking the
/// unit down. The `Display` text is what API callers see after `Error: `.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("mutex acquired")]
    LockBusy,
    #[error("no data from encoder")]
    NoData,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("hardware alert status")]
    HardwareAlert,
    #[error("network alert status")]
    NetworkAlert,
    #[error("manual mode")]
    ManualMode,
    #[error("automatic mode")]
    AutoMode,
    #[error("switchboard is off")]
    SwitchboardOff,
    #[error("no AC power")]
    NoAc,
    #[error("finding zero")]
    FindingZero,
    #[error("parking")]
    Parking,
    #[error("moving")]
    Moving,
    #[error("target out of bound")]
    OutOfBounds,
    #[error("movement locked")]
    MovementLocked,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Persistence(format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// API reply
// ---------------------------------------------------------------------------

/// The `{"rsp": ...}` body returned by every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub rsp: String,
}

impl Reply {
    pub fn done() -> Self {
        Self { rsp: "done".into() }
    }

    pub fn error(err: &ControlError) -> Self {
        Self {
            rsp: format!("Error: {err}"),
        }
    }

    pub fn wrong_syntax() -> Self {
        Self {
            rsp: "Error: wrong syntax".into(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.rsp == "done"
    }
}

impl From<Result<(), ControlError>> for Reply {
    fn from(res: Result<(), ControlError>) -> Self {
        match res {
            Ok(()) => Reply::done(),
            Err(e) => Reply::error(&e),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_busy_reads_like_the_panel_firmware() {
        assert_eq!(
            Reply::error(&ControlError::LockBusy).rsp,
            "Error: mutex acquired"
        );
    }

    #[test]
    fn result_conversion() {
        assert!(Reply::from(Ok(())).is_done());
        let r = Reply::from(Err(ControlError::ManualMode));
        assert_eq!(r.rsp, "Error: manual mode");
        assert!(!r.is_done());
    }

    #[test]
    fn reply_serializes_as_rsp_object() {
        let json = serde_json::to_string(&Reply::done()).unwrap();
        assert_eq!(json, r#"{"rsp":"done"}"#);
    }
}
