//! TOML config loading and the validation helpers both units share.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
pub const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub trait Validate {
    /// Push one message per violation into `errors`.
    fn collect_errors(&self, errors: &mut Vec<String>);

    /// Returns `Ok(())` or an error describing every violation found (not
    /// just the first one).
    fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        self.collect_errors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

pub fn check_positive(errors: &mut Vec<String>, field: &str, value: u64) {
    if value == 0 {
        errors.push(format!("{field} must be positive, got 0"));
    }
}

// ---------------------------------------------------------------------------
// Board wiring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BoardConfig {
    pub relay_gpio: Vec<i64>,
    pub input_gpio: Vec<i64>,
    #[serde(default = "default_true")]
    pub relay_active_low: bool,
    #[serde(default)]
    pub input_active_low: bool,
}

fn default_true() -> bool {
    true
}

impl BoardConfig {
    pub fn relay_pins(&self) -> Vec<u8> {
        self.relay_gpio.iter().map(|p| *p as u8).collect()
    }

    pub fn input_pins(&self) -> Vec<u8> {
        self.input_gpio.iter().map(|p| *p as u8).collect()
    }

    /// Check a relay role binding. `relay_gpio` must have an entry at `idx`.
    pub fn check_relay_role(&self, errors: &mut Vec<String>, role: &str, idx: usize) {
        if idx >= self.relay_gpio.len() {
            errors.push(format!(
                "board: relay role '{role}' uses index {idx} but only {} relay(s) are wired",
                self.relay_gpio.len()
            ));
        }
    }

    pub fn check_input_role(&self, errors: &mut Vec<String>, role: &str, idx: usize) {
        if idx >= self.input_gpio.len() {
            errors.push(format!(
                "board: input role '{role}' uses index {idx} but only {} input(s) are wired",
                self.input_gpio.len()
            ));
        }
    }

    /// Relay roles must not share an output.
    pub fn check_distinct_relays(&self, errors: &mut Vec<String>, roles: &[(&str, usize)]) {
        let mut seen: HashSet<usize> = HashSet::new();
        for (role, idx) in roles {
            if !seen.insert(*idx) {
                errors.push(format!(
                    "board: relay role '{role}' shares index {idx} with another role"
                ));
            }
        }
    }
}

impl Validate for BoardConfig {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let all = self
            .relay_gpio
            .iter()
            .map(|p| ("relay_gpio", p))
            .chain(self.input_gpio.iter().map(|p| ("input_gpio", p)));

        for (field, pin) in all {
            if !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!(
                    "board: {field} pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(*pin) {
                errors.push(format!("board: {field} pin {pin} is already in use"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load<T: DeserializeOwned + Validate>(path: &str) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate TOML text.
pub fn parse<T: DeserializeOwned + Validate>(contents: &str) -> Result<T> {
    let config: T = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_board() -> BoardConfig {
        BoardConfig {
            relay_gpio: vec![17, 27, 22],
            input_gpio: vec![5, 6, 13],
            relay_active_low: true,
            input_active_low: false,
        }
    }

    fn assert_validation_err(cfg: &BoardConfig, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    #[test]
    fn valid_board_passes() {
        assert!(valid_board().validate().is_ok());
    }

    #[test]
    fn parse_board_defaults_active_levels() {
        let cfg: BoardConfig = toml::from_str(
            r#"
relay_gpio = [17, 27]
input_gpio = [5]
"#,
        )
        .unwrap();
        assert!(cfg.relay_active_low);
        assert!(!cfg.input_active_low);
    }

    #[test]
    fn reserved_pin_rejected() {
        let mut cfg = valid_board();
        cfg.relay_gpio[0] = 1;
        assert_validation_err(&cfg, "relay_gpio pin 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn pin_shared_between_relay_and_input_rejected() {
        let mut cfg = valid_board();
        cfg.input_gpio[0] = 17;
        assert_validation_err(&cfg, "input_gpio pin 17 is already in use");
    }

    #[test]
    fn multiple_errors_reported_together() {
        let mut cfg = valid_board();
        cfg.relay_gpio = vec![0, 40];
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("2 errors"), "got: {msg}");
    }

    #[test]
    fn role_index_out_of_range() {
        let cfg = valid_board();
        let mut errors = Vec::new();
        cfg.check_relay_role(&mut errors, "cw", 3);
        cfg.check_input_role(&mut errors, "auto", 2);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'cw'"));
    }

    #[test]
    fn shared_relay_roles_rejected() {
        let cfg = valid_board();
        let mut errors = Vec::new();
        cfg.check_distinct_relays(&mut errors, &[("cw", 0), ("ccw", 0)]);
        assert_eq!(errors.len(), 1);
    }
}
