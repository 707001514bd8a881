//! Relay outputs and opto-isolated inputs. The `gpio` feature gates the real
//! rppal driver; `MockBoard` is always available for development and tests.
//!
//! Ids are indices into the board's relay/input lists. Role bindings (which
//! relay drives CW, which input is the AUTO switch) live in each unit's config.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

#[cfg(feature = "gpio")]
use anyhow::Result;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Relay outputs. Calls are immediate and infallible at the call site.
pub trait RelayBank: Send + Sync {
    fn set_relay(&self, id: usize, on: bool);
    fn relay(&self, id: usize) -> bool;
    fn all_off(&self);
}

/// Digital inputs, debounced in hardware. Every read is a fresh sample.
pub trait SensorBank: Send + Sync {
    fn input(&self, id: usize) -> bool;
}

// ---------------------------------------------------------------------------
// Real GPIO board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioBoard {
    relays: Mutex<Vec<OutputPin>>,
    inputs: Vec<InputPin>,
    relay_active_low: bool,
    input_active_low: bool,
}

#[cfg(feature = "gpio")]
impl GpioBoard {
    pub fn new(
        relay_pins: &[u8],
        input_pins: &[u8],
        relay_active_low: bool,
        input_active_low: bool,
    ) -> Result<Self> {
        let gpio = Gpio::new()?;

        let mut relays = Vec::with_capacity(relay_pins.len());
        for pin_num in relay_pins {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Fail-safe: every relay released at startup
            if relay_active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            relays.push(pin);
        }

        let mut inputs = Vec::with_capacity(input_pins.len());
        for pin_num in input_pins {
            inputs.push(gpio.get(*pin_num)?.into_input_pullup());
        }

        Ok(Self {
            relays: Mutex::new(relays),
            inputs,
            relay_active_low,
            input_active_low,
        })
    }
}

#[cfg(feature = "gpio")]
impl RelayBank for GpioBoard {
    fn set_relay(&self, id: usize, on: bool) {
        let mut relays = self.relays.lock().unwrap_or_else(|p| p.into_inner());
        let Some(pin) = relays.get_mut(id) else {
            warn!(relay = id, "gpio: unknown relay");
            return;
        };
        // active-low boards: LOW = energized
        if on != self.relay_active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        debug!(relay = id, on, "gpio: relay set");
    }

    fn relay(&self, id: usize) -> bool {
        let relays = self.relays.lock().unwrap_or_else(|p| p.into_inner());
        relays
            .get(id)
            .map(|pin| pin.is_set_high() != self.relay_active_low)
            .unwrap_or(false)
    }

    fn all_off(&self) {
        let count = self.relays.lock().unwrap_or_else(|p| p.into_inner()).len();
        for id in 0..count {
            self.set_relay(id, false);
        }
    }
}

#[cfg(feature = "gpio")]
impl SensorBank for GpioBoard {
    fn input(&self, id: usize) -> bool {
        self.inputs
            .get(id)
            .map(|pin| pin.is_high() != self.input_active_low)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Mock board (development, no hardware, logs state changes)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InputLine {
    level: bool,
    script: VecDeque<bool>,
}

pub struct MockBoard {
    relays: Mutex<Vec<bool>>,
    inputs: Mutex<Vec<InputLine>>,
    exclusive: Mutex<Vec<(usize, usize)>>,
    overlaps: AtomicUsize,
}

impl MockBoard {
    pub fn new(relay_count: usize, input_count: usize) -> Self {
        let mut inputs = Vec::with_capacity(input_count);
        inputs.resize_with(input_count, InputLine::default);
        debug!(relay_count, input_count, "mock-board: initialised (no hardware)");
        Self {
            relays: Mutex::new(vec![false; relay_count]),
            inputs: Mutex::new(inputs),
            exclusive: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
        }
    }

    /// Drive an input to a fixed level, discarding any pending script.
    pub fn set_input(&self, id: usize, level: bool) {
        let mut inputs = self.inputs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(line) = inputs.get_mut(id) {
            line.level = level;
            line.script.clear();
        }
    }

    /// Queue levels returned by successive reads of `id`. The last one
    /// sticks once the script runs out.
    pub fn script_input(&self, id: usize, levels: &[bool]) {
        let mut inputs = self.inputs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(line) = inputs.get_mut(id) {
            line.script.extend(levels.iter().copied());
        }
    }

    /// Count every moment both relays of the pair are energized.
    pub fn watch_pair(&self, a: usize, b: usize) {
        self.exclusive
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((a, b));
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

impl RelayBank for MockBoard {
    fn set_relay(&self, id: usize, on: bool) {
        let mut relays = self.relays.lock().unwrap_or_else(|p| p.into_inner());
        let Some(slot) = relays.get_mut(id) else {
            warn!(relay = id, "mock-board: unknown relay");
            return;
        };
        *slot = on;
        debug!(relay = id, on, "mock-board: relay set");

        let pairs = self.exclusive.lock().unwrap_or_else(|p| p.into_inner());
        for (a, b) in pairs.iter() {
            if relays.get(*a) == Some(&true) && relays.get(*b) == Some(&true) {
                warn!(a, b, "mock-board: both relays of a pair energized");
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn relay(&self, id: usize) -> bool {
        let relays = self.relays.lock().unwrap_or_else(|p| p.into_inner());
        relays.get(id).copied().unwrap_or(false)
    }

    fn all_off(&self) {
        let mut relays = self.relays.lock().unwrap_or_else(|p| p.into_inner());
        relays.iter_mut().for_each(|r| *r = false);
        debug!("mock-board: all relays off");
    }
}

impl SensorBank for MockBoard {
    fn input(&self, id: usize) -> bool {
        let mut inputs = self.inputs.lock().unwrap_or_else(|p| p.into_inner());
        match inputs.get_mut(id) {
            Some(line) => {
                if let Some(next) = line.script.pop_front() {
                    line.level = next;
                }
                line.level
            }
            None => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
