//! Simulated encoder for running without hardware. Azimuth advances one
//! step per position request while a motor relay is energized.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use observatory_common::board::{MockBoard, RelayBank};
use tracing::debug;

use crate::config::Roles;
use crate::encoder::{
    checksum, frame_is_valid, SerialBus, CMD_DISABLE_ZERO, CMD_FIND_ZERO, CMD_READ_CONFIG,
    CMD_READ_POSITION, CMD_RESET_CONFIG, CMD_SIREN, CMD_WRITE_CONFIG, CMD_WRITE_POSITION,
    ZERO_REPLY_TAG,
};

const FACTORY_CONFIG: [u8; 7] = [10, 0x0E, 0x10, 0x00, 0xF8, 0x00, 0x00];

struct SimState {
    az: i32,
    step: i32,
    outbox: VecDeque<u8>,
    /// Silent reads left before the zero reply is produced.
    zero_countdown: Option<u32>,
    zero_after_reads: u32,
    zero_reply: Option<Vec<u8>>,
    config: [u8; 7],
    zero_disabled: bool,
    siren: bool,
}

#[derive(Clone)]
pub struct SimEncoder {
    state: Arc<Mutex<SimState>>,
    relays: Arc<dyn RelayBank>,
    cw_relay: usize,
    ccw_relay: usize,
}

impl SimEncoder {
    pub fn new(relays: Arc<dyn RelayBank>, roles: &Roles, az: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                az,
                step: 1,
                outbox: VecDeque::new(),
                zero_countdown: None,
                zero_after_reads: 40,
                zero_reply: None,
                config: FACTORY_CONFIG,
                zero_disabled: false,
                siren: false,
            })),
            relays,
            cw_relay: roles.cw_relay,
            ccw_relay: roles.ccw_relay,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut st)
    }

    pub fn azimuth(&self) -> i32 {
        self.with(|st| st.az)
    }

    pub fn set_azimuth(&self, az: i32) {
        self.with(|st| st.az = az);
    }

    pub fn set_step(&self, step: i32) {
        self.with(|st| st.step = step);
    }

    /// Number of silent reads before a zero-seek replies.
    pub fn set_zero_delay(&self, reads: u32) {
        self.with(|st| st.zero_after_reads = reads);
    }

    /// Replace the next zero-seek reply with raw bytes.
    pub fn override_zero_reply(&self, reply: Vec<u8>) {
        self.with(|st| st.zero_reply = Some(reply));
    }

    pub fn siren(&self) -> bool {
        self.with(|st| st.siren)
    }

    pub fn config(&self) -> [u8; 7] {
        self.with(|st| st.config)
    }

    pub fn zero_disabled(&self) -> bool {
        self.with(|st| st.zero_disabled)
    }

    fn advance(&self, st: &mut SimState) {
        let cw = self.relays.relay(self.cw_relay);
        let ccw = self.relays.relay(self.ccw_relay);
        if cw && !ccw {
            st.az = (st.az + st.step).rem_euclid(360);
        } else if ccw && !cw {
            st.az = (st.az - st.step).rem_euclid(360);
        }
    }

    fn zero_azimuth(st: &SimState) -> i32 {
        i32::from(u16::from_be_bytes([st.config[3], st.config[4]])) % 360
    }
}

impl SerialBus for SimEncoder {
    fn write_bytes(&mut self, buf: &[u8]) {
        let Some(&cmd) = buf.first() else {
            return;
        };
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.siren = false;
        match cmd {
            CMD_READ_POSITION => {
                self.advance(&mut st);
                let [hi, lo] = (st.az as u16).to_be_bytes();
                st.outbox.extend([hi, lo]);
            }
            CMD_WRITE_POSITION if buf.len() == 3 => {
                st.az = i32::from(u16::from_be_bytes([buf[1], buf[2]]));
            }
            CMD_FIND_ZERO => {
                st.zero_countdown = Some(st.zero_after_reads);
            }
            CMD_SIREN => st.siren = true,
            CMD_READ_CONFIG => {
                let cs = checksum(&[&[CMD_WRITE_CONFIG][..], &st.config[..]].concat());
                let reply: Vec<u8> = st.config.iter().copied().chain([cs]).collect();
                st.outbox.extend(reply);
            }
            CMD_WRITE_CONFIG if buf.len() == 9 && frame_is_valid(buf) => {
                st.config.copy_from_slice(&buf[1..8]);
            }
            CMD_RESET_CONFIG => st.config = FACTORY_CONFIG,
            CMD_DISABLE_ZERO => st.zero_disabled = true,
            other => debug!(cmd = other, "sim-encoder: ignored command"),
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(byte) = st.outbox.pop_front() {
            return Some(byte);
        }
        let countdown = st.zero_countdown;
        match countdown {
            Some(0) => {
                st.zero_countdown = None;
                let reply = match st.zero_reply.take() {
                    Some(raw) => raw,
                    None => {
                        st.az = Self::zero_azimuth(&st);
                        let [hi, lo] = (st.az as u16).to_be_bytes();
                        vec![ZERO_REPLY_TAG, hi, lo]
                    }
                };
                st.outbox.extend(reply);
                st.outbox.pop_front()
            }
            Some(n) => {
                st.zero_countdown = Some(n - 1);
                None
            }
            None => None,
        }
    }
}

/// Board for a hardware-free run: AUTO, switchboard on and AC present.
pub fn demo_board(roles: &Roles, relays: usize, inputs: usize) -> Arc<MockBoard> {
    let board = Arc::new(MockBoard::new(relays, inputs));
    board.watch_pair(roles.cw_relay, roles.ccw_relay);
    board.set_input(roles.auto_input, true);
    board.set_input(roles.switchboard_status_input, true);
    board.set_input(roles.ac_presence_input, true);
    board
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{config_frame, BusTiming, Encoder};
    use std::time::Duration;

    fn rig() -> (Arc<MockBoard>, SimEncoder, Encoder) {
        let roles = Roles::default();
        let board = demo_board(&roles, 3, 6);
        let sim = SimEncoder::new(board.clone(), &roles, 0);
        let timing = BusTiming {
            read_retries: 10,
            poll: Duration::from_millis(30),
            lock_wait: Duration::from_millis(250),
        };
        let enc = Encoder::new(Box::new(sim.clone()), timing);
        (board, sim, enc)
    }

    #[tokio::test(start_paused = true)]
    async fn position_follows_relays() {
        let (board, sim, enc) = rig();
        sim.set_step(5);
        board.set_relay(0, true);
        assert_eq!(enc.request_position().await, Ok(5));
        board.set_relay(0, false);
        board.set_relay(1, true);
        assert_eq!(enc.request_position().await, Ok(0));
        assert_eq!(enc.request_position().await, Ok(355));
    }

    #[tokio::test(start_paused = true)]
    async fn written_position_is_reported_back() {
        let (_board, _sim, enc) = rig();
        enc.write_position(123).await.unwrap();
        assert_eq!(enc.request_position().await, Ok(123));
    }

    #[tokio::test(start_paused = true)]
    async fn config_write_then_read_validates() {
        let (_board, sim, enc) = rig();
        let payload = [4, 0x05, 0xA0, 0x01, 0x0E, 0x00, 0x20];
        enc.write_config(&payload).await.unwrap();
        assert_eq!(sim.config(), payload);
        let report = enc.read_config().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.decoded.zero_azimuth, 270);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_config_write_is_ignored() {
        let (_board, sim, _enc) = rig();
        let mut frame = config_frame(&[1, 2, 3, 4, 5, 6, 7]);
        frame[8] = frame[8].wrapping_add(1);
        let mut bus = sim.clone();
        bus.write_bytes(&frame);
        assert_eq!(sim.config(), FACTORY_CONFIG);
    }

    #[tokio::test(start_paused = true)]
    async fn siren_stops_on_next_command() {
        let (_board, sim, enc) = rig();
        enc.session().await.unwrap().start_siren();
        assert!(sim.siren());
        enc.stop_siren().await;
        assert!(!sim.siren());
    }
}
