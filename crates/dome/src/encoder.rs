//! Rotary encoder driver. The encoder speaks a single-byte command protocol
//! over a shared half-duplex RS-485 bus and answers slowly, so every read
//! polls with a bounded number of retries. Frames carry no length field:
//! a frame ends when the bus goes quiet.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use observatory_common::ControlError;

use crate::config::EncoderLink;

#[cfg(feature = "gpio")]
use anyhow::{Context, Result};
#[cfg(feature = "gpio")]
use rppal::uart::{Parity, Uart};

pub const CMD_READ_POSITION: u8 = 0x52;
pub const CMD_WRITE_POSITION: u8 = 0x57;
pub const CMD_FIND_ZERO: u8 = 0x5A;
pub const ZERO_REPLY_TAG: u8 = 0x5A;
pub const CMD_SIREN: u8 = 0x42;
pub const CMD_WRITE_CONFIG: u8 = 0xC0;
pub const CMD_READ_CONFIG: u8 = 0xC1;
pub const CMD_RESET_CONFIG: u8 = b'D';
pub const CMD_DISABLE_ZERO: u8 = b'#';

// ---------------------------------------------------------------------------
// Bus capability
// ---------------------------------------------------------------------------

pub trait SerialBus: Send {
    fn write_bytes(&mut self, buf: &[u8]);
    /// Next byte if one is waiting, `None` otherwise. Never blocks.
    fn read_byte(&mut self) -> Option<u8>;
}

#[derive(Debug, Clone, Copy)]
pub struct BusTiming {
    pub read_retries: u32,
    pub poll: Duration,
    pub lock_wait: Duration,
}

impl From<&EncoderLink> for BusTiming {
    fn from(link: &EncoderLink) -> Self {
        Self {
            read_retries: link.read_retries,
            poll: Duration::from_millis(link.poll_ms),
            lock_wait: Duration::from_millis(link.bus_lock_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

/// Two's-complement checksum: the value that brings the byte sum to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

/// `0xC0`, the payload, then the checksum computed over the whole frame
/// with a zero placeholder in the last slot.
pub fn config_frame(payload: &[u8; 7]) -> [u8; 9] {
    let mut frame = [0u8; 9];
    frame[0] = CMD_WRITE_CONFIG;
    frame[1..8].copy_from_slice(payload);
    frame[8] = checksum(&frame);
    frame
}

pub fn frame_is_valid(frame: &[u8]) -> bool {
    frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
}

pub fn decode_position(frame: &[u8]) -> Result<i32, ControlError> {
    match frame {
        [] => Err(ControlError::NoData),
        [hi, lo] => match i32::from(u16::from_be_bytes([*hi, *lo])) {
            az @ 0..=359 => Ok(az),
            az => Err(ControlError::MalformedFrame(format!(
                "position {az} out of range"
            ))),
        },
        other => Err(ControlError::MalformedFrame(format!(
            "position reply has {} bytes",
            other.len()
        ))),
    }
}

pub fn decode_zero(frame: &[u8]) -> Result<i32, ControlError> {
    match frame {
        [] => Err(ControlError::NoData),
        [ZERO_REPLY_TAG, hi, lo] => Ok(i32::from(u16::from_be_bytes([*hi, *lo]))),
        other => Err(ControlError::MalformedFrame(format!(
            "zero reply {other:02X?}"
        ))),
    }
}

/// Decoded 7-byte encoder configuration payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncoderConfig {
    pub steps_per_degree: u8,
    pub steps_per_revolution: u16,
    pub zero_azimuth: u16,
    pub zero_offset_steps: u16,
}

impl EncoderConfig {
    pub fn from_payload(p: &[u8; 7]) -> Self {
        Self {
            steps_per_degree: p[0],
            steps_per_revolution: u16::from_be_bytes([p[1], p[2]]),
            zero_azimuth: u16::from_be_bytes([p[3], p[4]]),
            zero_offset_steps: u16::from_be_bytes([p[5], p[6]]),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigReport {
    pub bytes: Vec<u8>,
    pub decoded: EncoderConfig,
    pub checksum: u8,
    pub valid: bool,
}

impl ConfigReport {
    /// A read-config reply is the payload followed by its checksum; it is
    /// valid when it closes the same frame a write would have produced.
    pub fn from_reply(frame: &[u8]) -> Result<Self, ControlError> {
        if frame.is_empty() {
            return Err(ControlError::NoData);
        }
        let Ok(reply) = <&[u8; 8]>::try_from(frame) else {
            return Err(ControlError::MalformedFrame(format!(
                "config reply has {} bytes",
                frame.len()
            )));
        };
        let mut payload = [0u8; 7];
        payload.copy_from_slice(&reply[..7]);

        let mut full = vec![CMD_WRITE_CONFIG];
        full.extend_from_slice(reply);

        Ok(Self {
            bytes: reply.to_vec(),
            decoded: EncoderConfig::from_payload(&payload),
            checksum: reply[7],
            valid: frame_is_valid(&full),
        })
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Encoder {
    bus: Arc<Mutex<Box<dyn SerialBus>>>,
    timing: BusTiming,
}

/// Exclusive use of the bus. Dropping it releases the bus lock.
pub struct BusSession {
    bus: OwnedMutexGuard<Box<dyn SerialBus>>,
    timing: BusTiming,
}

impl Encoder {
    pub fn new(bus: Box<dyn SerialBus>, timing: BusTiming) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
            timing,
        }
    }

    /// Bounded wait for the bus lock.
    pub async fn session(&self) -> Result<BusSession, ControlError> {
        let bus = timeout(self.timing.lock_wait, Arc::clone(&self.bus).lock_owned())
            .await
            .map_err(|_| {
                warn!("encoder: bus lock busy");
                ControlError::LockBusy
            })?;
        Ok(BusSession {
            bus,
            timing: self.timing,
        })
    }

    pub async fn request_position(&self) -> Result<i32, ControlError> {
        let frame = {
            let mut bus = self.session().await?;
            bus.send(&[CMD_READ_POSITION]);
            bus.read_frame().await
        };
        let position = decode_position(&frame);
        match &position {
            Ok(az) => debug!(az, "encoder: position"),
            Err(e) => warn!("encoder: position request failed: {e}"),
        }
        position
    }

    pub async fn write_position(&self, az: i32) -> Result<(), ControlError> {
        let az = u16::try_from(az).map_err(|_| ControlError::OutOfBounds)?;
        let [hi, lo] = az.to_be_bytes();
        let mut bus = self.session().await?;
        bus.send(&[CMD_WRITE_POSITION, hi, lo]);
        debug!(az, "encoder: position written");
        Ok(())
    }

    pub async fn write_config(&self, payload: &[u8; 7]) -> Result<(), ControlError> {
        let frame = config_frame(payload);
        let mut bus = self.session().await?;
        bus.send(&frame);
        debug!(frame = ?frame, "encoder: config written");
        Ok(())
    }

    pub async fn read_config(&self) -> Result<ConfigReport, ControlError> {
        let frame = {
            let mut bus = self.session().await?;
            bus.send(&[CMD_READ_CONFIG]);
            bus.read_frame().await
        };
        ConfigReport::from_reply(&frame)
    }

    pub async fn reset_config(&self) -> Result<(), ControlError> {
        self.session().await?.send(&[CMD_RESET_CONFIG]);
        Ok(())
    }

    pub async fn disable_zero(&self) -> Result<(), ControlError> {
        self.session().await?.send(&[CMD_DISABLE_ZERO]);
        Ok(())
    }

    /// The siren stops at the next command, so a position request ends it.
    pub async fn stop_siren(&self) {
        if let Err(e) = self.request_position().await {
            warn!("encoder: siren stop request failed: {e}");
        }
    }
}

impl BusSession {
    pub fn send(&mut self, bytes: &[u8]) {
        self.bus.write_bytes(bytes);
    }

    pub fn start_siren(&mut self) {
        self.send(&[CMD_SIREN]);
        debug!("encoder: siren playing");
    }

    /// Poll for the first byte up to `read_retries` more times, then keep
    /// reading until the bus goes idle. Returns an empty frame on silence.
    pub async fn read_frame(&mut self) -> Vec<u8> {
        let mut value = self.bus.read_byte();
        let mut attempts = 0;
        while value.is_none() && attempts < self.timing.read_retries {
            sleep(self.timing.poll).await;
            value = self.bus.read_byte();
            attempts += 1;
        }

        let mut frame = Vec::new();
        while let Some(byte) = value {
            sleep(self.timing.poll).await;
            frame.push(byte);
            value = self.bus.read_byte();
        }
        frame
    }

    /// Send the zero-seek command and read frames until one arrives or
    /// `keep_going` turns false. Returns the frame, or empty if abandoned.
    pub async fn request_zero(&mut self, keep_going: impl Fn() -> bool) -> Vec<u8> {
        self.send(&[CMD_FIND_ZERO]);
        loop {
            let frame = self.read_frame().await;
            if !frame.is_empty() || !keep_going() {
                return frame;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UART bus (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct UartBus {
    uart: Uart,
}

#[cfg(feature = "gpio")]
impl UartBus {
    pub fn open(link: &EncoderLink) -> Result<Self> {
        let mut uart = Uart::with_path(&link.device, link.baud, Parity::None, 8, 1)
            .with_context(|| format!("failed to open encoder uart {}", link.device))?;
        uart.set_read_mode(0, Duration::ZERO)
            .context("failed to set uart read mode")?;
        Ok(Self { uart })
    }
}

#[cfg(feature = "gpio")]
impl SerialBus for UartBus {
    fn write_bytes(&mut self, buf: &[u8]) {
        if let Err(e) = self.uart.write(buf) {
            warn!("uart: write failed: {e}");
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.uart.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            Ok(_) => None,
            Err(e) => {
                warn!("uart: read failed: {e}");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
