use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::drivers::{DriverError, SensorDriver, StreamCallback};
use crate::types::RawPacket;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const SETTLE_DELAY: Duration = Duration::from_millis(100);

// Shimmer3 command set (subset)
const DATA_PACKET: u8 = 0x00;
const INQUIRY_COMMAND: u8 = 0x01;
const INQUIRY_RESPONSE: u8 = 0x02;
const START_STREAMING_COMMAND: u8 = 0x07;
const STOP_STREAMING_COMMAND: u8 = 0x20;
const NAME_RESPONSE: u8 = 0x7A;
const GET_NAME_COMMAND: u8 = 0x7B;
const BATTERY_RESPONSE: u8 = 0x94;
const GET_BATTERY_COMMAND: u8 = 0x95;
const ACK: u8 = 0xFF;

/// Internal ADC A13, where the PPG probe is wired.
pub const PPG_CHANNEL: u8 = 0x12;

pub const GSR_CHANNEL: u8 = 0x1C;

// Channels 0x00..=0x13 (accel, battery, mag, gyro, ADCs) and GSR are 16 bit.
const LAST_PLAIN_CHANNEL: u8 = 0x13;
const TIMESTAMP_BYTES: usize = 3;
const INQUIRY_HEADER_BYTES: usize = 8;
const BATTERY_EMPTY_VOLTS: f64 = 3.2;
const BATTERY_FULL_VOLTS: f64 = 4.167;

/// Byte offsets inside a data frame, derived from the inquiry channel list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketLayout {
    frame_len: usize,
    gsr_offset: usize,
    ppg_offset: usize,
}

impl PacketLayout {
    pub fn from_channels(channels: &[u8]) -> Result<Self, DriverError> {
        let mut offset = TIMESTAMP_BYTES;
        let mut gsr_offset = None;
        let mut ppg_offset = None;
        for &channel in channels {
            if channel > LAST_PLAIN_CHANNEL && channel != GSR_CHANNEL {
                return Err(DriverError::Protocol(format!(
                    "unsupported channel 0x{channel:02X} in sensor configuration"
                )));
            }
            match channel {
                GSR_CHANNEL => gsr_offset = Some(offset),
                PPG_CHANNEL => ppg_offset = Some(offset),
                _ => {}
            }
            offset += 2;
        }
        let gsr_offset = gsr_offset
            .ok_or_else(|| DriverError::Protocol("GSR channel is not enabled".into()))?;
        let ppg_offset = ppg_offset
            .ok_or_else(|| DriverError::Protocol("PPG channel (ADC A13) is not enabled".into()))?;
        Ok(Self {
            frame_len: offset,
            gsr_offset,
            ppg_offset,
        })
    }

    /// Length of a data frame, not counting the leading packet-type byte.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn decode(&self, frame: &[u8]) -> Option<RawPacket> {
        if frame.len() < self.frame_len {
            return None;
        }
        let device_time =
            u32::from(frame[0]) | (u32::from(frame[1]) << 8) | (u32::from(frame[2]) << 16);
        let raw_gsr = u16::from_le_bytes([frame[self.gsr_offset], frame[self.gsr_offset + 1]]);
        let raw_ppg = u16::from_le_bytes([frame[self.ppg_offset], frame[self.ppg_offset + 1]]);
        Some(RawPacket {
            device_time,
            raw_gsr,
            raw_ppg: i32::from(raw_ppg),
        })
    }
}

/// Pulls every complete data frame off the front of `pending`.
/// Acks and stray bytes between frames are dropped; a trailing partial frame is kept.
pub fn drain_frames(layout: &PacketLayout, pending: &mut Vec<u8>) -> Vec<RawPacket> {
    let mut packets = Vec::new();
    let mut cursor = 0;
    while cursor < pending.len() {
        match pending[cursor] {
            DATA_PACKET => {
                let end = cursor + 1 + layout.frame_len;
                if end > pending.len() {
                    break;
                }
                if let Some(packet) = layout.decode(&pending[cursor + 1..end]) {
                    packets.push(packet);
                }
                cursor = end;
            }
            ACK => cursor += 1,
            other => {
                debug!("skipping stray byte 0x{other:02X}");
                cursor += 1;
            }
        }
    }
    pending.drain(..cursor);
    packets
}

/// Maps the battery ADC reading to a charge percentage (linear between empty and full).
pub fn battery_percent(adc: u16) -> u8 {
    // battery sense goes through a ~1:2 divider
    let volts = f64::from(adc & 0x0FFF) * 3.0 / 4095.0 * 1.988;
    let fraction = (volts - BATTERY_EMPTY_VOLTS) / (BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS);
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Shimmer3 GSR+ unit on a serial (or Bluetooth RFCOMM) port.
pub struct ShimmerDriver {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
    layout: Option<PacketLayout>,
    callbacks: Vec<StreamCallback>,
    stop_flag: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ShimmerDriver {
    pub fn open(port_name: &str) -> Result<Self, DriverError> {
        Self::open_with_baud(port_name, DEFAULT_BAUD_RATE)
    }

    pub fn open_with_baud(port_name: &str, baud_rate: u32) -> Result<Self, DriverError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| DriverError::from_open(port_name, err))?;
        info!("opened {port_name} at {baud_rate} baud");
        Ok(Self {
            port_name: port_name.to_string(),
            port: Some(port),
            layout: None,
            callbacks: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, DriverError> {
        self.port.as_mut().ok_or(DriverError::NotInitialized)
    }

    fn send(&mut self, command: u8) -> Result<(), DriverError> {
        let port = self.port()?;
        port.write_all(&[command])?;
        port.flush()?;
        Ok(())
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DriverError> {
        let mut buf = vec![0u8; count];
        self.port()?.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn expect_byte(&mut self, expected: u8, what: &str) -> Result<(), DriverError> {
        let got = self.read_bytes(1)?[0];
        if got == expected {
            Ok(())
        } else {
            Err(DriverError::Protocol(format!(
                "expected {what} (0x{expected:02X}), got 0x{got:02X}"
            )))
        }
    }

    // Request/response only works while the device is not streaming.
    fn request(&mut self, command: u8, response: u8, what: &str) -> Result<(), DriverError> {
        if self.reader.is_some() {
            return Err(DriverError::Protocol(format!(
                "{what} is not available while streaming"
            )));
        }
        self.send(command)?;
        self.expect_byte(ACK, "ack")?;
        self.expect_byte(response, what)
    }
}

impl SensorDriver for ShimmerDriver {
    fn initialize(&mut self) -> Result<(), DriverError> {
        // A previous run may have left the unit streaming.
        self.send(STOP_STREAMING_COMMAND)?;
        thread::sleep(SETTLE_DELAY);
        self.port()?.clear(ClearBuffer::All)?;
        self.request(INQUIRY_COMMAND, INQUIRY_RESPONSE, "inquiry response")?;
        let header = self.read_bytes(INQUIRY_HEADER_BYTES)?;
        let sampling_ticks = u16::from_le_bytes([header[0], header[1]]);
        let channel_count = usize::from(header[6]);
        let channels = self.read_bytes(channel_count)?;
        let layout = PacketLayout::from_channels(&channels)?;
        let rate_hz = if sampling_ticks == 0 {
            0.0
        } else {
            32768.0 / f64::from(sampling_ticks)
        };
        info!(
            "{}: {} channels at {:.1} Hz, {} byte frames",
            self.port_name,
            channel_count,
            rate_hz,
            layout.frame_len()
        );
        self.layout = Some(layout);
        Ok(())
    }

    fn get_battery_state(&mut self) -> Result<u8, DriverError> {
        self.request(GET_BATTERY_COMMAND, BATTERY_RESPONSE, "battery response")?;
        let payload = self.read_bytes(3)?;
        Ok(battery_percent(u16::from_le_bytes([payload[0], payload[1]])))
    }

    fn get_device_name(&mut self) -> Result<String, DriverError> {
        self.request(GET_NAME_COMMAND, NAME_RESPONSE, "name response")?;
        let len = usize::from(self.read_bytes(1)?[0]);
        let raw = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn add_stream_callback(&mut self, callback: StreamCallback) {
        self.callbacks.push(callback);
    }

    fn start_streaming(&mut self) -> Result<(), DriverError> {
        if self.reader.is_some() {
            return Ok(());
        }
        let layout = self.layout.ok_or(DriverError::NotInitialized)?;
        let reader_port = self.port()?.try_clone()?;
        self.send(START_STREAMING_COMMAND)?;
        self.stop_flag.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop_flag);
        let callbacks = self.callbacks.clone();
        let handle = thread::Builder::new()
            .name(format!("shimmer-{}", self.port_name))
            .spawn(move || read_loop(reader_port, layout, callbacks, stop))?;
        self.reader = Some(handle);
        info!("{}: streaming", self.port_name);
        Ok(())
    }

    /// Blocks until the reader thread has exited.
    fn stop_streaming(&mut self) -> Result<(), DriverError> {
        let Some(handle) = self.reader.take() else {
            return Ok(());
        };
        let sent = self.send(STOP_STREAMING_COMMAND);
        self.stop_flag.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            error!("{}: reader thread panicked", self.port_name);
        }
        info!("{}: stream stopped", self.port_name);
        sent
    }

    fn shutdown(&mut self) -> Result<(), DriverError> {
        let stopped = self.stop_streaming();
        self.layout = None;
        if self.port.take().is_some() {
            info!("{}: port closed", self.port_name);
        }
        stopped
    }

    fn is_initialized(&self) -> bool {
        self.port.is_some() && self.layout.is_some()
    }
}

impl Drop for ShimmerDriver {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("{}: shutdown on drop failed: {err}", self.port_name);
        }
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    layout: PacketLayout,
    callbacks: Vec<StreamCallback>,
    stop: Arc<AtomicBool>,
) {
    let mut pending = Vec::with_capacity(layout.frame_len() * 8);
    let mut chunk = [0u8; 256];
    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(err) => {
                error!("serial read failed, stream ends: {err}");
                break;
            }
        }
        for packet in drain_frames(&layout, &mut pending) {
            for callback in &callbacks {
                callback(packet);
            }
        }
    }
    debug!("reader thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gsr_ppg_layout() -> PacketLayout {
        // accel x, PPG, GSR
        PacketLayout::from_channels(&[0x00, PPG_CHANNEL, GSR_CHANNEL]).unwrap()
    }

    #[test]
    fn layout_follows_channel_order() {
        let layout = gsr_ppg_layout();
        assert_eq!(layout.frame_len(), 3 + 6);
        assert_eq!(layout.ppg_offset, 5);
        assert_eq!(layout.gsr_offset, 7);
    }

    #[test]
    fn layout_requires_gsr_and_ppg() {
        assert!(PacketLayout::from_channels(&[PPG_CHANNEL]).is_err());
        assert!(PacketLayout::from_channels(&[GSR_CHANNEL]).is_err());
        assert!(PacketLayout::from_channels(&[0x1D, PPG_CHANNEL, GSR_CHANNEL]).is_err());
    }

    #[test]
    fn decodes_little_endian_fields() {
        let layout = gsr_ppg_layout();
        let frame = [0x01, 0x02, 0x03, 0xAA, 0xBB, 0x34, 0x12, 0x00, 0xC4];
        let packet = layout.decode(&frame).unwrap();
        assert_eq!(packet.device_time, 0x030201);
        assert_eq!(packet.raw_ppg, 0x1234);
        assert_eq!(packet.raw_gsr, 0xC400);
        assert!(layout.decode(&frame[..5]).is_none());
    }

    #[test]
    fn drain_skips_acks_and_keeps_partial_frame() {
        let layout = gsr_ppg_layout();
        let mut pending = vec![ACK];
        pending.push(DATA_PACKET);
        pending.extend_from_slice(&[1, 0, 0, 0, 0, 10, 0, 20, 0]);
        pending.push(DATA_PACKET);
        pending.extend_from_slice(&[2, 0, 0, 0]);
        let packets = drain_frames(&layout, &mut pending);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].device_time, 1);
        assert_eq!(packets[0].raw_ppg, 10);
        assert_eq!(packets[0].raw_gsr, 20);
        assert_eq!(pending, vec![DATA_PACKET, 2, 0, 0, 0]);
        pending.extend_from_slice(&[0, 11, 0, 21, 0]);
        let packets = drain_frames(&layout, &mut pending);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].device_time, 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn battery_percent_is_clamped() {
        assert_eq!(battery_percent(0), 0);
        assert_eq!(battery_percent(0x0FFF), 100);
        let mid = battery_percent(2500);
        assert!(mid > 0 && mid < 100);
    }
}
