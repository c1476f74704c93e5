//! Wire formats of the two hardware families.
//!
//! A codec turns outgoing source samples into OUT packets and incoming IN
//! packets into calibrated measurements, and knows the vendor control
//! requests its family uses to start, stop and configure sampling.

mod high_rate;
mod low_rate;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use crossbeam_channel::Sender;
use log::debug;

pub use high_rate::HighRateCodec;
pub use low_rate::LowRateCodec;

use crate::{
    calibration::CalibrationTable,
    error::{Error, Result},
    signal::{Mode, Quantity, Signal, SignalInfo},
    usb::{CONTROL_TIMEOUT, Family, UsbHandle, vendor},
};

/// Sample indices of one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Counters {
    /// Samples covered by IN transfers submitted so far.
    pub requested: u64,
    /// Samples decoded from IN packets.
    pub received: u64,
    /// Samples encoded into OUT packets.
    pub sent: u64,
    /// Samples per channel to acquire; 0 means continuous.
    pub target: u64,
}

impl Counters {
    pub fn start(target: u64) -> Self {
        Counters {
            target,
            ..Default::default()
        }
    }

    pub fn wants_in(&self) -> bool {
        self.target == 0 || self.requested < self.target
    }

    pub fn wants_out(&self) -> bool {
        self.target == 0 || self.sent < self.target
    }
}

/// Everything a codec touches while converting packets.
pub(crate) struct StreamIo<'a> {
    pub signals: &'a mut [[Signal; 2]; 2],
    pub modes: [Mode; 2],
    pub calibration: &'a CalibrationTable,
    pub counters: &'a mut Counters,
    pub queue: &'a Sender<[f32; 4]>,
    pub overflow: &'a AtomicBool,
}

impl StreamIo<'_> {
    /// Pull the next value for the quantity sourced on `channel`, clamped to
    /// its signal range. `None` for a disabled channel.
    pub fn pull(&mut self, channel: usize) -> Option<(Mode, f32)> {
        let signal = match self.modes[channel] {
            Mode::Disabled => return None,
            Mode::Svmi => &mut self.signals[channel][Quantity::Voltage as usize],
            Mode::Simv => &mut self.signals[channel][Quantity::Current as usize],
        };
        let v = signal.get_sample();
        Some((self.modes[channel], signal.info().constrain(v)))
    }

    /// Whether the next OUT slot still belongs to the run.
    pub fn out_open(&self) -> bool {
        self.counters.wants_out()
    }

    /// Hand one decoded `[va, ia, vb, ib]` tuple to the sinks and the read
    /// queue. Samples beyond the run target are counted but discarded.
    pub fn deliver(&mut self, sample: [f32; 4]) {
        let c = &mut *self.counters;
        if c.target == 0 || c.received < c.target {
            for (i, v) in sample.iter().enumerate() {
                self.signals[i / 2][i % 2].put_sample(*v);
            }
            if self.queue.try_send(sample).is_err() {
                self.overflow.store(true, Ordering::Relaxed);
            }
        }
        c.received += 1;
    }
}

/// Fixed packet geometry of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub ep_in: u8,
    pub ep_out: u8,
    pub in_packet_len: usize,
    pub out_packet_len: usize,
    pub samples_per_packet: usize,
    pub transfer_timeout: Duration,
}

/// Sampling parameters after hardware rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub rate: u32,
    pub sample_period: f64,
}

pub(crate) enum Codec {
    LowRate(LowRateCodec),
    HighRate(HighRateCodec),
}

impl Codec {
    pub fn open(family: Family, handle: &dyn UsbHandle, fw_version: &str) -> Self {
        match family {
            Family::LowRate => Codec::LowRate(LowRateCodec::open(handle, fw_version)),
            Family::HighRate => Codec::HighRate(HighRateCodec::new(fw_version)),
        }
    }

    pub fn signal_info(&self, quantity: Quantity) -> &'static SignalInfo {
        match self {
            Codec::LowRate(_) => LowRateCodec::signal_info(quantity),
            Codec::HighRate(_) => HighRateCodec::signal_info(quantity),
        }
    }

    pub fn layout(&self) -> PacketLayout {
        match self {
            Codec::LowRate(_) => low_rate::LAYOUT,
            Codec::HighRate(_) => high_rate::LAYOUT,
        }
    }

    pub fn default_rate(&self) -> u32 {
        match self {
            Codec::LowRate(_) => low_rate::DEFAULT_RATE,
            Codec::HighRate(c) => c.default_rate(),
        }
    }

    /// Put a freshly claimed device into a known idle state.
    pub fn reset(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        match self {
            Codec::LowRate(c) => c.reset(handle),
            Codec::HighRate(_) => Ok(()),
        }
    }

    /// Load the stored calibration. The flag is false when the stored record
    /// failed validation and defaults were substituted.
    pub fn read_calibration(&mut self, handle: &dyn UsbHandle) -> Result<(CalibrationTable, bool)> {
        match self {
            Codec::LowRate(c) => c.read_calibration(handle),
            Codec::HighRate(c) => c.read_calibration(handle),
        }
    }

    pub fn write_calibration(&self, handle: &dyn UsbHandle, table: &CalibrationTable) -> Result<()> {
        match self {
            Codec::LowRate(_) => Err(Error::Unsupported("low-rate devices")),
            Codec::HighRate(c) => c.write_calibration(handle, table),
        }
    }

    pub fn configure(&mut self, rate: u32) -> Timing {
        match self {
            Codec::LowRate(c) => c.configure(rate),
            Codec::HighRate(c) => c.configure(rate),
        }
    }

    pub fn set_mode(&self, handle: &dyn UsbHandle, channel: usize, mode: Mode) -> Result<()> {
        match self {
            Codec::LowRate(_) => Ok(()),
            Codec::HighRate(c) => c.set_mode(handle, channel, mode),
        }
    }

    pub fn on(&mut self, handle: &dyn UsbHandle, modes: [Mode; 2]) -> Result<()> {
        match self {
            Codec::LowRate(c) => c.on(handle),
            Codec::HighRate(c) => c.on(handle, modes),
        }
    }

    pub fn sync(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        match self {
            Codec::LowRate(_) => Ok(()),
            Codec::HighRate(c) => c.sync(handle),
        }
    }

    pub fn run(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        match self {
            Codec::LowRate(_) => Ok(()),
            Codec::HighRate(c) => c.run(handle),
        }
    }

    pub fn off(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        match self {
            Codec::LowRate(c) => c.off(handle),
            Codec::HighRate(c) => c.off(handle),
        }
    }

    pub fn decode(&mut self, packet: &[u8], io: &mut StreamIo<'_>) {
        match self {
            Codec::LowRate(c) => c.decode(packet, io),
            Codec::HighRate(c) => c.decode(packet, io),
        }
    }

    pub fn encode(&mut self, packet: &mut [u8], io: &mut StreamIo<'_>) {
        match self {
            Codec::LowRate(c) => c.encode(packet, io),
            Codec::HighRate(c) => c.encode(packet, io),
        }
    }
}

/// Vendor request without a data stage.
pub(crate) fn command(handle: &dyn UsbHandle, request: u8, value: u16, index: u16) -> Result<()> {
    debug!(
        "command {:#04x} value {:#06x} index {:#06x}",
        request, value, index
    );
    handle
        .control_out(vendor(request, value, index), &[], CONTROL_TIMEOUT)
        .map_err(Error::control)?;
    Ok(())
}

/// Vendor request reading into `buf`; returns the bytes received.
pub(crate) fn query(
    handle: &dyn UsbHandle,
    request: u8,
    value: u16,
    index: u16,
    buf: &mut [u8],
) -> Result<usize> {
    handle
        .control_in(vendor(request, value, index), buf, CONTROL_TIMEOUT)
        .map_err(Error::control)
}

/// NUL-terminated string descriptor read through vendor request 0x00.
pub(crate) fn read_string(handle: &dyn UsbHandle, index: u16) -> Result<String> {
    let mut buf = [0u8; 64];
    let n = query(handle, 0x00, 0, index, &mut buf)?;
    let end = buf[..n].iter().position(|&b| b == 0).unwrap_or(n);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Leading decimal number of a version string, `0.0` if there is none.
pub(crate) fn version_number(version: &str) -> f64 {
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in version.char_indices() {
        match c {
            '0'..='9' => end = i + 1,
            '.' if !seen_dot => seen_dot = true,
            _ => break,
        }
    }
    version[..end].parse().unwrap_or(0.0)
}

/// `major.minor.patch` components of a version string; missing or
/// non-numeric parts read as 0.
pub fn fwver_sem(version: &str) -> [u32; 3] {
    let mut components = [0; 3];
    for (slot, part) in components
        .iter_mut()
        .zip(version.split('.').filter(|p| !p.is_empty()))
    {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        *slot = digits.parse().unwrap_or(0);
    }
    components
}
