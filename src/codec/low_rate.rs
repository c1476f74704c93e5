//! 12-bit low-rate family.
//!
//! IN packets carry 10 samples of both channels as 12-bit signed codes whose
//! high nibbles share a byte; OUT packets carry 10 pairs of 12-bit DAC codes.

use std::time::Duration;

use log::{debug, info, warn};

use super::{PacketLayout, StreamIo, Timing, command, query, version_number};
use crate::{
    calibration::{CalQuantity, CalibrationTable, LowRateCalibration},
    error::{Error, Result},
    signal::{Mode, Quantity, SignalInfo},
    usb::UsbHandle,
};

pub(super) const LAYOUT: PacketLayout = PacketLayout {
    ep_in: 0x81,
    ep_out: 0x02,
    in_packet_len: 64,
    out_packet_len: 32,
    samples_per_packet: SAMPLES_PER_PACKET,
    transfer_timeout: Duration::from_secs(1),
};

pub(super) const DEFAULT_RATE: u32 = 80_000;

const SAMPLES_PER_PACKET: usize = 10;
const TIMER_CLOCK: f64 = 4e6;
const DEFAULT_MIN_PER: u32 = 100;
/// The period travels in the 16-bit `wValue` of the capture request.
const MAX_PER: u32 = u16::MAX as u32;
const DEFAULT_CURRENT_LIMIT: u32 = 200;

const CMD_CONFIG_CAPTURE: u8 = 0x80;
const CMD_CONFIG_GAIN: u8 = 0x65;
const CMD_ISET_DAC: u8 = 0x15;
const CMD_READ_EEPROM: u8 = 0xE0;
const DEVMODE_OFF: u16 = 0;
const DEVMODE_2SMU: u16 = 1;

const FLAG_PACKET_DROPPED: u8 = 1 << 0;

const V_LSB: f32 = 5.0 / 2048.0;
const I_LSB: f32 = 2.5 / 2048.0 / 2.0;

static SIGNALS: [SignalInfo; 2] = [
    SignalInfo {
        label: "Voltage",
        quantity: Quantity::Voltage,
        input_modes: 0x7,
        output_modes: 0x2,
        min: 0.0,
        max: 5.0,
        resolution: 5.0 / 4095.0,
    },
    SignalInfo {
        label: "Current",
        quantity: Quantity::Current,
        input_modes: 0x6,
        output_modes: 0x4,
        min: -0.2,
        max: 0.2,
        resolution: 0.4 / 4095.0,
    },
];

fn sign_extend12(v: u16) -> i16 {
    ((v << 4) as i16) >> 4
}

pub struct LowRateCodec {
    min_per: u32,
    per: u32,
    cal: LowRateCalibration,
    current_limit: u32,
    last_code: [u16; 2],
    /// Packets the device reported as lost during the current run.
    dropped: u64,
}

impl LowRateCodec {
    pub(super) fn open(handle: &dyn UsbHandle, fw_version: &str) -> Self {
        let mut min_per = DEFAULT_MIN_PER;
        if version_number(fw_version) >= 1.2 {
            // major, minor, flags, timer period in ns, minimum timer period
            let mut desc = [0u8; 5];
            match query(handle, 0x00, 0, 0xff, &mut desc) {
                Ok(5) => {
                    if desc[3] != 250 {
                        warn!("unsupported timer clock period {} ns", desc[3]);
                    }
                    min_per = (desc[4] as u32).max(1);
                }
                Ok(n) => warn!("short version descriptor ({} bytes)", n),
                Err(e) => warn!("reading version descriptor: {}", e),
            }
        }
        info!(
            "low-rate device, maximum {:.1} ksps",
            TIMER_CLOCK / min_per as f64 / 1000.0
        );
        LowRateCodec {
            min_per,
            per: min_per,
            cal: LowRateCalibration::default(),
            current_limit: DEFAULT_CURRENT_LIMIT,
            last_code: [0; 2],
            dropped: 0,
        }
    }

    pub(super) fn signal_info(quantity: Quantity) -> &'static SignalInfo {
        &SIGNALS[quantity as usize]
    }

    pub fn current_limit(&self) -> u32 {
        self.current_limit
    }

    pub(super) fn reset(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        command(handle, CMD_CONFIG_CAPTURE, 0, DEVMODE_OFF)?;
        for (index, gain) in [1u16, 0, 0, 1].into_iter().enumerate() {
            command(handle, CMD_CONFIG_GAIN, gain << 2, index as u16)?;
        }
        Ok(())
    }

    pub(super) fn read_calibration(
        &mut self,
        handle: &dyn UsbHandle,
    ) -> Result<(CalibrationTable, bool)> {
        let mut buf = [0u8; 64];
        let n = query(handle, CMD_READ_EEPROM, 0, 0, &mut buf)?;
        let valid = match LowRateCalibration::parse(&buf[..n]) {
            Some(cal) => {
                self.cal = cal;
                true
            }
            None => {
                warn!("EEPROM calibration invalid, using defaults");
                self.cal = LowRateCalibration::default();
                false
            }
        };
        debug!(
            "current gain {} {}",
            self.cal.current_gain_a, self.cal.current_gain_b
        );
        let limit = if self.cal.usb_powered() {
            DEFAULT_CURRENT_LIMIT
        } else {
            2000
        };
        self.set_current_limit(handle, limit)?;
        Ok((self.cal.to_table(), valid))
    }

    /// Program the current limit in mA: 200, 400 or 2000.
    pub fn set_current_limit(&mut self, handle: &dyn UsbHandle, limit_ma: u32) -> Result<()> {
        let (a, b) = self.cal.ilimit_dac(limit_ma).ok_or_else(|| {
            Error::InvalidArgument(format!("unsupported current limit {} mA", limit_ma))
        })?;
        query(handle, CMD_ISET_DAC, a, b, &mut [])?;
        self.current_limit = limit_ma;
        Ok(())
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped
    }

    pub(super) fn configure(&mut self, rate: u32) -> Timing {
        let rate = if rate == 0 { DEFAULT_RATE } else { rate };
        self.per = ((TIMER_CLOCK / rate as f64).round() as u32).clamp(self.min_per, MAX_PER);
        let sample_period = self.per as f64 / TIMER_CLOCK;
        debug!("timer period {} ({} s)", self.per, sample_period);
        Timing {
            rate: (1.0 / sample_period).round() as u32,
            sample_period,
        }
    }

    pub(super) fn on(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        self.last_code = [0; 2];
        self.dropped = 0;
        command(handle, CMD_CONFIG_CAPTURE, self.per as u16, DEVMODE_2SMU)
    }

    pub(super) fn off(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        command(handle, CMD_CONFIG_CAPTURE, 0, DEVMODE_OFF)
    }

    pub(super) fn decode(&mut self, packet: &[u8], io: &mut StreamIo<'_>) {
        if packet.len() < LAYOUT.in_packet_len {
            return;
        }
        if packet[2] & FLAG_PACKET_DROPPED != 0 && io.counters.received != 0 {
            self.dropped += 1;
            warn!("device dropped a packet near sample {}", io.counters.received);
        }
        let modes = io.modes;
        for s in packet[4..LAYOUT.in_packet_len].chunks_exact(6) {
            let av = sign_extend12((s[2] as u16 & 0x0f) << 8 | s[0] as u16);
            let ai = sign_extend12((s[2] as u16 & 0xf0) << 4 | s[1] as u16);
            let bv = sign_extend12((s[5] as u16 & 0x0f) << 8 | s[3] as u16);
            let bi = sign_extend12((s[5] as u16 & 0xf0) << 4 | s[4] as u16);

            let cal = io.calibration;
            let current = |ch: usize, raw: i16| {
                if modes[ch] == Mode::Disabled {
                    0.0
                } else {
                    cal.apply(ch, CalQuantity::MeasuredCurrent, raw as f32 * I_LSB)
                }
            };
            let sample = [
                cal.apply(0, CalQuantity::MeasuredVoltage, av as f32 * V_LSB),
                current(0, ai),
                cal.apply(1, CalQuantity::MeasuredVoltage, bv as f32 * V_LSB),
                current(1, bi),
            ];
            io.deliver(sample);
        }
    }

    fn encode_channel(&self, channel: usize, io: &mut StreamIo<'_>) -> u16 {
        let code = match io.pull(channel) {
            None => 0.0,
            Some((Mode::Svmi, v)) => 4095.0 * v.clamp(0.0, 5.0) / 5.0,
            Some((_, i)) => {
                let limit = self.current_limit as f32 / 1000.0;
                let gain = self.cal.current_gain(channel) as f32;
                4095.0 * (1.25 + gain * i.clamp(-limit, limit)) / 2.5
            }
        };
        (code as i32).clamp(0, 4095) as u16
    }

    pub(super) fn encode(&mut self, packet: &mut [u8], io: &mut StreamIo<'_>) {
        packet[0] = io.modes[0] as u8;
        packet[1] = io.modes[1] as u8;
        for s in packet[2..LAYOUT.out_packet_len].chunks_exact_mut(3) {
            if io.out_open() {
                self.last_code = [self.encode_channel(0, io), self.encode_channel(1, io)];
            }
            let [a, b] = self.last_code;
            s[0] = (a & 0xff) as u8;
            s[1] = (b & 0xff) as u8;
            s[2] = (((b >> 4) & 0xf0) | (a >> 8)) as u8;
            io.counters.sent += 1;
        }
    }
}
