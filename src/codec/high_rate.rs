//! 16-bit high-rate family.
//!
//! IN packets hold 256 samples of four big-endian codes (`va, ia, vb, ib`),
//! OUT packets 256 pairs of DAC codes. Firmware from 2.0 interleaves the
//! codes per sample; earlier firmware sends one 256-code block per quantity.

use std::time::Duration;

use log::{debug, info, warn};

use super::{PacketLayout, StreamIo, Timing, command, query, version_number};
use crate::{
    calibration::{CAL_BLOB_LEN, CalQuantity, CalibrationTable},
    error::{Error, Result},
    signal::{Mode, Quantity, SignalInfo},
    usb::{CONTROL_TIMEOUT, UsbHandle, vendor},
};

const CHUNK: usize = 256;

pub(super) const LAYOUT: PacketLayout = PacketLayout {
    ep_in: 0x81,
    ep_out: 0x02,
    in_packet_len: CHUNK * 4 * 2,
    out_packet_len: CHUNK * 2 * 2,
    samples_per_packet: CHUNK,
    transfer_timeout: Duration::from_secs(10),
};

const CLOCK: f64 = 48e6;
const REV0_CLOCK: f64 = 3e6;
const MIN_PER: u16 = 240;
const REV0_MIN_PER: u16 = 0x18;
const MAX_PER: u16 = 0xffff;

/// DAC code that leaves an idle channel at 2 V.
const IDLE_CODE: u16 = 26214;

const CMD_SET_LED: u8 = 0x03;
const CMD_READ_CAL: u8 = 0x01;
const CMD_WRITE_CAL: u8 = 0x02;
const CMD_READ_ADM1177: u8 = 0x17;
const CMD_SET_MODE: u8 = 0x53;
const CMD_SET_POTS: u8 = 0x59;
const CMD_GET_SOF: u8 = 0x6F;
const CMD_SAMPLING: u8 = 0xC5;
const CMD_CONFIGURE: u8 = 0xCC;

static SIGNALS: [SignalInfo; 2] = [
    SignalInfo {
        label: "Voltage",
        quantity: Quantity::Voltage,
        input_modes: 0x7,
        output_modes: 0x2,
        min: 0.0,
        max: 5.0,
        resolution: 5.0 / 65536.0,
    },
    SignalInfo {
        label: "Current",
        quantity: Quantity::Current,
        input_modes: 0x6,
        output_modes: 0x4,
        min: -0.2,
        max: 0.2,
        resolution: 0.4 / 65536.0,
    },
];

const V_RES: f32 = 5.0 / 65536.0;
const I_RES: f32 = 0.4 / 65536.0;

fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

pub struct HighRateCodec {
    fw_number: f64,
    /// Initial production firmware with the slow timer clock.
    rev0: bool,
    interleaved: bool,
    sam_per: u16,
    sof_start: u16,
    overcurrent: bool,
    last_code: [u16; 2],
}

impl HighRateCodec {
    pub(super) fn new(fw_version: &str) -> Self {
        let rev0 = fw_version.starts_with("023314a");
        let fw_number = version_number(fw_version);
        let interleaved = !rev0 && fw_number >= 2.0;
        info!(
            "high-rate firmware {} ({} layout)",
            fw_version,
            if interleaved { "interleaved" } else { "planar" }
        );
        HighRateCodec {
            fw_number,
            rev0,
            interleaved,
            sam_per: MIN_PER,
            sof_start: 0,
            overcurrent: false,
            last_code: [IDLE_CODE; 2],
        }
    }

    pub(super) fn signal_info(quantity: Quantity) -> &'static SignalInfo {
        &SIGNALS[quantity as usize]
    }

    pub(super) fn default_rate(&self) -> u32 {
        if self.rev0 { 62_500 } else { 100_000 }
    }

    /// Whether the supply monitor flagged an overcurrent during the last run.
    pub fn overcurrent(&self) -> bool {
        self.overcurrent
    }

    pub(super) fn read_calibration(
        &mut self,
        handle: &dyn UsbHandle,
    ) -> Result<(CalibrationTable, bool)> {
        let mut buf = [0u8; CAL_BLOB_LEN];
        let n = query(handle, CMD_READ_CAL, 0, 0, &mut buf)?;
        match CalibrationTable::from_blob(&buf[..n]) {
            Some(table) => Ok((table, true)),
            None => {
                warn!("stored calibration invalid, using defaults");
                Ok((CalibrationTable::default(), false))
            }
        }
    }

    pub(super) fn write_calibration(
        &self,
        handle: &dyn UsbHandle,
        table: &CalibrationTable,
    ) -> Result<()> {
        let blob = table.to_blob();
        let n = handle
            .control_out(vendor(CMD_WRITE_CAL, 0, 0), &blob, CONTROL_TIMEOUT)
            .map_err(Error::control)?;
        if n != blob.len() {
            return Err(Error::InvalidResponse {
                expected: blob.len(),
                actual: n,
            });
        }
        Ok(())
    }

    pub(super) fn configure(&mut self, rate: u32) -> Timing {
        let rate = if rate == 0 { self.default_rate() } else { rate };
        let (clock, min_per) = if self.rev0 {
            (REV0_CLOCK, REV0_MIN_PER)
        } else {
            (CLOCK, MIN_PER)
        };
        // the timer counts half sample periods
        let per = ((clock / rate as f64).round() / 2.0).trunc();
        self.sam_per = (per as u32).clamp(min_per as u32, MAX_PER as u32) as u16;
        let actual = (clock / self.sam_per as f64 / 2.0).round() as u32;
        debug!("sample period {} at {} Hz clock: {} sps", self.sam_per, clock, actual);
        Timing {
            rate: actual,
            sample_period: 1.0 / actual as f64,
        }
    }

    pub(super) fn set_mode(&self, handle: &dyn UsbHandle, channel: usize, mode: Mode) -> Result<()> {
        let pots = match mode {
            Mode::Simv => 0x7f7f,
            Mode::Svmi => 0x0000,
            Mode::Disabled => 0x3000,
        };
        command(handle, CMD_SET_POTS, channel as u16, pots)?;
        command(handle, CMD_SET_MODE, channel as u16, mode as u16)
    }

    pub(super) fn on(&mut self, handle: &dyn UsbHandle, modes: [Mode; 2]) -> Result<()> {
        handle.set_alt_setting(1)?;
        for (ch, mode) in modes.into_iter().enumerate() {
            self.set_mode(handle, ch, mode)?;
        }
        self.sof_start = 0;
        self.last_code = [IDLE_CODE; 2];
        command(handle, CMD_SAMPLING, 0, 0)?;
        command(handle, CMD_CONFIGURE, 0, 0)
    }

    /// Pick a start-of-frame a little in the future so that several devices
    /// begin sampling on the same frame.
    pub(super) fn sync(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        let mut buf = [0u8; 2];
        let n = query(handle, CMD_GET_SOF, 0, 0, &mut buf)?;
        if n != buf.len() {
            return Err(Error::InvalidResponse {
                expected: buf.len(),
                actual: n,
            });
        }
        self.sof_start = u16::from_le_bytes(buf).wrapping_add(0xff) & 0x3c00;
        debug!("start of frame {:#06x}", self.sof_start);
        Ok(())
    }

    pub(super) fn run(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        command(handle, CMD_SAMPLING, self.sam_per, self.sof_start)
    }

    pub(super) fn off(&mut self, handle: &dyn UsbHandle) -> Result<()> {
        self.overcurrent = self.read_overcurrent(handle).unwrap_or_else(|e| {
            debug!("overcurrent status unavailable: {}", e);
            false
        });
        if self.overcurrent {
            warn!("overcurrent event during the last run");
        }
        self.set_mode(handle, 0, Mode::Disabled)?;
        self.set_mode(handle, 1, Mode::Disabled)?;
        command(handle, CMD_SAMPLING, 0, 0)
    }

    fn read_overcurrent(&self, handle: &dyn UsbHandle) -> Result<bool> {
        if self.fw_number < 2.07 {
            return Ok(false);
        }
        let mut status = [0u8; 1];
        let n = query(handle, CMD_READ_ADM1177, 0, 1, &mut status)?;
        if n != 1 {
            return Err(Error::InvalidResponse {
                expected: 1,
                actual: n,
            });
        }
        let alert_bit = if self.fw_number >= 2.11 { 0x8 } else { 0x4 };
        Ok(status[0] & alert_bit != 0)
    }

    /// Each bit drives one LED.
    pub fn set_led(&self, handle: &dyn UsbHandle, leds: u8) -> Result<()> {
        if leds > 7 {
            return Err(Error::InvalidArgument(format!("LED mask {} out of range", leds)));
        }
        command(handle, CMD_SET_LED, leds as u16, 0)
    }

    fn raw(&self, packet: &[u8], sample: usize, slot: usize) -> u16 {
        if self.interleaved {
            be16(packet, sample * 8 + slot * 2)
        } else {
            be16(packet, (sample + CHUNK * slot) * 2)
        }
    }

    pub(super) fn decode(&mut self, packet: &[u8], io: &mut StreamIo<'_>) {
        if packet.len() < LAYOUT.in_packet_len {
            return;
        }
        let cal = io.calibration;
        for i in 0..CHUNK {
            let volts = |ch: usize, raw: u16| {
                cal.apply(ch, CalQuantity::MeasuredVoltage, raw as f32 * V_RES)
            };
            let amps = |ch: usize, raw: u16| {
                let v = (raw as f32 * I_RES - 0.195) * 1.25;
                cal.apply(ch, CalQuantity::MeasuredCurrent, v)
            };
            io.deliver([
                volts(0, self.raw(packet, i, 0)),
                amps(0, self.raw(packet, i, 1)),
                volts(1, self.raw(packet, i, 2)),
                amps(1, self.raw(packet, i, 3)),
            ]);
        }
    }

    fn encode_channel(channel: usize, io: &mut StreamIo<'_>) -> u16 {
        let code = match io.pull(channel) {
            None => return IDLE_CODE,
            Some((Mode::Svmi, v)) => {
                let e = io.calibration.entry(channel, CalQuantity::SourcedVoltage);
                let v = ((v - e.offset) * e.gain_p).clamp(0.0, 5.0);
                v / V_RES
            }
            Some((_, i)) => {
                let i = io
                    .calibration
                    .apply(channel, CalQuantity::SourcedCurrent, i)
                    .clamp(-0.2, 0.2);
                65536.0 * (0.4 + 1.6 * i)
            }
        };
        (code as i32).clamp(0, 65535) as u16
    }

    pub(super) fn encode(&mut self, packet: &mut [u8], io: &mut StreamIo<'_>) {
        for i in 0..CHUNK {
            if io.out_open() {
                self.last_code = [Self::encode_channel(0, io), Self::encode_channel(1, io)];
            }
            let [a, b] = self.last_code.map(u16::to_be_bytes);
            let (ia, ib) = if self.interleaved {
                (i * 4, i * 4 + 2)
            } else {
                (i * 2, (i + CHUNK) * 2)
            };
            packet[ia..ia + 2].copy_from_slice(&a);
            packet[ib..ib + 2].copy_from_slice(&b);
            io.counters.sent += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::CalEntry,
        codec::{Counters, rig::Rig},
        loopback::Loopback,
    };
    use approx::assert_abs_diff_eq;

    fn rig() -> Rig {
        Rig::new(&SIGNALS[0], &SIGNALS[1], 1024)
    }

    fn interleaved_packet(codes: [u16; 4]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(LAYOUT.in_packet_len);
        for _ in 0..CHUNK {
            for c in codes {
                packet.extend_from_slice(&c.to_be_bytes());
            }
        }
        packet
    }

    #[test]
    fn sample_period_rounding() {
        let mut codec = HighRateCodec::new("2.17");
        let t = codec.configure(0);
        assert_eq!((codec.sam_per, t.rate), (240, 100_000));
        let t = codec.configure(200_000);
        assert_eq!((codec.sam_per, t.rate), (240, 100_000));
        let t = codec.configure(10_000);
        assert_eq!((codec.sam_per, t.rate), (2400, 10_000));
        let t = codec.configure(1);
        assert_eq!(codec.sam_per, MAX_PER);
        assert_eq!(t.rate, 366);

        let mut rev0 = HighRateCodec::new("023314a*");
        assert_eq!(rev0.default_rate(), 62_500);
        assert!(!rev0.interleaved);
        let t = rev0.configure(0);
        assert_eq!((rev0.sam_per, t.rate), (24, 62_500));
    }

    #[test]
    fn decodes_interleaved() {
        let mut codec = HighRateCodec::new("2.17");
        let mut rig = rig();
        // 2.5 V on A, 0 A on A, 0 V on B, 0 A on B
        let zero_amps = (0.195f64 / (0.4 / 65536.0)).round() as u16;
        let packet = interleaved_packet([32768, zero_amps, 0, zero_amps]);
        codec.decode(&packet, &mut rig.io());

        let samples = rig.drain();
        assert_eq!(samples.len(), CHUNK);
        for [va, ia, vb, ib] in samples {
            assert_abs_diff_eq!(va, 2.5, epsilon = 1e-6);
            assert_abs_diff_eq!(ia, 0.0, epsilon = 1e-5);
            assert_eq!(vb, 0.0);
            assert_abs_diff_eq!(ib, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn decodes_planar_with_calibration() {
        let mut codec = HighRateCodec::new("1.08");
        assert!(!codec.interleaved);
        let mut rig = rig();
        let mut entries = [CalEntry::default(); 8];
        entries[4] = CalEntry {
            offset: 0.5,
            gain_p: 2.0,
            gain_n: 1.0,
        };
        rig.calibration = CalibrationTable::new(entries);

        let mut packet = vec![0u8; LAYOUT.in_packet_len];
        // block 2 holds channel B voltage
        for i in 0..CHUNK {
            let off = (i + CHUNK * 2) * 2;
            packet[off..off + 2].copy_from_slice(&16384u16.to_be_bytes());
        }
        codec.decode(&packet, &mut rig.io());
        for [va, _, vb, _] in rig.drain() {
            assert_eq!(va, 0.0);
            assert_abs_diff_eq!(vb, (1.25 - 0.5) * 2.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn encodes_modes_and_idle() {
        let mut codec = HighRateCodec::new("2.17");
        let mut rig = rig();
        rig.modes = [Mode::Svmi, Mode::Disabled];
        rig.signals[0][0].source_constant(2.5);

        let mut packet = vec![0u8; LAYOUT.out_packet_len];
        codec.encode(&mut packet, &mut rig.io());
        assert_eq!(rig.counters.sent, CHUNK as u64);
        for s in packet.chunks_exact(4) {
            assert_eq!(be16(s, 0), 32768);
            assert_eq!(be16(s, 2), IDLE_CODE);
        }

        rig.modes = [Mode::Simv, Mode::Simv];
        rig.signals[0][1].source_constant(0.1);
        rig.signals[1][1].source_constant(-1.0);
        codec.encode(&mut packet, &mut rig.io());
        assert_eq!(be16(&packet, 0), (65536.0f32 * (0.4 + 1.6 * 0.1)) as u16);
        // clamped to -0.2 A
        assert_eq!(be16(&packet, 2), (65536.0f32 * (0.4 - 1.6 * 0.2)) as u16);
    }

    #[test]
    fn planar_encode_holds_last_code() {
        let mut codec = HighRateCodec::new("1.08");
        let mut rig = rig();
        rig.modes = [Mode::Svmi, Mode::Svmi];
        rig.counters = Counters::start(1);
        rig.signals[0][0].source_buffer(vec![5.0, 0.0], false).unwrap();
        rig.signals[1][0].source_constant(0.0);

        let mut packet = vec![0u8; LAYOUT.out_packet_len];
        codec.encode(&mut packet, &mut rig.io());
        for i in 0..CHUNK {
            assert_eq!(be16(&packet, i * 2), 65535);
            assert_eq!(be16(&packet, (i + CHUNK) * 2), 0);
        }
    }

    #[test]
    fn run_lifecycle_commands() {
        let dev = Loopback::high_rate("SIM");
        dev.set_overcurrent(0x8);
        let mut codec = HighRateCodec::new("2.17");
        codec.configure(100_000);
        codec.on(&dev, [Mode::Svmi, Mode::Simv]).unwrap();
        codec.sync(&dev).unwrap();
        codec.run(&dev).unwrap();
        codec.off(&dev).unwrap();
        assert!(codec.overcurrent());
        assert_eq!(dev.alt_setting(), 1);

        let sent: Vec<_> = dev
            .controls()
            .into_iter()
            .filter(|c| !c.device_to_host)
            .map(|c| (c.request, c.value, c.index))
            .collect();
        assert_eq!(
            sent,
            vec![
                (0x59, 0, 0x0000),
                (0x53, 0, 1),
                (0x59, 1, 0x7f7f),
                (0x53, 1, 2),
                (0xC5, 0, 0),
                (0xCC, 0, 0),
                (0xC5, 240, 0x1000),
                (0x59, 0, 0x3000),
                (0x53, 0, 0),
                (0x59, 1, 0x3000),
                (0x53, 1, 0),
                (0xC5, 0, 0),
            ]
        );
    }

    #[test]
    fn calibration_round_trip() {
        let dev = Loopback::high_rate("SIM");
        let mut codec = HighRateCodec::new("2.17");
        let (table, valid) = codec.read_calibration(&dev).unwrap();
        assert!(!valid);
        assert!(table.is_default());

        let mut entries = [CalEntry::default(); 8];
        entries[3].gain_n = 1.5;
        let table = CalibrationTable::new(entries);
        codec.write_calibration(&dev, &table).unwrap();
        assert_eq!(dev.eeprom().len(), CAL_BLOB_LEN);
        assert_eq!(codec.read_calibration(&dev).unwrap(), (table, true));
    }

    #[test]
    fn led_mask_range() {
        let dev = Loopback::high_rate("SIM");
        let codec = HighRateCodec::new("2.17");
        codec.set_led(&dev, 5).unwrap();
        assert!(codec.set_led(&dev, 8).is_err());
        assert_eq!(dev.controls().len(), 1);
    }
}
