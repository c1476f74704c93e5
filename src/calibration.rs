//! Gain/offset correction tables.
//!
//! Both hardware families reduce to the same 8-entry table: one entry per
//! (channel, quantity) pair, indexed `channel * 4 + q`. The high-rate family
//! stores the table verbatim in device memory; the low-rate family stores raw
//! code offsets and current-sense gains which are converted on load.

use std::{fs, path::Path};

use crate::error::{Error, Result};

pub const CAL_ENTRIES: usize = 8;

/// Marker word in front of a valid high-rate calibration record.
pub const CAL_MARKER: u32 = 0x01ee_02dd;

/// Size of the high-rate record: marker plus three arrays of eight f32.
pub const CAL_BLOB_LEN: usize = 4 + 3 * CAL_ENTRIES * 4;

/// Which of the four per-channel quantities an entry corrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalQuantity {
    MeasuredVoltage = 0,
    MeasuredCurrent = 1,
    SourcedVoltage = 2,
    SourcedCurrent = 3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalEntry {
    pub offset: f32,
    pub gain_p: f32,
    pub gain_n: f32,
}

impl Default for CalEntry {
    fn default() -> Self {
        CalEntry {
            offset: 0.0,
            gain_p: 1.0,
            gain_n: 1.0,
        }
    }
}

impl CalEntry {
    /// Correct `value`, choosing the gain by the sign of the raw value.
    pub fn apply(&self, value: f32) -> f32 {
        let gain = if value > 0.0 { self.gain_p } else { self.gain_n };
        (value - self.offset) * gain
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationTable {
    entries: [CalEntry; CAL_ENTRIES],
}

impl CalibrationTable {
    pub fn new(entries: [CalEntry; CAL_ENTRIES]) -> Self {
        CalibrationTable { entries }
    }

    pub fn index(channel: usize, quantity: CalQuantity) -> usize {
        channel * 4 + quantity as usize
    }

    pub fn entries(&self) -> &[CalEntry; CAL_ENTRIES] {
        &self.entries
    }

    pub fn entry(&self, channel: usize, quantity: CalQuantity) -> &CalEntry {
        &self.entries[Self::index(channel, quantity)]
    }

    pub fn apply(&self, channel: usize, quantity: CalQuantity, value: f32) -> f32 {
        self.entry(channel, quantity).apply(value)
    }

    pub fn is_default(&self) -> bool {
        self.entries.iter().all(|e| *e == CalEntry::default())
    }

    /// Load a calibration file from disk. See [`CalibrationTable::parse_file`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(Error::IoError)?;
        Self::parse_file(&text)
    }

    /// Parse the bracketed calibration file format.
    ///
    /// A record opens at a line containing `</>` and closes at the next line
    /// containing `<\>`. Each line in between is a `<reference, measured>`
    /// point. The first point of a record fixes the offset; the remaining
    /// points are averaged into the positive and negative gains. Exactly
    /// eight non-empty records are required.
    pub fn parse_file(text: &str) -> Result<Self> {
        let mut records = Vec::with_capacity(CAL_ENTRIES);
        let mut lines = text.lines().enumerate();

        while let Some((_, line)) = lines.next() {
            if !line.contains("</>") {
                continue;
            }
            let mut points: Vec<(f32, f32)> = Vec::new();
            let mut closed = false;
            for (lineno, line) in lines.by_ref() {
                if line.contains("<\\>") && !points.is_empty() {
                    closed = true;
                    break;
                }
                points.push(parse_point(line).ok_or_else(|| {
                    Error::InvalidCalibrationFile(format!(
                        "line {}: expected <reference, measured>, got {:?}",
                        lineno + 1,
                        line.trim()
                    ))
                })?);
            }
            if !closed {
                return Err(Error::InvalidCalibrationFile(
                    "unterminated calibration record".into(),
                ));
            }
            records.push(fit_entry(&points));
        }

        let entries: [CalEntry; CAL_ENTRIES] = records.try_into().map_err(|r: Vec<CalEntry>| {
            Error::InvalidCalibrationFile(format!(
                "expected {} records, found {}",
                CAL_ENTRIES,
                r.len()
            ))
        })?;
        Ok(CalibrationTable { entries })
    }

    /// Decode a high-rate calibration record. `None` when the marker does
    /// not match or the record is short.
    pub(crate) fn from_blob(blob: &[u8]) -> Option<Self> {
        if blob.len() < CAL_BLOB_LEN || le_u32(blob, 0) != CAL_MARKER {
            return None;
        }
        let mut entries = [CalEntry::default(); CAL_ENTRIES];
        for (i, e) in entries.iter_mut().enumerate() {
            e.offset = le_f32(blob, 4 + i * 4);
            e.gain_p = le_f32(blob, 4 + (CAL_ENTRIES + i) * 4);
            e.gain_n = le_f32(blob, 4 + (2 * CAL_ENTRIES + i) * 4);
        }
        Some(CalibrationTable { entries })
    }

    pub(crate) fn to_blob(&self) -> [u8; CAL_BLOB_LEN] {
        let mut blob = [0u8; CAL_BLOB_LEN];
        blob[..4].copy_from_slice(&CAL_MARKER.to_le_bytes());
        for (i, e) in self.entries.iter().enumerate() {
            let fields = [
                (4 + i * 4, e.offset),
                (4 + (CAL_ENTRIES + i) * 4, e.gain_p),
                (4 + (2 * CAL_ENTRIES + i) * 4, e.gain_n),
            ];
            for (off, v) in fields {
                blob[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        blob
    }
}

fn parse_point(line: &str) -> Option<(f32, f32)> {
    let inner = line.trim().strip_prefix('<')?;
    let inner = inner.split('>').next()?;
    let (reference, measured) = inner.split_once(',')?;
    Some((
        reference.trim().parse().ok()?,
        measured.trim().parse().ok()?,
    ))
}

fn fit_entry(points: &[(f32, f32)]) -> CalEntry {
    let offset = points[0].1 - points[0].0;
    let (mut sum_p, mut cnt_p, mut sum_n, mut cnt_n) = (0.0f32, 0u32, 0.0f32, 0u32);
    for &(reference, measured) in &points[1..] {
        let g = reference / (measured - offset);
        if reference > 0.0 {
            sum_p += g;
            cnt_p += 1;
        } else {
            sum_n += g;
            cnt_n += 1;
        }
    }
    CalEntry {
        offset,
        gain_p: if cnt_p > 0 { sum_p / cnt_p as f32 } else { 1.0 },
        gain_n: if cnt_n > 0 { sum_n / cnt_n as f32 } else { 1.0 },
    }
}

fn le_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le_f32(b: &[u8], off: usize) -> f32 {
    f32::from_bits(le_u32(b, off))
}

fn le_i16(b: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([b[off], b[off + 1]])
}

// Low-rate EEPROM record

pub const LOW_RATE_CAL_MAGIC: u32 = 0x90e2_6cee;
pub const LOW_RATE_CAL_LEN: usize = 25;
pub const FLAG_USB_POWER: u8 = 1 << 0;

const CURRENT_GAIN_SCALE: f64 = 100_000.0;
/// 45 × 0.07 × 100000
pub const DEFAULT_CURRENT_GAIN: u32 = 315_000;
const DEFAULT_ILIMIT_DAC: i16 = 0x6B7;

/// Factory calibration stored in the low-rate family's EEPROM.
///
/// Offsets are in raw ADC codes; current gains are scaled by 100000.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowRateCalibration {
    pub offset_a_v: i8,
    pub offset_a_i: i8,
    pub offset_b_v: i8,
    pub offset_b_i: i8,
    pub dac200_a: i16,
    pub dac200_b: i16,
    pub dac400_a: i16,
    pub dac400_b: i16,
    pub current_gain_a: u32,
    pub current_gain_b: u32,
    pub flags: u8,
}

impl Default for LowRateCalibration {
    fn default() -> Self {
        LowRateCalibration {
            offset_a_v: 0,
            offset_a_i: 0,
            offset_b_v: 0,
            offset_b_i: 0,
            dac200_a: DEFAULT_ILIMIT_DAC,
            dac200_b: DEFAULT_ILIMIT_DAC,
            dac400_a: DEFAULT_ILIMIT_DAC,
            dac400_b: DEFAULT_ILIMIT_DAC,
            current_gain_a: DEFAULT_CURRENT_GAIN,
            current_gain_b: DEFAULT_CURRENT_GAIN,
            flags: 0xff,
        }
    }
}

impl LowRateCalibration {
    /// Decode the EEPROM record; `None` if the magic word does not match.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < LOW_RATE_CAL_LEN || le_u32(buf, 0) != LOW_RATE_CAL_MAGIC {
            return None;
        }
        let gain = |off| match le_u32(buf, off) {
            u32::MAX => DEFAULT_CURRENT_GAIN,
            g => g,
        };
        Some(LowRateCalibration {
            offset_a_v: buf[4] as i8,
            offset_a_i: buf[5] as i8,
            offset_b_v: buf[6] as i8,
            offset_b_i: buf[7] as i8,
            dac200_a: le_i16(buf, 8),
            dac200_b: le_i16(buf, 10),
            dac400_a: le_i16(buf, 12),
            dac400_b: le_i16(buf, 14),
            current_gain_a: gain(16),
            current_gain_b: gain(20),
            flags: buf[24],
        })
    }

    pub fn encode(&self) -> [u8; LOW_RATE_CAL_LEN] {
        let mut buf = [0u8; LOW_RATE_CAL_LEN];
        buf[..4].copy_from_slice(&LOW_RATE_CAL_MAGIC.to_le_bytes());
        buf[4] = self.offset_a_v as u8;
        buf[5] = self.offset_a_i as u8;
        buf[6] = self.offset_b_v as u8;
        buf[7] = self.offset_b_i as u8;
        buf[8..10].copy_from_slice(&self.dac200_a.to_le_bytes());
        buf[10..12].copy_from_slice(&self.dac200_b.to_le_bytes());
        buf[12..14].copy_from_slice(&self.dac400_a.to_le_bytes());
        buf[14..16].copy_from_slice(&self.dac400_b.to_le_bytes());
        buf[16..20].copy_from_slice(&self.current_gain_a.to_le_bytes());
        buf[20..24].copy_from_slice(&self.current_gain_b.to_le_bytes());
        buf[24] = self.flags;
        buf
    }

    pub fn usb_powered(&self) -> bool {
        self.flags & FLAG_USB_POWER != 0
    }

    /// Current-limit DAC codes for a limit in mA.
    pub fn ilimit_dac(&self, limit_ma: u32) -> Option<(u16, u16)> {
        match limit_ma {
            200 => Some((self.dac200_a as u16, self.dac200_b as u16)),
            400 => Some((self.dac400_a as u16, self.dac400_b as u16)),
            2000 => Some((0, 0)),
            _ => None,
        }
    }

    pub fn current_gain(&self, channel: usize) -> f64 {
        let g = if channel == 0 {
            self.current_gain_a
        } else {
            self.current_gain_b
        };
        g as f64 / CURRENT_GAIN_SCALE
    }

    /// Express the raw-code offsets and current gains as a generic table
    /// acting on values already scaled to volts and amps.
    pub fn to_table(&self) -> CalibrationTable {
        const V_LSB: f64 = 5.0 / 2048.0;
        const I_LSB: f64 = 2.5 / 2048.0 / 2.0;

        let mut entries = [CalEntry::default(); CAL_ENTRIES];
        let offsets = [
            (self.offset_a_v, self.offset_a_i),
            (self.offset_b_v, self.offset_b_i),
        ];
        for (ch, (ov, oi)) in offsets.into_iter().enumerate() {
            entries[CalibrationTable::index(ch, CalQuantity::MeasuredVoltage)] = CalEntry {
                offset: (-(ov as f64) * V_LSB) as f32,
                gain_p: 1.0,
                gain_n: 1.0,
            };
            let gain = (1.0 / self.current_gain(ch)) as f32;
            entries[CalibrationTable::index(ch, CalQuantity::MeasuredCurrent)] = CalEntry {
                offset: (-(oi as f64) * I_LSB) as f32,
                gain_p: gain,
                gain_n: gain,
            };
        }
        CalibrationTable { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fmt::Write as _;

    fn calibration_file(records: usize) -> String {
        let mut text = String::from("# smu calibration\n");
        for r in 0..records {
            let off = r as f32 * 0.01;
            writeln!(text, "</>").unwrap();
            writeln!(text, "<0.0000, {:.4}>", off).unwrap();
            writeln!(text, "<2.0000, {:.4}>", 1.0 + off).unwrap();
            writeln!(text, "<-2.0000, {:.4}>", -4.0 + off).unwrap();
            writeln!(text, "<\\>").unwrap();
        }
        text
    }

    #[test]
    fn parses_eight_records() {
        let table = CalibrationTable::parse_file(&calibration_file(8)).unwrap();
        for (r, e) in table.entries().iter().enumerate() {
            assert_relative_eq!(e.offset, r as f32 * 0.01, epsilon = 1e-5);
            assert_relative_eq!(e.gain_p, 2.0, epsilon = 1e-4);
            assert_relative_eq!(e.gain_n, 0.5, epsilon = 1e-4);
        }
    }

    #[test]
    fn wrong_record_count_is_rejected() {
        for n in [0, 7, 9] {
            assert!(matches!(
                CalibrationTable::parse_file(&calibration_file(n)),
                Err(Error::InvalidCalibrationFile(_))
            ));
        }
    }

    #[test]
    fn malformed_point_is_rejected() {
        let text = calibration_file(8).replacen("<2.0000,", "<two,", 1);
        assert!(matches!(
            CalibrationTable::parse_file(&text),
            Err(Error::InvalidCalibrationFile(_))
        ));
    }

    #[test]
    fn offset_only_record_keeps_unit_gain() {
        let mut text = String::new();
        for _ in 0..8 {
            text.push_str("</>\n<0.0, 0.125>\n<\\>\n");
        }
        let table = CalibrationTable::parse_file(&text).unwrap();
        let e = table.entry(1, CalQuantity::SourcedCurrent);
        assert_eq!(e.offset, 0.125);
        assert_eq!((e.gain_p, e.gain_n), (1.0, 1.0));
    }

    #[test]
    fn apply_selects_gain_by_sign() {
        let e = CalEntry {
            offset: 0.5,
            gain_p: 2.0,
            gain_n: 3.0,
        };
        assert_eq!(e.apply(1.5), 2.0);
        assert_eq!(e.apply(-0.5), -3.0);
        assert_eq!(CalEntry::default().apply(1.25), 1.25);
    }

    #[test]
    fn blob_layout() {
        let table = CalibrationTable::parse_file(&calibration_file(8)).unwrap();
        let blob = table.to_blob();
        assert_eq!(blob.len(), 100);
        assert_eq!(&blob[..4], &[0xdd, 0x02, 0xee, 0x01]);
        assert_eq!(CalibrationTable::from_blob(&blob), Some(table));

        let mut bad = blob;
        bad[0] = 0;
        assert_eq!(CalibrationTable::from_blob(&bad), None);
        assert_eq!(CalibrationTable::from_blob(&blob[..50]), None);
    }

    #[test]
    fn low_rate_defaults_when_magic_missing() {
        assert_eq!(LowRateCalibration::parse(&[0xff; 64]), None);
        let cal = LowRateCalibration::default();
        assert!(cal.usb_powered());
        assert_eq!(cal.ilimit_dac(200), Some((0x6B7, 0x6B7)));
        assert_eq!(cal.ilimit_dac(2000), Some((0, 0)));
        assert_eq!(cal.ilimit_dac(300), None);
        assert_relative_eq!(cal.current_gain(1), 3.15);
    }

    #[test]
    fn low_rate_record_converts_to_table() {
        let cal = LowRateCalibration {
            offset_a_v: -4,
            offset_b_i: 8,
            current_gain_a: 200_000,
            flags: 0,
            ..Default::default()
        };
        let parsed = LowRateCalibration::parse(&cal.encode()).unwrap();
        assert_eq!(parsed, cal);
        assert!(!parsed.usb_powered());

        let table = parsed.to_table();
        let av = table.entry(0, CalQuantity::MeasuredVoltage);
        assert_relative_eq!(av.offset, 4.0 * 5.0 / 2048.0);
        let ai = table.entry(0, CalQuantity::MeasuredCurrent);
        assert_relative_eq!(ai.gain_p, 0.5);
        let bi = table.entry(1, CalQuantity::MeasuredCurrent);
        assert_relative_eq!(bi.offset, -8.0 * 2.5 / 4096.0);
        assert_eq!(*table.entry(0, CalQuantity::SourcedVoltage), CalEntry::default());
    }

    #[test]
    fn unset_gain_falls_back_to_nominal() {
        let mut buf = LowRateCalibration {
            flags: 0,
            ..Default::default()
        }
        .encode();
        buf[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        let cal = LowRateCalibration::parse(&buf).unwrap();
        assert_eq!(cal.current_gain_a, DEFAULT_CURRENT_GAIN);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.txt");
        fs::write(&path, calibration_file(8)).unwrap();
        assert!(CalibrationTable::load(&path).is_ok());
        assert!(matches!(
            CalibrationTable::load(dir.path().join("missing.txt")),
            Err(Error::IoError(_))
        ));
    }
}
