use std::{fs, path::PathBuf};

use approx::assert_abs_diff_eq;
use smu_stream::{
    CalQuantity, CalibrationTable, Error, Session, SessionConfig, loopback::Loopback,
};
use tempfile::TempDir;

fn session() -> Session {
    Session::with_config(SessionConfig::default().hotplug(false)).unwrap()
}

fn calibration_file(dir: &TempDir, name: &str, records: usize) -> PathBuf {
    let mut text = String::from("# bench calibration\n");
    for i in 0..records {
        text.push_str("</>\n");
        text.push_str(&format!("<0.0, {}>\n", 0.01 * i as f32));
        text.push_str("<2.5, 2.6>\n");
        text.push_str("<-0.1, -0.09>\n");
        text.push_str("<\\>\n");
    }
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn file_round_trips_through_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = calibration_file(&dir, "cal.txt", 8);
    let session = session();
    let dev = Loopback::high_rate("SIM");
    let device = session.attach_handle(dev.clone()).unwrap();
    assert!(device.calibration().is_default());

    device.write_calibration(Some(path.as_path())).unwrap();
    let expected = CalibrationTable::load(&path).unwrap();
    assert_eq!(device.calibration(), expected);
    assert_eq!(dev.eeprom().len(), 100);

    assert!(device.read_calibration().unwrap());
    assert_eq!(device.calibration(), expected);

    let e = expected.entry(1, CalQuantity::SourcedVoltage);
    assert_abs_diff_eq!(e.offset, 0.06, epsilon = 1e-6);
    assert_abs_diff_eq!(e.gain_p, 2.5 / (2.6 - 0.06), epsilon = 1e-6);
    assert_abs_diff_eq!(e.gain_n, -0.1 / (-0.09 - 0.06), epsilon = 1e-6);
}

#[test]
fn wrong_record_count_leaves_table_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let good = calibration_file(&dir, "good.txt", 8);
    let short = calibration_file(&dir, "short.txt", 7);
    let session = session();
    let dev = Loopback::high_rate("SIM");
    let device = session.attach_handle(dev.clone()).unwrap();
    device.write_calibration(Some(good.as_path())).unwrap();
    let before = device.calibration();
    let stored = dev.eeprom();

    assert!(matches!(
        device.write_calibration(Some(short.as_path())),
        Err(Error::InvalidCalibrationFile(_))
    ));
    assert_eq!(device.calibration(), before);
    assert_eq!(dev.eeprom(), stored);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let device = session.attach_handle(Loopback::high_rate("SIM")).unwrap();
    assert!(matches!(
        device.write_calibration(Some(dir.path().join("absent.txt").as_path())),
        Err(Error::IoError(_))
    ));
}

#[test]
fn defaults_can_be_restored() {
    let dir = tempfile::tempdir().unwrap();
    let path = calibration_file(&dir, "cal.txt", 8);
    let session = session();
    let device = session.attach_handle(Loopback::high_rate("SIM")).unwrap();
    device.write_calibration(Some(path.as_path())).unwrap();
    assert!(!device.calibration().is_default());

    device.write_calibration(None).unwrap();
    assert!(device.calibration().is_default());
    assert!(device.read_calibration().unwrap());
    assert!(device.calibration().is_default());
}

#[test]
fn corrupt_stored_record_falls_back_to_defaults() {
    let session = session();
    let dev = Loopback::high_rate("SIM");
    dev.set_eeprom(vec![0xa5; 100]);
    let device = session.attach_handle(dev).unwrap();
    assert!(device.calibration().is_default());
    assert!(!device.read_calibration().unwrap());
}

#[test]
fn calibration_applies_to_measurements() {
    let dir = tempfile::tempdir().unwrap();
    let path = calibration_file(&dir, "cal.txt", 8);
    let session = session();
    let dev = Loopback::high_rate("SIM");
    // every code reads back as 2.5 V
    dev.set_input_packet(32768u16.to_be_bytes().to_vec());
    let device = session.attach_handle(dev).unwrap();
    device.write_calibration(Some(path.as_path())).unwrap();
    session.run(256).unwrap();

    let cal = device.calibration();
    let samples = device.read(256, None).unwrap();
    assert_eq!(samples.len(), 256);
    let expected_va = cal.apply(0, CalQuantity::MeasuredVoltage, 2.5);
    let expected_vb = cal.apply(1, CalQuantity::MeasuredVoltage, 2.5);
    for [va, _, vb, _] in samples {
        assert_abs_diff_eq!(va, expected_va, epsilon = 1e-5);
        assert_abs_diff_eq!(vb, expected_vb, epsilon = 1e-5);
    }
}
