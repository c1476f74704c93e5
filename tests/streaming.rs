use std::time::Duration;

use nusb::transfer::TransferError;
use smu_stream::{
    Error, Event, Fault, FaultKind, Mode, Quantity, Session, SessionConfig, loopback::Loopback,
};

fn session() -> Session {
    Session::with_config(SessionConfig::default().hotplug(false)).unwrap()
}

fn completions(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .filter(|e| matches!(e, Event::Completion { .. }))
        .cloned()
        .collect()
}

fn wait_for_completion(events: &crossbeam_channel::Receiver<Event>) -> Event {
    loop {
        let e = events
            .recv_timeout(Duration::from_secs(5))
            .expect("run never completed");
        if matches!(e, Event::Completion { .. }) {
            return e;
        }
    }
}

#[test]
fn run_produces_exact_sample_count() {
    let session = session();
    let dev = Loopback::high_rate("SIM0001");
    let device = session.attach_handle(dev.clone()).unwrap();
    device.set_mode(0, Mode::Svmi).unwrap();
    device
        .with_signal(0, Quantity::Voltage, |s| s.source_constant(1.25))
        .unwrap();
    let currents = device
        .with_signal(0, Quantity::Current, |s| s.measure_buffer(4096))
        .unwrap();
    let events = session.subscribe();

    assert_eq!(session.configure(0).unwrap(), 100_000);
    session.run(1000).unwrap();

    assert_eq!(session.active_devices(), 0);
    assert!(!session.is_running());
    assert!(!session.cancelled());
    assert_eq!(device.read(4096, None).unwrap().len(), 1000);
    assert_eq!(currents.len(), 1000);

    let events: Vec<Event> = events.try_iter().collect();
    assert_eq!(
        completions(&events),
        vec![Event::Completion {
            cancelled: false,
            fault: None
        }]
    );
    assert!(events.contains(&Event::Progress(1000)));

    // 1.25 V on channel A, idle code on B
    let out = dev.out_data();
    assert_eq!(&out[..4], &[0x40, 0x00, 0x66, 0x66]);
}

#[test]
fn runs_can_be_repeated() {
    let session = session();
    let device = session
        .attach_handle(Loopback::high_rate("SIM"))
        .unwrap();
    session.configure(50_000).unwrap();
    for _ in 0..3 {
        session.run(300).unwrap();
        assert_eq!(device.read(1000, None).unwrap().len(), 300);
    }
}

#[test]
fn cancelling_continuous_run_completes_once() {
    let session = session();
    let device = session
        .attach_handle(Loopback::high_rate("SIM"))
        .unwrap();
    let events = session.subscribe();
    session.configure(0).unwrap();
    session.start(0).unwrap();

    let first = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(first, Event::Progress(n) if n > 0));

    session.cancel();
    session.cancel();
    session.end().unwrap();
    assert!(session.cancelled());
    assert_eq!(session.active_devices(), 0);
    assert!(device.queued() > 0);

    let events: Vec<Event> = events.try_iter().collect();
    assert_eq!(
        completions(&events),
        vec![Event::Completion {
            cancelled: true,
            fault: None
        }]
    );
}

#[test]
fn end_stops_continuous_run() {
    let session = session();
    session
        .attach_handle(Loopback::low_rate("SIM"))
        .unwrap();
    session.start(0).unwrap();
    session.end().unwrap();
    assert!(!session.is_running());
}

#[test]
fn multiple_devices_share_start_of_frame() {
    let session = session();
    let a = Loopback::high_rate("A");
    let b = Loopback::high_rate("B");
    let dev_a = session.attach_handle(a.clone()).unwrap();
    let dev_b = session.attach_handle(b.clone()).unwrap();
    session.run(512).unwrap();

    for (dev, device) in [(&a, &dev_a), (&b, &dev_b)] {
        let controls = dev.controls();
        assert!(controls.iter().any(|c| c.device_to_host && c.request == 0x6F));
        assert!(
            controls
                .iter()
                .any(|c| !c.device_to_host && (c.request, c.value, c.index) == (0xC5, 240, 0x1000))
        );
        assert_eq!(device.read(1024, None).unwrap().len(), 512);
    }
}

#[test]
fn single_device_skips_synchronisation() {
    let session = session();
    let dev = Loopback::high_rate("SIM");
    session.attach_handle(dev.clone()).unwrap();
    session.run(100).unwrap();
    assert!(!dev.controls().iter().any(|c| c.request == 0x6F));
    // sampling is stopped and both channels left floating
    let last: Vec<_> = dev
        .controls()
        .iter()
        .rev()
        .take(3)
        .map(|c| (c.request, c.value, c.index))
        .collect();
    assert_eq!(last, vec![(0xC5, 0, 0), (0x53, 1, 0), (0x59, 1, 0x3000)]);
}

#[test]
fn failed_submission_fails_the_run() {
    let session = session();
    let dev = Loopback::high_rate("SIM");
    let device = session.attach_handle(dev.clone()).unwrap();
    session.configure(0).unwrap();
    dev.fail_next_submit(TransferError::Fault);

    let err = session.run(1000).unwrap_err();
    assert!(matches!(
        err,
        Error::Transport(Fault {
            tag: "submit_out",
            kind: FaultKind::Transfer(TransferError::Fault),
        })
    ));
    assert_eq!(session.active_devices(), 0);
    assert!(!session.is_running());
    assert!(!device.is_streaming());

    // the next run starts clean
    session.run(100).unwrap();
}

#[test]
fn transfer_error_cancels_every_device() {
    let session = session();
    let a = Loopback::high_rate("A");
    let b = Loopback::high_rate("B");
    b.set_hold(true);
    session.attach_handle(a.clone()).unwrap();
    session.attach_handle(b.clone()).unwrap();
    let events = session.subscribe();
    session.start(0).unwrap();

    a.fail_next_completion(TransferError::Stall);
    match wait_for_completion(&events) {
        Event::Completion { cancelled, fault } => {
            assert!(cancelled);
            assert!(matches!(
                fault,
                Some(Fault {
                    kind: FaultKind::Transfer(TransferError::Stall),
                    ..
                })
            ));
        }
        e => panic!("unexpected event {:?}", e),
    }
    assert!(matches!(session.end(), Err(Error::Transport(_))));
    assert_eq!(session.active_devices(), 0);
}

#[test]
fn disconnect_during_run_is_a_transport_error() {
    let session = session();
    let dev = Loopback::high_rate("SIM");
    dev.set_hold(true);
    session.attach_handle(dev.clone()).unwrap();
    let events = session.subscribe();
    session.start(0).unwrap();
    dev.disconnect();
    wait_for_completion(&events);
    assert!(matches!(
        session.end(),
        Err(Error::Transport(Fault {
            kind: FaultKind::Transfer(TransferError::Disconnected),
            ..
        }))
    ));
}

#[test]
fn low_rate_run() {
    let session = session();
    let dev = Loopback::low_rate("SIM");
    let device = session.attach_handle(dev.clone()).unwrap();
    device.set_mode(0, Mode::Svmi).unwrap();
    device
        .with_signal(0, Quantity::Voltage, |s| s.source_constant(5.0))
        .unwrap();
    assert_eq!(session.configure(0).unwrap(), 80_000);
    session.run(100).unwrap();

    assert_eq!(device.read(1000, None).unwrap().len(), 100);
    let out = dev.out_data();
    assert_eq!(&out[..5], &[1, 0, 0xff, 0x00, 0x0f]);
}

#[test]
fn callbacks_see_every_sample() {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    let session = session();
    let device = session
        .attach_handle(Loopback::high_rate("SIM"))
        .unwrap();
    device.set_mode(1, Mode::Simv).unwrap();
    let pulled = Arc::new(AtomicU64::new(0));
    let pushed = Arc::new(AtomicU64::new(0));
    let p = pulled.clone();
    device
        .with_signal(1, Quantity::Current, |s| {
            s.source_callback(move |_| {
                p.fetch_add(1, Ordering::Relaxed);
                0.0
            })
        })
        .unwrap();
    let p = pushed.clone();
    device
        .with_signal(1, Quantity::Voltage, |s| {
            s.measure_callback(move |_| {
                p.fetch_add(1, Ordering::Relaxed);
            })
        })
        .unwrap();

    session.run(700).unwrap();
    assert_eq!(pushed.load(Ordering::Relaxed), 700);
    assert_eq!(pulled.load(Ordering::Relaxed), 700);
}

#[test]
fn end_times_out_on_silent_hardware() {
    use std::time::Instant;

    let session = Session::with_config(SessionConfig {
        end_margin: Duration::from_millis(200),
        ..SessionConfig::default().hotplug(false)
    })
    .unwrap();
    let dev = Loopback::high_rate("SIM");
    dev.set_hold(true);
    session.attach_handle(dev).unwrap();

    let start = Instant::now();
    assert!(matches!(session.run(1000), Err(Error::Timeout)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(3), "end took {:?}", elapsed);
    assert_eq!(session.active_devices(), 0);
    assert!(!session.is_running());
    assert!(session.cancelled());
}

#[test]
fn stalled_transfers_fail_the_run() {
    let session = session();
    let dev = Loopback::low_rate("SIM");
    dev.set_hold(true);
    session.attach_handle(dev).unwrap();
    let events = session.subscribe();
    session.start(0).unwrap();

    match wait_for_completion(&events) {
        Event::Completion { cancelled, fault } => {
            assert!(cancelled);
            assert!(matches!(
                fault,
                Some(Fault {
                    kind: FaultKind::Timeout,
                    ..
                })
            ));
        }
        e => panic!("unexpected event {:?}", e),
    }
    assert!(matches!(
        session.end(),
        Err(Error::Transport(Fault {
            kind: FaultKind::Timeout,
            ..
        }))
    ));
}
