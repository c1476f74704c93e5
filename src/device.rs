//! Family-agnostic instrument façade.
//!
//! A [`Device`] owns the transport handle, the per-channel [`Signal`]s, the
//! calibration table and, while streaming, one [`TransferPool`] per
//! direction. Everything the background thread mutates lives behind a
//! single state lock.

use std::{
    path::Path,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, info, warn};
use nusb::transfer::TransferError;

use crate::{
    calibration::CalibrationTable,
    codec::{self, Codec, Counters, PacketLayout, StreamIo, Timing},
    error::{Error, Fault, FaultKind, Result},
    session::SessionConfig,
    signal::{Mode, Quantity, Signal},
    transfer::{TransferPool, packets_per_transfer},
    usb::{CONTROL_TIMEOUT, Family, UsbHandle, control_from_request_type, family_of},
};

/// Decoded `[va, ia, vb, ib]` tuple.
pub type Sample = [f32; 4];

const INTERFACE: u8 = 0;

/// Pool geometry computed by [`Device::configure`], applied when a run starts.
#[derive(Debug, Clone, Copy)]
struct PoolPlan {
    transfers: usize,
    in_packets: usize,
    out_packets: usize,
}

struct Pools {
    input: TransferPool,
    output: TransferPool,
    in_packets: usize,
}

struct DeviceState {
    codec: Codec,
    signals: [[Signal; 2]; 2],
    modes: [Mode; 2],
    calibration: CalibrationTable,
    plan: Option<PoolPlan>,
    timing: Option<Timing>,
    pools: Option<Pools>,
    counters: Counters,
    streaming: bool,
    cancelling: bool,
    queue: Sender<Sample>,
}

impl DeviceState {
    fn io<'a>(&'a mut self, overflow: &'a AtomicBool) -> (&'a mut Codec, StreamIo<'a>) {
        (
            &mut self.codec,
            StreamIo {
                signals: &mut self.signals,
                modes: self.modes,
                calibration: &self.calibration,
                counters: &mut self.counters,
                queue: &self.queue,
                overflow,
            },
        )
    }
}

/// What one pass over a device's completion queues observed.
#[derive(Debug, Default)]
pub(crate) struct PollReport {
    /// IN packets decoded.
    pub packets: usize,
    pub fault: Option<Fault>,
    /// The device finished streaming: no transfer is in flight any more.
    pub drained: bool,
}

pub struct Device {
    handle: Box<dyn UsbHandle>,
    family: Family,
    serial: String,
    hw_version: String,
    fw_version: String,
    state: Mutex<DeviceState>,
    reader: Mutex<Receiver<Sample>>,
    overflow: AtomicBool,
    /// Samples decoded in the current run, readable without the state lock.
    received: AtomicU64,
    gone: AtomicBool,
    claimed: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("family", &self.family)
            .field("serial", &self.serial)
            .field("hw_version", &self.hw_version)
            .field("fw_version", &self.fw_version)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Identify the instrument behind `handle` and build its codec. The
    /// interface is not claimed until the device is bound to a session.
    pub fn open(handle: Box<dyn UsbHandle>) -> Result<Self> {
        let desc = handle.descriptor().clone();
        let family = family_of(desc.vendor_id, desc.product_id).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unsupported device {:04x}:{:04x}",
                desc.vendor_id, desc.product_id
            ))
        })?;
        let hw_version = codec::read_string(handle.as_ref(), 0)?;
        let fw_version = codec::read_string(handle.as_ref(), 1)?;
        info!(
            "{} device {}: hardware {}, firmware {}",
            family.name(),
            desc.serial,
            hw_version,
            fw_version
        );

        let codec = Codec::open(family, handle.as_ref(), &fw_version);
        let voltage = codec.signal_info(Quantity::Voltage);
        let current = codec.signal_info(Quantity::Current);
        let (queue, reader) = bounded(SessionConfig::default().queue_size);
        Ok(Device {
            family,
            serial: desc.serial,
            hw_version,
            fw_version,
            state: Mutex::new(DeviceState {
                codec,
                signals: [
                    [Signal::new(voltage), Signal::new(current)],
                    [Signal::new(voltage), Signal::new(current)],
                ],
                modes: [Mode::Disabled; 2],
                calibration: CalibrationTable::default(),
                plan: None,
                timing: None,
                pools: None,
                counters: Counters::default(),
                streaming: false,
                cancelling: false,
                queue,
            }),
            reader: Mutex::new(reader),
            handle,
            overflow: AtomicBool::new(false),
            received: AtomicU64::new(0),
            gone: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn hw_version(&self) -> &str {
        &self.hw_version
    }

    pub fn fw_version(&self) -> &str {
        &self.fw_version
    }

    pub fn fwver_sem(&self) -> [u32; 3] {
        codec::fwver_sem(&self.fw_version)
    }

    pub(crate) fn handle(&self) -> &dyn UsbHandle {
        self.handle.as_ref()
    }

    /// Sample rate used when a session is configured with rate 0.
    pub fn default_rate(&self) -> u32 {
        self.state().codec.default_rate()
    }

    pub fn layout(&self) -> PacketLayout {
        self.state().codec.layout()
    }

    /// Run `f` on the signal of `quantity` on `channel` (0 = A, 1 = B).
    pub fn with_signal<R>(
        &self,
        channel: usize,
        quantity: Quantity,
        f: impl FnOnce(&mut Signal) -> R,
    ) -> Result<R> {
        check_channel(channel)?;
        let mut st = self.state();
        Ok(f(&mut st.signals[channel][quantity as usize]))
    }

    /// Latest measured value of a signal.
    pub fn measure_instantaneous(&self, channel: usize, quantity: Quantity) -> Result<f32> {
        self.with_signal(channel, quantity, |s| s.measure_instantaneous())
    }

    pub fn mode(&self, channel: usize) -> Result<Mode> {
        check_channel(channel)?;
        Ok(self.state().modes[channel])
    }

    pub fn set_mode(&self, channel: usize, mode: Mode) -> Result<()> {
        check_channel(channel)?;
        let mut st = self.state();
        if st.streaming {
            return Err(Error::Busy);
        }
        if self.claimed.load(Ordering::Relaxed) {
            st.codec.set_mode(self.handle(), channel, mode)?;
        }
        debug!("{}: channel {} mode {:?}", self.serial, channel, mode);
        st.modes[channel] = mode;
        Ok(())
    }

    pub fn calibration(&self) -> CalibrationTable {
        self.state().calibration.clone()
    }

    /// Reload calibration from the device. Returns false if the stored record
    /// failed validation and defaults are now in use.
    pub fn read_calibration(&self) -> Result<bool> {
        let mut st = self.state();
        let (table, valid) = st.codec.read_calibration(self.handle())?;
        st.calibration = table;
        Ok(valid)
    }

    /// Persist a calibration file to the device, or defaults with `None`.
    /// A file that does not parse leaves both the device and the in-memory
    /// table untouched.
    pub fn write_calibration(&self, path: Option<&Path>) -> Result<()> {
        let table = match path {
            Some(p) => CalibrationTable::load(p)?,
            None => CalibrationTable::default(),
        };
        let mut st = self.state();
        if st.streaming {
            return Err(Error::Busy);
        }
        st.codec.write_calibration(self.handle(), &table)?;
        info!("{}: calibration written", self.serial);
        st.calibration = table;
        Ok(())
    }

    /// Raw control transfer from the device. `request_type` is a standard
    /// `bmRequestType` with the direction bit set.
    pub fn ctrl_transfer_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let (device_to_host, control) =
            control_from_request_type(request_type, request, value, index)?;
        if !device_to_host {
            return Err(Error::InvalidArgument(
                "bmRequestType is host-to-device".into(),
            ));
        }
        self.handle
            .control_in(control, data, timeout.unwrap_or(CONTROL_TIMEOUT))
            .map_err(Error::control)
    }

    pub fn ctrl_transfer_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let (device_to_host, control) =
            control_from_request_type(request_type, request, value, index)?;
        if device_to_host {
            return Err(Error::InvalidArgument(
                "bmRequestType is device-to-host".into(),
            ));
        }
        self.handle
            .control_out(control, data, timeout.unwrap_or(CONTROL_TIMEOUT))
            .map_err(Error::control)
    }

    pub fn set_led(&self, leds: u8) -> Result<()> {
        match &self.state().codec {
            Codec::HighRate(c) => c.set_led(self.handle(), leds),
            Codec::LowRate(_) => Err(Error::Unsupported("low-rate devices")),
        }
    }

    /// Program the current limit of a low-rate device in mA (200, 400 or 2000).
    pub fn set_current_limit(&self, limit_ma: u32) -> Result<()> {
        let mut st = self.state();
        if st.streaming {
            return Err(Error::Busy);
        }
        match &mut st.codec {
            Codec::LowRate(c) => c.set_current_limit(self.handle(), limit_ma),
            Codec::HighRate(_) => Err(Error::Unsupported("high-rate devices")),
        }
    }

    /// Whether the last run ended with an overcurrent alert.
    pub fn overcurrent(&self) -> bool {
        match &self.state().codec {
            Codec::HighRate(c) => c.overcurrent(),
            Codec::LowRate(_) => false,
        }
    }

    /// Pop up to `n` buffered samples. With a timeout, wait until `n`
    /// samples are available or the timeout passes; without one, return
    /// whatever is queued.
    pub fn read(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<Sample>> {
        if self.overflow.swap(false, Ordering::Relaxed) {
            return Err(Error::Overflow);
        }
        let reader = self.reader();
        let mut out: Vec<Sample> = reader.try_iter().take(n).collect();
        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            while out.len() < n {
                match reader.recv_deadline(deadline) {
                    Ok(s) => out.push(s),
                    Err(_) => break,
                }
            }
        }
        Ok(out)
    }

    /// Samples waiting to be read.
    pub fn queued(&self) -> usize {
        self.reader().len()
    }

    /// Discard queued samples and clear the overflow flag.
    pub fn flush(&self) {
        self.reader().try_iter().for_each(drop);
        self.overflow.store(false, Ordering::Relaxed);
    }

    fn reader(&self) -> Receiver<Sample> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_received(&self) {
        self.received.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_gone(&self) {
        self.gone.store(true, Ordering::Relaxed);
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Relaxed)
    }

    /// Claim the interface, reset the hardware and load its calibration.
    pub(crate) fn claim(&self) -> Result<()> {
        if self.claimed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.handle.claim(INTERFACE)?;
        let mut st = self.state();
        st.codec.reset(self.handle())?;
        let (table, valid) = st.codec.read_calibration(self.handle())?;
        if !valid {
            warn!("{}: using default calibration", self.serial);
        }
        st.calibration = table;
        Ok(())
    }

    pub(crate) fn release(&self) {
        if self.claimed.swap(false, Ordering::Relaxed) {
            debug!("{}: releasing interface", self.serial);
            self.handle.release();
        }
    }

    /// Apply a sample rate (0 for the default) and size the transfer pools
    /// and the read queue. Returns the rate after hardware rounding.
    pub(crate) fn configure(&self, rate: u32, config: &SessionConfig) -> Result<u32> {
        let mut st = self.state();
        if st.streaming {
            return Err(Error::Busy);
        }
        let timing = st.codec.configure(rate);
        let layout = st.codec.layout();
        let transfers = config.transfers.max(1);
        let packets = packets_per_transfer(
            config.buffer_time,
            timing.sample_period,
            layout.samples_per_packet,
            transfers,
        );
        st.plan = Some(PoolPlan {
            transfers,
            in_packets: packets,
            out_packets: packets,
        });
        st.timing = Some(timing);

        let (queue, reader) = bounded(config.queue_size.max(1));
        st.queue = queue;
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = reader;
        self.overflow.store(false, Ordering::Relaxed);

        info!(
            "{}: {} sps, {} transfers of {} packets",
            self.serial, timing.rate, transfers, packets
        );
        Ok(timing.rate)
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.state().timing.map(|t| t.rate)
    }

    /// Power the channels up in their configured modes.
    pub(crate) fn on(&self) -> Result<()> {
        let mut st = self.state();
        let modes = st.modes;
        st.codec.on(self.handle(), modes)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.state().codec.sync(self.handle())
    }

    /// Stop sampling and return the channels to high impedance.
    pub(crate) fn off(&self) -> Result<()> {
        let mut st = self.state();
        st.pools = None;
        st.streaming = false;
        if self.is_gone() {
            return Ok(());
        }
        st.codec.off(self.handle())
    }

    /// Open both endpoints, fill them with the first transfers and start the
    /// hardware timer. `samples` per channel, 0 for continuous.
    ///
    /// The device counts as streaming from here on even if a submission
    /// fails; it finishes once whatever was submitted has completed.
    pub(crate) fn start_run(&self, samples: u64) -> Result<()> {
        let mut st = self.state();
        let plan = st
            .plan
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not configured", self.serial)))?;
        let layout = st.codec.layout();
        let input = TransferPool::new(
            "in",
            self.handle.open_in(layout.ep_in)?,
            plan.transfers,
            plan.in_packets * layout.in_packet_len,
            layout.transfer_timeout,
        );
        let output = TransferPool::new(
            "out",
            self.handle.open_out(layout.ep_out)?,
            plan.transfers,
            plan.out_packets * layout.out_packet_len,
            layout.transfer_timeout,
        );
        st.pools = Some(Pools {
            input,
            output,
            in_packets: plan.in_packets,
        });
        st.counters = Counters::start(samples);
        st.streaming = true;
        st.cancelling = false;
        self.received.store(0, Ordering::Relaxed);
        debug!("{}: starting run of {} samples", self.serial, samples);

        self.fill_out(&mut st).map_err(|kind| Fault {
            tag: "submit_out",
            kind,
        })?;
        self.fill_in(&mut st, layout).map_err(|kind| Fault {
            tag: "submit_in",
            kind,
        })?;
        st.codec.run(self.handle())
    }

    /// Submit every idle IN buffer the run still needs.
    fn fill_in(
        &self,
        st: &mut DeviceState,
        layout: PacketLayout,
    ) -> std::result::Result<(), FaultKind> {
        let DeviceState {
            pools, counters, ..
        } = st;
        let Some(pools) = pools else { return Ok(()) };
        while counters.wants_in() {
            let Some(buf) = pools.input.take_idle() else {
                break;
            };
            pools.input.submit(buf).map_err(FaultKind::Transfer)?;
            counters.requested += (pools.in_packets * layout.samples_per_packet) as u64;
        }
        Ok(())
    }

    /// Encode and submit every idle OUT buffer the run still needs.
    fn fill_out(&self, st: &mut DeviceState) -> std::result::Result<(), FaultKind> {
        loop {
            if !st.counters.wants_out() {
                return Ok(());
            }
            let Some(mut buf) = st.pools.as_mut().and_then(|p| p.output.take_idle()) else {
                return Ok(());
            };
            let packet_len = st.codec.layout().out_packet_len;
            let (codec, mut io) = st.io(&self.overflow);
            for packet in buf.chunks_exact_mut(packet_len) {
                codec.encode(packet, &mut io);
            }
            if let Some(pools) = st.pools.as_mut() {
                pools.output.submit(buf).map_err(FaultKind::Transfer)?;
            }
        }
    }

    /// Request cancellation of every in-flight transfer. Completions still
    /// arrive and are collected by [`Device::poll_transfers`].
    pub(crate) fn cancel(&self) {
        let mut st = self.state();
        if !st.streaming || st.cancelling {
            return;
        }
        st.cancelling = true;
        if let Some(pools) = st.pools.as_mut() {
            pools.input.cancel();
            pools.output.cancel();
        }
    }

    /// Service both completion queues: decode IN data, refill OUT buffers
    /// and resubmit while the run lasts. At most one pool's worth of
    /// completions per direction is handled per call.
    pub(crate) fn poll_transfers(&self, cx: &mut Context<'_>) -> PollReport {
        let mut report = PollReport::default();
        let mut st = self.state();
        if !st.streaming {
            return report;
        }
        let layout = st.codec.layout();
        let halt = st.cancelling || self.is_gone();

        let batch = st.pools.as_ref().map_or(0, |p| p.input.size());
        for _ in 0..batch {
            let Some(Poll::Ready(c)) = st.pools.as_mut().map(|p| p.input.poll_complete(cx)) else {
                break;
            };
            match c.status {
                Ok(()) => {
                    let (codec, mut io) = st.io(&self.overflow);
                    for packet in c.data.chunks_exact(layout.in_packet_len) {
                        codec.decode(packet, &mut io);
                        report.packets += 1;
                    }
                }
                Err(TransferError::Cancelled) => {}
                Err(e) => {
                    report.fault.get_or_insert(Fault {
                        tag: "in_completion",
                        kind: FaultKind::Transfer(e),
                    });
                }
            }
            if let Some(pools) = st.pools.as_mut() {
                pools.input.recycle(c.data);
            }
        }

        let batch = st.pools.as_ref().map_or(0, |p| p.output.size());
        for _ in 0..batch {
            let Some(Poll::Ready(c)) = st.pools.as_mut().map(|p| p.output.poll_complete(cx)) else {
                break;
            };
            match c.status {
                Ok(()) | Err(TransferError::Cancelled) => {}
                Err(e) => {
                    report.fault.get_or_insert(Fault {
                        tag: "out_completion",
                        kind: FaultKind::Transfer(e),
                    });
                }
            }
            if let Some(pools) = st.pools.as_mut() {
                pools.output.recycle(c.data);
            }
        }

        if !halt && report.fault.is_none() {
            if let Err(kind) = self.fill_out(&mut st) {
                report.fault = Some(Fault {
                    tag: "submit_out",
                    kind,
                });
            } else if let Err(kind) = self.fill_in(&mut st, layout) {
                report.fault = Some(Fault {
                    tag: "submit_in",
                    kind,
                });
            }
        }

        if let Some(pools) = st.pools.as_ref() {
            let now = Instant::now();
            if pools.input.stalled(now) {
                report.fault.get_or_insert(Fault {
                    tag: "in_watchdog",
                    kind: FaultKind::Timeout,
                });
            } else if pools.output.stalled(now) {
                report.fault.get_or_insert(Fault {
                    tag: "out_watchdog",
                    kind: FaultKind::Timeout,
                });
            }
        }

        self.received.store(st.counters.received, Ordering::Relaxed);
        let idle = st
            .pools
            .as_ref()
            .is_none_or(|p| p.input.active() == 0 && p.output.active() == 0);
        if idle {
            debug!(
                "{}: run drained after {} samples",
                self.serial, st.counters.received
            );
            st.streaming = false;
            report.drained = true;
        }
        report
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_channel(channel: usize) -> Result<()> {
    if channel > 1 {
        return Err(Error::InvalidArgument(format!("no channel {}", channel)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::Loopback;
    use std::task::Waker;

    fn open(dev: &Loopback) -> Device {
        let device = Device::open(Box::new(dev.clone())).unwrap();
        device.claim().unwrap();
        device
    }

    fn drain(device: &Device) -> (usize, Option<Fault>) {
        let mut cx = Context::from_waker(Waker::noop());
        let mut packets = 0;
        for _ in 0..10_000 {
            let report = device.poll_transfers(&mut cx);
            packets += report.packets;
            if report.fault.is_some() || report.drained {
                return (packets, report.fault);
            }
        }
        panic!("device never drained");
    }

    #[test]
    fn identity_from_version_strings() {
        let dev = Loopback::high_rate("SIM0001");
        let device = open(&dev);
        assert_eq!(device.serial(), "SIM0001");
        assert_eq!(device.family(), Family::HighRate);
        assert_eq!(device.hw_version(), "F");
        assert_eq!(device.fwver_sem(), [2, 17, 0]);
        assert_eq!(device.default_rate(), 100_000);
        assert!(dev.is_claimed());
        drop(device);
        assert!(!dev.is_claimed());
    }

    #[test]
    fn channel_bounds() {
        let device = open(&Loopback::high_rate("SIM"));
        assert!(matches!(device.set_mode(2, Mode::Svmi), Err(Error::InvalidArgument(_))));
        assert!(device.mode(1).is_ok());
    }

    #[test]
    fn bounded_run_delivers_exact_count() {
        let dev = Loopback::high_rate("SIM");
        let device = open(&dev);
        device.set_mode(0, Mode::Svmi).unwrap();
        device
            .with_signal(0, Quantity::Voltage, |s| s.source_constant(2.5))
            .unwrap();
        assert_eq!(device.configure(0, &SessionConfig::default()).unwrap(), 100_000);
        device.on().unwrap();
        device.start_run(1000).unwrap();
        assert!(device.is_streaming());

        let (packets, fault) = drain(&device);
        assert!(fault.is_none());
        assert!(packets >= 4);
        assert!(!device.is_streaming());
        assert_eq!(device.read(2000, None).unwrap().len(), 1000);
        assert!(device.received() >= 1000);

        // 2.5 V on channel A for every sourced slot
        let out = dev.out_data();
        assert_eq!(&out[..2], &32768u16.to_be_bytes());
        device.off().unwrap();
    }

    #[test]
    fn busy_while_streaming() {
        let dev = Loopback::high_rate("SIM");
        dev.set_hold(true);
        let device = open(&dev);
        device.configure(0, &SessionConfig::default()).unwrap();
        device.start_run(0).unwrap();
        assert!(matches!(device.set_mode(0, Mode::Simv), Err(Error::Busy)));
        assert!(matches!(
            device.configure(0, &SessionConfig::default()),
            Err(Error::Busy)
        ));

        device.cancel();
        let (_, fault) = drain(&device);
        assert!(fault.is_none());
        assert!(device.set_mode(0, Mode::Simv).is_ok());
    }

    #[test]
    fn completion_error_is_reported() {
        let dev = Loopback::high_rate("SIM");
        let device = open(&dev);
        device.configure(0, &SessionConfig::default()).unwrap();
        device.start_run(0).unwrap();
        dev.fail_next_completion(TransferError::Stall);
        let (_, fault) = drain(&device);
        assert_eq!(
            fault,
            Some(Fault {
                tag: "in_completion",
                kind: FaultKind::Transfer(TransferError::Stall),
            })
        );
    }

    #[test]
    fn read_reports_overflow_once() {
        let dev = Loopback::high_rate("SIM");
        let device = open(&dev);
        let config = SessionConfig {
            queue_size: 100,
            ..Default::default()
        };
        device.configure(0, &config).unwrap();
        device.start_run(1000).unwrap();
        drain(&device);
        assert!(matches!(device.read(10, None), Err(Error::Overflow)));
        assert_eq!(device.read(1000, None).unwrap().len(), 100);
        assert!(device.read(10, Some(Duration::from_millis(5))).unwrap().is_empty());
    }

    #[test]
    fn timed_read_returns_what_arrived() {
        let dev = Loopback::high_rate("SIM");
        let device = open(&dev);
        device.configure(0, &SessionConfig::default()).unwrap();
        device.start_run(300).unwrap();
        drain(&device);
        assert_eq!(device.queued(), 300);
        assert_eq!(device.read(200, Some(Duration::from_secs(1))).unwrap().len(), 200);

        let start = Instant::now();
        let rest = device.read(200, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(rest.len(), 100);
        assert!(start.elapsed() >= Duration::from_millis(20));

        device.start_run(50).unwrap();
        drain(&device);
        device.flush();
        assert_eq!(device.queued(), 0);
    }

    #[test]
    fn unconfigured_run_is_rejected() {
        let device = open(&Loopback::high_rate("SIM"));
        assert!(matches!(device.start_run(10), Err(Error::InvalidArgument(_))));
        assert!(!device.is_streaming());
    }

    #[test]
    fn raw_control_transfers() {
        let dev = Loopback::high_rate("SIM");
        let device = open(&dev);
        let mut buf = [0u8; 64];
        let n = device
            .ctrl_transfer_in(0xc0, 0x00, 0, 1, &mut buf, None)
            .unwrap();
        assert_eq!(&buf[..n], b"2.17");
        assert!(device.ctrl_transfer_in(0x40, 0x00, 0, 1, &mut buf, None).is_err());
        device.ctrl_transfer_out(0x40, 0x03, 2, 0, &[], None).unwrap();
        assert_eq!(dev.controls().last().map(|c| c.request), Some(0x03));
    }

    #[test]
    fn low_rate_capabilities() {
        let device = open(&Loopback::low_rate("SIM"));
        assert!(matches!(device.set_led(1), Err(Error::Unsupported(_))));
        assert!(matches!(
            device.write_calibration(None),
            Err(Error::Unsupported(_))
        ));
        device.set_current_limit(200).unwrap();
        assert!(!device.overcurrent());
    }
}
