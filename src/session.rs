//! Orchestration of bound devices.
//!
//! A [`Session`] owns one background thread that services every streaming
//! device's transfer queues, aggregates progress, and turns the first
//! transport fault of a run into a session-wide cancellation. Callers start
//! and stop runs from their own threads and observe the stream through
//! [`Event`]s or by reading queued samples from the devices.

use std::{
    pin::Pin,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Wake, Waker},
    thread::{self, JoinHandle, Thread},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use futures_lite::Stream;
use log::{debug, error, info, warn};
use nusb::{
    DeviceInfo,
    hotplug::{HotplugEvent, HotplugWatch},
    transfer::TransferError,
};
use thread_priority::{ThreadPriority, set_current_thread_priority};

use crate::{
    device::Device,
    error::{Error, Fault, FaultKind, Result},
    usb::{self, Descriptor, Family, NusbHandle, UsbHandle, family_of},
};

/// Tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transfers kept in flight per direction and device, 4 to 8.
    pub transfers: usize,
    /// Samples in flight per direction, expressed as time.
    pub buffer_time: Duration,
    /// Capacity of each device's read queue in samples.
    pub queue_size: usize,
    /// Slack added to the expected run duration before `end` gives up.
    pub end_margin: Duration,
    /// Longest the I/O thread sleeps without USB activity.
    pub io_tick: Duration,
    /// Watch for devices arriving and leaving.
    pub hotplug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            transfers: 4,
            buffer_time: Duration::from_millis(20),
            queue_size: 100_000,
            end_margin: Duration::from_secs(1),
            io_tick: Duration::from_millis(5),
            hotplug: true,
        }
    }
}

impl SessionConfig {
    pub fn hotplug(mut self, enabled: bool) -> Self {
        self.hotplug = enabled;
        self
    }
}

/// Notifications delivered to [`Session::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Samples per channel acquired by every device of the run so far.
    Progress(u64),
    /// All devices of the run finished streaming. Sent once per run.
    Completion {
        cancelled: bool,
        fault: Option<Fault>,
    },
    /// A supported device was plugged in; it is available, not bound.
    Attached(String),
    /// A bound device was unplugged and removed from the session.
    Detached(String),
}

#[derive(Default)]
struct RunState {
    /// Devices of the current run, from `start` until `end`.
    participants: Vec<Arc<Device>>,
    /// Participants whose transfers have not drained yet.
    streaming: Vec<Arc<Device>>,
    progress: u64,
    fault: Option<Fault>,
    rate: u32,
    target: u64,
}

struct SessionCore {
    config: SessionConfig,
    devices: Mutex<Vec<Arc<Device>>>,
    available: Mutex<Vec<(DeviceInfo, Family)>>,
    run: Mutex<RunState>,
    done: Condvar,
    cancelled: AtomicBool,
    shutdown: AtomicBool,
    listeners: Mutex<Vec<Sender<Event>>>,
    io_thread: OnceLock<Thread>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

impl SessionCore {
    fn run(&self) -> MutexGuard<'_, RunState> {
        lock(&self.run)
    }

    fn emit(&self, event: Event) {
        lock(&self.listeners).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn wake_io(&self) {
        if let Some(t) = self.io_thread.get() {
            t.unpark();
        }
    }

    /// Fail-fast path: the first fault of a run is kept and cancels the
    /// whole session. Faults observed while already cancelling are dropped.
    fn handle_error(&self, fault: Fault) {
        if self.cancelled.load(Ordering::Acquire) {
            debug!("ignoring {} while cancelling", fault);
            return;
        }
        {
            let mut run = self.run();
            if run.fault.is_some() {
                return;
            }
            error!("streaming fault at {}", fault);
            run.fault = Some(fault);
        }
        self.cancel();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let streaming = self.run().streaming.clone();
        for device in streaming {
            device.cancel();
        }
        self.wake_io();
    }

    fn progress(&self) {
        let mut run = self.run();
        let Some(mut min) = run.participants.iter().map(|d| d.received()).min() else {
            return;
        };
        if run.target > 0 {
            min = min.min(run.target);
        }
        if min > run.progress {
            run.progress = min;
            drop(run);
            self.emit(Event::Progress(min));
        }
    }

    /// Publish a new run. Sample counters of the previous run are cleared
    /// before any device becomes visible to `progress`.
    fn begin(&self, devices: &[Arc<Device>], samples: u64) {
        for device in devices {
            device.reset_received();
        }
        let mut run = self.run();
        run.participants = devices.to_vec();
        run.streaming = devices.to_vec();
        run.progress = 0;
        run.fault = None;
        run.target = samples;
        self.cancelled.store(false, Ordering::Release);
    }

    /// A device drained its last transfer.
    fn completion(&self, device: &Arc<Device>) {
        let mut run = self.run();
        let before = run.streaming.len();
        run.streaming.retain(|d| !Arc::ptr_eq(d, device));
        if run.streaming.len() == before || !run.streaming.is_empty() {
            return;
        }
        let event = Event::Completion {
            cancelled: self.cancelled.load(Ordering::Acquire),
            fault: run.fault,
        };
        info!("run complete after {} samples", run.progress);
        // sent under the run lock so that `end` never returns ahead of it
        self.emit(event);
        drop(run);
        self.done.notify_all();
    }

    fn hotplug(&self, event: HotplugEvent) {
        match event {
            HotplugEvent::Connected(info) => {
                let Some(family) = family_of(info.vendor_id(), info.product_id()) else {
                    return;
                };
                let serial = info.serial_number().unwrap_or_default().to_string();
                info!("{} device {} attached", family.name(), serial);
                {
                    let mut available = lock(&self.available);
                    if !available.iter().any(|(i, _)| i.id() == info.id()) {
                        available.push((info, family));
                    }
                }
                self.emit(Event::Attached(serial));
            }
            HotplugEvent::Disconnected(id) => {
                lock(&self.available).retain(|(i, _)| i.id() != id);
                let device = {
                    let mut devices = lock(&self.devices);
                    devices
                        .iter()
                        .position(|d| d.handle().device_id() == Some(id))
                        .map(|i| devices.remove(i))
                };
                if let Some(device) = device {
                    self.detach(&device);
                }
            }
        }
    }

    /// Forget a bound device that disappeared from the bus. A running
    /// stream is failed; the device itself lives on until its transfers
    /// drained and the run ended.
    fn detach(&self, device: &Arc<Device>) {
        warn!("device {} detached", device.serial());
        device.mark_gone();
        if device.is_streaming() {
            self.handle_error(Fault {
                tag: "hotplug",
                kind: FaultKind::Transfer(TransferError::Disconnected),
            });
        }
        self.emit(Event::Detached(device.serial().to_string()));
    }
}

fn io_loop(core: Arc<SessionCore>) {
    if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
        warn!("could not raise I/O thread priority: {:?}", e);
    }
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);

    let mut watch: Option<Pin<Box<HotplugWatch>>> = None;
    if core.config.hotplug {
        match nusb::watch_devices() {
            Ok(w) => watch = Some(Box::pin(w)),
            Err(e) => warn!("hotplug unavailable: {}", e),
        }
    }

    while !core.shutdown.load(Ordering::Acquire) {
        let mut busy = false;

        if let Some(w) = watch.as_mut() {
            while let Poll::Ready(Some(event)) = w.as_mut().poll_next(&mut cx) {
                core.hotplug(event);
            }
        }

        let streaming = core.run().streaming.clone();
        for device in &streaming {
            let report = device.poll_transfers(&mut cx);
            if report.packets > 0 {
                busy = true;
                core.progress();
            }
            if let Some(fault) = report.fault {
                core.handle_error(fault);
            }
            if report.drained {
                busy = true;
                core.completion(device);
            }
        }

        if !busy {
            thread::park_timeout(core.config.io_tick);
        }
    }
    debug!("I/O thread exiting");
}

pub struct Session {
    core: Arc<SessionCore>,
    io: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default())
    }

    /// Create a session and spawn its I/O thread.
    pub fn with_config(mut config: SessionConfig) -> Result<Self> {
        if !(4..=8).contains(&config.transfers) {
            warn!("{} transfers per direction, clamping to 4..=8", config.transfers);
            config.transfers = config.transfers.clamp(4, 8);
        }
        let core = Arc::new(SessionCore {
            config,
            devices: Mutex::new(Vec::new()),
            available: Mutex::new(Vec::new()),
            run: Mutex::new(RunState::default()),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            io_thread: OnceLock::new(),
        });
        let io = thread::Builder::new()
            .name("smu-io".into())
            .spawn({
                let core = core.clone();
                move || io_loop(core)
            })
            .map_err(Error::IoError)?;
        let _ = core.io_thread.set(io.thread().clone());
        Ok(Session { core, io: Some(io) })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.core.run().participants.is_empty() {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    /// Enumerate attached devices of a supported family. Returns how many
    /// were found; see [`Session::available`].
    pub fn scan(&self) -> Result<usize> {
        let found = usb::list_supported()?;
        debug!("scan found {} devices", found.len());
        let n = found.len();
        *lock(&self.core.available) = found;
        Ok(n)
    }

    /// Devices found by the last scan or hotplug, bound or not.
    pub fn available(&self) -> Vec<Descriptor> {
        lock(&self.core.available)
            .iter()
            .map(|(info, _)| Descriptor::from_info(info))
            .collect()
    }

    /// Devices waiting in the firmware bootloader. They are never bound.
    pub fn scan_bootloader(&self) -> Result<Vec<Descriptor>> {
        Ok(usb::list_bootloaders()?
            .iter()
            .map(Descriptor::from_info)
            .collect())
    }

    /// Open and bind the available device with `serial`.
    pub fn add(&self, serial: &str) -> Result<Arc<Device>> {
        if let Some(device) = self.get_device(serial) {
            return Ok(device);
        }
        let info = lock(&self.core.available)
            .iter()
            .find(|(info, _)| info.serial_number() == Some(serial))
            .map(|(info, _)| info.clone())
            .ok_or_else(|| Error::DeviceNotFound(serial.to_string()))?;
        self.attach_handle(NusbHandle::open(&info)?)
    }

    /// Bind every available device, skipping ones that fail to open.
    pub fn add_all(&self) -> Result<Vec<Arc<Device>>> {
        let serials: Vec<String> = self.available().into_iter().map(|d| d.serial).collect();
        let mut added = Vec::new();
        for serial in serials {
            match self.add(&serial) {
                Ok(device) => added.push(device),
                Err(Error::Busy) => return Err(Error::Busy),
                Err(e) => warn!("skipping {}: {}", serial, e),
            }
        }
        Ok(added)
    }

    /// Open a device over an arbitrary transport and bind it.
    pub fn attach_handle(&self, handle: impl UsbHandle + 'static) -> Result<Arc<Device>> {
        let device = Arc::new(Device::open(Box::new(handle))?);
        self.attach(device.clone())?;
        Ok(device)
    }

    /// Bind an opened device: claim it, load its calibration and apply the
    /// session's sample rate if one is configured.
    pub fn attach(&self, device: Arc<Device>) -> Result<()> {
        self.ensure_idle()?;
        if self.get_device(device.serial()).is_some() {
            return Err(Error::InvalidArgument(format!(
                "device {} is already bound",
                device.serial()
            )));
        }
        device.claim()?;
        let rate = self.core.run().rate;
        if rate != 0 {
            device.configure(rate, &self.core.config)?;
        }
        info!("bound {} device {}", device.family().name(), device.serial());
        lock(&self.core.devices).push(device);
        Ok(())
    }

    pub fn remove(&self, serial: &str) -> Result<()> {
        self.ensure_idle()?;
        let device = {
            let mut devices = lock(&self.core.devices);
            let i = devices
                .iter()
                .position(|d| d.serial() == serial)
                .ok_or_else(|| Error::DeviceNotFound(serial.to_string()))?;
            devices.remove(i)
        };
        device.release();
        info!("removed device {}", serial);
        Ok(())
    }

    pub fn get_device(&self, serial: &str) -> Option<Arc<Device>> {
        lock(&self.core.devices)
            .iter()
            .find(|d| d.serial() == serial)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        lock(&self.core.devices).clone()
    }

    /// Set the sample rate of every bound device. Rate 0 picks the first
    /// device's default. Returns the rate the hardware will actually use.
    pub fn configure(&self, rate: u32) -> Result<u32> {
        self.ensure_idle()?;
        let devices = self.devices();
        let first = devices
            .first()
            .ok_or_else(|| Error::InvalidArgument("no devices bound".into()))?;
        let rate = if rate == 0 { first.default_rate() } else { rate };
        let mut actual = 0;
        for device in &devices {
            let r = device.configure(rate, &self.core.config)?;
            if actual == 0 {
                actual = r;
            } else if r != actual {
                warn!("{} runs at {} sps instead of {}", device.serial(), r, actual);
            }
        }
        self.core.run().rate = actual;
        Ok(actual)
    }

    /// Configured sample rate, 0 before [`Session::configure`].
    pub fn sample_rate(&self) -> u32 {
        self.core.run().rate
    }

    /// Begin streaming `samples` per channel on every bound device, or
    /// stream until cancelled with 0. Returns once all devices are running.
    ///
    /// If a device fails to start, the run is failed and ended before the
    /// error is returned.
    pub fn start(&self, samples: u64) -> Result<()> {
        let devices = self.devices();
        if devices.is_empty() {
            return Err(Error::InvalidArgument("no devices bound".into()));
        }
        self.ensure_idle()?;
        if self.sample_rate() == 0 {
            self.configure(0)?;
        }

        for device in &devices {
            if let Err(e) = device.on() {
                self.power_down(&devices);
                return Err(e);
            }
        }
        if devices.len() > 1 {
            for device in &devices {
                if let Err(e) = device.sync() {
                    self.power_down(&devices);
                    return Err(e);
                }
            }
        }

        self.core.begin(&devices, samples);
        info!("starting run of {} samples on {} devices", samples, devices.len());

        for device in &devices {
            if let Err(e) = device.start_run(samples) {
                error!("{}: failed to start: {}", device.serial(), e);
                match &e {
                    Error::Transport(fault) => self.core.handle_error(*fault),
                    Error::UsbTransferError(t) => self.core.handle_error(Fault {
                        tag: "start",
                        kind: FaultKind::Transfer(*t),
                    }),
                    _ => self.core.cancel(),
                }
                for d in &devices {
                    if !d.is_streaming() {
                        self.core.completion(d);
                    }
                }
                let _ = self.end();
                return Err(e);
            }
        }
        self.core.wake_io();
        Ok(())
    }

    fn power_down(&self, devices: &[Arc<Device>]) {
        for device in devices {
            if let Err(e) = device.off() {
                warn!("{}: power down failed: {}", device.serial(), e);
            }
        }
    }

    /// Wait for the current run to finish and turn every device off. A
    /// continuous run is cancelled first. Returns the fault that ended the
    /// run, if any.
    pub fn end(&self) -> Result<()> {
        let (target, rate, running) = {
            let run = self.core.run();
            (run.target, run.rate, !run.participants.is_empty())
        };
        if !running {
            return Ok(());
        }
        if target == 0 {
            self.cancel();
        }
        let expected = if target == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(target as f64 / rate.max(1) as f64)
        };
        let margin = self.core.config.end_margin;

        let mut result = Ok(());
        let mut run = self.wait_drained(expected + margin);
        if !run.streaming.is_empty() {
            warn!("run did not finish within {:?}, cancelling", expected + margin);
            drop(run);
            self.cancel();
            run = self.wait_drained(margin);
            if !run.streaming.is_empty() {
                error!("{} devices never drained", run.streaming.len());
                run.streaming.clear();
            }
            result = Err(Error::Timeout);
        }
        let participants = std::mem::take(&mut run.participants);
        let fault = run.fault;
        drop(run);

        self.power_down(&participants);
        match fault {
            Some(fault) => Err(Error::Transport(fault)),
            None => result,
        }
    }

    fn wait_drained(&self, timeout: Duration) -> MutexGuard<'_, RunState> {
        let run = self.core.run();
        let (run, _) = self
            .core
            .done
            .wait_timeout_while(run, timeout, |r| !r.streaming.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        run
    }

    /// `start` followed by `end`.
    pub fn run(&self, samples: u64) -> Result<()> {
        self.start(samples)?;
        self.end()
    }

    /// Stop the current run without waiting. Idempotent.
    pub fn cancel(&self) {
        debug!("cancelling session");
        self.core.cancel();
    }

    /// Whether the current or last run was cancelled.
    pub fn cancelled(&self) -> bool {
        self.core.cancelled.load(Ordering::Acquire)
    }

    /// Devices still streaming.
    pub fn active_devices(&self) -> usize {
        self.core.run().streaming.len()
    }

    /// Whether a run was started and not yet ended.
    pub fn is_running(&self) -> bool {
        self.ensure_idle().is_err()
    }

    /// Receive events from now on. Any number of receivers may subscribe.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        lock(&self.core.listeners).push(tx);
        rx
    }

    /// Drop unread samples of every device.
    pub fn flush(&self) {
        for device in self.devices() {
            device.flush();
        }
    }

    #[cfg(test)]
    fn detach(&self, serial: &str) {
        let device = {
            let mut devices = lock(&self.core.devices);
            devices
                .iter()
                .position(|d| d.serial() == serial)
                .map(|i| devices.remove(i))
        };
        if let Some(device) = device {
            self.core.detach(&device);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.end() {
                warn!("ending run on drop: {}", e);
            }
        }
        self.core.shutdown.store(true, Ordering::Release);
        self.core.wake_io();
        if let Some(io) = self.io.take() {
            if io.join().is_err() {
                error!("I/O thread panicked");
            }
        }
    }
}
