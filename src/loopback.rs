//! Simulated instrument.
//!
//! [`Loopback`] implements [`UsbHandle`] without touching the bus: control
//! requests are answered from in-memory state, IN transfers complete
//! immediately with a configurable packet pattern, and OUT transfers are
//! recorded. Faults can be injected to drive the fail-fast paths.
//!
//! ```no_run
//! use smu_stream::{loopback::Loopback, Session, SessionConfig};
//!
//! # fn main() -> smu_stream::Result<()> {
//! let session = Session::with_config(SessionConfig::default().hotplug(false))?;
//! session.attach_handle(Loopback::high_rate("SIM0001"))?;
//! session.configure(0)?;
//! session.run(1000)?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
    time::Duration,
};

use log::debug;
use nusb::transfer::{Control, TransferError};

use crate::{
    error::Result,
    usb::{Completion, Descriptor, TransferQueue, UsbHandle},
};

/// Bytes of OUT payload kept for inspection.
const OUT_CAPTURE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub device_to_host: bool,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Host-to-device payload; empty for IN requests.
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    hw_version: String,
    fw_version: String,
    min_per: u8,
    eeprom: Vec<u8>,
    input: Vec<u8>,
    hold: bool,
    fail_submit: Option<TransferError>,
    fail_completion: Option<TransferError>,
    disconnected: bool,
    claimed: bool,
    alt_setting: u8,
    sof: u16,
    overcurrent: u8,
    controls: Vec<ControlRecord>,
    out_data: Vec<u8>,
    out_transfers: usize,
    in_transfers: usize,
    wakers: Vec<Waker>,
}

impl State {
    fn wake_all(&mut self) {
        for w in self.wakers.drain(..) {
            w.wake();
        }
    }
}

/// Cloneable handle to one simulated instrument; clones share state, so a
/// test can keep one to inspect or inject faults after handing another to a
/// session.
#[derive(Clone)]
pub struct Loopback {
    descriptor: Descriptor,
    state: Arc<Mutex<State>>,
}

impl Loopback {
    fn new(vendor_id: u16, product_id: u16, serial: &str, hw: &str, fw: &str) -> Self {
        Loopback {
            descriptor: Descriptor {
                vendor_id,
                product_id,
                serial: serial.to_string(),
            },
            state: Arc::new(Mutex::new(State {
                hw_version: hw.to_string(),
                fw_version: fw.to_string(),
                min_per: 50,
                sof: 0x1234,
                ..Default::default()
            })),
        }
    }

    pub fn high_rate(serial: &str) -> Self {
        Self::new(0x064b, 0x784c, serial, "F", "2.17")
    }

    pub fn low_rate(serial: &str) -> Self {
        Self::new(0x59e3, 0xcee1, serial, "cee-1.0", "1.2")
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_firmware(self, fw: &str) -> Self {
        self.lock().fw_version = fw.to_string();
        self
    }

    /// Pattern repeated across every IN transfer.
    pub fn set_input_packet(&self, packet: Vec<u8>) {
        self.lock().input = packet;
    }

    /// Withhold completions until released.
    pub fn set_hold(&self, hold: bool) {
        let mut st = self.lock();
        st.hold = hold;
        if !hold {
            st.wake_all();
        }
    }

    pub fn fail_next_submit(&self, error: TransferError) {
        self.lock().fail_submit = Some(error);
    }

    pub fn fail_next_completion(&self, error: TransferError) {
        let mut st = self.lock();
        st.fail_completion = Some(error);
        st.wake_all();
    }

    /// Every pending and future transfer fails with `Disconnected`.
    pub fn disconnect(&self) {
        let mut st = self.lock();
        st.disconnected = true;
        st.wake_all();
    }

    pub fn set_eeprom(&self, data: Vec<u8>) {
        self.lock().eeprom = data;
    }

    pub fn eeprom(&self) -> Vec<u8> {
        self.lock().eeprom.clone()
    }

    pub fn set_overcurrent(&self, status: u8) {
        self.lock().overcurrent = status;
    }

    pub fn controls(&self) -> Vec<ControlRecord> {
        self.lock().controls.clone()
    }

    pub fn out_data(&self) -> Vec<u8> {
        self.lock().out_data.clone()
    }

    pub fn out_transfers(&self) -> usize {
        self.lock().out_transfers
    }

    pub fn in_transfers(&self) -> usize {
        self.lock().in_transfers
    }

    pub fn is_claimed(&self) -> bool {
        self.lock().claimed
    }

    pub fn alt_setting(&self) -> u8 {
        self.lock().alt_setting
    }

    fn reply(st: &State, control: &Control) -> Vec<u8> {
        match (control.request, control.index) {
            (0x00, 0) => st.hw_version.as_bytes().to_vec(),
            (0x00, 1) => st.fw_version.as_bytes().to_vec(),
            (0x00, 2) => b"loopback".to_vec(),
            (0x00, 0xff) => {
                let mut parts = st.fw_version.split('.').map(|p| p.parse::<u8>().unwrap_or(0));
                let major = parts.next().unwrap_or(0);
                let minor = parts.next().unwrap_or(0);
                vec![major, minor, 0, 250, st.min_per]
            }
            (0x01, _) | (0xE0, _) => st.eeprom.clone(),
            (0x6F, _) => st.sof.to_le_bytes().to_vec(),
            (0x17, _) => vec![st.overcurrent],
            _ => Vec::new(),
        }
    }

    fn queue(&self, device_to_host: bool) -> Box<dyn TransferQueue> {
        Box::new(LoopbackQueue {
            state: self.state.clone(),
            device_to_host,
            pending: VecDeque::new(),
            cancelled: 0,
            waker: None,
        })
    }
}

impl UsbHandle for Loopback {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn control_in(
        &self,
        control: Control,
        data: &mut [u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        let mut st = self.lock();
        if st.disconnected {
            return Err(TransferError::Disconnected);
        }
        st.controls.push(ControlRecord {
            device_to_host: true,
            request: control.request,
            value: control.value,
            index: control.index,
            data: Vec::new(),
        });
        let reply = Self::reply(&st, &control);
        let n = reply.len().min(data.len());
        data[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn control_out(
        &self,
        control: Control,
        data: &[u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        let mut st = self.lock();
        if st.disconnected {
            return Err(TransferError::Disconnected);
        }
        st.controls.push(ControlRecord {
            device_to_host: false,
            request: control.request,
            value: control.value,
            index: control.index,
            data: data.to_vec(),
        });
        if control.request == 0x02 {
            st.eeprom = data.to_vec();
        }
        Ok(data.len())
    }

    fn claim(&self, _interface: u8) -> Result<()> {
        self.lock().claimed = true;
        Ok(())
    }

    fn release(&self) {
        self.lock().claimed = false;
    }

    fn set_alt_setting(&self, alt: u8) -> Result<()> {
        self.lock().alt_setting = alt;
        Ok(())
    }

    fn open_in(&self, _endpoint: u8) -> Result<Box<dyn TransferQueue>> {
        Ok(self.queue(true))
    }

    fn open_out(&self, _endpoint: u8) -> Result<Box<dyn TransferQueue>> {
        Ok(self.queue(false))
    }
}

struct LoopbackQueue {
    state: Arc<Mutex<State>>,
    device_to_host: bool,
    pending: VecDeque<Vec<u8>>,
    cancelled: usize,
    waker: Option<Waker>,
}

impl LoopbackQueue {
    fn complete(&mut self, status: std::result::Result<(), TransferError>) -> Poll<Completion> {
        match self.pending.pop_front() {
            Some(data) => Poll::Ready(Completion { data, status }),
            None => Poll::Pending,
        }
    }
}

impl TransferQueue for LoopbackQueue {
    fn submit(&mut self, buf: Vec<u8>) -> std::result::Result<(), TransferError> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.disconnected {
            return Err(TransferError::Disconnected);
        }
        if let Some(e) = st.fail_submit.take() {
            debug!("loopback: failing submission with {}", e);
            return Err(e);
        }
        drop(st);
        self.pending.push_back(buf);
        if let Some(w) = self.waker.take() {
            w.wake();
        }
        Ok(())
    }

    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Completion> {
        if self.pending.is_empty() {
            self.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if self.cancelled > 0 {
            self.cancelled -= 1;
            return self.complete(Err(TransferError::Cancelled));
        }

        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.disconnected {
            drop(st);
            return self.complete(Err(TransferError::Disconnected));
        }
        if let Some(e) = st.fail_completion.take() {
            drop(st);
            return self.complete(Err(e));
        }
        if st.hold {
            st.wakers.push(cx.waker().clone());
            return Poll::Pending;
        }

        let Some(mut data) = self.pending.pop_front() else {
            return Poll::Pending;
        };
        if self.device_to_host {
            st.in_transfers += 1;
            if st.input.is_empty() {
                data.fill(0);
            } else {
                let pattern = st.input.clone();
                for (b, p) in data.iter_mut().zip(pattern.iter().cycle()) {
                    *b = *p;
                }
            }
        } else {
            st.out_transfers += 1;
            let room = OUT_CAPTURE_LIMIT.saturating_sub(st.out_data.len());
            let keep = data.len().min(room);
            st.out_data.extend_from_slice(&data[..keep]);
            data.clear();
        }
        Poll::Ready(Completion {
            data,
            status: Ok(()),
        })
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn cancel_all(&mut self) {
        self.cancelled = self.pending.len();
        if let Some(w) = self.waker.take() {
            w.wake();
        }
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.wake_all();
    }
}
