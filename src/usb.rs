//! USB transport seam.
//!
//! Everything the streaming core needs from the bus goes through
//! [`UsbHandle`] (control transfers, interface management, opening bulk
//! queues) and [`TransferQueue`] (one endpoint's asynchronous queue). The
//! production implementation wraps `nusb`; [`crate::loopback`] provides a
//! simulated instrument behind the same traits.

use std::{
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};

use log::{debug, info};
use nusb::{
    DeviceId, DeviceInfo, Interface,
    transfer::{Control, ControlType, Queue, Recipient, RequestBuffer, TransferError},
};

use crate::error::{Error, Result};

/// Hardware family, selected from the VID:PID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// 12-bit, 10 samples per packet, up to 80 ksps.
    LowRate,
    /// 16-bit, 256 samples per packet, up to 100 ksps.
    HighRate,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::LowRate => "low-rate",
            Family::HighRate => "high-rate",
        }
    }
}

pub const SUPPORTED: &[(u16, u16, Family)] = &[
    (0x59e3, 0xcee1, Family::LowRate),
    (0x0456, 0xcee2, Family::HighRate),
    (0x064b, 0x784c, Family::HighRate),
];

/// Devices sitting in the firmware bootloader. Reported, never bound.
pub const BOOTLOADER: &[(u16, u16)] = &[(0x03eb, 0x6124)];

pub fn family_of(vendor_id: u16, product_id: u16) -> Option<Family> {
    SUPPORTED
        .iter()
        .find(|(v, p, _)| *v == vendor_id && *p == product_id)
        .map(|(_, _, f)| *f)
}

pub fn is_bootloader(vendor_id: u16, product_id: u16) -> bool {
    BOOTLOADER
        .iter()
        .any(|(v, p)| *v == vendor_id && *p == product_id)
}

/// Identity read from the device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
}

impl Descriptor {
    pub fn from_info(info: &DeviceInfo) -> Self {
        Descriptor {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            serial: info.serial_number().unwrap_or_default().to_string(),
        }
    }
}

/// Result of one bulk transfer.
#[derive(Debug)]
pub struct Completion {
    /// IN: the received bytes. OUT: the emptied buffer, for reuse.
    pub data: Vec<u8>,
    pub status: std::result::Result<(), TransferError>,
}

/// Asynchronous queue of bulk transfers on one endpoint.
pub trait TransferQueue: Send {
    /// Queue a transfer. IN queues request `buf.len()` bytes; OUT queues send
    /// the buffer contents.
    fn submit(&mut self, buf: Vec<u8>) -> std::result::Result<(), TransferError>;

    /// Next completed transfer, in submission order.
    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Completion>;

    fn pending(&self) -> usize;

    /// Request cancellation of every pending transfer. Cancelled transfers
    /// still complete, with [`TransferError::Cancelled`].
    fn cancel_all(&mut self);
}

/// An opened device.
pub trait UsbHandle: Send + Sync {
    fn descriptor(&self) -> &Descriptor;

    /// Bus identity for matching hot-unplug events.
    fn device_id(&self) -> Option<DeviceId> {
        None
    }

    fn control_in(
        &self,
        control: Control,
        data: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferError>;

    fn control_out(
        &self,
        control: Control,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferError>;

    fn claim(&self, interface: u8) -> Result<()>;

    fn release(&self);

    fn set_alt_setting(&self, alt: u8) -> Result<()>;

    fn open_in(&self, endpoint: u8) -> Result<Box<dyn TransferQueue>>;

    fn open_out(&self, endpoint: u8) -> Result<Box<dyn TransferQueue>>;
}

pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) fn vendor(request: u8, value: u16, index: u16) -> Control {
    Control {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request,
        value,
        index,
    }
}

/// Split a raw `bmRequestType` into direction and `nusb` control fields.
/// Returns `true` for device-to-host.
pub fn control_from_request_type(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
) -> Result<(bool, Control)> {
    let control_type = match (request_type >> 5) & 0x3 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        2 => ControlType::Vendor,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "reserved control type in bmRequestType {:#04x}",
                request_type
            )));
        }
    };
    let recipient = match request_type & 0x1f {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "reserved recipient in bmRequestType {:#04x}",
                request_type
            )));
        }
    };
    Ok((
        request_type & 0x80 != 0,
        Control {
            control_type,
            recipient,
            request,
            value,
            index,
        },
    ))
}

/// Currently attached devices of a supported family.
pub fn list_supported() -> Result<Vec<(DeviceInfo, Family)>> {
    Ok(nusb::list_devices()
        .map_err(Error::IoError)?
        .filter_map(|dev| family_of(dev.vendor_id(), dev.product_id()).map(|f| (dev, f)))
        .collect())
}

pub fn list_bootloaders() -> Result<Vec<DeviceInfo>> {
    Ok(nusb::list_devices()
        .map_err(Error::IoError)?
        .filter(|dev| is_bootloader(dev.vendor_id(), dev.product_id()))
        .collect())
}

/// [`UsbHandle`] backed by a real `nusb` device.
pub struct NusbHandle {
    descriptor: Descriptor,
    id: DeviceId,
    device: nusb::Device,
    interface: Mutex<Option<Interface>>,
}

impl NusbHandle {
    pub fn open(info: &DeviceInfo) -> Result<Self> {
        let descriptor = Descriptor::from_info(info);
        info!(
            "opening {:04x}:{:04x} serial {}",
            descriptor.vendor_id, descriptor.product_id, descriptor.serial
        );
        let device = info.open().map_err(Error::IoError)?;
        Ok(NusbHandle {
            descriptor,
            id: info.id(),
            device,
            interface: Mutex::new(None),
        })
    }

    fn interface(&self) -> Result<Interface> {
        self.interface
            .lock()
            .ok()
            .and_then(|i| i.clone())
            .ok_or_else(|| Error::InvalidArgument("interface not claimed".into()))
    }
}

impl UsbHandle for NusbHandle {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn device_id(&self) -> Option<DeviceId> {
        Some(self.id)
    }

    fn control_in(
        &self,
        control: Control,
        data: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        self.device.control_in_blocking(control, data, timeout)
    }

    fn control_out(
        &self,
        control: Control,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        self.device.control_out_blocking(control, data, timeout)
    }

    fn claim(&self, interface: u8) -> Result<()> {
        let iface = self
            .device
            .claim_interface(interface)
            .map_err(Error::IoError)?;
        if let Ok(mut slot) = self.interface.lock() {
            *slot = Some(iface);
        }
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut slot) = self.interface.lock() {
            if slot.take().is_some() {
                debug!("released interface of {}", self.descriptor.serial);
            }
        }
    }

    fn set_alt_setting(&self, alt: u8) -> Result<()> {
        self.interface()?
            .set_alt_setting(alt)
            .map_err(Error::IoError)
    }

    fn open_in(&self, endpoint: u8) -> Result<Box<dyn TransferQueue>> {
        Ok(Box::new(NusbInQueue(self.interface()?.bulk_in_queue(endpoint))))
    }

    fn open_out(&self, endpoint: u8) -> Result<Box<dyn TransferQueue>> {
        Ok(Box::new(NusbOutQueue(
            self.interface()?.bulk_out_queue(endpoint),
        )))
    }
}

struct NusbInQueue(Queue<RequestBuffer>);

impl TransferQueue for NusbInQueue {
    fn submit(&mut self, buf: Vec<u8>) -> std::result::Result<(), TransferError> {
        let len = buf.len();
        self.0.submit(RequestBuffer::reuse(buf, len));
        Ok(())
    }

    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Completion> {
        self.0.poll_next(cx).map(|c| Completion {
            data: c.data,
            status: c.status,
        })
    }

    fn pending(&self) -> usize {
        self.0.pending()
    }

    fn cancel_all(&mut self) {
        self.0.cancel_all();
    }
}

struct NusbOutQueue(Queue<Vec<u8>>);

impl TransferQueue for NusbOutQueue {
    fn submit(&mut self, buf: Vec<u8>) -> std::result::Result<(), TransferError> {
        self.0.submit(buf);
        Ok(())
    }

    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Completion> {
        self.0.poll_next(cx).map(|c| Completion {
            data: c.data.reuse(),
            status: c.status,
        })
    }

    fn pending(&self) -> usize {
        self.0.pending()
    }

    fn cancel_all(&mut self) {
        self.0.cancel_all();
    }
}
