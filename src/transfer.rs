//! Fixed pool of bulk transfer buffers for one endpoint.

use std::{
    task::{Context, Poll},
    time::{Duration, Instant},
};

use log::{debug, warn};
use nusb::transfer::TransferError;

use crate::usb::{Completion, TransferQueue};

/// Number of packets each transfer carries so that `transfers` buffers
/// together cover roughly `buffer_time` of samples.
pub fn packets_per_transfer(
    buffer_time: Duration,
    sample_period: f64,
    samples_per_packet: usize,
    transfers: usize,
) -> usize {
    let packets =
        buffer_time.as_secs_f64() / (sample_period * samples_per_packet as f64) / transfers as f64;
    (packets.ceil() as usize).max(1)
}

pub(crate) struct TransferPool {
    name: &'static str,
    queue: Box<dyn TransferQueue>,
    idle: Vec<Vec<u8>>,
    /// Buffers owned by the pool, idle or in flight. Shrinks when a
    /// submission fails.
    size: usize,
    active: usize,
    transfer_len: usize,
    timeout: Duration,
    last_activity: Instant,
}

impl TransferPool {
    pub fn new(
        name: &'static str,
        queue: Box<dyn TransferQueue>,
        transfers: usize,
        transfer_len: usize,
        timeout: Duration,
    ) -> Self {
        debug!(
            "{}: {} transfers of {} bytes",
            name, transfers, transfer_len
        );
        TransferPool {
            name,
            queue,
            idle: (0..transfers).map(|_| vec![0; transfer_len]).collect(),
            size: transfers,
            active: 0,
            transfer_len,
            timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn transfer_len(&self) -> usize {
        self.transfer_len
    }

    /// An idle buffer resized to the transfer length.
    pub fn take_idle(&mut self) -> Option<Vec<u8>> {
        let mut buf = self.idle.pop()?;
        buf.resize(self.transfer_len, 0);
        Some(buf)
    }

    pub fn recycle(&mut self, buf: Vec<u8>) {
        if self.idle.len() + self.active < self.size {
            self.idle.push(buf);
        }
    }

    /// Submit a buffer. On failure the buffer is dropped and the pool
    /// permanently shrinks by one; there is no retry.
    pub fn submit(&mut self, buf: Vec<u8>) -> Result<(), TransferError> {
        if self.active == 0 {
            self.last_activity = Instant::now();
        }
        match self.queue.submit(buf) {
            Ok(()) => {
                self.active += 1;
                Ok(())
            }
            Err(e) => {
                warn!("{}: submission failed: {}", self.name, e);
                self.size -= 1;
                Err(e)
            }
        }
    }

    pub fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Completion> {
        if self.active == 0 {
            return Poll::Pending;
        }
        let c = self.queue.poll_complete(cx);
        if c.is_ready() {
            self.active -= 1;
            self.last_activity = Instant::now();
        }
        c
    }

    pub fn cancel(&mut self) {
        if self.active > 0 {
            debug!("{}: cancelling {} transfers", self.name, self.active);
            self.queue.cancel_all();
        }
    }

    /// Transfers are outstanding but nothing completed within the timeout.
    pub fn stalled(&self, now: Instant) -> bool {
        self.active > 0 && now.duration_since(self.last_activity) > self.timeout
    }
}
