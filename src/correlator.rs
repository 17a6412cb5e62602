//! In-flight request table. The proxy-assigned transaction ID is the key:
//! requests live in a dense 65 536-slot table indexed by that ID, with a
//! FIFO of IDs in forwarding order so the sweeper can cull timeouts from
//! the oldest end and stop at the first entry still inside the window.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// One slot per possible u16 ID; slot 0 is never allocated.
const SLOT_COUNT: usize = 1 << 16;

/// How many FIFO entries a sweep examines per lock acquisition.
const SWEEP_BATCH: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("no transaction id available")]
    NoIdAvailable,
}

/// A client query in flight, owned by exactly one holder at a time:
/// ingress queue, then a processor, then the correlator, then egress.
#[derive(Debug)]
pub struct Request {
    /// Owned copy of the datagram; only its first two bytes ever change.
    pub raw: Vec<u8>,
    pub client_addr: SocketAddr,
    /// Transaction ID the client chose; restored before the reply goes back.
    pub client_id: u16,
    /// Our replacement ID, equal to the slot index while in flight.
    pub proxy_id: u16,
    pub forwarded_at: Instant,
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Request {
    pub fn new(raw: Vec<u8>, client_addr: SocketAddr) -> Self {
        Self {
            raw,
            client_addr,
            client_id: 0,
            proxy_id: 0,
            forwarded_at: Instant::now(),
            qname: String::new(),
            qtype: 0,
            qclass: 0,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.forwarded_at)
    }
}

struct Inner {
    slots: Vec<Option<Box<Request>>>,
    sweep_queue: VecDeque<u16>,
    next_id: u16,
    live: usize,
}

impl Inner {
    // Pre-increment, skip zero, probe forward past occupied slots. A full
    // fruitless cycle means every ID is in flight.
    fn allocate(&mut self) -> Result<u16, CorrelatorError> {
        for _ in 0..u16::MAX {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if self.slots[self.next_id as usize].is_none() {
                return Ok(self.next_id);
            }
        }
        Err(CorrelatorError::NoIdAvailable)
    }
}

pub struct Correlator {
    inner: Mutex<Inner>,
    request_timeout: Duration,
}

impl Correlator {
    pub fn new(request_timeout: Duration) -> Self {
        let mut slots = Vec::with_capacity(SLOT_COUNT);
        slots.resize_with(SLOT_COUNT, || None);
        Self {
            inner: Mutex::new(Inner {
                slots,
                sweep_queue: VecDeque::new(),
                next_id: 0,
                live: 0,
            }),
            request_timeout,
        }
    }

    /// Assign a fresh proxy ID to `req`, stamp its forwarding time, and file
    /// it under that ID. Fails only when all 65 535 IDs are in flight; a
    /// live entry is never overwritten.
    pub fn install(&self, mut req: Request) -> Result<u16, CorrelatorError> {
        let mut inner = self.inner.lock().expect("correlator lock");
        let id = inner.allocate()?;
        req.proxy_id = id;
        req.forwarded_at = Instant::now();
        // The raw bytes carry the slot index while the request is filed.
        crate::proto_utils::write_id(&mut req.raw, id);
        inner.slots[id as usize] = Some(Box::new(req));
        inner.sweep_queue.push_back(id);
        inner.live += 1;
        Ok(id)
    }

    /// Remove and return the request filed under `id`, if any. The stale
    /// FIFO entry is left behind for the sweeper to discard lazily.
    pub fn take_by_id(&self, id: u16) -> Option<Request> {
        let mut inner = self.inner.lock().expect("correlator lock");
        let req = inner.slots[id as usize].take()?;
        inner.live -= 1;
        Some(*req)
    }

    /// Cull requests older than the timeout, oldest first, and return how
    /// many were removed. Stops at the first live entry still inside the
    /// window; everything behind it in the FIFO is younger. The lock is
    /// released between batches so a deep backlog cannot stall the stages.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut timed_out = 0;

        loop {
            let mut inner = self.inner.lock().expect("correlator lock");
            for _ in 0..SWEEP_BATCH {
                let Some(&id) = inner.sweep_queue.front() else {
                    return timed_out;
                };
                let expired = match inner.slots[id as usize].as_deref() {
                    // Already answered or reclaimed; just a stale entry.
                    None => false,
                    Some(req) if req.age(now) >= self.request_timeout => true,
                    // Young and live: everything behind it is younger.
                    Some(_) => return timed_out,
                };
                inner.sweep_queue.pop_front();
                if expired {
                    let req = inner.slots[id as usize]
                        .take()
                        .expect("slot checked non-empty");
                    inner.live -= 1;
                    timed_out += 1;
                    tracing::debug!(
                        qname = %req.qname,
                        proxy_id = req.proxy_id,
                        elapsed_ms = req.age(now).as_millis() as u64,
                        "timeout (active)"
                    );
                }
            }
            // Batch exhausted; reacquire on the next pass.
            drop(inner);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().expect("correlator lock").live
    }

    #[cfg(test)]
    fn sweep_queue_len(&self) -> usize {
        self.inner.lock().expect("correlator lock").sweep_queue.len()
    }
}
