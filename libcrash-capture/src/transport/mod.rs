// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where captured envelopes go.

mod disk;
mod envelope;

pub use disk::DiskTransport;
pub use envelope::{Envelope, EnvelopeError, EnvelopeItem};

use crate::run::Run;
use crate::sync::Mutex;
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};
use tracing::debug;

pub trait Transport: Send + Sync {
    fn send_envelope(&self, envelope: Envelope);

    /// Writes every envelope still waiting to be sent into `run`, so that a
    /// later run can send them. Returns how many were written.
    fn dump_queue(&self, _run: &Run) -> usize {
        0
    }
}

/// A transport that queues envelopes until a worker drains them, e.g. to
/// upload them. Whatever is still queued when the process crashes is dumped
/// to disk by the crash pipeline.
#[derive(Default)]
pub struct QueuedTransport {
    queue: Mutex<VecDeque<Envelope>>,
}

impl QueuedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }
}

impl Transport for QueuedTransport {
    fn send_envelope(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
    }

    fn dump_queue(&self, run: &Run) -> usize {
        let mut queue = self.queue.lock();
        let mut dumped = 0;
        while let Some(envelope) = queue.pop_front() {
            if run.write_envelope(&envelope).is_ok() {
                dumped += 1;
            }
        }
        dumped
    }
}

/// Holds the active transport and lets the fault path swap it without taking
/// a lock.
///
/// The slot holds either null or a pointer from `Box::into_raw`. A transport
/// handed out by [TransportSlot::with_current] must not be replaced and
/// dropped concurrently: replacement happens at startup, before the handler
/// chain is installed, and on the fault path, which leaks the old transport
/// instead of dropping it.
pub struct TransportSlot {
    current: AtomicPtr<Box<dyn Transport>>,
}

impl Default for TransportSlot {
    fn default() -> Self {
        Self::empty()
    }
}

impl TransportSlot {
    pub fn empty() -> Self {
        Self {
            current: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn new(transport: Box<dyn Transport>) -> Self {
        let slot = Self::empty();
        slot.replace(Some(transport));
        slot
    }

    /// Installs `transport` and returns the one it replaced.
    pub fn replace(&self, transport: Option<Box<dyn Transport>>) -> Option<Box<dyn Transport>> {
        let new = transport.map_or(ptr::null_mut(), |t| Box::into_raw(Box::new(t)));
        let old = self.current.swap(new, SeqCst);
        if old.is_null() {
            None
        } else {
            // SAFETY: non-null pointers in the slot always come from
            // `Box::into_raw` above, and the swap made us the only owner.
            Some(*unsafe { Box::from_raw(old) })
        }
    }

    /// Replaces the active transport with a [DiskTransport] writing into
    /// `run`, and returns the previous one so that its queue can be dumped.
    pub fn enforce_disk_transport(&self, run: &Run) -> Option<Box<dyn Transport>> {
        self.replace(Some(Box::new(DiskTransport::new(run.clone()))))
    }

    pub fn with_current<R>(&self, f: impl FnOnce(&dyn Transport) -> R) -> Option<R> {
        let current = self.current.load(SeqCst);
        // SAFETY: see the type level docs.
        unsafe { current.as_ref() }.map(|transport| f(&**transport))
    }

    /// Sends through the active transport. Returns false, dropping the
    /// envelope, if there is none.
    pub fn send_envelope(&self, envelope: Envelope) -> bool {
        let sent = self
            .with_current(|transport| transport.send_envelope(envelope))
            .is_some();
        if !sent && !crate::sync::in_signal_handler() {
            debug!("No transport installed, dropping envelope");
        }
        sent
    }
}

impl Drop for TransportSlot {
    fn drop(&mut self) {
        self.replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::from_event(&crate::new_event()).unwrap()
    }

    #[test]
    fn test_queued_transport_dumps_into_run() -> anyhow::Result<()> {
        let db = tempfile::tempdir()?;
        let run = Run::new(db.path())?;
        let transport = QueuedTransport::new();
        let queued = [envelope(), envelope()];
        for e in &queued {
            transport.send_envelope(e.clone());
        }
        assert_eq!(2, transport.pending());

        assert_eq!(2, transport.dump_queue(&run));
        assert_eq!(0, transport.pending());
        let mut on_disk: Vec<_> = run.envelopes()?.into_iter().map(|e| e.id()).collect();
        let mut expected: Vec<_> = queued.iter().map(|e| e.id()).collect();
        on_disk.sort();
        expected.sort();
        assert_eq!(expected, on_disk);
        Ok(())
    }

    #[test]
    fn test_slot_swaps_to_disk() -> anyhow::Result<()> {
        let db = tempfile::tempdir()?;
        let run = Run::new(db.path())?;
        let slot = TransportSlot::new(Box::new(QueuedTransport::new()));
        slot.send_envelope(envelope());

        let previous = slot.enforce_disk_transport(&run).unwrap();
        assert_eq!(1, previous.dump_queue(&run));

        let event = json!({ "event_id": uuid::Uuid::new_v4().simple().to_string() });
        assert!(slot.send_envelope(Envelope::from_event(&event)?));
        assert_eq!(2, run.envelopes()?.len());
        Ok(())
    }

    #[test]
    fn test_empty_slot_drops() {
        let slot = TransportSlot::empty();
        assert!(!slot.send_envelope(envelope()));
        assert!(slot.with_current(|_| ()).is_none());
        assert!(slot.replace(None).is_none());
    }
}
