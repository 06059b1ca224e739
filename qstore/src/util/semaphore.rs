use std::{fmt::Debug, sync::Arc};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::error;

/// Counting admission gate for open device file handles.
///
/// Every occupied slot is one message sitting in a bounded channel, so
/// `acquire` blocks exactly when the channel is full. Slots are handed out as
/// [`AdmissionPermit`]s and go back to the gate when the permit is dropped.
pub struct HandleSemaphore {
    slots: Sender<()>,
    taken: Receiver<()>,
    capacity: usize,
}

impl HandleSemaphore {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (slots, taken) = bounded(capacity.max(1));
        Arc::new(Self {
            slots,
            taken,
            capacity: capacity.max(1),
        })
    }

    /// Blocks until a slot is free.
    pub fn acquire(self: &Arc<Self>) -> AdmissionPermit {
        // both channel ends live in `self`, the send can only block, never fail
        let _ = self.slots.send(());
        AdmissionPermit { sem: self.clone() }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        match self.slots.try_send(()) {
            Ok(()) => Some(AdmissionPermit { sem: self.clone() }),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => None,
        }
    }

    /// Occupied slots, for diagnostics only.
    pub fn count(&self) -> usize {
        self.taken.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self) {
        if self.taken.try_recv().is_err() {
            error!("admission slot released without a matching acquire");
        }
    }
}

impl Debug for HandleSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleSemaphore")
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// One occupied admission slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    sem: Arc<HandleSemaphore>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    pub fn permits_balance() {
        let sem = HandleSemaphore::new(2);
        let a = sem.acquire();
        let b = sem.acquire();
        assert_eq!(sem.count(), 2);
        assert!(sem.try_acquire().is_none());

        drop(a);
        assert_eq!(sem.count(), 1);
        let c = sem.try_acquire();
        assert!(c.is_some());

        drop(b);
        drop(c);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    pub fn error_path_restores_capacity() {
        fn open_that_fails(sem: &Arc<HandleSemaphore>) -> Result<AdmissionPermit, &'static str> {
            let _permit = sem.acquire();
            Err("open fail")
        }

        let sem = HandleSemaphore::new(1);
        for _ in 0..10 {
            assert!(open_that_fails(&sem).is_err());
            assert_eq!(sem.count(), 0);
        }
        assert!(sem.try_acquire().is_some());
    }

    #[test]
    pub fn never_exceeds_capacity() {
        let sem = HandleSemaphore::new(3);
        let inside = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        crossbeam::scope(|s| {
            for _ in 0..16 {
                s.spawn(|_| {
                    for _ in 0..20 {
                        let _permit = sem.acquire();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        })
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(sem.count(), 0);
    }
}
