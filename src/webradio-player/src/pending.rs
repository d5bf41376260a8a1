//! Single-slot acknowledgement hand-off between the command path and the
//! read loop.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How the player answered the pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ack {
    Done,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitError {
    TimedOut(Duration),
    Closed,
    Rejected(String),
}

#[derive(Debug, Default)]
struct Slot {
    ack: Option<Ack>,
    closed: bool,
}

/// At most one command waits at a time; callers serialize through their own
/// lock, the slot only carries the answer.
#[derive(Debug, Default)]
pub(crate) struct PendingOperation {
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl PendingOperation {
    /// Clear any stale answer before a command is written.
    pub fn arm(&self) -> Result<(), WaitError> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return Err(WaitError::Closed);
        }
        slot.ack = None;
        Ok(())
    }

    pub fn release(&self, ack: Ack) {
        self.slot.lock().ack = Some(ack);
        self.signal.notify_all();
    }

    /// Wake any waiter for good; the output stream is gone.
    pub fn close(&self) {
        self.slot.lock().closed = true;
        self.signal.notify_all();
    }

    /// Make the slot usable again for a fresh process.
    pub fn reopen(&self) {
        let mut slot = self.slot.lock();
        slot.closed = false;
        slot.ack = None;
    }

    /// Block until released, closed or `timeout` elapses. `None` waits
    /// without bound.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slot = self.slot.lock();
        loop {
            if let Some(ack) = slot.ack.take() {
                return match ack {
                    Ack::Done => Ok(()),
                    Ack::Rejected(message) => Err(WaitError::Rejected(message)),
                };
            }
            if slot.closed {
                return Err(WaitError::Closed);
            }
            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if self.signal.wait_until(&mut slot, deadline).timed_out()
                        && slot.ack.is_none()
                        && !slot.closed
                    {
                        return Err(WaitError::TimedOut(timeout));
                    }
                }
                _ => self.signal.wait(&mut slot),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_wakes_waiter() {
        let pending = Arc::new(PendingOperation::default());
        pending.arm().unwrap();

        let releaser = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pending.release(Ack::Done);
            })
        };
        assert_eq!(pending.wait(Some(Duration::from_secs(2))), Ok(()));
        releaser.join().unwrap();
    }

    #[test]
    fn answer_before_wait_is_not_lost() {
        let pending = PendingOperation::default();
        pending.arm().unwrap();
        pending.release(Ack::Rejected("No stream opened".into()));
        assert_eq!(
            pending.wait(None),
            Err(WaitError::Rejected("No stream opened".into()))
        );
    }

    #[test]
    fn arm_discards_stale_answer() {
        let pending = PendingOperation::default();
        pending.release(Ack::Done);
        pending.arm().unwrap();
        assert_eq!(
            pending.wait(Some(Duration::from_millis(30))),
            Err(WaitError::TimedOut(Duration::from_millis(30)))
        );
    }

    #[test]
    fn close_fails_current_and_future_operations() {
        let pending = Arc::new(PendingOperation::default());
        pending.arm().unwrap();
        let closer = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || pending.close())
        };
        assert_eq!(pending.wait(None), Err(WaitError::Closed));
        closer.join().unwrap();
        assert_eq!(pending.arm(), Err(WaitError::Closed));

        pending.reopen();
        assert_eq!(pending.arm(), Ok(()));
    }
}
