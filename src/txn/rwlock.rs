//! # Writer-Preferring Reader-Writer Lock
//!
//! The single concurrency barrier of the engine: any number of readers OR
//! exactly one writer. A waiting writer blocks *new* readers, so writers
//! cannot starve behind a steady reader stream:
//!
//! - `lock_read` admits only when no writer holds the lock and no writer
//!   is queued.
//! - `lock_write` queues itself (bumping `waiting_writers`, which is what
//!   holds readers back), then waits for the lock to drain.
//! - `unlock_write` hands off to a queued writer first; only when none is
//!   waiting does it wake all readers.
//! - The try variants never block and never touch `waiting_writers`,
//!   so a failed `try_lock_write` cannot stall readers.
//!
//! Built on a `parking_lot` mutex + condvars rather than the stock
//! `RwLock` because the admission policy above is part of the engine's
//! contract and needs to be explicit (and testable), not an
//! implementation detail of the lock vendor.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

#[derive(Debug, Default)]
pub struct RwLock {
    state: Mutex<LockState>,
    read_cv: Condvar,
    write_cv: Condvar,
}

impl RwLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks while a writer holds the lock or is queued.
    pub fn lock_read(&self) {
        let mut state = self.state.lock();
        while state.writer || state.waiting_writers > 0 {
            self.read_cv.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn unlock_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "unlock_read without a read lock");
        state.readers -= 1;
        if state.readers == 0 {
            self.write_cv.notify_one();
        }
    }

    /// Queues as a waiting writer (blocking new readers), then blocks
    /// until all current readers and any current writer are gone.
    pub fn lock_write(&self) {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.readers > 0 || state.writer {
            self.write_cv.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    pub fn unlock_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "unlock_write without the write lock");
        state.writer = false;
        if state.waiting_writers > 0 {
            self.write_cv.notify_one();
        } else {
            self.read_cv.notify_all();
        }
    }

    /// Non-blocking read acquisition; refuses while a writer holds or
    /// waits.
    pub fn try_lock_read(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.waiting_writers > 0 {
            return false;
        }
        state.readers += 1;
        true
    }

    /// Non-blocking write acquisition; never queues.
    pub fn try_lock_write(&self) -> bool {
        let mut state = self.state.lock();
        if state.readers > 0 || state.writer {
            return false;
        }
        state.writer = true;
        true
    }

    #[cfg(test)]
    fn snapshot(&self) -> (u32, bool, u32) {
        let state = self.state.lock();
        (state.readers, state.writer, state.waiting_writers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn multiple_readers_share() {
        let lock = RwLock::new();
        lock.lock_read();
        lock.lock_read();
        assert!(lock.try_lock_read());
        assert_eq!(lock.snapshot(), (3, false, 0));

        lock.unlock_read();
        lock.unlock_read();
        lock.unlock_read();
        assert_eq!(lock.snapshot(), (0, false, 0));
    }

    #[test]
    fn writer_excludes_everyone() {
        let lock = RwLock::new();
        lock.lock_write();
        assert!(!lock.try_lock_read());
        assert!(!lock.try_lock_write());
        lock.unlock_write();
        assert!(lock.try_lock_write());
        lock.unlock_write();
    }

    #[test]
    fn try_lock_write_does_not_queue() {
        let lock = RwLock::new();
        lock.lock_read();
        assert!(!lock.try_lock_write());
        // A failed try must not have left a phantom waiting writer.
        assert!(lock.try_lock_read());
        lock.unlock_read();
        lock.unlock_read();
    }

    #[test]
    fn no_two_writers_and_no_writer_with_readers() {
        let lock = Arc::new(RwLock::new());
        let in_critical = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let in_critical = Arc::clone(&in_critical);
            let max_seen = Arc::clone(&max_seen);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    lock.lock_write();
                    let now = in_critical.fetch_add(1, Ordering::AcqRel) + 1;
                    max_seen.fetch_max(now, Ordering::AcqRel);
                    in_critical.fetch_sub(1, Ordering::AcqRel);
                    lock.unlock_write();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::Acquire), 1);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let lock = Arc::new(RwLock::new());
        lock.lock_read();

        // Queue a writer behind the active reader.
        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock_write();
                lock.unlock_write();
            })
        };

        // Wait until the writer is queued.
        while lock.snapshot().2 == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        // New readers must refuse while the writer waits.
        assert!(!lock.try_lock_read());

        lock.unlock_read();
        writer.join().unwrap();

        // Once the writer is through, readers are admitted again.
        assert!(lock.try_lock_read());
        lock.unlock_read();
    }

    #[test]
    fn writer_wins_before_new_readers_on_release() {
        let lock = Arc::new(RwLock::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        lock.lock_read();

        let writer = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                lock.lock_write();
                order.lock().push("writer");
                thread::sleep(Duration::from_millis(20));
                lock.unlock_write();
            })
        };

        while lock.snapshot().2 == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        // This reader starts after the writer queued: it must come after.
        let reader = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                lock.lock_read();
                order.lock().push("reader");
                lock.unlock_read();
            })
        };

        thread::sleep(Duration::from_millis(5));
        lock.unlock_read();

        writer.join().unwrap();
        reader.join().unwrap();

        assert_eq!(*order.lock(), vec!["writer", "reader"]);
    }
}
