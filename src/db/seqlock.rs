//! Single-writer / multi-reader sequence lock.
//!
//! A process-wide monotonically increasing 64-bit counter. The writer
//! bumps it to an odd value before mutating and to the next even value
//! after. A reader snapshots an even value, performs its reads, and
//! retries if the counter moved. Torn reads are impossible provided each
//! commit's final store is a single naturally aligned word-size write,
//! which every table's sync guarantees.
//!
//! The writer side also carries a mutex so that independent threads can
//! share one writer identity; mutations on a given database instance are
//! serialised through it.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct Sequence {
    counter: AtomicU64,
    writer: Mutex<()>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the writer critical section; the counter turns odd until
    /// the guard drops.
    pub fn write(&self) -> WriteGuard<'_> {
        let guard = self.writer.lock();
        let previous = self.counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous % 2 == 0, "nested sequence write");
        WriteGuard {
            sequence: self,
            _writer: guard,
        }
    }

    /// Runs `fetch` until it executes entirely between two identical even
    /// counter observations. `fetch` may run many times; it must be pure
    /// reads.
    pub fn read<T>(&self, mut fetch: impl FnMut() -> T) -> T {
        loop {
            let before = self.counter.load(Ordering::Acquire);
            if before % 2 != 0 {
                std::thread::yield_now();
                continue;
            }

            let value = fetch();

            if self.counter.load(Ordering::Acquire) == before {
                return value;
            }
            std::thread::yield_now();
        }
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

pub struct WriteGuard<'a> {
    sequence: &'a Sequence,
    _writer: MutexGuard<'a, ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let previous = self.sequence.counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous % 2 == 1, "unbalanced sequence write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn counter_is_odd_inside_a_write() {
        let sequence = Sequence::new();
        assert_eq!(sequence.current(), 0);
        {
            let _guard = sequence.write();
            assert_eq!(sequence.current(), 1);
        }
        assert_eq!(sequence.current(), 2);
    }

    #[test]
    fn readers_never_observe_torn_pairs() {
        // The writer keeps the invariant second == first * 2; any reader
        // that validates its snapshot must see it hold.
        let sequence = Arc::new(Sequence::new());
        let cells = Arc::new((AtomicU64::new(0), AtomicU64::new(0)));

        let writer = {
            let sequence = Arc::clone(&sequence);
            let cells = Arc::clone(&cells);
            std::thread::spawn(move || {
                for i in 1..=10_000u64 {
                    let _guard = sequence.write();
                    cells.0.store(i, Ordering::Relaxed);
                    cells.1.store(i * 2, Ordering::Relaxed);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let sequence = Arc::clone(&sequence);
                let cells = Arc::clone(&cells);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let (first, second) = sequence.read(|| {
                            (
                                cells.0.load(Ordering::Relaxed),
                                cells.1.load(Ordering::Relaxed),
                            )
                        });
                        assert_eq!(second, first * 2);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
