// Lock-free SPSC sample ring connecting the routing path to the output
// render callback.
//
// Two monotonically advancing indices (modulo capacity) with a one-slot
// gap sentinel: available_read + available_write == capacity - 1 at all
// times. The producer only advances `write`, the consumer only advances
// `read`, so a release store paired with an acquire load on the opposite
// index is the entire synchronization protocol.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration for a [`FrameRing`].
#[derive(Debug, Clone)]
pub struct FrameRingConfig {
    /// Ring capacity in samples. One slot is reserved as the full/empty
    /// sentinel, so the usable depth is `capacity - 1`.
    pub capacity: usize,
}

impl Default for FrameRingConfig {
    fn default() -> Self {
        // One second of stereo audio at 48 kHz.
        Self { capacity: 96000 }
    }
}

struct RingShared {
    buffer: UnsafeCell<Box<[f32]>>,
    read: AtomicUsize,
    write: AtomicUsize,
    overruns: AtomicU64,
}

// The producer and consumer touch disjoint regions delimited by the
// atomic indices.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

/// Single-producer single-consumer circular sample store.
pub struct FrameRing {
    shared: Arc<RingShared>,
}

impl FrameRing {
    pub fn new(config: FrameRingConfig) -> Self {
        let capacity = config.capacity.max(2);
        Self {
            shared: Arc::new(RingShared {
                buffer: UnsafeCell::new(vec![0.0; capacity].into_boxed_slice()),
                read: AtomicUsize::new(0),
                write: AtomicUsize::new(0),
                overruns: AtomicU64::new(0),
            }),
        }
    }

    /// Split into the producer and consumer halves. Each half is owned by
    /// exactly one thread from here on.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        (
            RingProducer {
                shared: self.shared.clone(),
            },
            RingConsumer {
                shared: self.shared,
            },
        )
    }
}

impl RingShared {
    fn capacity(&self) -> usize {
        unsafe { (&*self.buffer.get()).len() }
    }

    fn available_read(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + self.capacity() - read) % self.capacity()
    }

    fn available_write(&self) -> usize {
        self.capacity() - 1 - self.available_read()
    }
}

/// Write half of a [`FrameRing`], owned by the routing thread.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Push as many samples as fit, returning how many were written. A
    /// short write increments the overrun counter; the call never blocks.
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        let capacity = self.shared.capacity();
        let available = self.shared.available_write();
        let n = samples.len().min(available);
        if n < samples.len() {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        }
        if n == 0 {
            return 0;
        }

        let write = self.shared.write.load(Ordering::Relaxed);
        let buffer = unsafe { &mut *self.shared.buffer.get() };
        for (i, &sample) in samples[..n].iter().enumerate() {
            buffer[(write + i) % capacity] = sample;
        }
        self.shared
            .write
            .store((write + n) % capacity, Ordering::Release);
        n
    }

    pub fn available_write(&self) -> usize {
        self.shared.available_write()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}

/// Read half of a [`FrameRing`], owned by the render callback.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    /// Pop up to `out.len()` samples, returning how many were read. The
    /// remainder of `out` is untouched; the call never blocks.
    pub fn pop_slice(&mut self, out: &mut [f32]) -> usize {
        let capacity = self.shared.capacity();
        let available = self.shared.available_read();
        let n = out.len().min(available);
        if n == 0 {
            return 0;
        }

        let read = self.shared.read.load(Ordering::Relaxed);
        let buffer = unsafe { &*self.shared.buffer.get() };
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = buffer[(read + i) % capacity];
        }
        self.shared
            .read
            .store((read + n) % capacity, Ordering::Release);
        n
    }

    /// Discard everything currently queued.
    pub fn drain(&mut self) {
        let write = self.shared.write.load(Ordering::Acquire);
        self.shared.read.store(write, Ordering::Release);
    }

    pub fn available_read(&self) -> usize {
        self.shared.available_read()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_plus_write_availability_is_capacity_minus_one() {
        let ring = FrameRing::new(FrameRingConfig { capacity: 64 });
        let (mut producer, consumer) = ring.split();

        assert_eq!(producer.available_write() + consumer.available_read(), 63);

        producer.push_slice(&[0.5; 20]);
        assert_eq!(producer.available_write() + consumer.available_read(), 63);
        assert_eq!(consumer.available_read(), 20);
    }

    #[test]
    fn samples_round_trip_in_order() {
        let ring = FrameRing::new(FrameRingConfig { capacity: 16 });
        let (mut producer, mut consumer) = ring.split();

        let input: Vec<f32> = (0..10).map(|i| i as f32 * 0.1).collect();
        assert_eq!(producer.push_slice(&input), 10);

        let mut out = vec![0.0; 10];
        assert_eq!(consumer.pop_slice(&mut out), 10);
        assert_eq!(out, input);
    }

    #[test]
    fn full_ring_rejects_excess_and_counts_overrun() {
        let ring = FrameRing::new(FrameRingConfig { capacity: 8 });
        let (mut producer, mut consumer) = ring.split();

        // Usable depth is capacity - 1.
        assert_eq!(producer.push_slice(&[1.0; 12]), 7);
        assert_eq!(producer.overruns(), 1);
        assert_eq!(producer.available_write(), 0);

        let mut out = [0.0; 7];
        assert_eq!(consumer.pop_slice(&mut out), 7);
        assert_eq!(producer.available_write(), 7);
    }

    #[test]
    fn indices_wrap_across_many_cycles() {
        let ring = FrameRing::new(FrameRingConfig { capacity: 8 });
        let (mut producer, mut consumer) = ring.split();

        let mut out = [0.0; 5];
        for round in 0..100 {
            let chunk: Vec<f32> = (0..5).map(|i| (round * 5 + i) as f32).collect();
            assert_eq!(producer.push_slice(&chunk), 5);
            assert_eq!(consumer.pop_slice(&mut out), 5);
            assert_eq!(out.to_vec(), chunk);
        }
    }
}
