//! Thread-safe dispenser of primary electrons.
//!
//! The pool borrows the primaries and their tags and hands out consecutive
//! chunks through an atomic cursor. Each primary is delivered to exactly one
//! caller; the cursor only moves forward.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::particle::Particle;

pub struct WorkPool<'a> {
    particles: &'a [Particle],
    tags: &'a [u32],
    cursor: AtomicUsize,
}

impl<'a> WorkPool<'a> {
    pub fn new(particles: &'a [Particle], tags: &'a [u32]) -> Self {
        assert_eq!(particles.len(), tags.len());
        Self {
            particles,
            tags,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Reserve up to `max_n` consecutive primaries. Returns empty slices iff
    /// the pool is exhausted. The views stay valid for the pool's lifetime.
    pub fn get_work(&self, max_n: usize) -> (&'a [Particle], &'a [u32]) {
        let total = self.particles.len();
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            if cur >= total {
                return (&[], &[]);
            }
            let n = max_n.min(total - cur);
            match self.cursor.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return (&self.particles[cur..cur + n], &self.tags[cur..cur + n]),
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn total(&self) -> usize {
        self.particles.len()
    }

    /// Unclaimed primaries; may lag a concurrent reservation but never reads
    /// zero while unclaimed work remains.
    pub fn primaries_to_go(&self) -> usize {
        self.particles
            .len()
            .saturating_sub(self.cursor.load(Ordering::Acquire))
    }

    pub fn done(&self) -> bool {
        self.cursor.load(Ordering::Acquire) >= self.particles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use std::collections::HashSet;

    fn primaries(n: usize) -> (Vec<Particle>, Vec<u32>) {
        let p = vec![Particle::new(Vec3::ZERO, Vec3::Z, 100.0); n];
        let t = (0..n as u32).collect();
        (p, t)
    }

    #[test]
    fn sequential_exhaustion() {
        let (p, t) = primaries(10);
        let pool = WorkPool::new(&p, &t);
        assert_eq!(pool.primaries_to_go(), 10);

        let (a, ta) = pool.get_work(4);
        assert_eq!(a.len(), 4);
        assert_eq!(ta, &[0, 1, 2, 3]);
        let (b, tb) = pool.get_work(100);
        assert_eq!(b.len(), 6);
        assert_eq!(tb[0], 4);
        assert!(pool.done());
        assert_eq!(pool.primaries_to_go(), 0);

        let (c, _) = pool.get_work(1);
        assert!(c.is_empty());
    }

    #[test]
    fn every_tag_delivered_exactly_once_concurrently() {
        let (p, t) = primaries(100_000);
        let pool = WorkPool::new(&p, &t);

        let mut all: Vec<u32> = Vec::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let pool = &pool;
                    s.spawn(move || {
                        let mut seen = Vec::new();
                        loop {
                            let (work, tags) = pool.get_work(1 + i * 3);
                            if work.is_empty() {
                                break;
                            }
                            seen.extend_from_slice(tags);
                        }
                        seen
                    })
                })
                .collect();
            for h in handles {
                all.extend(h.join().unwrap());
            }
        });

        assert!(pool.done());
        assert_eq!(all.len(), 100_000);
        let unique: HashSet<u32> = all.iter().copied().collect();
        assert_eq!(unique.len(), 100_000);
    }

    #[test]
    fn zero_length_pool_is_done() {
        let (p, t) = primaries(0);
        let pool = WorkPool::new(&p, &t);
        assert!(pool.done());
        let (w, _) = pool.get_work(5);
        assert!(w.is_empty());
    }
}
