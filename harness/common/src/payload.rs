//! Random text payloads cut from a shared pool of alphanumeric characters.

use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::OnceLock;
use tracing::debug;

use crate::HarnessError;

/// Size of the process-wide pool, 1 MiB.
pub const POOL_SIZE: usize = 1024 * 1024;
/// Character placed at both ends of every generated payload.
pub const MARKER: char = '*';

static GLOBAL_POOL: OnceLock<PayloadPool> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct PayloadPool {
    data: String,
}

impl PayloadPool {
    /// The shared pool, filled on first use and read-only afterwards.
    pub fn global() -> &'static PayloadPool {
        GLOBAL_POOL.get_or_init(|| {
            debug!("Filling {POOL_SIZE} byte payload pool");
            PayloadPool::with_size(POOL_SIZE, &mut rand::rng())
        })
    }

    pub fn with_size<R: Rng + ?Sized>(size: usize, rng: &mut R) -> Self {
        let data = rng
            .sample_iter(Alphanumeric)
            .take(size.max(1))
            .map(char::from)
            .collect();
        PayloadPool { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn generate(&self, size: usize) -> Result<String, HarnessError> {
        self.generate_with(size, &mut rand::rng())
    }

    /// Build a payload of exactly `size` characters: a marker, runs copied
    /// from the pool at random offsets, and a closing marker.
    pub fn generate_with<R: Rng + ?Sized>(
        &self,
        size: usize,
        rng: &mut R,
    ) -> Result<String, HarnessError> {
        if size < 2 {
            return Err(HarnessError::Configuration(format!(
                "payload size must be at least 2 to hold the markers, got {size}"
            )));
        }

        let mut payload = String::with_capacity(size);
        payload.push(MARKER);

        let mut remaining = size - 2;
        while remaining > 0 {
            let offset = rng.random_range(0..self.data.len());
            let run = self.data.len() - offset;
            if run > remaining {
                payload.push_str(&self.data[offset..offset + remaining]);
                remaining = 0;
            } else {
                payload.push_str(&self.data[offset..]);
                remaining -= run;
            }
        }

        payload.push(MARKER);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn minimum_payload_is_just_the_markers() {
        let pool = PayloadPool::with_size(16, &mut SmallRng::seed_from_u64(7));
        assert_eq!(pool.generate(2).unwrap(), "**");
    }

    #[test]
    fn payload_larger_than_the_pool_wraps_around() {
        let mut rng = SmallRng::seed_from_u64(42);
        let pool = PayloadPool::with_size(32, &mut rng);
        let payload = pool.generate_with(1000, &mut rng).unwrap();

        assert_eq!(payload.len(), 1000);
        assert!(payload.starts_with(MARKER) && payload.ends_with(MARKER));
        assert!(payload[1..999].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn interior_comes_from_the_pool() {
        let mut rng = SmallRng::seed_from_u64(3);
        let pool = PayloadPool::with_size(1, &mut rng);
        let payload = pool.generate_with(6, &mut rng).unwrap();
        assert_eq!(payload, format!("*{}*", pool.data.repeat(4)));
    }

    #[test]
    fn sizes_below_two_are_rejected() {
        let pool = PayloadPool::with_size(8, &mut SmallRng::seed_from_u64(1));
        for size in [0, 1] {
            assert!(matches!(
                pool.generate(size),
                Err(HarnessError::Configuration(_))
            ));
        }
    }

    #[test]
    fn global_pool_is_one_mebibyte() {
        let pool = PayloadPool::global();
        assert_eq!(pool.len(), POOL_SIZE);
        assert!(std::ptr::eq(pool, PayloadPool::global()));
    }
}
