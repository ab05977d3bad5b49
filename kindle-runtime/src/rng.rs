//! The context's random stream.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Exact position of a [`ContextRng`], enough to resume it bit for bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngPosition {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos: u128,
}

/// Seeded ChaCha stream, advanced by every stochastic sample.
#[derive(Debug, Clone)]
pub struct ContextRng {
    inner: ChaCha8Rng,
}

impl ContextRng {
    /// `seed == 0` draws the seed from the OS.
    pub fn new(seed: u32) -> Self {
        let inner = if seed == 0 {
            ChaCha8Rng::from_entropy()
        } else {
            ChaCha8Rng::seed_from_u64(u64::from(seed))
        };
        Self { inner }
    }

    pub fn position(&self) -> RngPosition {
        RngPosition {
            seed: self.inner.get_seed(),
            stream: self.inner.get_stream(),
            word_pos: self.inner.get_word_pos(),
        }
    }

    pub fn from_position(position: &RngPosition) -> Self {
        let mut inner = ChaCha8Rng::from_seed(position.seed);
        inner.set_stream(position.stream);
        inner.set_word_pos(position.word_pos);
        Self { inner }
    }
}

impl RngCore for ContextRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_position_resumes_stream() {
        let mut rng = ContextRng::new(7);
        let _: f32 = rng.gen();
        let saved = rng.position();
        let expected: Vec<f32> = (0..5).map(|_| rng.gen()).collect();

        let mut resumed = ContextRng::from_position(&saved);
        let got: Vec<f32> = (0..5).map(|_| resumed.gen()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = ContextRng::new(42);
        let mut b = ContextRng::new(42);
        assert_eq!(a.next_u64(), b.next_u64());
    }
}
