//! Burst-sized mix accumulator.
//!
//! Holds one interleaved block of `channels × frames_per_burst` samples. The
//! mixing thread clears it once per cycle, sums each running client into it,
//! and hands the finished block to the device write.

use tracing::trace;

use crate::ring::FrameRing;

/// Accumulates client streams into a single interleaved output block.
pub struct MixAccumulator {
    channels: usize,
    frames_per_burst: usize,
    block: Vec<f32>,
    scratch: Vec<f32>,
}

impl MixAccumulator {
    /// Allocate a zeroed block for the given geometry.
    pub fn allocate(channels: usize, frames_per_burst: usize) -> Self {
        let samples = channels * frames_per_burst;
        Self {
            channels,
            frames_per_burst,
            block: vec![0.0; samples],
            scratch: vec![0.0; samples],
        }
    }

    /// Channels per frame of the output block.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames per output block.
    pub fn frames_per_burst(&self) -> usize {
        self.frames_per_burst
    }

    /// Reset the block to silence. Idempotent.
    pub fn clear(&mut self) {
        self.block.fill(0.0);
    }

    /// Pull up to one burst from `ring` and sum it into the block with the
    /// given gain. Returns true when the ring held fewer frames than a full
    /// burst (an underflow for the client that owns it). Whatever frames are
    /// available are still mixed; `slot_index` is the client's position in
    /// this cycle's registry traversal, used for diagnostics only.
    pub fn mix(&mut self, slot_index: usize, ring: &FrameRing, gain: f32) -> bool {
        let wanted = self.frames_per_burst * self.channels;
        let got_frames = ring.pop(&mut self.scratch[..wanted]);
        let got_samples = got_frames * self.channels;

        for (acc, sample) in self.block[..got_samples]
            .iter_mut()
            .zip(&self.scratch[..got_samples])
        {
            *acc += sample * gain;
        }

        let underflowed = got_frames < self.frames_per_burst;
        if underflowed {
            trace!(
                slot = slot_index,
                got = got_frames,
                wanted = self.frames_per_burst,
                "client ring underflowed"
            );
        }
        underflowed
    }

    /// The finished interleaved block for the current cycle.
    pub fn output(&self) -> &[f32] {
        &self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::FrameRing;

    #[test]
    fn clear_then_output_is_silence() {
        let mut acc = MixAccumulator::allocate(2, 64);
        acc.clear();
        assert_eq!(acc.output().len(), 128);
        assert!(acc.output().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn mix_sums_two_rings_with_gain() {
        let mut acc = MixAccumulator::allocate(2, 4);
        let a = FrameRing::new_local(8, 2);
        let b = FrameRing::new_local(8, 2);
        a.push(&[0.25f32; 8], None);
        b.push(&[0.5f32; 8], None);

        acc.clear();
        assert!(!acc.mix(0, &a, 1.0));
        assert!(!acc.mix(1, &b, 1.0));
        assert!(acc.output().iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn short_ring_reports_underflow_but_still_mixes() {
        let mut acc = MixAccumulator::allocate(1, 8);
        let ring = FrameRing::new_local(8, 1);
        ring.push(&[1.0f32; 3], None);

        acc.clear();
        assert!(acc.mix(0, &ring, 1.0));
        let out = acc.output();
        assert!(out[..3].iter().all(|&s| s == 1.0));
        assert!(out[3..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn empty_ring_underflows_and_leaves_silence() {
        let mut acc = MixAccumulator::allocate(2, 16);
        let ring = FrameRing::new_local(16, 2);
        acc.clear();
        assert!(acc.mix(3, &ring, 1.0));
        assert!(acc.output().iter().all(|&s| s == 0.0));
    }
}
