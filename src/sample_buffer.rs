use assume::assume;

use crate::Error;

// -------------------------------------------------------------------------------------------------

/// Immutable, decoded PCM audio of a single loop.
///
/// Samples are stored interleaved. Buffers are shared between voices and grains via
/// [`basedrop::Shared`], so the last reference never gets freed on the audio thread.
#[derive(Debug)]
pub struct SampleBuffer {
    samples: Box<[f32]>,
    channel_count: usize,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Create a new buffer from interleaved samples, as delivered by a decoder.
    pub fn new(samples: Vec<f32>, channel_count: usize, sample_rate: u32) -> Result<Self, Error> {
        if channel_count == 0 {
            return Err(Error::ConfigError(
                "Sample buffer needs at least one channel".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(Error::ConfigError(
                "Sample buffer needs a valid sample rate".to_string(),
            ));
        }
        if samples.is_empty() || samples.len() % channel_count != 0 {
            return Err(Error::ConfigError(format!(
                "Sample buffer length {} is empty or no multiple of its channel count {}",
                samples.len(),
                channel_count
            )));
        }
        Ok(Self {
            samples: samples.into_boxed_slice(),
            channel_count,
            sample_rate,
        })
    }

    /// Create a mono buffer from the given samples.
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self, Error> {
        Self::new(samples, 1, sample_rate)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames in the buffer. Always > 0.
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channel_count
    }

    /// Raw access to the interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Read a stereo frame at the given integer frame index. Mono buffers are copied into
    /// both channels, buffers with more than two channels only use their first two.
    #[inline]
    fn frame(&self, index: usize) -> (f32, f32) {
        let offset = index * self.channel_count;
        assume!(unsafe: offset + self.channel_count <= self.samples.len());
        if self.channel_count == 1 {
            let s = self.samples[offset];
            (s, s)
        } else {
            (self.samples[offset], self.samples[offset + 1])
        }
    }

    /// Sample a stereo frame at a fractional frame position with linear interpolation.
    ///
    /// When `looping` is set, positions wrap around the buffer end, else positions outside of
    /// the buffer read silence.
    #[inline]
    pub fn sample_at(&self, position: f64, looping: bool) -> (f32, f32) {
        let frame_count = self.frame_count();
        let floor = position.floor();
        let fraction = (position - floor) as f32;
        let (index, next_index) = if looping {
            let index = (floor as i64).rem_euclid(frame_count as i64) as usize;
            (index, (index + 1) % frame_count)
        } else {
            if floor < 0.0 || floor >= frame_count as f64 {
                return (0.0, 0.0);
            }
            let index = floor as usize;
            if index + 1 >= frame_count {
                let (l, r) = self.frame(index);
                return (l * (1.0 - fraction), r * (1.0 - fraction));
            }
            (index, index + 1)
        };
        let (l0, r0) = self.frame(index);
        let (l1, r1) = self.frame(next_index);
        (
            l0 + (l1 - l0) * fraction,
            r0 + (r1 - r0) * fraction,
        )
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_layouts() {
        assert!(SampleBuffer::new(vec![], 1, 44100).is_err());
        assert!(SampleBuffer::new(vec![0.0; 3], 2, 44100).is_err());
        assert!(SampleBuffer::new(vec![0.0; 4], 0, 44100).is_err());
        assert!(SampleBuffer::new(vec![0.0; 4], 2, 0).is_err());
        assert_eq!(SampleBuffer::new(vec![0.0; 4], 2, 44100).unwrap().frame_count(), 2);
    }

    #[test]
    fn linear_interpolation() {
        let buffer = SampleBuffer::from_mono(vec![0.0, 1.0, 0.0, -1.0], 44100).unwrap();
        assert_eq!(buffer.sample_at(1.0, false), (1.0, 1.0));
        assert_eq!(buffer.sample_at(0.5, false), (0.5, 0.5));
        assert_eq!(buffer.sample_at(2.5, false), (-0.5, -0.5));
        // wraps around when looping, reads silence otherwise
        assert_eq!(buffer.sample_at(3.5, true), (-0.5, -0.5));
        assert_eq!(buffer.sample_at(4.0, true), (0.0, 0.0));
        assert_eq!(buffer.sample_at(5.0, true), (1.0, 1.0));
        assert_eq!(buffer.sample_at(5.0, false), (0.0, 0.0));
        assert_eq!(buffer.sample_at(-1.0, true), (-1.0, -1.0));
    }

    #[test]
    fn stereo_frames() {
        let buffer = SampleBuffer::new(vec![1.0, -1.0, 0.0, 0.0], 2, 48000).unwrap();
        assert_eq!(buffer.sample_at(0.0, true), (1.0, -1.0));
        assert_eq!(buffer.sample_at(0.5, true), (0.5, -0.5));
    }
}
