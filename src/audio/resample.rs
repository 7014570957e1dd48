use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Deterministic polyphase-sinc resampler (order 32, well above the ≥16
/// floor) wrapping `rubato`. One instance handles one input→output rate
/// pair for the lifetime of a single decode call.
pub struct PolyphaseResampler {
    inner: Option<SincFixedIn<f64>>,
    chunk_size: usize,
}

const SINC_LEN: usize = 32;
const CHUNK_SIZE: usize = 1024;

impl PolyphaseResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        if input_rate == output_rate {
            return Self {
                inner: None,
                chunk_size: CHUNK_SIZE,
            };
        }

        let params = SincInterpolationParameters {
            sinc_len: SINC_LEN,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let ratio = output_rate as f64 / input_rate as f64;
        let resampler = SincFixedIn::<f64>::new(ratio, 2.0, params, CHUNK_SIZE, 1)
            .expect("sinc resampler parameters are always valid for supported rate pairs");

        Self {
            inner: Some(resampler),
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Resamples the full buffer, internally chunking and flushing any tail
    /// so no samples are lost at end-of-stream.
    pub fn process(&mut self, samples: &[f64]) -> Vec<f64> {
        let Some(resampler) = &mut self.inner else {
            return samples.to_vec();
        };

        let mut output = Vec::new();
        let mut scratch = vec![0.0f64; resampler.output_frames_max()];
        let mut pos = 0;
        while pos < samples.len() {
            let end = (pos + self.chunk_size).min(samples.len());
            let mut chunk = samples[pos..end].to_vec();
            let is_last = end == samples.len();
            if chunk.len() < self.chunk_size {
                chunk.resize(self.chunk_size, 0.0);
            }

            let (_, produced) = resampler
                .process_into_buffer(&[&chunk], &mut [&mut scratch], None)
                .expect("resampling a fixed-size, correctly-shaped chunk cannot fail");
            output.extend_from_slice(&scratch[..produced]);

            if is_last {
                // Flush remaining filter delay by pushing trailing silence.
                let tail_len = resampler.input_frames_next();
                let tail = vec![0.0f64; tail_len];
                let (_, produced) = resampler
                    .process_into_buffer(&[&tail], &mut [&mut scratch], None)
                    .expect("flush chunk has a valid fixed length");
                output.extend_from_slice(&scratch[..produced]);
            }

            pos = end;
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_should_be_identity_when_rates_match() {
        let mut r = PolyphaseResampler::new(16000, 16000);
        let input: Vec<f64> = (0..500).map(|i| i as f64).collect();
        let output = r.process(&input);
        assert_eq!(output, input);
    }

    #[test]
    fn resample_should_scale_length_by_rate_ratio() {
        let mut r = PolyphaseResampler::new(48000, 16000);
        let input = vec![0.0f64; 48000];
        let output = r.process(&input);
        // within one sinc filter length of the exact ratio
        let expected = 16000usize;
        assert!(
            output.len().abs_diff(expected) <= SINC_LEN * 4,
            "got {}, expected near {}",
            output.len(),
            expected
        );
    }

    #[test]
    fn resample_should_be_deterministic() {
        let input: Vec<f64> = (0..2000)
            .map(|i| (i as f64 * 0.01).sin())
            .collect();
        let mut r1 = PolyphaseResampler::new(48000, 16000);
        let mut r2 = PolyphaseResampler::new(48000, 16000);
        assert_eq!(r1.process(&input), r2.process(&input));
    }
}
