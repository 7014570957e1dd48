//! Log-mel filterbank front-end for the CTC model variant: framing,
//! Hamming windowing, FFT power spectrum, mel filterbank, log
//! compression, LFR stacking and CMVN.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex32, Fft, FftPlanner};

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("cmvn vector dimension mismatch: got {got}, expected {expected}")]
    CmvnDimMismatch { got: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, FeatureError>;

const N_FFT: usize = 512;
const FRAME_LENGTH_MS: f32 = 25.0;
const FRAME_SHIFT_MS: f32 = 10.0;
const LOG_FLOOR: f32 = 1e-10;

/// A 2-D feature matrix, row-major: `rows[t]` is the feature vector for frame `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub rows: Vec<Vec<f32>>,
    pub feature_dim: usize,
}

impl FeatureMatrix {
    pub fn num_frames(&self) -> usize {
        self.rows.len()
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// Builds an `n_mels x (n_fft/2+1)` triangular mel filterbank in HTK-mel
/// space, bin edges floored then clipped into the valid FFT-bin range.
fn mel_filterbank(sample_rate: u32, n_mels: usize, f_min: f32, f_max: f32) -> Vec<Vec<f32>> {
    let n_freq = N_FFT / 2 + 1;
    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);

    let mels: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_min + (mel_max - mel_min) * (i as f32) / (n_mels as f32 + 1.0))
        .collect();
    let hz: Vec<f32> = mels.iter().map(|&m| mel_to_hz(m)).collect();
    let bins: Vec<usize> = hz
        .iter()
        .map(|&h| {
            let bin = ((N_FFT as f32 + 1.0) * h / sample_rate as f32).floor();
            bin.clamp(0.0, (n_freq - 1) as f32) as usize
        })
        .collect();

    let mut fb = vec![vec![0.0f32; n_freq]; n_mels];
    for m in 1..=n_mels {
        let left = bins[m - 1];
        let center = bins[m];
        let right = bins[m + 1];
        if center == left || right == center {
            continue;
        }
        for k in left..center {
            fb[m - 1][k] = (k - left) as f32 / (center - left) as f32;
        }
        for k in center..right {
            fb[m - 1][k] = (right - k) as f32 / (right - center) as f32;
        }
    }
    fb
}

fn hamming_window(frame_length: usize) -> Vec<f32> {
    if frame_length == 1 {
        return vec![1.0];
    }
    (0..frame_length)
        .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f32 / (frame_length as f32 - 1.0)).cos())
        .collect()
}

fn frame_waveform(waveform: &[f32], frame_length: usize, frame_shift: usize) -> Vec<Vec<f32>> {
    let mut padded = waveform.to_vec();
    if padded.len() < frame_length {
        padded.resize(frame_length, 0.0);
    }

    let num_frames = 1 + (padded.len() - frame_length) / frame_shift;
    let total_len = (num_frames - 1) * frame_shift + frame_length;
    if padded.len() < total_len {
        padded.resize(total_len, 0.0);
    }

    (0..num_frames)
        .map(|i| {
            let start = i * frame_shift;
            padded[start..start + frame_length].to_vec()
        })
        .collect()
}

fn rfft_power(fft: &Arc<dyn Fft<f32>>, frame: &[f32]) -> Vec<f32> {
    let mut buf: Vec<Complex32> = frame
        .iter()
        .map(|&s| Complex32::new(s, 0.0))
        .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
        .take(N_FFT)
        .collect();
    fft.process(&mut buf);
    buf[..N_FFT / 2 + 1]
        .iter()
        .map(|c| c.re * c.re + c.im * c.im)
        .collect()
}

/// Converts raw PCM (already cast to float with whatever scaling the
/// caller's CMVN vectors expect — this front-end does not rescale) into
/// log-mel frames. Empty input yields zero frames.
pub fn log_mel_fbank(waveform: &[f32], sample_rate: u32, n_mels: usize) -> Vec<Vec<f32>> {
    if waveform.is_empty() {
        return Vec::new();
    }

    let frame_length = (sample_rate as f32 * FRAME_LENGTH_MS / 1000.0).round() as usize;
    let frame_shift = (sample_rate as f32 * FRAME_SHIFT_MS / 1000.0).round() as usize;
    let window = hamming_window(frame_length);
    let fb = mel_filterbank(sample_rate, n_mels, 0.0, sample_rate as f32 / 2.0);

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(N_FFT);

    frame_waveform(waveform, frame_length, frame_shift)
        .iter()
        .map(|frame| {
            let windowed: Vec<f32> = frame.iter().zip(&window).map(|(&s, &w)| s * w).collect();
            let power = rfft_power(&fft, &windowed);
            fb.iter()
                .map(|filter| {
                    let energy: f32 = filter.iter().zip(&power).map(|(&w, &p)| w * p).sum();
                    energy.max(LOG_FLOOR).ln()
                })
                .collect()
        })
        .collect()
}

/// Stacks `lfr_m` adjacent rows stepping by `lfr_n`; a short final window
/// is padded by repeating its last row. Produces `ceil(T / lfr_n)` rows.
pub fn apply_lfr(features: &[Vec<f32>], lfr_m: usize, lfr_n: usize) -> Vec<Vec<f32>> {
    if features.is_empty() {
        return Vec::new();
    }

    let t = features.len();
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < t {
        let end = (idx + lfr_m).min(t);
        let mut chunk: Vec<&Vec<f32>> = features[idx..end].iter().collect();
        let last = *chunk.last().unwrap();
        while chunk.len() < lfr_m {
            chunk.push(last);
        }
        let mut flat = Vec::with_capacity(chunk[0].len() * lfr_m);
        for row in chunk {
            flat.extend_from_slice(row);
        }
        out.push(flat);
        idx += lfr_n;
    }
    out
}

/// `x'[t,c] = (x[t,c] + neg_mean[c]) * inv_stddev[c]`.
pub fn apply_cmvn(
    features: &[Vec<f32>],
    neg_mean: &[f32],
    inv_stddev: &[f32],
) -> Result<Vec<Vec<f32>>> {
    if let Some(row) = features.first() {
        if row.len() != neg_mean.len() {
            return Err(FeatureError::CmvnDimMismatch {
                got: row.len(),
                expected: neg_mean.len(),
            });
        }
        if row.len() != inv_stddev.len() {
            return Err(FeatureError::CmvnDimMismatch {
                got: row.len(),
                expected: inv_stddev.len(),
            });
        }
    }

    Ok(features
        .iter()
        .map(|row| {
            row.iter()
                .zip(neg_mean)
                .zip(inv_stddev)
                .map(|((&x, &m), &s)| (x + m) * s)
                .collect()
        })
        .collect())
}

/// Full front-end for the SenseVoice-style CTC model: s16 PCM (cast to
/// float with no /32768 scaling) → log-mel → LFR → CMVN.
pub fn sensevoice_ctc_features(
    pcm_s16le: &[i16],
    sample_rate: u32,
    n_mels: usize,
    lfr_m: usize,
    lfr_n: usize,
    cmvn_neg_mean: &[f32],
    cmvn_inv_stddev: &[f32],
) -> Result<FeatureMatrix> {
    let waveform: Vec<f32> = pcm_s16le.iter().map(|&s| s as f32).collect();
    let fbanks = log_mel_fbank(&waveform, sample_rate, n_mels);
    let lfr = apply_lfr(&fbanks, lfr_m, lfr_n);
    let feature_dim = n_mels * lfr_m;
    let cmvn = apply_cmvn(&lfr, cmvn_neg_mean, cmvn_inv_stddev)?;
    Ok(FeatureMatrix {
        rows: cmvn,
        feature_dim,
    })
}
