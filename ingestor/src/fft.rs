//! Amplitude spectrum of a real-valued sample buffer.
//!
//! The buffer is truncated to the largest power of two (keeping the newest
//! samples), DC-corrected, Hann-windowed and run through an in-place
//! iterative radix-2 Cooley-Tukey transform.

use crate::model::FrequencyBin;
use std::f64::consts::PI;

/// Standard `2/N` amplitude normalization times the Hann coherent gain correction of 2.
const HANN_SCALE: f64 = 4.0;

pub fn compute_fft(samples: &[f64], sample_rate: f64) -> Vec<FrequencyBin> {
    if samples.is_empty() {
        return Vec::new();
    }

    let n = largest_power_of_two(samples.len());
    let input = &samples[samples.len() - n..];

    let mean = input.iter().sum::<f64>() / n as f64;
    let mut real: Vec<f64> = input
        .iter()
        .enumerate()
        .map(|(i, &v)| (v - mean) * hann(i, n))
        .collect();
    let mut imag = vec![0.0; n];

    transform(&mut real, &mut imag);

    let scale = HANN_SCALE / n as f64;
    (0..n / 2)
        .map(|k| FrequencyBin {
            frequency: k as f64 * sample_rate / n as f64,
            magnitude: real[k].hypot(imag[k]) * scale,
        })
        .collect()
}

fn largest_power_of_two(len: usize) -> usize {
    1 << (usize::BITS - 1 - len.leading_zeros())
}

fn hann(i: usize, n: usize) -> f64 {
    if n < 2 {
        return 1.0;
    }
    0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos())
}

/// In-place forward FFT. `real.len()` must be a power of two.
fn transform(real: &mut [f64], imag: &mut [f64]) {
    let n = real.len();

    // bit-reversal permutation
    let mut j = 0;
    for i in 0..n.saturating_sub(1) {
        if i < j {
            real.swap(i, j);
            imag.swap(i, j);
        }
        let mut k = n >> 1;
        while k <= j {
            j -= k;
            k >>= 1;
        }
        j += k;
    }

    let mut m = 1;
    while m < n {
        let step = m << 1;
        let (wi_step, wr_step) = (-PI / m as f64).sin_cos();

        for start in (0..n).step_by(step) {
            let (mut wr, mut wi) = (1.0, 0.0);
            for i in 0..m {
                let a = start + i;
                let b = a + m;

                let tr = wr * real[b] - wi * imag[b];
                let ti = wr * imag[b] + wi * real[b];

                real[b] = real[a] - tr;
                imag[b] = imag[a] - ti;
                real[a] += tr;
                imag[a] += ti;

                let next_wr = wr * wr_step - wi * wi_step;
                wi = wr * wi_step + wi * wr_step;
                wr = next_wr;
            }
        }
        m = step;
    }
}
