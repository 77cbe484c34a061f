use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use crate::drivers::RadarError;

/// ADC reference voltage.
pub const VREF: f64 = 3.3;
/// 12-bit converter.
pub const ADC_RESOLUTION: f64 = 4096.0;

/// Everything derived from one target's raw I/Q sweep.
#[derive(Clone, Debug)]
pub struct ProcessedTarget {
    pub calibrated_i: Vec<f64>,
    pub calibrated_q: Vec<f64>,
    pub spectrum: Vec<Complex64>,
    pub magnitude: Vec<f64>,
    pub peak_index: usize,
    /// Radians, in (-pi, pi].
    pub peak_phase: f64,
}

/// Turns raw ADC sweeps into calibrated spectra. The FFT plan and Hann window are
/// built once per sweep length; `process` itself has no side effects.
pub struct SignalProcessor {
    len: usize,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
}

impl SignalProcessor {
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(len);
        Self {
            len,
            fft,
            window: hann(len),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn process(&self, raw_i: &[u16], raw_q: &[u16]) -> Result<ProcessedTarget, RadarError> {
        if self.len == 0 || raw_i.len() != self.len || raw_q.len() != self.len {
            return Err(RadarError::SampleMismatch {
                expected: self.len,
                i: raw_i.len(),
                q: raw_q.len(),
            });
        }

        let calibrated_i = calibrate(raw_i);
        let calibrated_q = calibrate(raw_q);

        let gain = 2.0 / VREF;
        let mut spectrum: Vec<Complex64> = calibrated_i
            .iter()
            .zip(&calibrated_q)
            .zip(&self.window)
            .map(|((&re, &im), &w)| Complex64::new(re, im) * (w * gain))
            .collect();
        self.fft.process(&mut spectrum);

        let magnitude: Vec<f64> = spectrum.iter().map(|c| 2.0 * c.norm()).collect();
        let peak_index = peak(&magnitude);
        let peak_phase = wrap_phase(spectrum[peak_index].arg());

        Ok(ProcessedTarget {
            calibrated_i,
            calibrated_q,
            spectrum,
            magnitude,
            peak_index,
            peak_phase,
        })
    }
}

/// Volts with the DC component removed.
pub fn calibrate(raw: &[u16]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let scale = VREF / ADC_RESOLUTION;
    let volts: Vec<f64> = raw.iter().map(|&v| f64::from(v) * scale).collect();
    let mean = volts.iter().sum::<f64>() / volts.len() as f64;
    volts.into_iter().map(|v| v - mean).collect()
}

/// Symmetric Hann window, zero at both ends.
pub fn hann(len: usize) -> Vec<f64> {
    match len {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (len - 1) as f64;
            (0..len)
                .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / denom).cos())
                .collect()
        }
    }
}

/// Index of the largest value; the first one wins on ties.
pub fn peak(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, max), (k, &v)| {
            if v > max {
                (k, v)
            } else {
                (best, max)
            }
        })
        .0
}

/// Maps `atan2` output onto (-pi, pi]; only -pi itself moves.
fn wrap_phase(phase: f64) -> f64 {
    if phase <= -PI {
        phase + 2.0 * PI
    } else {
        phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, bin: usize, amplitude: f64, phase: f64) -> (Vec<u16>, Vec<u16>) {
        (0..len)
            .map(|n| {
                let arg = 2.0 * PI * bin as f64 * n as f64 / len as f64 + phase;
                (
                    (2048.0 + amplitude * arg.cos()).round() as u16,
                    (2048.0 + amplitude * arg.sin()).round() as u16,
                )
            })
            .unzip()
    }

    #[test]
    fn all_zero_input_gives_flat_spectrum() {
        let proc = SignalProcessor::new(200);
        let zeros = vec![0u16; 200];
        let out = proc.process(&zeros, &zeros).unwrap();
        assert_eq!(out.magnitude.len(), 200);
        assert!(out.magnitude.iter().all(|&m| m == 0.0));
        assert_eq!(out.peak_index, 0);
        assert!(out.peak_phase.is_finite());
    }

    #[test]
    fn constant_input_is_removed_by_calibration() {
        let proc = SignalProcessor::new(64);
        let flat = vec![3000u16; 64];
        let out = proc.process(&flat, &flat).unwrap();
        assert!(out.calibrated_i.iter().all(|v| v.abs() < 1e-12));
        assert!(out.magnitude.iter().all(|&m| m < 1e-9));
    }

    #[test]
    fn processing_is_deterministic() {
        let proc = SignalProcessor::new(200);
        let (i, q) = tone(200, 17, 700.0, 0.4);
        let a = proc.process(&i, &q).unwrap();
        let b = SignalProcessor::new(200).process(&i, &q).unwrap();
        assert_eq!(a.magnitude, b.magnitude);
        assert_eq!(a.peak_index, b.peak_index);
        assert_eq!(a.peak_phase, b.peak_phase);
    }

    #[test]
    fn pure_tone_peaks_at_its_bin() {
        let len = 200;
        let bin = 20;
        let proc = SignalProcessor::new(len);
        let (i, q) = tone(len, bin, 1000.0, 0.0);
        let out = proc.process(&i, &q).unwrap();
        assert_eq!(out.peak_index, bin);

        // Hann sidelobes sit at least ~31 dB under the main lobe
        let floor = out.magnitude[bin] / 10f64.powf(31.0 / 20.0);
        for (k, &m) in out.magnitude.iter().enumerate() {
            let dist = (k as isize - bin as isize).unsigned_abs();
            let dist = dist.min(len - dist);
            if dist >= 3 {
                assert!(m < floor, "bin {k}: {m} vs peak {}", out.magnitude[bin]);
            }
        }
    }

    #[test]
    fn peak_phase_tracks_tone_phase() {
        let proc = SignalProcessor::new(128);
        let (i0, q0) = tone(128, 10, 900.0, 0.0);
        let (i1, q1) = tone(128, 10, 900.0, 1.0);
        let p0 = proc.process(&i0, &q0).unwrap().peak_phase;
        let p1 = proc.process(&i1, &q1).unwrap().peak_phase;
        let mut delta = p1 - p0;
        if delta <= -PI {
            delta += 2.0 * PI;
        }
        assert!((delta - 1.0).abs() < 0.05, "delta {delta}");
    }

    #[test]
    fn peak_phase_stays_in_half_open_range() {
        let proc = SignalProcessor::new(100);
        for step in 0..40 {
            let phase = -PI + step as f64 * (2.0 * PI / 40.0);
            let (i, q) = tone(100, 7, 500.0, phase);
            let p = proc.process(&i, &q).unwrap().peak_phase;
            assert!(p > -PI && p <= PI, "phase {p}");
        }
        assert_eq!(wrap_phase(-PI), PI);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let proc = SignalProcessor::new(8);
        assert!(matches!(
            proc.process(&[0; 8], &[0; 7]),
            Err(RadarError::SampleMismatch { expected: 8, i: 8, q: 7 })
        ));
    }

    #[test]
    fn hann_matches_reference_values() {
        let w = hann(5);
        let expected = [0.0, 0.5, 1.0, 0.5, 0.0];
        for (a, b) in w.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_eq!(hann(1), vec![1.0]);
    }

    #[test]
    fn ties_resolve_to_first_peak() {
        assert_eq!(peak(&[1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(peak(&[0.0, 0.0]), 0);
    }
}
