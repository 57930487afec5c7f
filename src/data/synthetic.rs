//! Synthetic recordings for demos and end-to-end tests.
//!
//! The generator builds a stimulus envelope, drives a known causal filter with
//! it, modulates the result by a pupil trace, and draws Poisson spike counts
//! for every repetition. Responses are averaged per stimulus, so the output
//! uses the averaged layout.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Normal, Poisson};

use crate::data::recording::{RecordingFile, RecordingTags};
use crate::domain::ResponseLayout;
use crate::error::FitError;

#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub cellid: String,
    pub channels: usize,
    pub stimuli: usize,
    pub time_bins: usize,
    /// Repetitions of most stimuli.
    pub low_reps: usize,
    /// Repetitions of the last `high_rep_stimuli` stimuli.
    pub high_reps: usize,
    pub high_rep_stimuli: usize,
    pub fir_len: usize,
    /// Strength of the multiplicative pupil gain (0 disables the effect).
    pub pupil_gain: f64,
    pub with_pupil: bool,
    pub fs: f64,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            cellid: "syn001a-a1".to_string(),
            channels: 2,
            stimuli: 12,
            time_bins: 60,
            low_reps: 3,
            high_reps: 10,
            high_rep_stimuli: 2,
            fir_len: 4,
            pupil_gain: 0.5,
            with_pupil: true,
            fs: 100.0,
            seed: 7,
        }
    }
}

/// Kernel used to generate responses: exponentially decaying, alternating
/// sign across channels.
pub fn true_kernel(channels: usize, fir_len: usize) -> Vec<Vec<f64>> {
    (0..channels)
        .map(|c| {
            let sign = if c % 2 == 0 { 1.0 } else { -0.5 };
            (0..fir_len).map(|k| sign * 2.0 * (-(k as f64) / 1.5).exp()).collect()
        })
        .collect()
}

pub fn generate_recording(spec: &SyntheticSpec) -> Result<RecordingFile, FitError> {
    if spec.channels == 0 || spec.stimuli == 0 || spec.time_bins == 0 || spec.fir_len == 0 {
        return Err(FitError::Configuration(
            "Synthetic recording needs at least one channel, stimulus, time bin and filter tap."
                .to_string(),
        ));
    }
    if spec.low_reps == 0 || spec.high_reps == 0 || spec.high_rep_stimuli > spec.stimuli {
        return Err(FitError::Configuration("Invalid synthetic repetition settings.".to_string()));
    }

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let jitter = Normal::new(0.0, 0.1)
        .map_err(|e| FitError::Configuration(format!("Noise distribution error: {e}")))?;

    let kernel = true_kernel(spec.channels, spec.fir_len);
    let baseline = 1.0;

    let mut stim = vec![vec![vec![0.0; spec.time_bins]; spec.stimuli]; spec.channels];
    for channel in stim.iter_mut() {
        for row in channel.iter_mut() {
            // Smoothed uniform envelope in [0, 1].
            let raw: Vec<f64> = (0..spec.time_bins).map(|_| rng.r#gen::<f64>()).collect();
            for t in 0..spec.time_bins {
                let lo = t.saturating_sub(1);
                let hi = (t + 1).min(spec.time_bins - 1);
                row[t] = raw[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64;
            }
        }
    }

    let mut pupil = vec![vec![0.0; spec.time_bins]; spec.stimuli];
    for row in pupil.iter_mut() {
        let mut level: f64 = rng.gen_range(0.2..0.8);
        for value in row.iter_mut() {
            level = (level + jitter.sample(&mut rng) * 0.2).clamp(0.0, 1.0);
            *value = level;
        }
    }

    let mut repcount = Vec::with_capacity(spec.stimuli);
    let mut resp = Vec::with_capacity(spec.stimuli);
    for s in 0..spec.stimuli {
        let reps = if s + spec.high_rep_stimuli >= spec.stimuli {
            spec.high_reps
        } else {
            spec.low_reps
        };
        repcount.push(reps);

        let mut row = vec![0.0; spec.time_bins];
        for t in 0..spec.time_bins {
            let mut drive = baseline;
            for (c, taps) in kernel.iter().enumerate() {
                for (k, w) in taps.iter().enumerate() {
                    if k <= t {
                        drive += w * stim[c][s][t - k];
                    }
                }
            }
            let gain = if spec.with_pupil { 1.0 + spec.pupil_gain * pupil[s][t] } else { 1.0 };
            let rate = (drive * gain).max(1e-3);
            let poisson = Poisson::new(rate)
                .map_err(|e| FitError::Configuration(format!("Spike distribution error: {e}")))?;
            let total: f64 = (0..reps).map(|_| poisson.sample(&mut rng)).sum();
            row[t] = total / reps as f64;
        }
        resp.push(row);
    }

    let duration = spec.time_bins as f64 / spec.fs;
    Ok(RecordingFile {
        cellid: spec.cellid.clone(),
        stimfs: spec.fs,
        respfs: spec.fs,
        isolation: Some(100.0),
        tags: RecordingTags {
            pre_stim_silence: 0.0,
            post_stim_silence: 0.0,
            duration,
        },
        stim,
        resp_raster: resp,
        pupil: spec.with_pupil.then_some(pupil),
        repcount: Some(repcount),
        replist: None,
        layout: ResponseLayout::Averaged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_recording_loads_into_container() {
        let spec = SyntheticSpec::default();
        let rec = generate_recording(&spec).unwrap();
        let c = rec.into_container().unwrap();
        assert_eq!(c.stim.dim(), (2, 12, 60));
        assert_eq!(c.resp.dim(), (1, 12, 60));
        assert!(c.pupil.is_some());
        assert_eq!(c.repetition_count[0], 3);
        assert_eq!(c.repetition_count[11], 10);
        assert!(c.resp.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn same_seed_gives_same_recording() {
        let spec = SyntheticSpec::default();
        let a = generate_recording(&spec).unwrap();
        let b = generate_recording(&spec).unwrap();
        assert_eq!(a.resp_raster, b.resp_raster);
        assert_eq!(a.stim, b.stim);
    }
}
