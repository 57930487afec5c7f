//! Stimulus-specific adaptation (SSA) index for two-stream oddball stimuli.
//!
//! The stimulus has two channels, one per tone stream, holding 0/1 tone
//! envelopes. In each trial the stream with more tones is the standard and
//! the other the deviant. Responses to every tone are cut out with one tone
//! length of context on each side; the first tone of a trial is kept apart as
//! an onset response. The index compares mean post-onset activity:
//! `SI = (deviant − standard) / (deviant + standard)`.

use ndarray::{Array3, Axis};

use crate::data::DataContainer;
use crate::domain::Field;
use crate::error::FitError;
use crate::stack::StackState;

use super::Stage;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SsaResult {
    pub stream0: f64,
    pub stream1: f64,
    pub cell: f64,
}

#[derive(Debug, Clone)]
pub struct SsaIndex {
    pub stim: Field,
    pub resp: Field,
    /// One result per scored container, in input order.
    pub results: Vec<SsaResult>,
}

impl Default for SsaIndex {
    fn default() -> Self {
        Self {
            stim: Field::Stim,
            resp: Field::Resp,
            results: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Pools {
    standard: [Vec<Vec<f64>>; 2],
    deviant: [Vec<Vec<f64>>; 2],
    onset: [Vec<Vec<f64>>; 2],
}

fn onsets(stim: &Array3<f64>, stream: usize, trial: usize) -> Vec<usize> {
    let time = stim.len_of(Axis(2));
    (0..time.saturating_sub(1))
        .filter(|&t| stim[[stream, trial, t + 1]] - stim[[stream, trial, t]] == 1.0)
        .map(|t| t + 1)
        .collect()
}

fn first_transition(stim: &Array3<f64>, step: f64) -> Option<usize> {
    let time = stim.len_of(Axis(2));
    (0..time.saturating_sub(1)).find(|&t| stim[[0, 0, t + 1]] - stim[[0, 0, t]] == step)
}

/// Mean across slices (ignoring NaN), summed from the tone onset onward.
fn activity(slices: &[Vec<f64>], tone_len: usize) -> f64 {
    let Some(width) = slices.first().map(Vec::len) else {
        return 0.0;
    };
    (tone_len..width)
        .map(|t| {
            let (sum, n) = slices
                .iter()
                .map(|s| s[t])
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
            if n == 0 { 0.0 } else { sum / n as f64 }
        })
        .sum()
}

fn index(deviant: f64, standard: f64) -> f64 {
    let si = (deviant - standard) / (deviant + standard);
    if si.is_finite() {
        si
    } else {
        log::debug!("ssa: zero activity, index set to 0");
        0.0
    }
}

/// SSA index of one recording.
pub fn ssa_index(stim: &Array3<f64>, resp: &Array3<f64>) -> Result<SsaResult, FitError> {
    let (streams, trials, time) = stim.dim();
    if streams != 2 {
        return Err(FitError::Shape(format!(
            "SSA index needs a two-stream stimulus, found {streams} channels"
        )));
    }
    if resp.len_of(Axis(1)) != trials || resp.len_of(Axis(2)) != time {
        return Err(FitError::Shape("SSA response does not match the stimulus".to_string()));
    }
    let tone_len = match (first_transition(stim, 1.0), first_transition(stim, -1.0)) {
        (Some(on), Some(off)) if off > on => off - on,
        _ => {
            return Err(FitError::Shape(
                "SSA stimulus has no complete tone in its first trial".to_string(),
            ));
        }
    };

    let mut pools = Pools::default();
    for trial in 0..trials {
        let cut = |ii: usize| -> Option<Vec<f64>> {
            (ii >= tone_len && ii + 2 * tone_len <= time)
                .then(|| (ii - tone_len..ii + 2 * tone_len).map(|t| resp[[0, trial, t]]).collect())
        };
        let starts = [onsets(stim, 0, trial), onsets(stim, 1, trial)];
        let mut slices: [Vec<Option<Vec<f64>>>; 2] = [
            starts[0].iter().map(|&ii| cut(ii)).collect(),
            starts[1].iter().map(|&ii| cut(ii)).collect(),
        ];

        // The first tone of the trial is an onset response, not part of the sequence.
        if let (Some(a), Some(b)) = (starts[0].first(), starts[1].first()) {
            let first = if a < b { 0 } else { 1 };
            if a != b {
                if let Some(slice) = slices[first].remove(0) {
                    pools.onset[first].push(slice);
                }
            }
        }

        let tones: [f64; 2] = [0, 1].map(|s| {
            stim.index_axis(Axis(0), s)
                .index_axis(Axis(0), trial)
                .iter()
                .filter(|v| !v.is_nan())
                .sum()
        });
        let [s0, s1] = slices.map(|list| list.into_iter().flatten().collect::<Vec<_>>());
        if tones[0] > tones[1] {
            pools.standard[0].extend(s0);
            pools.deviant[1].extend(s1);
        } else if tones[0] < tones[1] {
            pools.standard[1].extend(s1);
            pools.deviant[0].extend(s0);
        }
    }

    let standard = [0, 1].map(|s| activity(&pools.standard[s], tone_len));
    let deviant = [0, 1].map(|s| activity(&pools.deviant[s], tone_len));
    log::debug!(
        "ssa: {} onset responses, standard {standard:?}, deviant {deviant:?}",
        pools.onset[0].len() + pools.onset[1].len()
    );

    Ok(SsaResult {
        stream0: index(deviant[0], standard[0]),
        stream1: index(deviant[1], standard[1]),
        cell: index(deviant[0] + deviant[1], standard[0] + standard[1]),
    })
}

impl Stage for SsaIndex {
    fn name(&self) -> &'static str {
        "metrics.ssa_index"
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        self.results = input
            .iter()
            .map(|c| ssa_index(c.require(self.stim)?, c.require(self.resp)?))
            .collect::<Result<_, _>>()?;
        if let Some(first) = self.results.first() {
            state.meta.insert("si_stream0".to_string(), first.stream0);
            state.meta.insert("si_stream1".to_string(), first.stream1);
            state.meta.insert("si_cell".to_string(), first.cell);
        }
        Ok(input.to_vec())
    }
}
