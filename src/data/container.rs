//! The data container that flows between stack modules.
//!
//! A container holds one recording (or one estimation/validation view of it).
//! All signals share the trial axis (axis 1), so restricting a container to a
//! subset of trials is a single `select` per signal.

use ndarray::{Array3, Axis};

use crate::domain::{Field, ResponseLayout};
use crate::error::FitError;

#[derive(Debug, Clone, PartialEq)]
pub struct DataContainer {
    /// Stimulus envelope, `(channel, trial, time)`.
    pub stim: Array3<f64>,
    /// Measured response, `(1, trial, time)`.
    pub resp: Array3<f64>,
    /// Pupil diameter, same shape as `resp`. Absent when not recorded.
    pub pupil: Option<Array3<f64>>,
    /// Model prediction, written by filter/gain modules.
    pub pred: Option<Array3<f64>>,

    /// Repetitions per distinct stimulus.
    pub repetition_count: Vec<usize>,
    /// Stimulus index per row (only for [`ResponseLayout::PerTrial`]).
    pub replist: Option<Vec<usize>>,
    pub layout: ResponseLayout,

    /// `None` until a splitter has run; never re-split afterwards.
    pub is_estimation: Option<bool>,
    /// Cross-validation fold that produced this view.
    pub fold: Option<usize>,

    /// Sampling rate (Hz) shared by all signals.
    pub fs: f64,
}

impl DataContainer {
    /// Build an unsplit container, checking that all signals agree on shape.
    pub fn new(
        stim: Array3<f64>,
        resp: Array3<f64>,
        pupil: Option<Array3<f64>>,
        repetition_count: Vec<usize>,
        replist: Option<Vec<usize>>,
        layout: ResponseLayout,
        fs: f64,
    ) -> Result<Self, FitError> {
        let container = Self {
            stim,
            resp,
            pupil,
            pred: None,
            repetition_count,
            replist,
            layout,
            is_estimation: None,
            fold: None,
            fs,
        };
        container.validate()?;
        Ok(container)
    }

    /// Number of rows along the trial axis.
    pub fn trial_count(&self) -> usize {
        self.resp.len_of(Axis(1))
    }

    pub fn time_len(&self) -> usize {
        self.resp.len_of(Axis(2))
    }

    /// Borrow a signal, or `None` when an optional field is absent.
    pub fn get(&self, field: Field) -> Option<&Array3<f64>> {
        match field {
            Field::Stim => Some(&self.stim),
            Field::Resp => Some(&self.resp),
            Field::Pupil => self.pupil.as_ref(),
            Field::Pred => self.pred.as_ref(),
        }
    }

    /// Borrow a signal that the caller cannot do without.
    pub fn require(&self, field: Field) -> Result<&Array3<f64>, FitError> {
        self.get(field).ok_or(FitError::MissingField { field })
    }

    pub fn set(&mut self, field: Field, value: Array3<f64>) {
        match field {
            Field::Stim => self.stim = value,
            Field::Resp => self.resp = value,
            Field::Pupil => self.pupil = Some(value),
            Field::Pred => self.pred = Some(value),
        }
    }

    /// Stimulus index for each row.
    pub fn stimulus_of_rows(&self) -> Vec<usize> {
        match (&self.layout, &self.replist) {
            (ResponseLayout::PerTrial, Some(replist)) => replist.clone(),
            _ => (0..self.trial_count()).collect(),
        }
    }

    /// Copy of this container restricted to `rows` along the trial axis.
    ///
    /// Row-aligned bookkeeping follows the rows: the averaged layout's
    /// repetition counts and the per-trial stimulus list are sliced too. The
    /// per-trial layout keeps its per-stimulus counts unchanged.
    pub fn select_trials(&self, rows: &[usize]) -> DataContainer {
        let repetition_count = match self.layout {
            ResponseLayout::Averaged => rows.iter().map(|&r| self.repetition_count[r]).collect(),
            ResponseLayout::PerTrial => self.repetition_count.clone(),
        };
        DataContainer {
            stim: self.stim.select(Axis(1), rows),
            resp: self.resp.select(Axis(1), rows),
            pupil: self.pupil.as_ref().map(|p| p.select(Axis(1), rows)),
            pred: self.pred.as_ref().map(|p| p.select(Axis(1), rows)),
            repetition_count,
            replist: self
                .replist
                .as_ref()
                .map(|list| rows.iter().map(|&r| list[r]).collect()),
            layout: self.layout,
            is_estimation: self.is_estimation,
            fold: self.fold,
            fs: self.fs,
        }
    }

    fn validate(&self) -> Result<(), FitError> {
        let (_, trials, time) = self.resp.dim();
        if self.resp.len_of(Axis(0)) != 1 {
            return Err(FitError::Shape(format!(
                "response must have a single channel, found {}",
                self.resp.len_of(Axis(0))
            )));
        }
        let (_, stim_trials, stim_time) = self.stim.dim();
        if stim_trials != trials || stim_time != time {
            return Err(FitError::Shape(format!(
                "stimulus is {stim_trials}x{stim_time} (trial x time) but response is {trials}x{time}"
            )));
        }
        if let Some(pupil) = &self.pupil {
            if pupil.dim() != self.resp.dim() {
                return Err(FitError::Shape(format!(
                    "pupil shape {:?} differs from response shape {:?}",
                    pupil.shape(),
                    self.resp.shape()
                )));
            }
        }
        match self.layout {
            ResponseLayout::Averaged => {
                if self.repetition_count.len() != trials {
                    return Err(FitError::Shape(format!(
                        "{} repetition counts for {trials} averaged rows",
                        self.repetition_count.len()
                    )));
                }
            }
            ResponseLayout::PerTrial => {
                let Some(replist) = &self.replist else {
                    return Err(FitError::Shape(
                        "per-trial layout requires a stimulus index per row".to_string(),
                    ));
                };
                if replist.len() != trials {
                    return Err(FitError::Shape(format!(
                        "{} stimulus indices for {trials} rows",
                        replist.len()
                    )));
                }
                if let Some(&bad) = replist.iter().find(|&&s| s >= self.repetition_count.len()) {
                    return Err(FitError::Shape(format!(
                        "row refers to stimulus {bad} but only {} stimuli have repetition counts",
                        self.repetition_count.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Stack containers of one recording along the trial axis.
///
/// Optional signals are kept only when every part carries them. The result
/// inherits the split flag of the first part and belongs to no fold.
pub fn concat_trials(parts: &[DataContainer]) -> Result<DataContainer, FitError> {
    let Some(first) = parts.first() else {
        return Err(FitError::Shape("nothing to concatenate".to_string()));
    };
    let stim = join_signal(parts.iter().map(|p| Some(&p.stim)))?;
    let resp = join_signal(parts.iter().map(|p| Some(&p.resp)))?;
    let (Some(stim), Some(resp)) = (stim, resp) else {
        return Err(FitError::Shape("stimulus or response missing while concatenating".to_string()));
    };
    let pupil = join_signal(parts.iter().map(|p| p.pupil.as_ref()))?;
    let pred = join_signal(parts.iter().map(|p| p.pred.as_ref()))?;

    let (repetition_count, replist) = match first.layout {
        ResponseLayout::Averaged => (
            parts.iter().flat_map(|p| p.repetition_count.iter().copied()).collect(),
            None,
        ),
        ResponseLayout::PerTrial => (
            first.repetition_count.clone(),
            Some(
                parts
                    .iter()
                    .flat_map(|p| p.replist.iter().flatten().copied())
                    .collect(),
            ),
        ),
    };

    let mut joined = DataContainer::new(stim, resp, pupil, repetition_count, replist, first.layout, first.fs)?;
    joined.pred = pred;
    joined.is_estimation = first.is_estimation;
    Ok(joined)
}

fn join_signal<'a>(
    parts: impl Iterator<Item = Option<&'a Array3<f64>>>,
) -> Result<Option<Array3<f64>>, FitError> {
    let views: Option<Vec<_>> = parts.map(|a| a.map(|a| a.view())).collect();
    views
        .map(|v| ndarray::concatenate(Axis(1), &v).map_err(|e| FitError::Shape(e.to_string())))
        .transpose()
}

/// Flatten a field across containers, keeping those accepted by `keep`.
pub fn gather(
    containers: &[DataContainer],
    field: Field,
    keep: impl Fn(&DataContainer) -> bool,
) -> Result<Vec<f64>, FitError> {
    let mut out = Vec::new();
    for c in containers.iter().filter(|c| keep(c)) {
        out.extend(c.require(field)?.iter().copied());
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Averaged container whose response row `i` is filled with `i`.
    pub(crate) fn averaged(repetition_count: Vec<usize>, time: usize, with_pupil: bool) -> DataContainer {
        let trials = repetition_count.len();
        let stim = Array3::from_shape_fn((2, trials, time), |(c, r, t)| (c * 100 + r * 10 + t) as f64);
        let resp = Array3::from_shape_fn((1, trials, time), |(_, r, _)| r as f64);
        let pupil = with_pupil.then(|| Array3::from_shape_fn((1, trials, time), |(_, r, t)| (r + t) as f64));
        DataContainer::new(stim, resp, pupil, repetition_count, None, ResponseLayout::Averaged, 100.0)
            .unwrap()
    }

    #[test]
    fn new_rejects_mismatched_stimulus() {
        let stim = Array3::zeros((2, 3, 10));
        let resp = Array3::zeros((1, 4, 10));
        let err = DataContainer::new(stim, resp, None, vec![1; 4], None, ResponseLayout::Averaged, 100.0)
            .unwrap_err();
        assert!(matches!(err, FitError::Shape(_)));
    }

    #[test]
    fn per_trial_layout_requires_replist() {
        let err = DataContainer::new(
            Array3::zeros((1, 3, 5)),
            Array3::zeros((1, 3, 5)),
            None,
            vec![3],
            None,
            ResponseLayout::PerTrial,
            100.0,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::Shape(_)));
    }

    #[test]
    fn select_trials_slices_every_signal() {
        let c = averaged(vec![1, 2, 3, 4], 5, true);
        let sub = c.select_trials(&[1, 3]);
        assert_eq!(sub.trial_count(), 2);
        assert_eq!(sub.stim.dim(), (2, 2, 5));
        assert_eq!(sub.resp[[0, 0, 0]], 1.0);
        assert_eq!(sub.resp[[0, 1, 4]], 3.0);
        assert_eq!(sub.pupil.as_ref().unwrap()[[0, 1, 2]], 5.0);
        assert_eq!(sub.repetition_count, vec![2, 4]);
    }

    #[test]
    fn select_trials_keeps_per_stimulus_counts_for_per_trial_layout() {
        let c = DataContainer::new(
            Array3::zeros((1, 4, 2)),
            Array3::zeros((1, 4, 2)),
            None,
            vec![3, 1],
            Some(vec![0, 0, 1, 0]),
            ResponseLayout::PerTrial,
            100.0,
        )
        .unwrap();
        let sub = c.select_trials(&[1, 2]);
        assert_eq!(sub.replist, Some(vec![0, 1]));
        assert_eq!(sub.repetition_count, vec![3, 1]);
    }

    #[test]
    fn concat_trials_restores_split_rows() {
        let c = averaged(vec![1, 2, 3, 4], 3, true);
        let mut a = c.select_trials(&[0, 1]);
        let mut b = c.select_trials(&[2, 3]);
        a.is_estimation = Some(false);
        a.fold = Some(0);
        b.is_estimation = Some(false);
        b.fold = Some(1);
        b.pred = Some(Array3::zeros((1, 2, 3)));

        let joined = concat_trials(&[a, b]).unwrap();
        assert_eq!(joined.stim, c.stim);
        assert_eq!(joined.resp, c.resp);
        assert_eq!(joined.pupil, c.pupil);
        assert!(joined.pred.is_none());
        assert_eq!(joined.repetition_count, vec![1, 2, 3, 4]);
        assert_eq!(joined.is_estimation, Some(false));
        assert_eq!(joined.fold, None);
    }

    #[test]
    fn missing_pupil_is_reported() {
        let c = averaged(vec![1, 2], 3, false);
        assert!(c.get(Field::Pupil).is_none());
        let err = c.require(Field::Pupil).unwrap_err();
        assert!(matches!(err, FitError::MissingField { field: Field::Pupil }));
    }
}
