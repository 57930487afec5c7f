//! Model-name keywords.
//!
//! A model name such as `xval10_wc02_fir15_pupgain_fit00` is a `_`-separated
//! list of keywords, each naming one stack step. Numeric suffixes carry the
//! step's size or order.

use crate::domain::FitterKind;
use crate::error::FitError;
use crate::modules::GainKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Keyword {
    /// `stdval`: standard estimation/validation split.
    StandardSplit,
    /// `xvalNN`: cross-validation holding out `NN` percent per fold.
    CrossValidation { validation_fraction: f64 },
    /// `wcNN`: channel weighting down to `NN` channels.
    WeightChannels(usize),
    /// `firNN`: FIR filter with `NN` taps.
    Fir(usize),
    /// `dc`
    DcGain,
    /// `dexp`
    DoubleExponential,
    PupilGain(GainKind),
    /// `mseshr` / `huber`: the metric the fit minimizes.
    Objective(Objective),
    /// `ssa`: also score stimulus-specific adaptation.
    SsaIndex,
    /// `fit00` / `fit01`
    Fit(FitterKind),
}

/// Objective metric selected by a model name.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Objective {
    /// Normalized mean square error.
    #[default]
    MeanSquareError,
    /// Mean square error shrunk toward 1 across time bins.
    ShrunkMeanSquareError,
    /// Pseudo-Huber cost on the relative per-trial error.
    PseudoHuber,
}

impl Keyword {
    pub fn parse(word: &str) -> Result<Self, FitError> {
        let unknown = || FitError::UnknownKeyword(word.to_string());
        let keyword = match word {
            "stdval" => Keyword::StandardSplit,
            "dc" => Keyword::DcGain,
            "dexp" => Keyword::DoubleExponential,
            "nopupgain" => Keyword::PupilGain(GainKind::NoPupil),
            "pupgain" => Keyword::PupilGain(GainKind::Linear),
            "pupgainctl" => Keyword::PupilGain(GainKind::LinearControl),
            "exppupgain" => Keyword::PupilGain(GainKind::Exponential),
            "mseshr" => Keyword::Objective(Objective::ShrunkMeanSquareError),
            "huber" => Keyword::Objective(Objective::PseudoHuber),
            "ssa" => Keyword::SsaIndex,
            "fit00" => Keyword::Fit(FitterKind::NelderMead),
            "fit01" => Keyword::Fit(FitterKind::CoordinateDescent),
            _ => {
                if let Some(n) = word.strip_prefix("xval") {
                    let percent = number(n).ok_or_else(unknown)?;
                    if percent == 0 || percent >= 100 {
                        return Err(FitError::Configuration(format!(
                            "`{word}`: validation percentage must be between 1 and 99"
                        )));
                    }
                    Keyword::CrossValidation {
                        validation_fraction: percent as f64 / 100.0,
                    }
                } else if let Some(n) = word.strip_prefix("wc") {
                    Keyword::WeightChannels(positive(word, n)?)
                } else if let Some(n) = word.strip_prefix("fir") {
                    Keyword::Fir(positive(word, n)?)
                } else if let Some(n) = word.strip_prefix("polypupgain") {
                    let degree = positive(word, n)?;
                    Keyword::PupilGain(GainKind::Polynomial { degree: degree as u32 })
                } else if let Some(n) = word.strip_prefix("powergain") {
                    let order = positive(word, n)?;
                    Keyword::PupilGain(GainKind::Power { order: order as u32 })
                } else if let Some(n) = word.strip_prefix("butterworth") {
                    let order = positive(word, n)?;
                    Keyword::PupilGain(GainKind::ButterworthHighPass { order: order as u32 })
                } else {
                    return Err(unknown());
                }
            }
        };
        Ok(keyword)
    }
}

fn number(digits: &str) -> Option<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn positive(word: &str, digits: &str) -> Result<usize, FitError> {
    match number(digits) {
        Some(0) => Err(FitError::Configuration(format!("`{word}`: size must be at least 1"))),
        Some(n) => Ok(n),
        None => Err(FitError::UnknownKeyword(word.to_string())),
    }
}

/// Split a model name into keywords.
pub fn parse_modelname(modelname: &str) -> Result<Vec<Keyword>, FitError> {
    if modelname.trim().is_empty() {
        return Err(FitError::Configuration("model name is empty".to_string()));
    }
    modelname.split('_').map(Keyword::parse).collect()
}
