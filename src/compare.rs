//! Numeric classification of one computed value against its reference target.
//!
//! The comparator is a pure function of `(computed, target, tolerance)`; it
//! holds no state, so repeated calls on the same triple always agree.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome classification for one expected label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Missing,
    Error,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Missing => "MISSING",
            Self::Error => "ERROR",
        }
    }

    pub fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side(s) of 1.0 a relative tolerance constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioConvention {
    /// ratio in `[1 - delta, 1 + delta]`
    #[default]
    Symmetric,
    /// ratio >= `1 - delta`
    AtLeast,
    /// ratio <= `1 + delta`
    AtMost,
}

/// Acceptance band around a target. All bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Tolerance {
    Relative {
        delta: f64,
        #[serde(default)]
        convention: RatioConvention,
    },
    RatioRange {
        lower: f64,
        upper: f64,
    },
    Absolute {
        epsilon: f64,
    },
}

impl Tolerance {
    pub fn relative(delta: f64) -> Self {
        Self::Relative {
            delta,
            convention: RatioConvention::Symmetric,
        }
    }

    /// Check that the bounds describe a non-empty, finite band.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Self::Relative { delta, .. } => {
                if !delta.is_finite() || delta < 0.0 {
                    return Err(format!("relative delta must be finite and >= 0 (got {delta})"));
                }
            }
            Self::RatioRange { lower, upper } => {
                if !lower.is_finite() || !upper.is_finite() {
                    return Err(format!("ratio range bounds must be finite (got [{lower}, {upper}])"));
                }
                if lower > upper {
                    return Err(format!("ratio range lower {lower} exceeds upper {upper}"));
                }
            }
            Self::Absolute { epsilon } => {
                if !epsilon.is_finite() || epsilon < 0.0 {
                    return Err(format!("absolute epsilon must be finite and >= 0 (got {epsilon})"));
                }
            }
        }
        Ok(())
    }

    fn band(&self) -> Band {
        match *self {
            Self::Relative { delta, convention } => match convention {
                RatioConvention::Symmetric => Band::Ratio(1.0 - delta, 1.0 + delta),
                RatioConvention::AtLeast => Band::Ratio(1.0 - delta, f64::INFINITY),
                RatioConvention::AtMost => Band::Ratio(f64::NEG_INFINITY, 1.0 + delta),
            },
            Self::RatioRange { lower, upper } => Band::Ratio(lower, upper),
            Self::Absolute { epsilon } => Band::Absolute(epsilon),
        }
    }

    pub fn describe(&self) -> String {
        match *self {
            Self::Relative { delta, convention } => match convention {
                RatioConvention::Symmetric => format!("ratio 1±{delta}"),
                RatioConvention::AtLeast => format!("ratio >= {}", 1.0 - delta),
                RatioConvention::AtMost => format!("ratio <= {}", 1.0 + delta),
            },
            Self::RatioRange { lower, upper } => format!("ratio [{lower}, {upper}]"),
            Self::Absolute { epsilon } => format!("|err| <= {epsilon}"),
        }
    }
}

enum Band {
    Ratio(f64, f64),
    Absolute(f64),
}

/// Numeric outcome of one comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub ratio: Option<f64>,
    pub deviation: Option<f64>,
    pub verdict: Verdict,
    pub note: Option<String>,
}

/// `computed / target`, with `0 / 0` defined as exactly 1.0.
pub fn ratio(computed: f64, target: f64) -> Option<f64> {
    if target == 0.0 {
        return (computed == 0.0).then_some(1.0);
    }
    Some(computed / target)
}

/// Classify `computed` against `target` under `tolerance`.
pub fn compare(computed: Option<f64>, target: f64, tolerance: &Tolerance) -> Comparison {
    let Some(computed) = computed else {
        return Comparison {
            ratio: None,
            deviation: None,
            verdict: Verdict::Missing,
            note: None,
        };
    };
    if !computed.is_finite() || !target.is_finite() {
        return Comparison {
            ratio: None,
            deviation: None,
            verdict: Verdict::Error,
            note: Some(format!("non-finite operand (computed {computed}, target {target})")),
        };
    }

    let deviation = computed - target;
    let ratio = ratio(computed, target);

    let verdict = match tolerance.band() {
        Band::Ratio(lower, upper) => match ratio {
            Some(value) if value >= lower && value <= upper => Verdict::Pass,
            Some(_) => Verdict::Fail,
            None => {
                return Comparison {
                    ratio: None,
                    deviation: Some(deviation),
                    verdict: Verdict::Error,
                    note: Some("ratio undefined for zero target".to_string()),
                };
            }
        },
        Band::Absolute(epsilon) => {
            if deviation.abs() <= epsilon {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        }
    };

    Comparison {
        ratio,
        deviation: Some(deviation),
        verdict,
        note: None,
    }
}
