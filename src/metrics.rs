//! Binary classification metrics. Label 1 (no-show) is the positive class;
//! a ratio with a zero denominator is reported as 0.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tn: u64,
    pub fp: u64,
    pub fn_: u64,
    pub tp: u64,
}

impl ConfusionMatrix {
    pub fn from_predictions(y_true: &[usize], y_pred: &[usize]) -> Self {
        let mut cm = Self::default();
        for (&truth, &pred) in y_true.iter().zip(y_pred) {
            match (truth, pred) {
                (0, 0) => cm.tn += 1,
                (0, _) => cm.fp += 1,
                (_, 0) => cm.fn_ += 1,
                _ => cm.tp += 1,
            }
        }
        cm
    }

    pub fn total(&self) -> u64 {
        self.tn + self.fp + self.fn_ + self.tp
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tn + self.tp, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    /// `[[tn, fp], [fn, tp]]`, rows are true labels.
    pub fn to_array(&self) -> [[u64; 2]; 2] {
        [[self.tn, self.fp], [self.fn_, self.tp]]
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub fn f1_score(y_true: &[usize], y_pred: &[usize]) -> f64 {
    ConfusionMatrix::from_predictions(y_true, y_pred).f1()
}

/// Rounds to `decimals` places for comparisons that must ignore float noise.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
