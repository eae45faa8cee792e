use std::collections::BTreeMap;

use serde::Serialize;

use crate::Tensor;

/// Reconstruction error between original and decoded tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub count: usize,
    pub mse: f64,
    pub mae: f64,
    pub max: f64,
}

impl ErrorStats {
    /// Compares tensors present in both maps with matching element counts.
    pub fn between(original: &BTreeMap<String, Tensor>, decoded: &BTreeMap<String, Tensor>) -> Self {
        let mut total = 0usize;
        let mut mse_acc = 0.0f64;
        let mut mae_acc = 0.0f64;
        let mut max_err = 0.0f64;

        for (name, orig_t) in original {
            let Some(rec_t) = decoded.get(name) else {
                continue;
            };
            if orig_t.data.len() != rec_t.data.len() {
                continue;
            }
            for (o, r) in orig_t.data.iter().zip(rec_t.data.iter()) {
                let diff = (*o as f64 - *r as f64).abs();
                mse_acc += diff * diff;
                mae_acc += diff;
                if diff > max_err {
                    max_err = diff;
                }
                total += 1;
            }
        }

        if total == 0 {
            return ErrorStats::default();
        }

        ErrorStats {
            count: total,
            mse: mse_acc / total as f64,
            mae: mae_acc / total as f64,
            max: max_err,
        }
    }
}
