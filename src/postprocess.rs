use ndarray::Array1;

use crate::error::InferenceError;
use crate::labels::{DrGrade, NUM_CLASSES};

/// Applies softmax to a 1D array (slice) and returns a new Array1<f32>.
pub fn softmax(slice: &Array1<f32>) -> Array1<f32> {
    let max_val = slice.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Array1<f32> = slice.mapv(|x| (x - max_val).exp());
    let sum_exp: f32 = exp_vals.sum();
    exp_vals.mapv(|v| v / sum_exp)
}

/// Index and value of the largest entry. Ties keep the first index.
pub fn argmax_and_max(softmaxed: &Array1<f32>) -> (usize, f32) {
    softmaxed
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(max_idx, max_val), (i, &val)| {
            if val > max_val { (i, val) } else { (max_idx, max_val) }
        })
}

/// Outcome of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub grade: DrGrade,
    pub index: usize,
    /// Probability of `grade`, in `[0, 1]`.
    pub confidence: f32,
    pub probabilities: Vec<f32>,
    pub logits: Vec<f32>,
}

impl Prediction {
    pub fn from_logits(logits: Vec<f32>) -> Result<Self, InferenceError> {
        if logits.len() != NUM_CLASSES {
            return Err(InferenceError::Shape {
                actual: vec![logits.len()],
                expected: vec![NUM_CLASSES],
            });
        }
        let probabilities = softmax(&Array1::from(logits.clone()));
        let (index, confidence) = argmax_and_max(&probabilities);
        let grade = DrGrade::from_index(index)
            .ok_or_else(|| InferenceError::Tensor(format!("class index {index} out of range")))?;

        Ok(Self {
            grade,
            index,
            confidence,
            probabilities: probabilities.to_vec(),
            logits,
        })
    }

    pub fn label(&self) -> &'static str {
        self.grade.label()
    }
}
