use serde::{Deserialize, Serialize};

/// Policy reducing several readings of one metric into one value per cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionPolicy {
    #[default]
    Mean,
    Median,
    Min,
    Max,
}

impl ReductionPolicy {
    /// Reduces `values`; `None` when there is nothing to reduce.
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }

        let reduced = match self {
            ReductionPolicy::Mean => values.iter().sum::<f64>() / values.len() as f64,
            ReductionPolicy::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            ReductionPolicy::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            ReductionPolicy::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };

        Some(reduced)
    }
}
