use ndarray::{Array1, Array2, ArrayView1};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::drivers::window::Window;
use crate::drivers::{StreamError, StreamResult};
use crate::types::Sample;

/// A pre-fit linear decomposition applied during extraction.
///
/// `unmixing` maps channels to components, `mixing` maps components back.
/// Output vectors keep only the non-excluded components, remixed through the
/// matching block of `mixing`, so a window loses one channel per excluded
/// component. Immutable once built; refits produce a new value.
#[derive(Clone, Debug)]
pub struct TransformState {
    mixing: Array2<f64>,
    unmixing: Array2<f64>,
    excluded: Vec<usize>,
    kept: Vec<usize>,
    projection: Array2<f64>,
}

impl TransformState {
    pub fn new(mixing: Array2<f64>, unmixing: Array2<f64>, excluded: Vec<usize>) -> StreamResult<Self> {
        let n = unmixing.ncols();
        for (rows, cols) in [mixing.dim(), unmixing.dim()] {
            if rows != n {
                return Err(StreamError::TransformShape { expected: n, actual: rows });
            }
            if cols != n {
                return Err(StreamError::TransformShape { expected: n, actual: cols });
            }
        }
        let mut excluded = excluded;
        excluded.sort_unstable();
        excluded.dedup();
        if let Some(&bad) = excluded.iter().find(|&&c| c >= n) {
            return Err(StreamError::InvalidConfig(format!(
                "excluded component {bad} out of range for {n} components"
            )));
        }
        let kept: Vec<usize> = (0..n).filter(|c| excluded.binary_search(c).is_err()).collect();
        if kept.is_empty() {
            return Err(StreamError::InvalidConfig(
                "transform would exclude every component".into(),
            ));
        }

        let k = kept.len();
        let mixing_kept = Array2::from_shape_fn((k, k), |(i, j)| mixing[[kept[i], kept[j]]]);
        let unmixing_kept = Array2::from_shape_fn((k, n), |(i, j)| unmixing[[kept[i], j]]);
        let projection = mixing_kept.dot(&unmixing_kept);

        Ok(Self {
            mixing,
            unmixing,
            excluded,
            kept,
            projection,
        })
    }

    pub fn input_width(&self) -> usize {
        self.unmixing.ncols()
    }

    pub fn output_width(&self) -> usize {
        self.kept.len()
    }

    pub fn excluded(&self) -> &[usize] {
        &self.excluded
    }

    pub fn kept(&self) -> &[usize] {
        &self.kept
    }

    pub fn mixing(&self) -> &Array2<f64> {
        &self.mixing
    }

    pub fn unmixing(&self) -> &Array2<f64> {
        &self.unmixing
    }

    pub fn check_width(&self, channel_count: usize) -> StreamResult<()> {
        if channel_count != self.input_width() {
            return Err(StreamError::TransformShape {
                expected: self.input_width(),
                actual: channel_count,
            });
        }
        Ok(())
    }

    pub fn apply(&self, values: &[f64]) -> StreamResult<Vec<f64>> {
        self.check_width(values.len())?;
        let out: Array1<f64> = self.projection.dot(&ArrayView1::from(values));
        Ok(out.to_vec())
    }

    /// Maps every value vector; order and timestamps are untouched.
    pub fn apply_samples(&self, samples: &[Sample]) -> StreamResult<Vec<Sample>> {
        samples
            .iter()
            .map(|s| Ok(Sample::new(s.timestamp, self.apply(&s.values)?)))
            .collect()
    }

    pub fn project_labels(&self, labels: &[String]) -> Vec<String> {
        self.kept
            .iter()
            .map(|&c| labels.get(c).cloned().unwrap_or_else(|| format!("comp{c}")))
            .collect()
    }
}

/// Supplies a fitted `(mixing, unmixing, excluded)` triple. Fitting itself
/// happens elsewhere.
pub trait TransformProvider {
    fn provide(&self) -> StreamResult<TransformState>;
}

/// Serializable transform triple, row-major.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformSpec {
    pub mixing: Vec<Vec<f64>>,
    pub unmixing: Vec<Vec<f64>>,
    #[serde(default)]
    pub excluded: Vec<usize>,
}

impl TransformSpec {
    pub fn from_json_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Identity decomposition over `n` channels with the given exclusions.
    pub fn identity(n: usize, excluded: Vec<usize>) -> Self {
        let eye: Vec<Vec<f64>> = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        Self {
            mixing: eye.clone(),
            unmixing: eye,
            excluded,
        }
    }
}

fn to_array(rows: &[Vec<f64>]) -> StreamResult<Array2<f64>> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(row) = rows.iter().find(|r| r.len() != ncols) {
        return Err(StreamError::TransformShape {
            expected: ncols,
            actual: row.len(),
        });
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| StreamError::InvalidConfig(format!("transform matrix: {e}")))
}

impl TransformProvider for TransformSpec {
    fn provide(&self) -> StreamResult<TransformState> {
        TransformState::new(
            to_array(&self.mixing)?,
            to_array(&self.unmixing)?,
            self.excluded.clone(),
        )
    }
}

/// Holds the session's current transform. Replacement swaps the whole
/// `Arc`, so an extraction that already cloned it keeps a consistent value.
#[derive(Default)]
pub struct TransformSlot {
    current: RwLock<Option<Arc<TransformState>>>,
}

impl TransformSlot {
    pub fn current(&self) -> Option<Arc<TransformState>> {
        self.current.read().clone()
    }

    pub fn replace(&self, state: TransformState) -> Option<Arc<TransformState>> {
        self.current.write().replace(Arc::new(state))
    }

    pub fn clear(&self) -> Option<Arc<TransformState>> {
        self.current.write().take()
    }
}

/// Record handed to a persistence collaborator after a model is trained on
/// transformed windows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedModelRecord {
    pub paradigm: String,
    pub processing: String,
    pub n_samples_for_training: usize,
    pub n_features: usize,
    pub model: serde_json::Value,
}

impl FittedModelRecord {
    /// The record must describe windows shaped like `window`.
    pub fn check_against(&self, window: &Window) -> StreamResult<()> {
        if self.n_features != window.channel_count {
            return Err(StreamError::ChannelMismatch {
                expected: self.n_features,
                actual: window.channel_count,
            });
        }
        Ok(())
    }
}
