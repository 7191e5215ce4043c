use nalgebra::{DMatrix, SymmetricEigen};
use serde_json::json;

use super::{base_params, InputKind, Reducer, ReducerInput, ReducerParams, Reduction};
use crate::document::Dimensions;
use crate::error::{ProtspaceError, Result};

/// Principal component analysis through an eigendecomposition of whichever
/// of the covariance or Gram matrix is smaller.
pub struct Pca;

impl Reducer for Pca {
    fn name(&self) -> &'static str {
        "pca"
    }

    fn accepts(&self, input: InputKind) -> bool {
        input == InputKind::Embeddings
    }

    fn reduce(
        &self,
        input: &ReducerInput,
        dims: Dimensions,
        _params: &ReducerParams,
    ) -> Result<Reduction> {
        let ReducerInput::Embeddings(data) = input else {
            return Err(ProtspaceError::MethodUnsupported {
                method: self.name().to_string(),
                input: input.kind(),
            });
        };
        let (points, ratios) = principal_components(data, dims.count());
        let mut params = base_params(dims);
        params.insert("explained_variance_ratio".into(), json!(ratios));
        Ok(Reduction { points, params })
    }
}

/// Scores of the first `k` components and their explained variance ratios.
/// Components beyond the rank of the data are zero.
pub(crate) fn principal_components(data: &DMatrix<f64>, k: usize) -> (DMatrix<f64>, Vec<f64>) {
    let (n, d) = data.shape();
    let mut centered = data.clone();
    for mut column in centered.column_iter_mut() {
        let mean = column.mean();
        column.add_scalar_mut(-mean);
    }

    let use_gram = n <= d;
    let square = if use_gram {
        &centered * centered.transpose()
    } else {
        centered.transpose() * &centered
    };
    let total = square.trace();
    let eigen = SymmetricEigen::new(square);
    let mut order = (0..eigen.eigenvalues.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .total_cmp(&eigen.eigenvalues[a])
            .then_with(|| a.cmp(&b))
    });

    let mut scores = DMatrix::zeros(n, k);
    let mut ratios = vec![0.0; k];
    for (component, &idx) in order.iter().take(k).enumerate() {
        let lambda = eigen.eigenvalues[idx].max(0.0);
        if total <= f64::EPSILON || lambda <= total * 1e-12 {
            continue;
        }
        let vector = eigen.eigenvectors.column(idx);
        let mut column = if use_gram {
            vector * lambda.sqrt()
        } else {
            &centered * vector
        };
        // Largest-magnitude score positive, so signs do not flip between runs.
        let pivot = column
            .iter()
            .copied()
            .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
        if pivot < 0.0 {
            column.neg_mut();
        }
        scores.set_column(component, &column);
        ratios[component] = lambda / total;
    }
    (scores, ratios)
}
