//! Activation matrices collected across prompts
//!
//! Each layer accumulates `[rows, d]` chunks (one per prompt or batch).
//! Chunks are concatenated lazily, the first time a layer is read.

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};
use statrs::statistics::Statistics;

/// Per-layer activation rows
#[derive(Debug, Default)]
pub struct ActivationCache {
    layers: BTreeMap<usize, Vec<Tensor>>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `[n, d]` rows to a layer
    pub fn push_rows(&mut self, layer: usize, rows: Tensor) -> Result<()> {
        anyhow::ensure!(
            rows.rank() == 2,
            "Expected [rows, d] activations, got {:?}",
            rows.dims()
        );
        let chunks = self.layers.entry(layer).or_default();
        if let Some(first) = chunks.first() {
            anyhow::ensure!(
                first.dim(1)? == rows.dim(1)?,
                "Layer {layer} width {} does not match new rows of width {}",
                first.dim(1)?,
                rows.dim(1)?
            );
        }
        chunks.push(rows.to_dtype(DType::F32)?);
        Ok(())
    }

    /// Number of rows stored for a layer
    pub fn n_rows(&self, layer: usize) -> usize {
        self.layers
            .get(&layer)
            .map(|chunks| chunks.iter().filter_map(|c| c.dim(0).ok()).sum())
            .unwrap_or(0)
    }

    /// All rows of a layer as one `[rows, d]` tensor
    pub fn get(&mut self, layer: usize) -> Result<Tensor> {
        let chunks = self
            .layers
            .get_mut(&layer)
            .ok_or_else(|| anyhow::anyhow!("Layer {layer} not in cache"))?;
        if chunks.len() > 1 {
            let joined = Tensor::cat(chunks.as_slice(), 0)?;
            *chunks = vec![joined];
        }
        chunks
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Layer {layer} has no rows"))
    }

    /// Keep only the first `n` rows of a layer
    pub fn truncate(&mut self, layer: usize, n: usize) -> Result<()> {
        let all = self.get(layer)?;
        let keep = n.min(all.dim(0)?);
        self.layers.insert(layer, vec![all.narrow(0, 0, keep)?]);
        Ok(())
    }

    pub fn layers(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// One column of a `[rows, d]` matrix
pub fn column(matrix: &Tensor, index: usize) -> Result<Vec<f32>> {
    let d = matrix.dim(1)?;
    anyhow::ensure!(index < d, "Column {index} out of range (d={d})");
    Ok(matrix.i((.., index))?.to_dtype(DType::F32)?.to_vec1()?)
}

/// Per-column mean of a `[rows, d]` matrix
pub fn column_means(matrix: &Tensor) -> Result<Vec<f32>> {
    Ok(matrix.to_dtype(DType::F32)?.mean(0)?.to_vec1()?)
}

/// Per-column sample standard deviation of a `[rows, d]` matrix
pub fn column_stds(matrix: &Tensor) -> Result<Vec<f64>> {
    let rows = to_rows(matrix)?;
    let d = matrix.dim(1)?;
    Ok((0..d)
        .map(|j| rows.iter().map(|r| f64::from(r[j])).std_dev())
        .collect())
}

/// Matrix as row vectors
pub fn to_rows(matrix: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(matrix.to_dtype(DType::F32)?.to_vec2()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn matrix(data: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = data.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (data.len(), 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_push_get_truncate() {
        let mut cache = ActivationCache::new();
        cache.push_rows(3, matrix(&[[1., 2.], [3., 4.]])).unwrap();
        cache.push_rows(3, matrix(&[[5., 6.]])).unwrap();
        assert_eq!(cache.n_rows(3), 3);
        assert_eq!(cache.n_rows(0), 0);

        let all = cache.get(3).unwrap();
        assert_eq!(all.dims(), &[3, 2]);

        cache.truncate(3, 2).unwrap();
        assert_eq!(to_rows(&cache.get(3).unwrap()).unwrap(), vec![vec![1., 2.], vec![3., 4.]]);
        assert!(cache.get(1).is_err());
        assert_eq!(cache.layers().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_width_mismatch() {
        let mut cache = ActivationCache::new();
        cache.push_rows(0, matrix(&[[1., 2.]])).unwrap();
        let wide = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu).unwrap();
        assert!(cache.push_rows(0, wide).is_err());
    }

    #[test]
    fn test_column_statistics() {
        let m = matrix(&[[1., 10.], [3., 10.], [5., 10.]]);
        assert_eq!(column(&m, 0).unwrap(), vec![1., 3., 5.]);
        assert!(column(&m, 2).is_err());
        assert_eq!(column_means(&m).unwrap(), vec![3., 10.]);

        let stds = column_stds(&m).unwrap();
        assert!((stds[0] - 2.0).abs() < 1e-9);
        assert!(stds[1].abs() < 1e-9);
    }
}
