//! Causal attention masks
//!
//! Masks are cached by `(seq_len, device, dtype)`. Cached tensors are shared
//! through shallow clones, so repeated forward passes over equal-length
//! batches do not rebuild the `[seq, seq]` mask.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Additive causal mask of shape `[1, 1, seq_len, seq_len]`
///
/// Entry `(i, j)` is `0.0` when `j <= i` and `-inf` otherwise.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_id(device), dtype);

    if let Ok(cache) = CAUSAL_MASK_CACHE.lock() {
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    if let Ok(mut cache) = CAUSAL_MASK_CACHE.lock() {
        cache.insert(key, mask.clone());
    }

    Ok(mask)
}

/// Number of cached masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE.lock().map(|c| c.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);

        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        let is_neg_inf = |v: f32| v.is_infinite() && v < 0.0;

        assert_eq!(data[0], 0.0);
        assert!(is_neg_inf(data[1]));
        assert!(is_neg_inf(data[2]));
        assert_eq!(&data[3..5], &[0.0, 0.0]);
        assert!(is_neg_inf(data[5]));
        assert_eq!(&data[6..9], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_causal_mask_is_reused() {
        let first = create_causal_mask(17, &Device::Cpu, DType::F32).unwrap();
        assert!(mask_cache_size() >= 1);
        let second = create_causal_mask(17, &Device::Cpu, DType::F32).unwrap();
        let a: Vec<f32> = first.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = second.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
