//! Shape and dtype assertions shared by layers.
//!
//! Every helper takes a label naming the tensor so failures point at the
//! offending argument, and returns [`LayerError::Precondition`] instead of
//! panicking.

use candle_core::{DType, Tensor};

use crate::{precondition, Result};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(precondition(format!(
            "{label}: expected shape {expected:?}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Like [`expect_shape`], but `-1` entries match any size.
pub fn assert_has_shape(label: &str, tensor: &Tensor, expected: &[i64]) -> Result<()> {
    let dims = tensor.dims();
    let matches = dims.len() == expected.len()
        && dims
            .iter()
            .zip(expected)
            .all(|(&actual, &want)| want == -1 || i64::try_from(actual).is_ok_and(|a| a == want));
    if matches {
        Ok(())
    } else {
        Err(precondition(format!(
            "{label}: expected shape {expected:?}, got {dims:?}"
        )))
    }
}

pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(precondition(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Checks the trailing dimension, the convention for feature axes.
pub fn expect_last_dim(label: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == size => Ok(()),
        _ => Err(precondition(format!(
            "{label}: expected trailing dimension {size}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(precondition(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}
