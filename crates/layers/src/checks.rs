//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape assertions that can be wired into
//! constructors or per-step paths. They return `candle_core::Result<()>` so
//! call sites can propagate errors without panicking.

use candle_core::{Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has the given rank.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Checks the trailing (feature) dimension.
pub fn expect_last_dim(label: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected last dim {size}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks that two tensors agree on their leading (batch) dimension.
pub fn expect_same_batch(label: &str, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    match (lhs.dims().first(), rhs.dims().first()) {
        (Some(a), Some(b)) if a == b => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: batch mismatch between {:?} and {:?}",
            lhs.dims(),
            rhs.dims()
        ))),
    }
}
