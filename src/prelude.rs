//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use normalizar::prelude::*;
//! ```

pub use crate::batchnorm::{AffineParams, BatchNorm1d, BatchNormConfig};
pub use crate::error::{NormalizarError, Result};
pub use crate::primitives::{Matrix, Vector};
