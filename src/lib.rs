//! Normalizar: batch normalization for fully-connected networks in pure Rust.
//!
//! Normalizar provides a self-contained Batch Normalization layer
//! (Ioffe & Szegedy, 2015) for 2-D `[batch, features]` inputs, with an
//! explicit backward pass, exponentially-averaged running statistics,
//! and versioned `SafeTensors` state persistence.
//!
//! # Quick Start
//!
//! ```
//! use normalizar::prelude::*;
//!
//! // A layer over 3 feature channels, without the affine transform
//! let mut layer = BatchNormConfig::new(3)
//!     .with_affine(false)
//!     .build()
//!     .expect("valid configuration");
//!
//! // A batch of 2 samples
//! let x = Matrix::from_vec(2, 3, vec![
//!     1.0, 2.0, 3.0,
//!     3.0, 2.0, 1.0,
//! ]).expect("data length matches rows * cols");
//!
//! // Training-mode forward: normalizes with batch statistics and
//! // updates the running statistics
//! let y = layer.forward(x.clone()).expect("batch matches layer width");
//! assert!((y.get(0, 0) - (-1.0)).abs() < 1e-3);
//! assert!((layer.running_mean().get(0) - 0.2).abs() < 1e-6);
//!
//! // Paired backward pass from the saved statistics
//! let dy = Matrix::from_vec(2, 3, vec![1.0; 6]).expect("data length matches rows * cols");
//! let dx = layer.backward(&x, &dy, 1.0).expect("forward ran first");
//! assert_eq!(dx.shape(), (2, 3));
//! ```
//!
//! # Modules
//!
//! - [`batchnorm`]: The `BatchNorm1d` layer and its configuration
//! - [`primitives`]: Core Vector and Matrix types
//! - [`serialization`]: `SafeTensors` state files
//! - [`error`]: Error type and `Result` alias
//!
//! # References
//!
//! - Ioffe, S., & Szegedy, C. (2015). Batch normalization: Accelerating
//!   deep network training by reducing internal covariate shift. ICML.

pub mod batchnorm;
pub mod error;
pub mod prelude;
pub mod primitives;
pub mod serialization;
