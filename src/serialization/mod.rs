//! Layer state persistence.
//!
//! The layer persists its named vectors (running statistics, affine
//! parameters) in `SafeTensors` format with a version tag carried in
//! the `__metadata__` header section. Version migration itself lives
//! with the layer; this module only moves bytes.

pub mod safetensors;
