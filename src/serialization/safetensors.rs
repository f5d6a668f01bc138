//! `SafeTensors` format implementation for layer state.
//!
//! Implements the `SafeTensors` layout:
//! ```text
//! [8-byte header: u64 metadata length (little-endian)]
//! [JSON metadata: tensor names, dtypes, shapes, data_offsets]
//! [Raw tensor data: F32 values in little-endian]
//! ```
//!
//! User metadata (the version tag among it) rides in the `__metadata__`
//! section of the JSON header as string key-value pairs. Only F32
//! tensors are supported; that is the only dtype the layer owns.

use crate::error::{NormalizarError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Map of tensor names to (data, shape) pairs.
/// `BTreeMap` keeps JSON serialization deterministic (sorted keys).
pub type TensorMap = BTreeMap<String, (Vec<f32>, Vec<usize>)>;

/// String key-value pairs from the `__metadata__` header section.
pub type UserMetadata = BTreeMap<String, String>;

/// Metadata for a single tensor in `SafeTensors` format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorMetadata {
    /// Data type of the tensor (always "F32" here).
    pub dtype: String,
    /// Shape of the tensor (e.g., `[num_features]`).
    pub shape: Vec<usize>,
    /// Data offsets `[start, end]` in the raw data section.
    pub data_offsets: [usize; 2],
}

/// Saves tensors to `SafeTensors` format with a `__metadata__` section.
///
/// # Errors
///
/// Returns an error if file writing or JSON serialization fails.
pub fn save_safetensors<P: AsRef<Path>>(
    path: P,
    tensors: &TensorMap,
    user_metadata: &UserMetadata,
) -> Result<()> {
    let mut header = serde_json::Map::new();

    if !user_metadata.is_empty() {
        let meta_obj: serde_json::Map<String, serde_json::Value> = user_metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        header.insert(
            "__metadata__".to_string(),
            serde_json::Value::Object(meta_obj),
        );
    }

    let mut raw_data = Vec::new();
    let mut current_offset = 0;

    for (name, (data, shape)) in tensors {
        let start_offset = current_offset;
        let end_offset = current_offset + data.len() * 4;

        let tensor_meta = serde_json::to_value(TensorMetadata {
            dtype: "F32".to_string(),
            shape: shape.clone(),
            data_offsets: [start_offset, end_offset],
        })
        .map_err(|e| NormalizarError::Serialization(format!("JSON serialization failed: {e}")))?;
        header.insert(name.clone(), tensor_meta);

        for &value in data {
            raw_data.extend_from_slice(&value.to_le_bytes());
        }
        current_offset = end_offset;
    }

    let metadata_json = serde_json::to_string(&header)
        .map_err(|e| NormalizarError::Serialization(format!("JSON serialization failed: {e}")))?;
    let metadata_bytes = metadata_json.as_bytes();
    let metadata_len = metadata_bytes.len() as u64;

    let mut output = Vec::new();
    output.extend_from_slice(&metadata_len.to_le_bytes());
    output.extend_from_slice(metadata_bytes);
    output.extend_from_slice(&raw_data);

    fs::write(path, output)?;
    Ok(())
}

/// A parsed `SafeTensors` file held in memory.
///
/// # Example
///
/// ```rust,ignore
/// use normalizar::serialization::safetensors::SafeTensorsArchive;
///
/// let archive = SafeTensorsArchive::open("layer.safetensors")?;
/// let running_mean = archive.tensor("running_mean")?;
/// ```
#[derive(Debug)]
pub struct SafeTensorsArchive {
    /// Parsed per-tensor metadata
    metadata: BTreeMap<String, TensorMetadata>,
    /// User metadata from the `__metadata__` header section
    user_metadata: UserMetadata,
    /// Raw tensor bytes (after header + metadata JSON)
    raw_data: Vec<u8>,
}

impl SafeTensorsArchive {
    /// Reads and parses a `SafeTensors` file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File reading fails
    /// - Header is invalid (< 8 bytes or truncated metadata)
    /// - JSON parsing fails
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        let metadata_len = validate_and_read_header(&bytes)?;
        let (metadata, user_metadata) = parse_metadata(&bytes, metadata_len)?;
        let raw_data = bytes[8 + metadata_len..].to_vec();
        Ok(Self {
            metadata,
            user_metadata,
            raw_data,
        })
    }

    /// Returns true if the file contains a tensor with this name.
    #[must_use]
    pub fn has_tensor(&self, name: &str) -> bool {
        self.metadata.contains_key(name)
    }

    /// Extracts tensor data as f32 values.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is missing, its dtype is not F32,
    /// or its data offsets fall outside the file.
    pub fn tensor(&self, name: &str) -> Result<Vec<f32>> {
        let meta = self
            .metadata
            .get(name)
            .ok_or_else(|| NormalizarError::format(format!("tensor '{name}' not found")))?;

        if meta.dtype != "F32" {
            return Err(NormalizarError::format(format!(
                "tensor '{name}' has unsupported dtype {}, expected F32",
                meta.dtype
            )));
        }

        let [start, end] = meta.data_offsets;
        if end > self.raw_data.len() || start > end {
            return Err(NormalizarError::format(format!(
                "tensor '{name}' data offsets [{start}, {end}] out of bounds (data size {})",
                self.raw_data.len()
            )));
        }

        extract_f32(&self.raw_data[start..end])
    }

    /// User metadata from the `__metadata__` header section.
    #[must_use]
    pub fn user_metadata(&self) -> &UserMetadata {
        &self.user_metadata
    }
}

fn validate_and_read_header(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < 8 {
        return Err(NormalizarError::format(format!(
            "file is {} bytes, need at least 8 bytes for header",
            bytes.len()
        )));
    }

    let header_bytes: [u8; 8] = bytes[0..8]
        .try_into()
        .map_err(|_| NormalizarError::format("failed to read header bytes"))?;
    let metadata_len = u64::from_le_bytes(header_bytes) as usize;

    if metadata_len == 0 {
        return Err(NormalizarError::format("metadata length is 0"));
    }

    if 8 + metadata_len > bytes.len() {
        return Err(NormalizarError::format(format!(
            "metadata length {metadata_len} exceeds file size"
        )));
    }

    Ok(metadata_len)
}

fn parse_metadata(
    bytes: &[u8],
    metadata_len: usize,
) -> Result<(BTreeMap<String, TensorMetadata>, UserMetadata)> {
    let metadata_json = &bytes[8..8 + metadata_len];
    let metadata_str = std::str::from_utf8(metadata_json)
        .map_err(|e| NormalizarError::format(format!("metadata is not valid UTF-8: {e}")))?;

    let raw_metadata: serde_json::Value = serde_json::from_str(metadata_str)
        .map_err(|e| NormalizarError::Serialization(format!("JSON parsing failed: {e}")))?;

    let serde_json::Value::Object(map) = raw_metadata else {
        return Ok((BTreeMap::new(), UserMetadata::new()));
    };

    let mut metadata = BTreeMap::new();
    let mut user_metadata = UserMetadata::new();

    for (key, value) in map {
        if key == "__metadata__" {
            extract_user_metadata(value, &mut user_metadata);
            continue;
        }
        if key.starts_with("__") {
            continue;
        }
        if let Ok(tensor_meta) = serde_json::from_value::<TensorMetadata>(value) {
            metadata.insert(key, tensor_meta);
        }
    }

    Ok((metadata, user_metadata))
}

/// Extracts string key-value pairs from a `__metadata__` JSON object.
fn extract_user_metadata(value: serde_json::Value, user_metadata: &mut UserMetadata) {
    let serde_json::Value::Object(meta_map) = value else {
        return;
    };
    for (mk, mv) in meta_map {
        if let serde_json::Value::String(s) = mv {
            user_metadata.insert(mk, s);
        }
    }
}

fn extract_f32(tensor_bytes: &[u8]) -> Result<Vec<f32>> {
    if tensor_bytes.len() % 4 != 0 {
        return Err(NormalizarError::format(format!(
            "F32 tensor data size {} is not a multiple of 4 bytes",
            tensor_bytes.len()
        )));
    }

    let values: Vec<f32> = tensor_bytes
        .chunks_exact(4)
        .map(|chunk| {
            let bytes: [u8; 4] = chunk.try_into().expect("chunk is 4 bytes");
            f32::from_le_bytes(bytes)
        })
        .collect();

    Ok(values)
}
