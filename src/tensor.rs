//! Named tensor collections and their on-disk representation.
//!
//! A [`TensorMap`] is the unit everything else in the crate moves around: the
//! weight extractor produces one, the delta codec consumes two of them and the
//! reconstruction engine hands one back. Maps are persisted in the
//! `safetensors` format so the files can be inspected with the usual tooling.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::Dtype;
use safetensors::SafeTensors;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

/// Ordered mapping from tensor name to tensor.
pub type TensorMap = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    fn to_safetensors(self) -> Dtype {
        match self {
            DType::F32 => Dtype::F32,
            DType::F64 => Dtype::F64,
            DType::I32 => Dtype::I32,
            DType::I64 => Dtype::I64,
        }
    }

    fn from_safetensors(dtype: Dtype) -> Option<Self> {
        match dtype {
            Dtype::F32 => Some(DType::F32),
            Dtype::F64 => Some(DType::F64),
            Dtype::I32 => Some(DType::I32),
            Dtype::I64 => Some(DType::I64),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// Flat element storage of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F64 => TensorData::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::I32 => TensorData::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::I64 => TensorData::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
        }
    }
}

/// A dense, row-major tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl Tensor {
    /// Builds a tensor, checking that `shape` accounts for every element.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ShapeMismatch {
                shape,
                elements: data.len(),
            });
        }
        Ok(Tensor { shape, data })
    }

    /// One-dimensional `f32` tensor.
    pub fn vector_f32(values: Vec<f32>) -> Self {
        Tensor {
            shape: vec![values.len()],
            data: TensorData::F32(values),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Bitwise equality, distinguishing `-0.0` from `0.0` and comparing NaNs
    /// by payload.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        if self.shape != other.shape {
            return false;
        }
        match (&self.data, &other.data) {
            (TensorData::F32(a), TensorData::F32(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (TensorData::F64(a), TensorData::F64(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (TensorData::I32(a), TensorData::I32(b)) => a == b,
            (TensorData::I64(a), TensorData::I64(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("failed to access tensor file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed safetensors data: {0}")]
    Format(#[from] safetensors::SafeTensorError),
    #[error("tensor `{name}` has unsupported dtype {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("shape {shape:?} does not match {elements} elements")]
    ShapeMismatch { shape: Vec<usize>, elements: usize },
}

/// Serializes `tensors` together with free-form string `metadata`.
pub fn encode(
    tensors: &TensorMap,
    metadata: Option<HashMap<String, String>>,
) -> Result<Vec<u8>, TensorError> {
    let raw: Vec<(String, DType, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, t)| (name.clone(), t.dtype(), t.shape.clone(), t.data.to_le_bytes()))
        .collect();
    let mut views = Vec::with_capacity(raw.len());
    for (name, dtype, shape, bytes) in &raw {
        let view = TensorView::new(dtype.to_safetensors(), shape.clone(), bytes)?;
        views.push((name.clone(), view));
    }
    Ok(safetensors::serialize(views, &metadata)?)
}

/// Parses a safetensors buffer into tensors plus its metadata table.
pub fn decode(bytes: &[u8]) -> Result<(TensorMap, HashMap<String, String>), TensorError> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let parsed = SafeTensors::deserialize(bytes)?;
    let mut tensors = TensorMap::new();
    for (name, view) in parsed.tensors() {
        let dtype =
            DType::from_safetensors(view.dtype()).ok_or_else(|| TensorError::UnsupportedDtype {
                name: name.clone(),
                dtype: view.dtype(),
            })?;
        let data = TensorData::from_le_bytes(dtype, view.data());
        let tensor = Tensor::new(view.shape().to_vec(), data)?;
        tensors.insert(name, tensor);
    }
    Ok((tensors, metadata))
}

pub fn save(path: &Path, tensors: &TensorMap) -> Result<(), TensorError> {
    save_with_metadata(path, tensors, None)
}

pub fn save_with_metadata(
    path: &Path,
    tensors: &TensorMap,
    metadata: Option<HashMap<String, String>>,
) -> Result<(), TensorError> {
    let bytes = encode(tensors, metadata)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(path, source))?;
    }
    fs::write(path, bytes).map_err(|source| io_error(path, source))
}

pub fn load(path: &Path) -> Result<TensorMap, TensorError> {
    load_with_metadata(path).map(|(tensors, _)| tensors)
}

pub fn load_with_metadata(
    path: &Path,
) -> Result<(TensorMap, HashMap<String, String>), TensorError> {
    let bytes = fs::read(path).map_err(|source| io_error(path, source))?;
    decode(&bytes)
}

fn io_error(path: &Path, source: io::Error) -> TensorError {
    TensorError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of the file at `path`.
pub fn file_hash(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(content_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_must_cover_elements() {
        let err = Tensor::new(vec![2, 2], TensorData::I32(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { elements: 3, .. }));
    }

    #[test]
    fn encoding_preserves_dtype_shape_and_metadata() {
        let mut map = TensorMap::new();
        map.insert(
            "layer.weight".into(),
            Tensor::new(vec![2, 2], TensorData::F64(vec![1.5, -0.0, 3.0, f64::MAX])).unwrap(),
        );
        map.insert(
            "layer.steps".into(),
            Tensor::new(vec![3], TensorData::I64(vec![i64::MIN, 0, 7])).unwrap(),
        );
        let mut meta = HashMap::new();
        meta.insert("k".to_string(), "v".to_string());

        let bytes = encode(&map, Some(meta)).unwrap();
        let (back, meta) = decode(&bytes).unwrap();

        assert_eq!(meta.get("k").map(String::as_str), Some("v"));
        assert_eq!(back.len(), 2);
        for (name, tensor) in &map {
            assert!(tensor.bit_eq(&back[name]), "{name} changed");
        }
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn bit_eq_distinguishes_signed_zero() {
        let a = Tensor::vector_f32(vec![0.0]);
        let b = Tensor::vector_f32(vec![-0.0]);
        assert_eq!(a, b);
        assert!(!a.bit_eq(&b));
    }
}
