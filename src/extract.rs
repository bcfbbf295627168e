//! Turning framework model files into tensor maps.

use std::path::Path;

use crate::tensor::{self, TensorError, TensorMap};

/// Produces the named tensors of a model file.
pub trait WeightExtractor {
    /// Framework tag recorded on commits built from this extractor.
    fn framework(&self) -> &str;

    fn extract(&self, model: &Path) -> Result<TensorMap, TensorError>;
}

/// Reads models already stored as `.safetensors`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafetensorsExtractor;

impl WeightExtractor for SafetensorsExtractor {
    fn framework(&self) -> &str {
        "safetensors"
    }

    fn extract(&self, model: &Path) -> Result<TensorMap, TensorError> {
        tensor::load(model)
    }
}
