//! Element-wise differences between tensor maps.
//!
//! A [`Delta`] is what a DELTA commit stores instead of its full weights.
//! Applying a delta adds every tensor it carries onto the base map, treating a
//! name the base does not know as zero, so parameters that appear mid-history
//! are carried wholesale. Names that disappeared are listed in
//! [`Delta::removed`] and dropped on apply.
//!
//! Integer tensors use wrapping arithmetic and therefore always round-trip.
//! Float tensors use plain IEEE arithmetic; when `prev + (cur - prev)` does not
//! give back `cur` bit for bit the codec logs a warning naming the tensor.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::tensor::{self, DType, Tensor, TensorData, TensorError, TensorMap};

/// Metadata key listing the tensors a delta removes.
pub const REMOVED_METADATA_KEY: &str = "flair.removed";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub tensors: TensorMap,
    pub removed: BTreeSet<String>,
}

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("tensor `{name}` changed dtype from {previous} to {current}")]
    DtypeMismatch {
        name: String,
        previous: DType,
        current: DType,
    },
    #[error("tensor `{name}` changed shape from {previous:?} to {current:?}")]
    ShapeMismatch {
        name: String,
        previous: Vec<usize>,
        current: Vec<usize>,
    },
    #[error("malformed removed-tensor list in delta metadata: {0}")]
    Metadata(#[source] serde_json::Error),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Computes the delta that turns `previous` into `current`.
pub fn compute_delta(previous: &TensorMap, current: &TensorMap) -> Result<Delta, DeltaError> {
    let mut tensors = TensorMap::new();
    for (name, cur) in current {
        let diff = match previous.get(name) {
            Some(prev) => {
                let diff = subtract(name, cur, prev)?;
                if let Ok(restored) = add(name, prev, &diff) {
                    if !restored.bit_eq(cur) {
                        warn!(tensor = %name, "float delta does not restore the target exactly");
                    }
                }
                diff
            }
            None => cur.clone(),
        };
        tensors.insert(name.clone(), diff);
    }
    let removed = previous
        .keys()
        .filter(|name| !current.contains_key(*name))
        .cloned()
        .collect();
    Ok(Delta { tensors, removed })
}

/// Applies `delta` on top of `base` in place.
pub fn apply_delta(base: &mut TensorMap, delta: &Delta) -> Result<(), DeltaError> {
    for name in &delta.removed {
        base.remove(name);
    }
    for (name, diff) in &delta.tensors {
        let next = match base.get(name) {
            Some(prev) => add(name, prev, diff)?,
            None => diff.clone(),
        };
        base.insert(name.clone(), next);
    }
    Ok(())
}

pub fn save_delta(path: &Path, delta: &Delta) -> Result<(), DeltaError> {
    let mut metadata = HashMap::new();
    if !delta.removed.is_empty() {
        let removed = serde_json::to_string(&delta.removed).map_err(DeltaError::Metadata)?;
        metadata.insert(REMOVED_METADATA_KEY.to_string(), removed);
    }
    let metadata = (!metadata.is_empty()).then_some(metadata);
    tensor::save_with_metadata(path, &delta.tensors, metadata)?;
    Ok(())
}

pub fn load_delta(path: &Path) -> Result<Delta, DeltaError> {
    let (tensors, metadata) = tensor::load_with_metadata(path)?;
    delta_from_parts(tensors, metadata)
}

/// Parses a delta from the bytes of a delta file.
pub fn decode_delta(bytes: &[u8]) -> Result<Delta, DeltaError> {
    let (tensors, metadata) = tensor::decode(bytes)?;
    delta_from_parts(tensors, metadata)
}

fn delta_from_parts(
    tensors: TensorMap,
    metadata: HashMap<String, String>,
) -> Result<Delta, DeltaError> {
    let removed = match metadata.get(REMOVED_METADATA_KEY) {
        Some(list) => serde_json::from_str(list).map_err(DeltaError::Metadata)?,
        None => BTreeSet::new(),
    };
    Ok(Delta { tensors, removed })
}

fn check_compatible(name: &str, a: &Tensor, b: &Tensor) -> Result<(), DeltaError> {
    if a.dtype() != b.dtype() {
        return Err(DeltaError::DtypeMismatch {
            name: name.to_string(),
            previous: b.dtype(),
            current: a.dtype(),
        });
    }
    if a.shape != b.shape {
        return Err(DeltaError::ShapeMismatch {
            name: name.to_string(),
            previous: b.shape.clone(),
            current: a.shape.clone(),
        });
    }
    Ok(())
}

fn subtract(name: &str, cur: &Tensor, prev: &Tensor) -> Result<Tensor, DeltaError> {
    check_compatible(name, cur, prev)?;
    let data = match (&cur.data, &prev.data) {
        (TensorData::F32(c), TensorData::F32(p)) => {
            TensorData::F32(c.iter().zip(p).map(|(c, p)| c - p).collect())
        }
        (TensorData::F64(c), TensorData::F64(p)) => {
            TensorData::F64(c.iter().zip(p).map(|(c, p)| c - p).collect())
        }
        (TensorData::I32(c), TensorData::I32(p)) => {
            TensorData::I32(c.iter().zip(p).map(|(c, p)| c.wrapping_sub(*p)).collect())
        }
        (TensorData::I64(c), TensorData::I64(p)) => {
            TensorData::I64(c.iter().zip(p).map(|(c, p)| c.wrapping_sub(*p)).collect())
        }
        _ => unreachable!("dtypes checked above"),
    };
    Ok(Tensor {
        shape: cur.shape.clone(),
        data,
    })
}

fn add(name: &str, base: &Tensor, diff: &Tensor) -> Result<Tensor, DeltaError> {
    // Report mismatches from the point of view of the incoming delta.
    check_compatible(name, diff, base)?;
    let data = match (&base.data, &diff.data) {
        (TensorData::F32(b), TensorData::F32(d)) => {
            TensorData::F32(b.iter().zip(d).map(|(b, d)| b + d).collect())
        }
        (TensorData::F64(b), TensorData::F64(d)) => {
            TensorData::F64(b.iter().zip(d).map(|(b, d)| b + d).collect())
        }
        (TensorData::I32(b), TensorData::I32(d)) => {
            TensorData::I32(b.iter().zip(d).map(|(b, d)| b.wrapping_add(*d)).collect())
        }
        (TensorData::I64(b), TensorData::I64(d)) => {
            TensorData::I64(b.iter().zip(d).map(|(b, d)| b.wrapping_add(*d)).collect())
        }
        _ => unreachable!("dtypes checked above"),
    };
    Ok(Tensor {
        shape: base.shape.clone(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn map(entries: &[(&str, &[f32])]) -> TensorMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Tensor::vector_f32(v.to_vec())))
            .collect()
    }

    #[test]
    fn delta_of_changed_and_new_tensors() {
        let prev = map(&[("w", &[1.0, 2.0, 5.0])]);
        let cur = map(&[("w", &[2.0, 2.0, 5.0]), ("v", &[9.0])]);
        let delta = compute_delta(&prev, &cur).unwrap();
        assert_eq!(delta.tensors, map(&[("w", &[1.0, 0.0, 0.0]), ("v", &[9.0])]));
        assert!(delta.removed.is_empty());

        let mut base = prev.clone();
        apply_delta(&mut base, &delta).unwrap();
        assert_eq!(base, cur);
    }

    #[test]
    fn removed_tensors_are_dropped_on_apply() {
        let prev = map(&[("w", &[1.0]), ("old", &[3.0])]);
        let cur = map(&[("w", &[4.0])]);
        let delta = compute_delta(&prev, &cur).unwrap();
        assert!(delta.removed.contains("old"));

        let mut base = prev;
        apply_delta(&mut base, &delta).unwrap();
        assert_eq!(base, cur);
    }

    #[test]
    fn shape_change_is_rejected() {
        let prev = map(&[("w", &[1.0, 2.0])]);
        let cur = map(&[("w", &[1.0, 2.0, 3.0])]);
        let err = compute_delta(&prev, &cur).unwrap_err();
        assert!(matches!(err, DeltaError::ShapeMismatch { ref name, .. } if name == "w"));
    }

    #[test]
    fn dtype_change_is_rejected() {
        let prev = map(&[("w", &[1.0])]);
        let mut cur = TensorMap::new();
        cur.insert("w".into(), Tensor::new(vec![1], TensorData::I32(vec![1])).unwrap());
        let err = compute_delta(&prev, &cur).unwrap_err();
        assert!(matches!(
            err,
            DeltaError::DtypeMismatch {
                previous: DType::F32,
                current: DType::I32,
                ..
            }
        ));
    }

    #[test]
    fn removed_list_survives_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delta.safetensors");
        let delta = compute_delta(&map(&[("a", &[1.0]), ("b", &[2.0])]), &map(&[("a", &[3.0])]))
            .unwrap();
        save_delta(&path, &delta).unwrap();
        assert_eq!(load_delta(&path).unwrap(), delta);
    }

    proptest! {
        #[test]
        fn integer_deltas_round_trip(
            pairs in prop::collection::vec((any::<i64>(), any::<i64>()), 0..64)
        ) {
            let (a, b): (Vec<i64>, Vec<i64>) = pairs.into_iter().unzip();
            let n = a.len();
            let mut prev = TensorMap::new();
            prev.insert("t".into(), Tensor::new(vec![n], TensorData::I64(a)).unwrap());
            let mut cur = TensorMap::new();
            cur.insert("t".into(), Tensor::new(vec![n], TensorData::I64(b)).unwrap());

            let delta = compute_delta(&prev, &cur).unwrap();
            let mut base = prev;
            apply_delta(&mut base, &delta).unwrap();
            prop_assert_eq!(base, cur);
        }

        #[test]
        fn small_integer_valued_floats_round_trip(
            pairs in prop::collection::vec((-1000i32..1000, -1000i32..1000), 1..64)
        ) {
            let prev = TensorMap::from([(
                "w".to_string(),
                Tensor::vector_f32(pairs.iter().map(|(a, _)| *a as f32).collect()),
            )]);
            let cur = TensorMap::from([(
                "w".to_string(),
                Tensor::vector_f32(pairs.iter().map(|(_, b)| *b as f32).collect()),
            )]);
            let delta = compute_delta(&prev, &cur).unwrap();
            let mut base = prev;
            apply_delta(&mut base, &delta).unwrap();
            prop_assert!(base["w"].bit_eq(&cur["w"]));
        }
    }
}
