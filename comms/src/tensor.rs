//! Payload types carried by data messages.

use std::io;

use ndarray::{ArrayD, IxDyn};
use serde::{Serialize, de::DeserializeOwned};

/// A dense `f32` tensor in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl Tensor {
    /// Creates a new `Tensor`.
    ///
    /// # Arguments
    /// * `shape` - The size of every dimension.
    /// * `values` - The elements in row-major order.
    ///
    /// # Returns
    /// The tensor, or an `InvalidData` error if the amount of values doesn't
    /// match the shape.
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> io::Result<Self> {
        let Some(expected) = shape.iter().try_fold(1_usize, |acc, &dim| acc.checked_mul(dim))
        else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Tensor of shape {shape:?} has too many elements"),
            ));
        };

        if expected != values.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Tensor of shape {shape:?} needs {expected} values, got {}",
                    values.len()
                ),
            ));
        }

        Ok(Self { shape, values })
    }

    /// Creates a one dimensional tensor.
    pub fn vector(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Converts this tensor into an owned dynamic dimensional array.
    pub fn into_array(self) -> ArrayD<f32> {
        // The shape was validated on construction.
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.values)
            .unwrap_or_else(|_| unreachable!("tensor shape always matches its values"))
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(array: ArrayD<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            values: array.iter().copied().collect(),
        }
    }
}

/// An opaque serialized value tagged with the name of its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyPayload {
    pub type_url: String,
    pub value: Vec<u8>,
}

impl AnyPayload {
    /// Packs `value` as json bytes under `type_url`.
    pub fn pack<T: Serialize>(type_url: &str, value: &T) -> io::Result<Self> {
        Ok(Self {
            type_url: type_url.to_string(),
            value: serde_json::to_vec(value)?,
        })
    }

    /// Unpacks the inner value, failing if it was packed under another type url.
    pub fn unpack<T: DeserializeOwned>(&self, type_url: &str) -> io::Result<T> {
        if self.type_url != type_url {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Expected payload of type {type_url}, got {}", self.type_url),
            ));
        }

        Ok(serde_json::from_slice(&self.value)?)
    }
}
