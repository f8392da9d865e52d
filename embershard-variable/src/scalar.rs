//! Element types an embedding variable can hold.

use embershard_core::DataType;
use num_traits::{Float, ToPrimitive};

/// A numeric element type usable as embedding weights and optimizer state.
///
/// Only `f32` and `f64` implement this; the integer members of [`DataType`]
/// exist for metadata compatibility and are rejected at variable creation.
pub trait Scalar:
    Float + ToPrimitive + Default + Send + Sync + std::fmt::Debug + bytemuck::Pod + 'static
{
    const DTYPE: DataType;
    const SIZE: usize;

    fn from_le_slice(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);

    /// Lossy conversion from a config value.
    fn from_config(value: f64) -> Self;

    fn from_count(count: u64) -> Self;
}

impl Scalar for f32 {
    const DTYPE: DataType = DataType::Float32;
    const SIZE: usize = 4;

    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(buf)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn from_config(value: f64) -> Self {
        value as f32
    }

    fn from_count(count: u64) -> Self {
        count as f32
    }
}

impl Scalar for f64 {
    const DTYPE: DataType = DataType::Float64;
    const SIZE: usize = 8;

    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(buf)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn from_config(value: f64) -> Self {
        value
    }

    fn from_count(count: u64) -> Self {
        count as f64
    }
}

/// Decode a little-endian byte span into scalars, appending to `out`.
pub fn decode_le<T: Scalar>(bytes: &[u8], out: &mut Vec<T>) {
    out.reserve(bytes.len() / T::SIZE);
    for chunk in bytes.chunks_exact(T::SIZE) {
        out.push(T::from_le_slice(chunk));
    }
}

/// Encode scalars as little-endian bytes, appending to `out`.
pub fn encode_le<T: Scalar>(values: &[T], out: &mut Vec<u8>) {
    out.reserve(values.len() * T::SIZE);
    for &v in values {
        v.write_le(out);
    }
}
