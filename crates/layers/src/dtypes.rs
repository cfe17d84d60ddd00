//! Dtype naming and casting helpers.
//!
//! Configurations carry dtypes by name (`"f32"`, `"bf16"`, ...) so they can
//! be stored as plain values and rendered as text. Forward passes cast
//! floating tensors to the layer's forward dtype while leaving integer
//! tensors (quantized weights, token ids) untouched.

use candle_core::{DType, Tensor};

use crate::{LayerError, Result};

/// Parses a dtype name.
pub fn parse_dtype(name: &str) -> Result<DType> {
    let dtype = match name.to_ascii_lowercase().as_str() {
        "u8" | "uint8" => DType::U8,
        "u32" | "uint32" => DType::U32,
        "i64" | "int64" => DType::I64,
        "bf16" | "bfloat16" => DType::BF16,
        "f16" | "float16" => DType::F16,
        "f32" | "float32" => DType::F32,
        "f64" | "float64" => DType::F64,
        other => return Err(LayerError::Config(format!("unknown dtype {other:?}"))),
    };
    Ok(dtype)
}

/// Canonical name of a dtype, accepted by [`parse_dtype`].
pub fn dtype_name(dtype: DType) -> &'static str {
    dtype.as_str()
}

pub fn is_floating(dtype: DType) -> bool {
    matches!(dtype, DType::BF16 | DType::F16 | DType::F32 | DType::F64)
}

/// Casts `tensor` to `dtype`, skipping the copy when already matching.
pub fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// Casts floating tensors to `dtype`; other tensors are returned unchanged.
pub fn cast_floating(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if is_floating(tensor.dtype()) && is_floating(dtype) {
        cast_tensor(tensor, dtype)
    } else {
        Ok(tensor.clone())
    }
}

/// Serde adapter storing a dtype by name.
pub mod serde_dtype {
    use candle_core::DType;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dtype: &DType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(super::dtype_name(*dtype))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DType, D::Error> {
        let name = String::deserialize(deserializer)?;
        super::parse_dtype(&name).map_err(D::Error::custom)
    }
}

/// Serde adapter for an optional dtype stored by name.
pub mod serde_opt_dtype {
    use candle_core::DType;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        dtype: &Option<DType>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match dtype {
            Some(dtype) => serializer.serialize_some(super::dtype_name(*dtype)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DType>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|name| super::parse_dtype(&name).map_err(D::Error::custom))
            .transpose()
    }
}
