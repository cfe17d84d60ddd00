//! Per-channel integer weight quantization.
//!
//! Weights shaped `(..., channels)` are quantized per output channel (the
//! last dimension): every channel gets its own scale, and for asymmetric
//! quantization its own zero point, so `w ≈ q * scale (+ zero_point)`.
//! Symmetric values use `[-127, 127]`; asymmetric values use `[-128, 127]`.
//!
//! [`QuantizedLinear`] runs in one of two modes. In `training` mode it holds
//! a float weight, runs on its fake-quantized value, and exports integer
//! weights through [`LayerBehavior::quantize_weight`]. In `inference` mode it
//! declares the integer weight and scale directly and dequantizes on the fly.

use std::{any::Any, fmt, str::FromStr};

use blueprint::{Arguments, Field};
use candle_core::{DType, Tensor};

use crate::{
    base::{Layer, LayerBehavior, LayerDef, QUANTIZED_SCALE_SUFFIX, QUANTIZED_ZP_SUFFIX},
    checks,
    dtypes::{dtype_name, parse_dtype},
    linear::project,
    nested::Nested,
    sharding::{weight_hparams_to_pspec, PartitionDim, PartitionSpec},
    variables::PARAMS,
    weights::WeightHParams,
    LayerError, Result,
};

const SYMMETRIC_BOUND: f64 = 127.0;
const ASYMMETRIC_LEVELS: f64 = 255.0;
const ASYMMETRIC_MIN: f64 = -128.0;
const ASYMMETRIC_MAX: f64 = 127.0;
/// Floor on a channel's range so all-zero channels get a usable scale.
const MIN_RANGE: f64 = 1e-8;

/// An integer tensor together with its per-channel dequantization params.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub values: Tensor,
    /// Shape `[channels]`.
    pub scale: Tensor,
    /// Shape `[channels]`; only for asymmetric quantization.
    pub zero_point: Option<Tensor>,
}

/// Quantizes `weight` per channel of its last dimension into `dtype`.
pub fn quantize_tensor(weight: &Tensor, use_symmetric: bool, dtype: DType) -> Result<QuantizedTensor> {
    let shape = weight.dims().to_vec();
    let Some(&channels) = shape.last() else {
        return Err(crate::precondition("cannot quantize a scalar weight"));
    };
    let flat = weight.to_dtype(DType::F32)?.reshape(((), channels))?;

    let (q, scale, zero_point) = if use_symmetric {
        let bound = flat.abs()?.max(0)?.clamp(MIN_RANGE, f64::MAX)?;
        let scale = bound.affine(1.0 / SYMMETRIC_BOUND, 0.0)?;
        let q = flat
            .broadcast_div(&scale)?
            .round()?
            .clamp(-SYMMETRIC_BOUND, SYMMETRIC_BOUND)?;
        (q, scale, None)
    } else {
        let min = flat.min(0)?;
        let range = flat.max(0)?.sub(&min)?.clamp(MIN_RANGE, f64::MAX)?;
        let scale = range.affine(1.0 / ASYMMETRIC_LEVELS, 0.0)?;
        let zero_point = min.add(&scale.affine(-ASYMMETRIC_MIN, 0.0)?)?;
        let q = flat
            .broadcast_sub(&zero_point)?
            .broadcast_div(&scale)?
            .round()?
            .clamp(ASYMMETRIC_MIN, ASYMMETRIC_MAX)?;
        (q, scale, Some(zero_point))
    };

    let out_dtype = weight.dtype();
    Ok(QuantizedTensor {
        values: q.reshape(shape)?.to_dtype(dtype)?,
        scale: scale.to_dtype(out_dtype)?,
        zero_point: zero_point.map(|zp| zp.to_dtype(out_dtype)).transpose()?,
    })
}

/// Inverse of [`quantize_tensor`], producing `dtype` values.
pub fn dequantize(
    values: &Tensor,
    scale: &Tensor,
    zero_point: Option<&Tensor>,
    dtype: DType,
) -> Result<Tensor> {
    let shape = values.dims().to_vec();
    let channels = scale.dims1()?;
    checks::expect_last_dim("dequantize.values", values, channels)?;
    let mut w = values
        .to_dtype(DType::F32)?
        .reshape(((), channels))?
        .broadcast_mul(&scale.to_dtype(DType::F32)?)?;
    if let Some(zp) = zero_point {
        w = w.broadcast_add(&zp.to_dtype(DType::F32)?)?;
    }
    Ok(w.reshape(shape)?.to_dtype(dtype)?)
}

/// Whether a [`QuantizedLinear`] trains float weights or serves integer ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationMode {
    Training,
    Inference,
}

impl QuantizationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QuantizationMode::Training => "training",
            QuantizationMode::Inference => "inference",
        }
    }
}

impl FromStr for QuantizationMode {
    type Err = LayerError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "training" => Ok(QuantizationMode::Training),
            "inference" => Ok(QuantizationMode::Inference),
            other => Err(LayerError::Config(format!("unknown quantization mode {other:?}"))),
        }
    }
}

impl fmt::Display for QuantizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear projection with an integer-quantized weight.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    pub input_dims: usize,
    pub output_dims: usize,
    pub mode: QuantizationMode,
    pub use_symmetric: bool,
    pub quantized_dtype: DType,
}

impl QuantizedLinear {
    pub fn forward(layer: &Layer, inputs: &Tensor) -> Result<Tensor> {
        layer.with_behavior(|ql: &QuantizedLinear, layer| {
            checks::expect_last_dim("quantized_linear.inputs", inputs, ql.input_dims)?;
            let w = ql.effective_weight(layer)?;
            project(layer, inputs, &w)
        })
    }

    /// The float weight the forward pass multiplies by.
    fn effective_weight(&self, layer: &Layer) -> Result<Tensor> {
        match self.mode {
            QuantizationMode::Training => {
                let w = layer.theta("w")?;
                let q = quantize_tensor(&w, self.use_symmetric, self.quantized_dtype)?;
                dequantize(&q.values, &q.scale, q.zero_point.as_ref(), w.dtype())
            }
            QuantizationMode::Inference => {
                let (q, scale, zero_point) = layer.get_quantized_weight("w", self.use_symmetric)?;
                dequantize(&q, &scale, zero_point.as_ref(), layer.fprop_dtype())
            }
        }
    }

    fn weight_hparams(&self, layer: &Layer) -> Result<WeightHParams> {
        Ok(WeightHParams::new(vec![self.input_dims, self.output_dims])
            .with_split_dims_mapping(layer.weight_sharding("wt")?))
    }
}

impl LayerBehavior for QuantizedLinear {
    fn setup(&mut self, layer: &Layer) -> Result<()> {
        let hparams = self.weight_hparams(layer)?;
        match self.mode {
            QuantizationMode::Training => {
                layer.create_variable("w", &hparams, true)?;
            }
            QuantizationMode::Inference => {
                layer.create_quantized_variable(
                    "w",
                    &hparams,
                    &[self.output_dims],
                    self.quantized_dtype,
                    self.use_symmetric,
                )?;
            }
        }
        Ok(())
    }

    fn quantize_weight(&self, layer: &Layer) -> Result<Nested<Tensor>> {
        if self.mode == QuantizationMode::Inference {
            return layer.default_quantize_weight();
        }
        let mut out = layer.merge_child_results(|child| child.quantize_weight())?;
        let q = quantize_tensor(&layer.theta("w")?, self.use_symmetric, self.quantized_dtype)?;
        out.insert_path(&[PARAMS, "w"], q.values);
        out.insert_path(&[PARAMS, &format!("w{QUANTIZED_SCALE_SUFFIX}")], q.scale);
        if let Some(zp) = q.zero_point {
            out.insert_path(&[PARAMS, &format!("w{QUANTIZED_ZP_SUFFIX}")], zp);
        }
        Ok(out)
    }

    fn quantized_partition_specs(&self, layer: &Layer) -> Result<Nested<PartitionSpec>> {
        if self.mode == QuantizationMode::Inference {
            return layer.default_quantized_partition_specs();
        }
        let mut out = layer.merge_child_results(|child| child.quantized_partition_specs())?;
        let hparams = layer
            .weight_hparams("w")
            .ok_or_else(|| crate::precondition("quantized linear has no weight w"))?;
        let names = layer.mesh_axis_names().unwrap_or_default();
        let w_spec = weight_hparams_to_pspec(&hparams, names)?;
        let channel = w_spec
            .dims()
            .last()
            .cloned()
            .unwrap_or(PartitionDim::Replicated);
        out.insert_path(&[PARAMS, "w"], w_spec);
        let scale_spec = PartitionSpec(vec![channel]);
        if !self.use_symmetric {
            out.insert_path(&[PARAMS, &format!("w{QUANTIZED_ZP_SUFFIX}")], scale_spec.clone());
        }
        out.insert_path(&[PARAMS, &format!("w{QUANTIZED_SCALE_SUFFIX}")], scale_spec);
        Ok(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LayerDef for QuantizedLinear {
    const NAME: &'static str = "QuantizedLinear";

    fn fields() -> Result<Vec<Field>> {
        Ok(vec![
            Field::required("input_dims"),
            Field::required("output_dims"),
            Field::with_default("mode", QuantizationMode::Inference.as_str()),
            Field::with_default("use_symmetric", true),
            Field::with_default("quantized_dtype", dtype_name(DType::I64)),
        ])
    }

    fn from_args(args: &Arguments) -> Result<Self> {
        Ok(Self {
            input_dims: args.get("input_dims")?,
            output_dims: args.get("output_dims")?,
            mode: args.get::<String>("mode")?.parse()?,
            use_symmetric: args.get("use_symmetric")?,
            quantized_dtype: parse_dtype(&args.get::<String>("quantized_dtype")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
    }

    #[test]
    fn symmetric_round_trip_is_close() -> Result<()> {
        let w = Tensor::randn(0f32, 1.0, (16, 4), &Device::Cpu)?;
        let q = quantize_tensor(&w, true, DType::I64)?;
        assert_eq!(q.values.dtype(), DType::I64);
        assert_eq!(q.scale.dims(), &[4]);
        assert!(q.zero_point.is_none());
        let max_q = q
            .values
            .to_dtype(DType::F32)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()?;
        assert!(max_q <= 127.0);

        let back = dequantize(&q.values, &q.scale, None, DType::F32)?;
        let tol = q.scale.max(0)?.to_vec0::<f32>()?;
        assert!(max_abs_diff(&w, &back)? <= tol);
        Ok(())
    }

    #[test]
    fn asymmetric_round_trip_is_close() -> Result<()> {
        let w = Tensor::rand(0.5f32, 3.0, (8, 3), &Device::Cpu)?;
        let q = quantize_tensor(&w, false, DType::I64)?;
        let zp = q.zero_point.clone().ok_or_else(|| crate::precondition("missing zp"))?;
        assert_eq!(zp.dims(), &[3]);
        let back = dequantize(&q.values, &q.scale, Some(&zp), DType::F32)?;
        let tol = q.scale.max(0)?.to_vec0::<f32>()?;
        assert!(max_abs_diff(&w, &back)? <= tol);
        Ok(())
    }

    #[test]
    fn zero_channels_stay_zero() -> Result<()> {
        let w = Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?;
        let q = quantize_tensor(&w, true, DType::I64)?;
        let back = dequantize(&q.values, &q.scale, None, DType::F32)?;
        assert_eq!(max_abs_diff(&w, &back)?, 0.0);
        Ok(())
    }

    #[test]
    fn modes_parse() -> Result<()> {
        assert_eq!("training".parse::<QuantizationMode>()?, QuantizationMode::Training);
        assert!("fp8".parse::<QuantizationMode>().is_err());
        Ok(())
    }
}
