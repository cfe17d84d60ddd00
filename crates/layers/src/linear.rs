//! Linear projection and bias layers.
//!
//! [`Linear`] expects inputs shaped `(..., input_dims)` and returns
//! `(..., output_dims)`; leading dimensions are flattened for the matmul and
//! restored afterwards. The weight `w` is stored `[input_dims, output_dims]`
//! and sharded by the `wt` entry of `weight_split_dims_mapping`; the output
//! is constrained by the `out` entry of `activation_split_dims_mapping`.
//! [`Bias`] adds a learned vector along the last dimension.

use std::any::Any;

use blueprint::{Arguments, Field};
use candle_core::Tensor;

use crate::{
    base::{Layer, LayerBehavior, LayerDef},
    checks,
    weights::{WeightHParams, WeightInit},
    Result,
};

/// Dense projection without bias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linear {
    /// Incoming feature dimension.
    pub input_dims: usize,
    /// Outgoing feature dimension.
    pub output_dims: usize,
}

impl Linear {
    /// Applies the projection held by `layer`, which must be a [`Linear`].
    pub fn forward(layer: &Layer, inputs: &Tensor) -> Result<Tensor> {
        layer.with_behavior(|linear: &Linear, layer| linear.fprop(layer, inputs))
    }

    fn fprop(&self, layer: &Layer, inputs: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("linear.inputs", inputs, self.input_dims)?;
        project(layer, inputs, &layer.theta("w")?)
    }
}

/// `inputs @ w` over the last dimension, constrained by the layer's `out`
/// activation sharding.
pub(crate) fn project(layer: &Layer, inputs: &Tensor, w: &Tensor) -> Result<Tensor> {
    let (input_dims, output_dims) = w.dims2()?;
    let mut dims = inputs.dims().to_vec();
    let rows: usize = dims[..dims.len().saturating_sub(1)].iter().product();
    let flat = inputs.to_dtype(w.dtype())?.reshape((rows, input_dims))?;
    if let Some(last) = dims.last_mut() {
        *last = output_dims;
    }
    let out = flat.matmul(w)?.reshape(dims)?;
    let sharding = layer.activation_sharding("out")?;
    if let Some(spec) = layer.maybe_shard(&out, sharding.as_deref(), None)? {
        log_at!(trace, "{} output sharded as {spec}", layer.path_name());
    }
    Ok(out)
}

impl LayerBehavior for Linear {
    fn setup(&mut self, layer: &Layer) -> Result<()> {
        let wt = layer.weight_sharding("wt")?;
        let hparams = WeightHParams::new(vec![self.input_dims, self.output_dims])
            .with_split_dims_mapping(wt);
        layer.create_variable("w", &hparams, true)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LayerDef for Linear {
    const NAME: &'static str = "Linear";

    fn fields() -> Result<Vec<Field>> {
        Ok(vec![
            Field::required("input_dims"),
            Field::required("output_dims"),
        ])
    }

    fn from_args(args: &Arguments) -> Result<Self> {
        Ok(Self {
            input_dims: args.get("input_dims")?,
            output_dims: args.get("output_dims")?,
        })
    }
}

/// Learned bias added along the last dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bias {
    pub dims: usize,
}

impl Bias {
    pub fn forward(layer: &Layer, inputs: &Tensor) -> Result<Tensor> {
        layer.with_behavior(|bias: &Bias, layer| {
            checks::expect_last_dim("bias.inputs", inputs, bias.dims)?;
            let b = layer.theta("b")?;
            Ok(inputs.to_dtype(b.dtype())?.broadcast_add(&b)?)
        })
    }
}

impl LayerBehavior for Bias {
    fn setup(&mut self, layer: &Layer) -> Result<()> {
        let wt = layer.weight_sharding("wt")?;
        let hparams = WeightHParams::new(vec![self.dims])
            .with_init(WeightInit::constant(0.0))
            .with_split_dims_mapping(wt);
        layer.create_variable("b", &hparams, true)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LayerDef for Bias {
    const NAME: &'static str = "Bias";

    fn fields() -> Result<Vec<Field>> {
        Ok(vec![Field::required("dims")])
    }

    fn from_args(args: &Arguments) -> Result<Self> {
        Ok(Self {
            dims: args.get("dims")?,
        })
    }
}
