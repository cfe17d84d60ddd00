//! Feed-forward block built from child projection and bias layers.
//!
//! The block consumes `(..., input_dims)` and returns `(..., output_dims)`:
//! a [`Linear`] child named `linear`, an optional [`Bias`] child named
//! `bias`, then an activation. Both children come from template fields, so
//! a config can swap either for another layer with the same fields.

use std::{any::Any, fmt, str::FromStr};

use blueprint::{template_field, Arguments, Config, Field};
use candle_core::Tensor;

use crate::{
    base::{Layer, LayerBehavior, LayerDef},
    linear::{Bias, Linear},
    sharding::{mapping_to_value, MeshAxis},
    LayerError, LayerRef, Result,
};

/// Non-linearity applied after the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Identity,
    Relu,
    /// Erf-based GELU.
    Gelu,
    Silu,
    Tanh,
}

impl ActivationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivationKind::Identity => "none",
            ActivationKind::Relu => "relu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Silu => "silu",
            ActivationKind::Tanh => "tanh",
        }
    }

    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            ActivationKind::Identity => x.clone(),
            ActivationKind::Relu => x.relu()?,
            ActivationKind::Gelu => x.gelu_erf()?,
            ActivationKind::Silu => x.silu()?,
            ActivationKind::Tanh => x.tanh()?,
        })
    }
}

impl FromStr for ActivationKind {
    type Err = LayerError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "none" | "identity" => Ok(ActivationKind::Identity),
            "relu" => Ok(ActivationKind::Relu),
            "gelu" => Ok(ActivationKind::Gelu),
            "silu" | "swish" => Ok(ActivationKind::Silu),
            "tanh" => Ok(ActivationKind::Tanh),
            other => Err(LayerError::Config(format!("unknown activation {other:?}"))),
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Projection, optional bias and activation.
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub input_dims: usize,
    pub output_dims: usize,
    pub has_bias: bool,
    pub activation: ActivationKind,
    linear_tpl: Config,
    bias_tpl: Config,
}

impl FeedForward {
    pub fn forward(layer: &Layer, inputs: &Tensor) -> Result<Tensor> {
        layer.with_behavior(|ffn: &FeedForward, layer| {
            let linear: LayerRef = child(layer, "linear")?;
            let mut out = Linear::forward(&linear, inputs)?;
            if ffn.has_bias {
                let bias: LayerRef = child(layer, "bias")?;
                out = Bias::forward(&bias, &out)?;
            }
            ffn.activation.apply(&out)
        })
    }
}

fn child(layer: &Layer, name: &str) -> Result<LayerRef> {
    layer.child(name).ok_or_else(|| {
        crate::precondition(format!("layer {} has no child {name}", layer.path_name()))
    })
}

/// Sets one entry of a sharding template held in `field` of `config`.
fn set_sharding(config: &mut Config, field: &str, entry: &str, mapping: &[MeshAxis]) -> Result<()> {
    let mut sharding: Config = config.get_as(field)?;
    sharding.set(entry, mapping_to_value(mapping))?;
    config.set(field, sharding)?;
    Ok(())
}

impl LayerBehavior for FeedForward {
    fn setup(&mut self, layer: &Layer) -> Result<()> {
        let wt = layer.weight_sharding("wt")?;
        let out = layer.activation_sharding("out")?;

        let mut linear = self
            .linear_tpl
            .clone()
            .with("input_dims", self.input_dims)?
            .with("output_dims", self.output_dims)?;
        if let Some(wt) = &wt {
            set_sharding(&mut linear, "weight_split_dims_mapping", "wt", wt)?;
        }
        if let Some(out) = &out {
            set_sharding(&mut linear, "activation_split_dims_mapping", "out", out)?;
        }
        layer.create_child("linear", &linear)?;

        if self.has_bias {
            let mut bias = self.bias_tpl.clone().with("dims", self.output_dims)?;
            if let Some(last) = wt.as_ref().and_then(|wt| wt.last()) {
                set_sharding(&mut bias, "weight_split_dims_mapping", "wt", &[last.clone()])?;
            }
            layer.create_child("bias", &bias)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LayerDef for FeedForward {
    const NAME: &'static str = "FeedForward";

    fn fields() -> Result<Vec<Field>> {
        Ok(vec![
            Field::required("input_dims"),
            Field::required("output_dims"),
            Field::with_default("has_bias", true),
            Field::with_default("activation", ActivationKind::Relu.as_str()),
            template_field("linear_tpl", Some(Linear::target()?)),
            template_field("bias_tpl", Some(Bias::target()?)),
        ])
    }

    fn from_args(args: &Arguments) -> Result<Self> {
        Ok(Self {
            input_dims: args.get("input_dims")?,
            output_dims: args.get("output_dims")?,
            has_bias: args.get("has_bias")?,
            activation: args.get::<String>("activation")?.parse()?,
            linear_tpl: args.get("linear_tpl")?,
            bias_tpl: args.get("bias_tpl")?,
        })
    }
}
