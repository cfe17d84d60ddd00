//! Weight descriptors: how a variable is initialized and what it carries.

use std::{collections::BTreeSet, fmt, str::FromStr};

use blueprint::{FromValue, Value};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::{
    dtypes::serde_opt_dtype,
    precondition,
    sharding::{MeshAxis, SplitDimsMapping},
    LayerError, Result,
};

/// Collection markers attached to weights.
pub mod collection {
    /// Excluded from weight-decay style regularization.
    pub const SKIP_LP_REGULARIZATION: &str = "skip_lp_regularization";
    /// Not updated by the optimizer.
    pub const NON_TRAINABLE: &str = "non_trainable";
    /// Averaged across replicas.
    pub const REQUIRES_MEAN_SYNC: &str = "requires_mean_sync";
    /// Summed across replicas.
    pub const REQUIRES_SUM_SYNC: &str = "requires_sum_sync";
    /// Kept in full precision even when the forward dtype is bf16.
    pub const DISALLOW_BFLOAT16_CONVERSION: &str = "disallow_bfloat16_conversion";
}

/// Scale of the default Xavier initializer. The small offset lets it be
/// told apart from an explicitly requested `xavier(1.0)`.
pub const DEFAULT_XAVIER_SCALE: f64 = 1.000001;

/// Initialization methods understood by [`crate::init::init_var`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InitMethod {
    DeltaOrthogonal,
    Gaussian,
    GaussianSqrtDim,
    GaussianSqrtFanIn,
    GaussianSqrtFanOut,
    GaussianSqrtFanAvg,
    Uniform,
    UniformSqrtDim,
    UniformUnitScaling,
    UniformSqrtFanAvg,
    TruncatedGaussian,
    TruncatedGaussianSqrtDim,
    TruncatedGaussianSqrtFanIn,
    TruncatedGaussianSqrtFanOut,
    Constant,
    Xavier,
}

impl InitMethod {
    pub const ALL: [InitMethod; 16] = [
        InitMethod::DeltaOrthogonal,
        InitMethod::Gaussian,
        InitMethod::GaussianSqrtDim,
        InitMethod::GaussianSqrtFanIn,
        InitMethod::GaussianSqrtFanOut,
        InitMethod::GaussianSqrtFanAvg,
        InitMethod::Uniform,
        InitMethod::UniformSqrtDim,
        InitMethod::UniformUnitScaling,
        InitMethod::UniformSqrtFanAvg,
        InitMethod::TruncatedGaussian,
        InitMethod::TruncatedGaussianSqrtDim,
        InitMethod::TruncatedGaussianSqrtFanIn,
        InitMethod::TruncatedGaussianSqrtFanOut,
        InitMethod::Constant,
        InitMethod::Xavier,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InitMethod::DeltaOrthogonal => "delta_orthogonal",
            InitMethod::Gaussian => "gaussian",
            InitMethod::GaussianSqrtDim => "gaussian_sqrt_dim",
            InitMethod::GaussianSqrtFanIn => "gaussian_sqrt_fanin",
            InitMethod::GaussianSqrtFanOut => "gaussian_sqrt_fanout",
            InitMethod::GaussianSqrtFanAvg => "gaussian_sqrt_fanavg",
            InitMethod::Uniform => "uniform",
            InitMethod::UniformSqrtDim => "uniform_sqrt_dim",
            InitMethod::UniformUnitScaling => "uniform_unit_scaling",
            InitMethod::UniformSqrtFanAvg => "uniform_sqrt_fanavg",
            InitMethod::TruncatedGaussian => "truncated_gaussian",
            InitMethod::TruncatedGaussianSqrtDim => "truncated_gaussian_sqrt_dim",
            InitMethod::TruncatedGaussianSqrtFanIn => "truncated_gaussian_sqrt_fanin",
            InitMethod::TruncatedGaussianSqrtFanOut => "truncated_gaussian_sqrt_fanout",
            InitMethod::Constant => "constant",
            InitMethod::Xavier => "xavier",
        }
    }
}

impl FromStr for InitMethod {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        InitMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| LayerError::UnsupportedInit(s.to_owned()))
    }
}

impl fmt::Display for InitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An initialization recipe: a method name and a scale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightInit {
    pub method: String,
    pub scale: f64,
}

impl Default for WeightInit {
    fn default() -> Self {
        Self::xavier(DEFAULT_XAVIER_SCALE)
    }
}

impl WeightInit {
    pub fn new(method: InitMethod, scale: f64) -> Self {
        Self {
            method: method.as_str().to_owned(),
            scale,
        }
    }

    pub fn gaussian(scale: f64) -> Self {
        Self::new(InitMethod::Gaussian, scale)
    }

    pub fn uniform(scale: f64) -> Self {
        Self::new(InitMethod::Uniform, scale)
    }

    pub fn constant(scale: f64) -> Self {
        Self::new(InitMethod::Constant, scale)
    }

    pub fn truncated_gaussian(scale: f64) -> Self {
        Self::new(InitMethod::TruncatedGaussian, scale)
    }

    pub fn gaussian_sqrt_dim(scale: f64) -> Self {
        Self::new(InitMethod::GaussianSqrtDim, scale)
    }

    pub fn gaussian_sqrt_fan_in(scale: f64) -> Self {
        Self::new(InitMethod::GaussianSqrtFanIn, scale)
    }

    pub fn gaussian_sqrt_fan_out(scale: f64) -> Self {
        Self::new(InitMethod::GaussianSqrtFanOut, scale)
    }

    pub fn gaussian_sqrt_fan_avg(scale: f64) -> Self {
        Self::new(InitMethod::GaussianSqrtFanAvg, scale)
    }

    pub fn uniform_sqrt_dim(scale: f64) -> Self {
        Self::new(InitMethod::UniformSqrtDim, scale)
    }

    pub fn uniform_unit_scaling(scale: f64) -> Self {
        Self::new(InitMethod::UniformUnitScaling, scale)
    }

    pub fn uniform_sqrt_fan_avg(scale: f64) -> Self {
        Self::new(InitMethod::UniformSqrtFanAvg, scale)
    }

    pub fn truncated_gaussian_sqrt_dim(scale: f64) -> Self {
        Self::new(InitMethod::TruncatedGaussianSqrtDim, scale)
    }

    pub fn truncated_gaussian_sqrt_fan_in(scale: f64) -> Self {
        Self::new(InitMethod::TruncatedGaussianSqrtFanIn, scale)
    }

    pub fn truncated_gaussian_sqrt_fan_out(scale: f64) -> Self {
        Self::new(InitMethod::TruncatedGaussianSqrtFanOut, scale)
    }

    pub fn delta_orthogonal(scale: f64) -> Self {
        Self::new(InitMethod::DeltaOrthogonal, scale)
    }

    pub fn xavier(scale: f64) -> Self {
        Self::new(InitMethod::Xavier, scale)
    }

    /// Xavier scaled down for `depth` stacked residual blocks.
    pub fn xavier_with_fixup(scale: f64, depth: f64, layers_per_residual_block: f64) -> Self {
        Self::xavier(scale * depth.powf(-1.0 / (2.0 * layers_per_residual_block)))
    }

    pub fn init_method(&self) -> Result<InitMethod> {
        self.method.parse()
    }

    /// True for the default Xavier recipe, compared with a small tolerance.
    pub fn is_default(&self) -> bool {
        self.method == InitMethod::Xavier.as_str() && (self.scale - DEFAULT_XAVIER_SCALE).abs() < 1e-7
    }

    pub fn to_value(&self) -> Value {
        Value::map([
            ("method", Value::Str(self.method.clone())),
            ("scale", Value::Float(self.scale)),
        ])
    }
}

impl From<WeightInit> for Value {
    fn from(init: WeightInit) -> Self {
        init.to_value()
    }
}

impl FromValue for WeightInit {
    const EXPECTED: &'static str = "weight init {method, scale}";

    fn from_value(value: &Value) -> Option<Self> {
        let Value::Map(entries) = value else {
            return None;
        };
        Some(Self {
            method: String::from_value(entries.get("method")?)?,
            scale: f64::from_value(entries.get("scale")?)?,
        })
    }
}

/// Metadata describing one variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightHParams {
    pub shape: Vec<usize>,
    /// Falls back to the owning layer's `params_init` when unset.
    pub init: Option<WeightInit>,
    /// Falls back to the owning layer's `dtype` when unset.
    #[serde(with = "serde_opt_dtype")]
    pub dtype: Option<DType>,
    pub collections: BTreeSet<String>,
    pub mesh_shape: Option<Vec<usize>>,
    pub tensor_split_dims_mapping: Option<SplitDimsMapping>,
    pub repeat_prefix: Option<Vec<usize>>,
    pub repeat_prefix_split_dims_mapping: Option<SplitDimsMapping>,
    pub repeat_optimizer_dims_mapping: Option<SplitDimsMapping>,
    pub fan_in_axes: Option<Vec<isize>>,
    pub fan_out_axes: Option<Vec<isize>>,
}

impl WeightHParams {
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            init: None,
            dtype: None,
            collections: BTreeSet::new(),
            mesh_shape: None,
            tensor_split_dims_mapping: None,
            repeat_prefix: None,
            repeat_prefix_split_dims_mapping: None,
            repeat_optimizer_dims_mapping: None,
            fan_in_axes: None,
            fan_out_axes: None,
        }
    }

    pub fn with_init(mut self, init: WeightInit) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collections.insert(collection.to_owned());
        self
    }

    pub fn with_mesh_shape(mut self, mesh_shape: Vec<usize>) -> Self {
        self.mesh_shape = Some(mesh_shape);
        self
    }

    pub fn with_split_dims_mapping(mut self, mapping: Option<SplitDimsMapping>) -> Self {
        self.tensor_split_dims_mapping = mapping;
        self
    }

    pub fn with_fan_axes(mut self, fan_in_axes: Vec<isize>, fan_out_axes: Vec<isize>) -> Self {
        self.fan_in_axes = Some(fan_in_axes);
        self.fan_out_axes = Some(fan_out_axes);
        self
    }

    /// Fills in an all-unsharded mapping when a mesh is set but no mapping
    /// was given, and checks an explicit mapping covers every dimension.
    pub fn normalized(mut self) -> Result<Self> {
        if self.mesh_shape.is_none() {
            return Ok(self);
        }
        match &self.tensor_split_dims_mapping {
            None => {
                log_at!(
                    info,
                    "no sharding annotation for weight of shape {:?}; replicating it",
                    self.shape
                );
                self.tensor_split_dims_mapping = Some(vec![MeshAxis::Unsharded; self.shape.len()]);
            }
            Some(mapping) if mapping.len() != self.shape.len() => {
                return Err(precondition(format!(
                    "split dims mapping {mapping:?} does not match weight shape {:?}",
                    self.shape
                )));
            }
            Some(_) => {}
        }
        Ok(self)
    }

    /// Repeat prefix followed by the per-instance shape.
    pub fn full_shape(&self) -> Vec<usize> {
        let mut shape = self.repeat_prefix.clone().unwrap_or_default();
        shape.extend(&self.shape);
        shape
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains(name)
    }

    pub fn is_trainable(&self) -> bool {
        !self.has_collection(collection::NON_TRAINABLE)
    }

    pub fn skips_lp_regularization(&self) -> bool {
        self.has_collection(collection::SKIP_LP_REGULARIZATION)
    }

    pub fn requires_mean_sync(&self) -> bool {
        self.has_collection(collection::REQUIRES_MEAN_SYNC)
    }

    pub fn requires_sum_sync(&self) -> bool {
        self.has_collection(collection::REQUIRES_SUM_SYNC)
    }

    pub fn disallows_bfloat16_conversion(&self) -> bool {
        self.has_collection(collection::DISALLOW_BFLOAT16_CONVERSION)
    }
}

fn resolve_axis(axis: isize, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 {
        rank.checked_sub(axis.unsigned_abs())
    } else {
        Some(axis.unsigned_abs()).filter(|&a| a < rank)
    };
    resolved.ok_or_else(|| precondition(format!("axis {axis} out of range for rank {rank}")))
}

/// Fan-in and fan-out of a weight shape.
///
/// With explicit axes, each fan is the product of the listed dimensions
/// (negative axes count from the end) and both lists must be given. Without
/// them: 0-D weights have fans `(1, 1)`, 1-D weights `(d, d)`, and higher
/// ranks multiply the receptive field (all leading dimensions) into
/// `shape[-2]` for fan-in and `shape[-1]` for fan-out.
pub fn fan_in_fan_out(
    shape: &[usize],
    fan_in_axes: Option<&[isize]>,
    fan_out_axes: Option<&[isize]>,
) -> Result<(usize, usize)> {
    match (fan_in_axes, fan_out_axes) {
        (Some(fan_in), Some(fan_out)) => {
            let product = |axes: &[isize]| -> Result<usize> {
                axes.iter()
                    .map(|&axis| resolve_axis(axis, shape.len()).map(|i| shape[i]))
                    .product()
            };
            Ok((product(fan_in)?, product(fan_out)?))
        }
        (None, None) => Ok(match shape {
            [] => (1, 1),
            [d] => (*d, *d),
            [receptive @ .., fan_in, fan_out] => {
                let field: usize = receptive.iter().product();
                (field * fan_in, field * fan_out)
            }
        }),
        _ => Err(precondition(
            "fan_in_axes and fan_out_axes must be given together",
        )),
    }
}
