//! Sharding annotations.
//!
//! A split-dims mapping says, per tensor dimension, which device-mesh
//! axis (or axes) it is split over. Entries are mesh axis indices, mesh
//! axis names, nested groups of either, or `Unsharded`. Annotations are
//! converted to [`PartitionSpec`]s keyed by axis name; nothing here moves
//! data between devices.

use std::{collections::BTreeMap, fmt};

use blueprint::{FromValue, Value};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{
    nested::Nested,
    precondition,
    weights::WeightHParams,
    LayerError, Result,
};

/// One entry of a split-dims mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeshAxis {
    Index(i64),
    Name(String),
    Group(Vec<MeshAxis>),
    Unsharded,
}

/// Per-dimension sharding annotation.
pub type SplitDimsMapping = Vec<MeshAxis>;

impl MeshAxis {
    pub fn to_value(&self) -> Value {
        match self {
            MeshAxis::Index(i) => Value::Int(*i),
            MeshAxis::Name(name) => Value::Str(name.clone()),
            MeshAxis::Group(axes) => Value::List(axes.iter().map(MeshAxis::to_value).collect()),
            MeshAxis::Unsharded => Value::None,
        }
    }
}

impl From<i64> for MeshAxis {
    fn from(index: i64) -> Self {
        MeshAxis::Index(index)
    }
}

impl From<&str> for MeshAxis {
    fn from(name: &str) -> Self {
        MeshAxis::Name(name.to_owned())
    }
}

impl<T: Into<MeshAxis>> From<Option<T>> for MeshAxis {
    fn from(axis: Option<T>) -> Self {
        axis.map_or(MeshAxis::Unsharded, Into::into)
    }
}

impl FromValue for MeshAxis {
    const EXPECTED: &'static str = "mesh axis";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::None => Some(MeshAxis::Unsharded),
            Value::Int(i) => Some(MeshAxis::Index(*i)),
            Value::Str(name) => Some(MeshAxis::Name(name.clone())),
            Value::List(items) => items
                .iter()
                .map(MeshAxis::from_value)
                .collect::<Option<Vec<_>>>()
                .map(MeshAxis::Group),
            _ => None,
        }
    }
}

/// Renders a mapping as a config value.
pub fn mapping_to_value(mapping: &[MeshAxis]) -> Value {
    Value::List(mapping.iter().map(MeshAxis::to_value).collect())
}

/// One dimension of a [`PartitionSpec`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PartitionDim {
    Replicated,
    Axis(String),
    Axes(Vec<PartitionDim>),
    /// Leaves the dimension's layout to the compiler.
    Unconstrained,
}

impl fmt::Display for PartitionDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionDim::Replicated => f.write_str("None"),
            PartitionDim::Axis(name) => write!(f, "'{name}'"),
            PartitionDim::Axes(axes) => {
                f.write_str("(")?;
                for (i, axis) in axes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{axis}")?;
                }
                f.write_str(")")
            }
            PartitionDim::Unconstrained => f.write_str("UNCONSTRAINED"),
        }
    }
}

/// Mesh-axis names per tensor dimension.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PartitionSpec(pub Vec<PartitionDim>);

impl PartitionSpec {
    pub fn replicated(rank: usize) -> Self {
        Self(vec![PartitionDim::Replicated; rank])
    }

    pub fn dims(&self) -> &[PartitionDim] {
        &self.0
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionSpec{}", PartitionDim::Axes(self.0.clone()))
    }
}

fn resolve_axis(axis: &MeshAxis, mesh_axis_names: &[String]) -> Result<PartitionDim> {
    match axis {
        MeshAxis::Unsharded => Ok(PartitionDim::Replicated),
        MeshAxis::Index(index) if *index < 0 => Ok(PartitionDim::Replicated),
        MeshAxis::Name(name) if mesh_axis_names.contains(name) => {
            Ok(PartitionDim::Axis(name.clone()))
        }
        MeshAxis::Name(name) => Err(LayerError::Config(format!(
            "unknown mesh axis {name:?}, expected one of {mesh_axis_names:?}"
        ))),
        MeshAxis::Index(index) => usize::try_from(*index)
            .ok()
            .and_then(|i| mesh_axis_names.get(i))
            .map(|name| PartitionDim::Axis(name.clone()))
            .ok_or_else(|| {
                LayerError::Config(format!(
                    "mesh axis index {index} out of range for axes {mesh_axis_names:?}"
                ))
            }),
        MeshAxis::Group(axes) => axes
            .iter()
            .map(|axis| resolve_axis(axis, mesh_axis_names))
            .collect::<Result<Vec<_>>>()
            .map(PartitionDim::Axes),
    }
}

/// Converts a split-dims mapping to a partition spec, resolving indices to names.
///
/// Negative indices mean replicated; names must appear in `mesh_axis_names`.
pub fn to_partition_spec(mapping: &[MeshAxis], mesh_axis_names: &[String]) -> Result<PartitionSpec> {
    mapping
        .iter()
        .map(|axis| resolve_axis(axis, mesh_axis_names))
        .collect::<Result<Vec<_>>>()
        .map(PartitionSpec)
}

/// Partition spec for a single weight, ignoring any repeat prefix.
///
/// Weights with no mapping are replicated over every dimension.
pub fn weight_hparams_to_pspec(
    hparams: &WeightHParams,
    mesh_axis_names: &[String],
) -> Result<PartitionSpec> {
    match &hparams.tensor_split_dims_mapping {
        Some(mapping) => to_partition_spec(mapping, mesh_axis_names),
        None => Ok(PartitionSpec::replicated(hparams.shape.len())),
    }
}

/// Partition specs for a tree of weight metadata, covering the full shape
/// (repeat prefix included).
pub fn var_partition_specs(
    var_specs: &Nested<WeightHParams>,
    mesh_shape: &[usize],
    mesh_axis_names: &[String],
) -> Result<Nested<PartitionSpec>> {
    if mesh_shape.len() != mesh_axis_names.len() {
        return Err(LayerError::Config(format!(
            "mesh shape {mesh_shape:?} does not match axis names {mesh_axis_names:?}"
        )));
    }
    var_specs.try_map(|hparams| {
        let prefix = hparams.repeat_prefix.as_deref().unwrap_or_default();
        let mut mapping = match &hparams.repeat_prefix_split_dims_mapping {
            Some(prefix_mapping) => {
                if prefix_mapping.len() != prefix.len() {
                    return Err(precondition(format!(
                        "repeat prefix mapping {prefix_mapping:?} does not match prefix {prefix:?}"
                    )));
                }
                prefix_mapping.clone()
            }
            None => vec![MeshAxis::Unsharded; prefix.len()],
        };
        match &hparams.tensor_split_dims_mapping {
            Some(split) if split.len() != hparams.shape.len() => {
                return Err(precondition(format!(
                    "split dims mapping {split:?} does not match weight shape {:?}",
                    hparams.shape
                )));
            }
            Some(split) => mapping.extend(split.iter().cloned()),
            None => mapping.extend(vec![MeshAxis::Unsharded; hparams.shape.len()]),
        }
        to_partition_spec(&mapping, mesh_axis_names)
    })
}

/// Device mesh shape: `ici` scaled elementwise by `dcn` when present.
pub fn effective_mesh_shape(
    ici_mesh_shape: Option<&[usize]>,
    dcn_mesh_shape: Option<&[usize]>,
    mesh_axis_names: Option<&[String]>,
) -> Result<Option<Vec<usize>>> {
    let Some(ici) = ici_mesh_shape else {
        if dcn_mesh_shape.is_some() {
            return Err(LayerError::Config(
                "dcn_mesh_shape requires ici_mesh_shape".into(),
            ));
        }
        return Ok(None);
    };
    let names = mesh_axis_names.unwrap_or_default();
    if ici.len() != names.len() {
        return Err(LayerError::Config(format!(
            "ici_mesh_shape {ici:?} does not match mesh_axis_names {names:?}"
        )));
    }
    match dcn_mesh_shape {
        None => Ok(Some(ici.to_vec())),
        Some(dcn) if dcn.len() == ici.len() => {
            Ok(Some(ici.iter().zip(dcn).map(|(i, d)| i * d).collect()))
        }
        Some(dcn) => Err(LayerError::Config(format!(
            "dcn_mesh_shape {dcn:?} does not match ici_mesh_shape {ici:?}"
        ))),
    }
}

fn transpose_dim(dim: PartitionDim, transpose: &BTreeMap<String, String>) -> PartitionDim {
    match dim {
        PartitionDim::Axis(name) => match transpose.get(&name) {
            Some(renamed) => PartitionDim::Axis(renamed.clone()),
            None => PartitionDim::Axis(name),
        },
        PartitionDim::Axes(axes) => PartitionDim::Axes(
            axes.into_iter()
                .map(|axis| transpose_dim(axis, transpose))
                .collect(),
        ),
        other => other,
    }
}

/// Computes the sharding constraint for `x`.
///
/// Returns `None` when there is no mapping or no mesh. Otherwise the mapping must
/// cover every dimension of `x`; axis names are renamed through the
/// ambient context's mesh-axes transpose table when one is active, and the
/// listed dimensions are marked unconstrained.
pub fn maybe_shard(
    x: &Tensor,
    split_dims_mapping: Option<&[MeshAxis]>,
    mesh_axis_names: Option<&[String]>,
    unconstrained_dims: Option<&[usize]>,
) -> Result<Option<PartitionSpec>> {
    let (Some(mapping), Some(names)) = (split_dims_mapping, mesh_axis_names) else {
        return Ok(None);
    };
    if mapping.len() != x.rank() {
        return Err(precondition(format!(
            "split dims mapping {mapping:?} does not match tensor shape {:?}",
            x.dims()
        )));
    }
    let mut spec = to_partition_spec(mapping, names)?;
    if let Some(transpose) = crate::context::AmbientContext::top()
        .and_then(|ctx| ctx.params().mesh_axes_transpose.clone())
    {
        spec = PartitionSpec(
            spec.0
                .into_iter()
                .map(|dim| transpose_dim(dim, &transpose))
                .collect(),
        );
    }
    for &dim in unconstrained_dims.unwrap_or_default() {
        let slot = spec.0.get_mut(dim).ok_or_else(|| {
            precondition(format!("unconstrained dim {dim} out of range for rank {}", x.rank()))
        })?;
        *slot = PartitionDim::Unconstrained;
    }
    Ok(Some(spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn names() -> Vec<String> {
        vec!["replica".into(), "data".into(), "mdl".into()]
    }

    #[test]
    fn indices_resolve_to_names() -> Result<()> {
        let mapping = vec![
            MeshAxis::Index(1),
            MeshAxis::Unsharded,
            MeshAxis::Group(vec![MeshAxis::Index(0), "mdl".into()]),
        ];
        let spec = to_partition_spec(&mapping, &names())?;
        assert_eq!(
            spec.0,
            vec![
                PartitionDim::Axis("data".into()),
                PartitionDim::Replicated,
                PartitionDim::Axes(vec![
                    PartitionDim::Axis("replica".into()),
                    PartitionDim::Axis("mdl".into())
                ]),
            ]
        );
        assert_eq!(spec.to_string(), "PartitionSpec('data', None, ('replica', 'mdl'))");
        assert!(to_partition_spec(&[MeshAxis::Index(7)], &names()).is_err());
        Ok(())
    }

    #[test]
    fn negative_indices_are_replicated() -> Result<()> {
        let names = vec!["replica".to_owned(), "data".to_owned()];
        let spec = to_partition_spec(&[MeshAxis::Index(-1), MeshAxis::Index(1)], &names)?;
        assert_eq!(
            spec.0,
            vec![PartitionDim::Replicated, PartitionDim::Axis("data".into())]
        );
        Ok(())
    }

    #[test]
    fn unknown_axis_names_are_rejected() {
        let bogus = [MeshAxis::Name("bogus".into())];
        assert!(to_partition_spec(&bogus, &names()).is_err());
        let nested = [MeshAxis::Group(vec![MeshAxis::Index(0), "bogus".into()])];
        assert!(to_partition_spec(&nested, &names()).is_err());
    }

    #[test]
    fn var_specs_include_the_repeat_prefix() -> Result<()> {
        let mut hparams = WeightHParams::new(vec![4, 8]);
        hparams.tensor_split_dims_mapping = Some(vec![MeshAxis::Unsharded, "mdl".into()]);
        hparams.repeat_prefix = Some(vec![3]);
        let mut tree = Nested::new();
        tree.insert_path(&["layer", "w"], hparams.clone());

        let specs = var_partition_specs(&tree, &[1, 2, 4], &names())?;
        let spec = specs
            .leaf_at(&["layer", "w"])
            .map(|s| s.to_string());
        assert_eq!(spec.as_deref(), Some("PartitionSpec(None, None, 'mdl')"));

        hparams.tensor_split_dims_mapping = Some(vec!["mdl".into()]);
        let mut tree = Nested::new();
        tree.insert_path(&["layer", "w"], hparams);
        assert!(var_partition_specs(&tree, &[1, 2, 4], &names()).is_err());
        Ok(())
    }

    #[test]
    fn mesh_shape_multiplies_dcn() -> Result<()> {
        let names = names();
        let names = Some(names.as_slice());
        let ici: &[usize] = &[1, 2, 4];
        assert_eq!(effective_mesh_shape(None, None, None)?, None);
        assert_eq!(effective_mesh_shape(Some(ici), None, names)?, Some(vec![1, 2, 4]));
        assert_eq!(
            effective_mesh_shape(Some(ici), Some(&[2, 1, 1][..]), names)?,
            Some(vec![2, 2, 4])
        );
        assert!(effective_mesh_shape(Some(&ici[..2]), None, names).is_err());
        assert!(effective_mesh_shape(Some(ici), Some(&[2][..]), names).is_err());
        Ok(())
    }

    #[test]
    fn maybe_shard_marks_unconstrained_dims() -> Result<()> {
        let x = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        assert_eq!(maybe_shard(&x, None, None, None)?, None);

        let mapping = vec![MeshAxis::Index(1), MeshAxis::Index(2)];
        let names = names();
        let spec = maybe_shard(&x, Some(mapping.as_slice()), Some(names.as_slice()), Some(&[0][..]))?;
        assert_eq!(
            spec.map(|s| s.0),
            Some(vec![PartitionDim::Unconstrained, PartitionDim::Axis("mdl".into())])
        );
        assert!(maybe_shard(&x, Some(&mapping[..1]), Some(names.as_slice()), None).is_err());
        Ok(())
    }

    #[test]
    fn maybe_shard_without_a_mesh_is_a_no_op() -> Result<()> {
        let x = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let mapping = [MeshAxis::Index(0), MeshAxis::Unsharded];
        assert_eq!(maybe_shard(&x, Some(&mapping[..]), None, None)?, None);
        Ok(())
    }

    #[test]
    fn mappings_convert_from_values() {
        let value = Value::List(vec![Value::None, Value::Int(2), Value::from(vec!["data"])]);
        assert_eq!(
            Vec::<MeshAxis>::from_value(&value),
            Some(vec![
                MeshAxis::Unsharded,
                MeshAxis::Index(2),
                MeshAxis::Group(vec![MeshAxis::Name("data".into())]),
            ])
        );
        assert_eq!(mapping_to_value(&[MeshAxis::Index(2)]), Value::List(vec![Value::Int(2)]));
    }
}
