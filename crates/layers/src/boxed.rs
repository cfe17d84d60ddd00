//! Parameters paired with their metadata.
//!
//! During initialization every variable is stored as a [`BoxedParam`] so
//! that its [`WeightHParams`] travel with the value. When a layer is
//! stacked by a repeat transform, the transform calls [`BoxedParam::add_axis`]
//! on the way out and [`BoxedParam::remove_axis`] on the way back in, which
//! keeps the repeat prefix in the metadata in step with the value's shape.
//! Each repeat axis contributes exactly one entry to both prefix mappings,
//! `Unsharded` when the transform gives none.

use candle_core::Tensor;

use crate::{
    precondition,
    sharding::{MeshAxis, SplitDimsMapping},
    weights::WeightHParams,
    Result,
};

/// Parameters of a repeat transform adding or removing a leading axis.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AxisMetadataParams {
    /// Metadata is only rewritten while initializing.
    pub is_initializing: bool,
    /// Size of the added axis.
    pub x_times: usize,
    /// Sharding of the added axis.
    pub sub_weight_split_dims_mapping: Option<SplitDimsMapping>,
    /// Optimizer-state sharding of the added axis.
    pub optimizer_dims_mapping: Option<SplitDimsMapping>,
}

impl AxisMetadataParams {
    fn leading_entries(&self) -> Result<(MeshAxis, MeshAxis)> {
        Ok((
            leading_entry(
                "sub_weight_split_dims_mapping",
                &self.sub_weight_split_dims_mapping,
            )?,
            leading_entry("optimizer_dims_mapping", &self.optimizer_dims_mapping)?,
        ))
    }
}

/// A variable value together with its metadata.
#[derive(Clone, Debug)]
pub struct BoxedParam {
    value: Tensor,
    meta: WeightHParams,
}

impl BoxedParam {
    pub fn new(value: Tensor, meta: WeightHParams) -> Self {
        Self { value, meta }
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn meta(&self) -> &WeightHParams {
        &self.meta
    }

    pub fn unbox(self) -> Tensor {
        self.value
    }

    /// Same metadata, new value.
    pub fn replace_boxed(&self, value: Tensor) -> Self {
        Self {
            value,
            meta: self.meta.clone(),
        }
    }

    fn check_index(index: usize) -> Result<()> {
        if index == 0 {
            Ok(())
        } else {
            Err(precondition(format!(
                "only index 0 is supported for repeat axes; given {index}"
            )))
        }
    }

    /// Records a new leading repeat axis of size `x_times` in the metadata.
    pub fn add_axis(&self, index: usize, params: &AxisMetadataParams) -> Result<Self> {
        Self::check_index(index)?;
        if !params.is_initializing {
            return Ok(self.clone());
        }
        let mut meta = self.meta.clone();
        let mut prefix = meta.repeat_prefix.take().unwrap_or_default();
        prefix.insert(0, params.x_times);
        meta.repeat_prefix = Some(prefix);

        let (sub, opt) = params.leading_entries()?;
        meta.repeat_prefix_split_dims_mapping =
            Some(prepend(sub, meta.repeat_prefix_split_dims_mapping.take()));
        meta.repeat_optimizer_dims_mapping =
            Some(prepend(opt, meta.repeat_optimizer_dims_mapping.take()));
        Ok(Self {
            value: self.value.clone(),
            meta,
        })
    }

    /// Inverse of [`BoxedParam::add_axis`]; the removed leading entries must
    /// match `params`.
    pub fn remove_axis(&self, index: usize, params: &AxisMetadataParams) -> Result<Self> {
        Self::check_index(index)?;
        if !params.is_initializing {
            return Ok(self.clone());
        }
        let mut meta = self.meta.clone();

        let mut prefix = meta.repeat_prefix.take().unwrap_or_default();
        if prefix.first() != Some(&params.x_times) {
            return Err(precondition(format!(
                "repeat prefix {prefix:?} does not start with {}",
                params.x_times
            )));
        }
        prefix.remove(0);
        meta.repeat_prefix = (!prefix.is_empty()).then_some(prefix);

        let (sub, opt) = params.leading_entries()?;
        meta.repeat_prefix_split_dims_mapping = strip_leading(
            "repeat_prefix_split_dims_mapping",
            meta.repeat_prefix_split_dims_mapping.take(),
            &sub,
        )?;
        meta.repeat_optimizer_dims_mapping = strip_leading(
            "repeat_optimizer_dims_mapping",
            meta.repeat_optimizer_dims_mapping.take(),
            &opt,
        )?;
        Ok(Self {
            value: self.value.clone(),
            meta,
        })
    }
}

/// The single mapping entry for a new repeat axis; unsharded when absent.
fn leading_entry(label: &str, mapping: &Option<SplitDimsMapping>) -> Result<MeshAxis> {
    match mapping.as_deref() {
        None => Ok(MeshAxis::Unsharded),
        Some([entry]) => Ok(entry.clone()),
        Some(other) => Err(precondition(format!(
            "{label} must have exactly one entry; given {other:?}"
        ))),
    }
}

fn prepend(entry: MeshAxis, mapping: Option<SplitDimsMapping>) -> SplitDimsMapping {
    let mut mapping = mapping.unwrap_or_default();
    mapping.insert(0, entry);
    mapping
}

fn strip_leading(
    label: &str,
    mapping: Option<SplitDimsMapping>,
    expected: &MeshAxis,
) -> Result<Option<SplitDimsMapping>> {
    let mut mapping = mapping.unwrap_or_default();
    if mapping.first() != Some(expected) {
        return Err(precondition(format!(
            "{label} {mapping:?} does not start with {expected:?}"
        )));
    }
    mapping.remove(0);
    Ok((!mapping.is_empty()).then_some(mapping))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{nested::Nested, sharding::var_partition_specs};
    use candle_core::{DType, Device};

    fn param() -> Result<BoxedParam> {
        let value = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        Ok(BoxedParam::new(value, WeightHParams::new(vec![2, 3])))
    }

    fn stacking(x_times: usize) -> AxisMetadataParams {
        AxisMetadataParams {
            is_initializing: true,
            x_times,
            sub_weight_split_dims_mapping: Some(vec![MeshAxis::Unsharded]),
            optimizer_dims_mapping: None,
        }
    }

    #[test]
    fn add_then_remove_restores_metadata() -> Result<()> {
        let boxed = param()?;
        let stacked = boxed.add_axis(0, &stacking(4))?.add_axis(0, &stacking(2))?;
        assert_eq!(stacked.meta().repeat_prefix, Some(vec![2, 4]));
        assert_eq!(stacked.meta().full_shape(), vec![2, 4, 2, 3]);

        let restored = stacked
            .remove_axis(0, &stacking(2))?
            .remove_axis(0, &stacking(4))?;
        assert_eq!(restored.meta(), boxed.meta());
        Ok(())
    }

    #[test]
    fn only_leading_axis_and_initializing_calls_change_metadata() -> Result<()> {
        let boxed = param()?;
        assert!(boxed.add_axis(1, &stacking(2)).is_err());

        let applying = AxisMetadataParams {
            is_initializing: false,
            ..stacking(2)
        };
        assert_eq!(boxed.add_axis(0, &applying)?.meta(), boxed.meta());
        Ok(())
    }

    #[test]
    fn mismatched_removal_is_rejected() -> Result<()> {
        let stacked = param()?.add_axis(0, &stacking(4))?;
        assert!(stacked.remove_axis(0, &stacking(3)).is_err());
        Ok(())
    }

    #[test]
    fn unmapped_axes_stack_as_unsharded() -> Result<()> {
        let unmapped = AxisMetadataParams {
            sub_weight_split_dims_mapping: None,
            ..stacking(4)
        };
        let mapped = AxisMetadataParams {
            sub_weight_split_dims_mapping: Some(vec![MeshAxis::Index(0)]),
            ..stacking(2)
        };
        let stacked = param()?.add_axis(0, &unmapped)?.add_axis(0, &mapped)?;
        let meta = stacked.meta();
        assert_eq!(meta.repeat_prefix, Some(vec![2, 4]));
        assert_eq!(
            meta.repeat_prefix_split_dims_mapping,
            Some(vec![MeshAxis::Index(0), MeshAxis::Unsharded])
        );
        assert_eq!(
            meta.repeat_optimizer_dims_mapping,
            Some(vec![MeshAxis::Unsharded, MeshAxis::Unsharded])
        );

        let mut tree = Nested::new();
        tree.insert_path(&["w"], meta.clone());
        let names = vec!["data".to_owned()];
        let specs = var_partition_specs(&tree, &[2], &names)?;
        let spec = specs.leaf_at(&["w"]).map(|s| s.to_string());
        assert_eq!(spec.as_deref(), Some("PartitionSpec('data', None, None, None)"));

        let restored = stacked.remove_axis(0, &mapped)?.remove_axis(0, &unmapped)?;
        assert_eq!(restored.meta(), param()?.meta());
        Ok(())
    }

    #[test]
    fn repeat_axis_mappings_have_one_entry() -> Result<()> {
        let wide = AxisMetadataParams {
            sub_weight_split_dims_mapping: Some(vec![MeshAxis::Unsharded, MeshAxis::Index(0)]),
            ..stacking(2)
        };
        assert!(param()?.add_axis(0, &wide).is_err());
        let stacked = param()?.add_axis(0, &stacking(2))?;
        assert!(stacked.remove_axis(0, &wide).is_err());
        Ok(())
    }
}
