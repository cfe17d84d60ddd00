//! Summary types and key conventions.
//!
//! Summaries are stored under keys suffixed with their type
//! (`loss_scalar`, `attention_image`, ...), so the type can be recovered
//! from the key alone.

use std::{collections::BTreeMap, fmt};

use candle_core::{DType, Tensor};

use crate::{dtypes::cast_floating, LayerError, Result};

/// Kind of a recorded summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SummaryType {
    Scalar,
    Image,
    Text,
    Audio,
    Video,
    Histogram,
    /// Scalar aggregated across replicas.
    AggregateScalar,
    /// Image aggregated across replicas.
    AggregateImage,
}

impl SummaryType {
    /// Declaration order; key parsing matches suffixes in this order.
    pub const ALL: [SummaryType; 8] = [
        SummaryType::Scalar,
        SummaryType::Image,
        SummaryType::Text,
        SummaryType::Audio,
        SummaryType::Video,
        SummaryType::Histogram,
        SummaryType::AggregateScalar,
        SummaryType::AggregateImage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SummaryType::Scalar => "scalar",
            SummaryType::Image => "image",
            SummaryType::Text => "text",
            SummaryType::Audio => "audio",
            SummaryType::Video => "video",
            SummaryType::Histogram => "histogram",
            SummaryType::AggregateScalar => "aggregate_scalar",
            SummaryType::AggregateImage => "aggregate_image",
        }
    }

    /// Type with any aggregation dropped.
    pub fn base(self) -> SummaryType {
        match self {
            SummaryType::AggregateScalar => SummaryType::Scalar,
            SummaryType::AggregateImage => SummaryType::Image,
            other => other,
        }
    }

    /// Key suffix for this type, using its base type.
    pub fn suffix(self) -> String {
        format!("_{}", self.base().name())
    }
}

impl fmt::Display for SummaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Recovers the summary type from a suffixed key.
pub fn summary_type_from_key(key: &str) -> Result<SummaryType> {
    SummaryType::ALL
        .into_iter()
        .find(|t| key.ends_with(&format!("_{}", t.name())))
        .ok_or_else(|| LayerError::Config(format!("cannot parse summary type from key {key:?}")))
}

/// Removes the type suffix from a summary key.
pub fn trim_summary_type_from_key(key: &str) -> Result<String> {
    let summary_type = summary_type_from_key(key)?;
    let suffix = format!("_{}", summary_type.name());
    Ok(key[..key.len() - suffix.len()].to_owned())
}

/// First free key for `name`: `name_<type>`, then `name1_<type>`, `name2_<type>`, ...
pub fn unique_summary_key(
    name: &str,
    summary_type: SummaryType,
    taken: impl Fn(&str) -> bool,
) -> String {
    let suffix = summary_type.suffix();
    let mut key = format!("{name}{suffix}");
    let mut i = 0;
    while taken(&key) {
        i += 1;
        key = format!("{name}{i}{suffix}");
    }
    key
}

/// Adds the batch dimension image and audio summaries must carry.
///
/// Images are `[batch, height, width, channels]` and audio is
/// `[batch, time, channels]`; a single unbatched example gets a leading
/// batch of one.
pub fn prepare_summary_tensor(tensor: &Tensor, summary_type: SummaryType) -> Result<Tensor> {
    let expected_rank = match summary_type.base() {
        SummaryType::Image => 4,
        SummaryType::Audio => 3,
        _ => return Ok(tensor.clone()),
    };
    let tensor = if tensor.rank() + 1 == expected_rank {
        tensor.unsqueeze(0)?
    } else {
        tensor.clone()
    };
    if tensor.rank() != expected_rank {
        return Err(LayerError::Precondition(format!(
            "{summary_type} summary must have rank {expected_rank}, got shape {:?}",
            tensor.dims()
        )));
    }
    Ok(tensor)
}

/// Summaries recorded outside of any layer, keyed by suffixed name.
#[derive(Clone, Debug, Default)]
pub struct SummaryDict {
    entries: BTreeMap<String, Tensor>,
}

impl SummaryDict {
    /// Records a summary, casting floating tensors to `f32`. Returns the key used.
    pub fn add_summary(
        &mut self,
        name: &str,
        tensor: &Tensor,
        summary_type: SummaryType,
    ) -> Result<String> {
        let key = unique_summary_key(name, summary_type, |k| self.entries.contains_key(k));
        let tensor = prepare_summary_tensor(&cast_floating(tensor, DType::F32)?, summary_type)?;
        self.entries.insert(key.clone(), tensor);
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, Tensor> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
