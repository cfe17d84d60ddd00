//! Declarative layer configuration and parameter-managed layers on candle.
//!
//! `blueprint` holds the configuration trees; `layers` holds the layer base,
//! weight initialization, sharding annotations and the concrete layers.

pub use blueprint;
pub use layers;

pub mod prelude {
    pub use blueprint::{build, instantiate, instantiate_as, Config, Value, DO_NOT_BUILD};
    pub use layers::{
        base::{build_layer, copy_base_hparams, LayerDef},
        context::{scoped, AmbientContext, ContextParams},
        linear::{Bias, Linear},
        mlp::FeedForward,
        quantization::QuantizedLinear,
        summary::SummaryType,
        variables::{AUX_LOSS, DECODE_CACHE, HYPER_PARAMS, NON_TRAINABLE, PARAMS, SUMMARIES},
        Layer, LayerRef, Nested, Variables, WeightHParams, WeightInit,
    };
}
