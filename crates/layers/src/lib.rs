//! Parameter-managed neural network layers.
//!
//! Layers are described by [`blueprint::Config`] trees, built into
//! [`base::Layer`] objects, and bound to a variable store by
//! [`base::Layer::init`] or [`base::Layer::apply`]. Setup runs lazily on
//! first use and declares the layer's variables and children; base
//! hyper-parameters (dtypes, mesh layout, default initializer) flow from
//! parent to child unless the child overrides them.

/// Logs through `log` unless a [`QuietLogs`] guard is alive on this thread.
/// Errors are always logged directly.
macro_rules! log_at {
    ($level:ident, $($arg:tt)+) => {
        if !$crate::logs_quieted() {
            ::log::$level!($($arg)+);
        }
    };
}

pub mod base;
pub mod boxed;
pub mod checks;
pub mod context;
pub mod dtypes;
pub mod init;
pub mod linear;
pub mod mlp;
pub mod nested;
pub mod quantization;
pub mod sharding;
pub mod summary;
pub mod variables;
pub mod weights;

use std::cell::Cell;

use thiserror::Error;

pub use base::{Layer, LayerBehavior, LayerDef, LayerRef};
pub use context::{AmbientContext, ContextParams};
pub use nested::Nested;
pub use variables::{Slot, Variables};
pub use weights::{WeightHParams, WeightInit};

/// Errors raised while configuring, initialising or running layers.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A configuration value is malformed or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An internal invariant or call-order requirement was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The requested initialization method is not known.
    #[error("unsupported init method {0:?}")]
    UnsupportedInit(String),

    /// The initializer cannot handle a tensor of this rank.
    #[error("{method} does not support rank {rank} tensors")]
    UnsupportedRank { method: String, rank: usize },

    /// An operation needs an ambient context but none is active.
    #[error("no ambient context is active")]
    NoContext,

    #[error(transparent)]
    Blueprint(#[from] blueprint::BlueprintError),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, LayerError>;

pub(crate) fn precondition(message: impl Into<String>) -> LayerError {
    LayerError::Precondition(message.into())
}

thread_local! {
    static QUIET_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Silences this crate's non-error logging on the current thread while held.
/// Other threads keep logging at their configured level.
pub(crate) struct QuietLogs(());

impl QuietLogs {
    pub(crate) fn new() -> Self {
        QUIET_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }
}

impl Drop for QuietLogs {
    fn drop(&mut self) {
        QUIET_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub(crate) fn logs_quieted() -> bool {
    QUIET_DEPTH.with(|depth| depth.get() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::LayerDef;

    #[test]
    fn quiet_logs_nest_and_stay_on_their_thread() {
        assert!(!logs_quieted());
        let outer = QuietLogs::new();
        {
            let _inner = QuietLogs::new();
            assert!(logs_quieted());
        }
        assert!(logs_quieted());
        let elsewhere = std::thread::spawn(logs_quieted).join();
        assert!(matches!(elsewhere, Ok(false)));
        drop(outer);
        assert!(!logs_quieted());
    }

    #[test]
    fn abstract_init_is_quiet_only_while_it_runs() -> Result<()> {
        let config = linear::Bias::config()?.with("dims", 2usize)?;
        let layer = base::build_layer(&config)?;
        let mut quiet_inside = false;
        layer.abstract_init_with_metadata(false, |_| {
            quiet_inside = logs_quieted();
            Ok(())
        })?;
        assert!(quiet_inside);
        assert!(!logs_quieted());
        Ok(())
    }
}
