//! Thread-scoped ambient context.
//!
//! An [`AmbientContext`] carries run-wide settings (eval mode, summary
//! verbosity, mesh-axis renaming), the global summary dictionary and the
//! shared-layer registry. Contexts form a per-thread stack: entering one
//! pushes it and the returned [`ContextGuard`] pops it when dropped, so an
//! early return or a panic unwinding through the scope restores the
//! previous context.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

use blueprint::Config;
use candle_core::Tensor;
use log::error;
use serde::{Deserialize, Serialize};

use crate::{
    base::LayerRef,
    summary::{SummaryDict, SummaryType},
    variables::ScopeId,
    LayerError, Result,
};

/// Settings visible to every layer while a context is active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Whether layers run in evaluation mode; `None` when unspecified.
    pub do_eval: Option<bool>,
    /// Summaries above this verbosity are dropped.
    pub summary_verbosity: i32,
    /// Renames mesh axes when computing sharding constraints.
    pub mesh_axes_transpose: Option<BTreeMap<String, String>>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            do_eval: None,
            summary_verbosity: 3,
            mesh_axes_transpose: None,
        }
    }
}

/// A layer registered under a shared-weight id.
#[derive(Clone)]
pub struct SharedLayerEntry {
    /// The shared layer itself.
    pub layer: LayerRef,
    /// The wrapper that owns it in the variable tree.
    pub wrapper: LayerRef,
    /// Configuration of the first call site, for compatibility checks.
    pub hparams: Config,
}

pub struct AmbientContext {
    params: ContextParams,
    summaries: RefCell<SummaryDict>,
    shared_layers: RefCell<HashMap<(ScopeId, String), SharedLayerEntry>>,
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Rc<AmbientContext>>> = const { RefCell::new(Vec::new()) };
}

/// Pops its context off the thread's stack when dropped.
#[must_use = "the context is exited as soon as the guard is dropped"]
pub struct ContextGuard {
    context: Rc<AmbientContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.last().is_some_and(|top| Rc::ptr_eq(top, &self.context)) {
                stack.pop();
                return;
            }
            // Out-of-order exit: drop only this frame, keep the ones above it.
            error!("context exited while not on top of the stack");
            if let Some(pos) = stack.iter().rposition(|c| Rc::ptr_eq(c, &self.context)) {
                stack.remove(pos);
            }
        });
    }
}

impl AmbientContext {
    /// Creates a context. Without explicit params, inherits the current
    /// top-of-stack params if any, otherwise uses defaults.
    pub fn new_context(params: Option<ContextParams>) -> Rc<Self> {
        let params = params
            .or_else(|| Self::top().map(|ctx| ctx.params.clone()))
            .unwrap_or_default();
        Rc::new(Self {
            params,
            summaries: RefCell::new(SummaryDict::default()),
            shared_layers: RefCell::new(HashMap::new()),
        })
    }

    /// Pushes this context; it stays current until the guard is dropped.
    pub fn enter(self: &Rc<Self>) -> ContextGuard {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        ContextGuard {
            context: self.clone(),
        }
    }

    /// The innermost active context on this thread.
    pub fn top() -> Option<Rc<Self>> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned())
    }

    pub fn has_context() -> bool {
        Self::top().is_some()
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn do_eval(&self) -> Option<bool> {
        self.params.do_eval
    }

    pub fn summary_verbosity(&self) -> i32 {
        self.params.summary_verbosity
    }

    pub fn lookup_shared_layer(&self, root: ScopeId, shared_id: &str) -> Option<SharedLayerEntry> {
        let entry = self
            .shared_layers
            .borrow()
            .get(&(root, shared_id.to_owned()))
            .cloned();
        if entry.is_some() {
            log_at!(info, "reusing shared layer {shared_id:?} under root scope {root}");
        }
        entry
    }

    pub fn set_shared_layer(
        &self,
        root: ScopeId,
        shared_id: &str,
        entry: SharedLayerEntry,
    ) -> Result<()> {
        let key = (root, shared_id.to_owned());
        let mut registry = self.shared_layers.borrow_mut();
        if registry.contains_key(&key) {
            return Err(LayerError::Precondition(format!(
                "shared layer {shared_id:?} is already registered under root scope {root}"
            )));
        }
        log_at!(info, "registering shared layer {shared_id:?} under root scope {root}");
        registry.insert(key, entry);
        Ok(())
    }

    pub fn add_summary(&self, name: &str, tensor: &Tensor, summary_type: SummaryType) -> Result<String> {
        self.summaries.borrow_mut().add_summary(name, tensor, summary_type)
    }

    pub fn summaries(&self) -> BTreeMap<String, Tensor> {
        self.summaries.borrow().entries().clone()
    }

    pub fn clear_summaries(&self) {
        self.summaries.borrow_mut().clear();
    }
}

/// The current context, or [`LayerError::NoContext`].
pub fn current_context() -> Result<Rc<AmbientContext>> {
    AmbientContext::top().ok_or(LayerError::NoContext)
}

/// Runs `f` inside a fresh context.
pub fn scoped<R>(params: Option<ContextParams>, f: impl FnOnce(&Rc<AmbientContext>) -> R) -> R {
    let context = AmbientContext::new_context(params);
    let _guard = context.enter();
    f(&context)
}

/// Records a summary in the current context's global dictionary.
///
/// Dropped without error when `verbosity` exceeds the context's summary
/// verbosity. Returns the key used, if recorded.
pub fn add_global_summary(
    name: &str,
    tensor: &Tensor,
    summary_type: SummaryType,
    verbosity: i32,
) -> Result<Option<String>> {
    let context = current_context()?;
    if verbosity > context.summary_verbosity() {
        return Ok(None);
    }
    context.add_summary(name, tensor, summary_type).map(Some)
}

pub fn all_global_summaries() -> Result<BTreeMap<String, Tensor>> {
    Ok(current_context()?.summaries())
}

pub fn clear_global_summary() -> Result<()> {
    current_context()?.clear_summaries();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn guards_restore_the_previous_context() {
        assert!(!AmbientContext::has_context());
        let outer = AmbientContext::new_context(Some(ContextParams {
            do_eval: Some(true),
            ..ContextParams::default()
        }));
        let _outer = outer.enter();
        {
            let inner = AmbientContext::new_context(None);
            let _inner = inner.enter();
            assert_eq!(AmbientContext::top().and_then(|c| c.do_eval()), Some(true));
            assert!(Rc::ptr_eq(&AmbientContext::top().unwrap(), &inner));
        }
        assert!(Rc::ptr_eq(&AmbientContext::top().unwrap(), &outer));
    }

    #[test]
    fn errors_inside_a_scope_still_pop_it() {
        let result: Result<()> = scoped(None, |_| Err(LayerError::NoContext));
        assert!(result.is_err());
        assert!(!AmbientContext::has_context());

        let unwound = std::panic::catch_unwind(|| scoped(None, |_| panic!("boom")));
        assert!(unwound.is_err());
        assert!(!AmbientContext::has_context());
    }

    #[test]
    fn global_summaries_respect_verbosity() -> Result<()> {
        assert!(matches!(clear_global_summary(), Err(LayerError::NoContext)));
        scoped(None, |_| {
            let x = Tensor::new(2f32, &Device::Cpu)?;
            assert_eq!(
                add_global_summary("x", &x, SummaryType::Scalar, 1)?,
                Some("x_scalar".to_owned())
            );
            assert_eq!(add_global_summary("y", &x, SummaryType::Scalar, 9)?, None);
            assert_eq!(all_global_summaries()?.len(), 1);
            clear_global_summary()?;
            assert!(all_global_summaries()?.is_empty());
            Ok(())
        })
    }

    #[test]
    fn out_of_order_exit_keeps_inner_contexts() {
        let first = AmbientContext::new_context(None);
        let second = AmbientContext::new_context(None);
        let a = first.enter();
        let b = second.enter();
        drop(a);
        assert!(AmbientContext::top().is_some_and(|top| Rc::ptr_eq(&top, &second)));
        drop(b);
        assert!(!AmbientContext::has_context());
    }
}
