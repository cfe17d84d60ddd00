//! Variable collections and the scoped store layers read and write.
//!
//! A [`Store`] holds named collections (`params`, `non_trainable`,
//! `summaries`, ...), each a tree keyed by the scope path of the owning
//! layer. Which collections may be written is fixed when the store is
//! created; writes to other collections are silently skipped by
//! [`Scope::sow`] and rejected by [`Scope::put`].

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use blueprint::Config;
use candle_core::{Device, Tensor};

use crate::{
    boxed::BoxedParam, init::fold_in, nested::Nested, precondition, weights::WeightHParams,
    Result,
};

pub const PARAMS: &str = "params";
pub const AUX_LOSS: &str = "aux_loss";
pub const SUMMARIES: &str = "summaries";
pub const NON_TRAINABLE: &str = "non_trainable";
pub const DECODE_CACHE: &str = "decoder_cache";
pub const PREFIX_DECODE_CACHE: &str = "prefix_decoder_cache";
pub const INTERMEDIATES: &str = "intermediates";
pub const HYPER_PARAMS: &str = "hyper_params";

/// Collections that are mutable by default during initialization.
pub const DEFAULT_INIT_MUTABLE: [&str; 2] = [PARAMS, NON_TRAINABLE];

/// RNG stream used for parameter initialization.
pub const PARAMS_RNG: &str = "params";
/// RNG stream used for stochastic forward passes (dropout and the like).
pub const RANDOM_RNG: &str = "random";

/// An auxiliary loss with its weight; values from repeated calls are summed.
#[derive(Clone, Debug)]
pub struct AuxLoss {
    pub value: Tensor,
    pub weight: Tensor,
}

/// A single stored variable.
#[derive(Clone, Debug)]
pub enum Slot {
    /// A parameter together with its metadata.
    Param(BoxedParam),
    Tensor(Tensor),
    AuxLoss(AuxLoss),
    HParams(Config),
}

impl Slot {
    /// The tensor held by a parameter or plain tensor slot.
    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Slot::Param(param) => Some(param.value()),
            Slot::Tensor(tensor) => Some(tensor),
            Slot::AuxLoss(_) | Slot::HParams(_) => None,
        }
    }

    pub fn meta(&self) -> Option<&WeightHParams> {
        match self {
            Slot::Param(param) => Some(param.meta()),
            _ => None,
        }
    }

    /// Drops parameter metadata, keeping the value.
    pub fn unboxed(&self) -> Slot {
        match self {
            Slot::Param(param) => Slot::Tensor(param.value().clone()),
            other => other.clone(),
        }
    }

    /// Replaces the tensor while keeping any metadata.
    pub fn with_tensor(&self, value: Tensor) -> Slot {
        match self {
            Slot::Param(param) => Slot::Param(param.replace_boxed(value)),
            _ => Slot::Tensor(value),
        }
    }
}

/// Named collections of variable trees.
#[derive(Clone, Debug, Default)]
pub struct Variables {
    collections: BTreeMap<String, Nested<Slot>>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Option<&Nested<Slot>> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn contains_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn get<S: AsRef<str>>(&self, collection: &str, path: &[S]) -> Option<&Slot> {
        self.collections.get(collection)?.leaf_at(path)
    }

    pub fn tensor<S: AsRef<str>>(&self, collection: &str, path: &[S]) -> Option<&Tensor> {
        self.get(collection, path).and_then(Slot::tensor)
    }

    pub fn insert<S: AsRef<str>>(&mut self, collection: &str, path: &[S], slot: Slot) {
        self.collections
            .entry(collection.to_owned())
            .or_default()
            .insert_path(path, slot);
    }

    pub fn insert_collection(&mut self, name: &str, tree: Nested<Slot>) {
        self.collections.insert(name.to_owned(), tree);
    }

    pub fn remove_collection(&mut self, name: &str) -> Option<Nested<Slot>> {
        self.collections.remove(name)
    }

    /// Merges `other` in; its collections replace same-named ones.
    pub fn merge(&mut self, other: Variables) {
        self.collections.extend(other.collections);
    }

    /// Same trees with parameter metadata stripped.
    pub fn unboxed(&self) -> Variables {
        Variables {
            collections: self
                .collections
                .iter()
                .map(|(name, tree)| (name.clone(), tree.map(Slot::unboxed)))
                .collect(),
        }
    }

    /// Metadata of every boxed parameter, per collection.
    pub fn metadata(&self) -> BTreeMap<String, Nested<WeightHParams>> {
        self.collections
            .iter()
            .map(|(name, tree)| (name.clone(), tree.filter_map(|s| s.meta().cloned())))
            .filter(|(_, tree)| !tree.is_empty())
            .collect()
    }

    /// Device of the first stored tensor.
    pub fn device(&self) -> Option<Device> {
        self.collections
            .values()
            .flat_map(Nested::leaves)
            .find_map(|(_, slot)| slot.tensor().map(|t| t.device().clone()))
    }

    fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.collections.retain(|name, _| keep(name));
    }
}

/// Identity of a store, used to key per-tree registries.
pub type ScopeId = usize;

static NEXT_STORE_ID: AtomicUsize = AtomicUsize::new(1);

/// How a store is being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// Creating variables from their initializers.
    Init,
    /// Creating placeholders (zeros) to collect metadata only.
    AbstractInit,
    /// Running with existing variables.
    Apply,
}

/// Backing storage for one `init`/`apply` call.
pub struct Store {
    id: ScopeId,
    mode: StoreMode,
    mutable: BTreeSet<String>,
    seed: Option<u64>,
    device: Device,
    variables: RefCell<Variables>,
    rng_counters: RefCell<HashMap<String, u64>>,
}

impl Store {
    pub fn new(
        variables: Variables,
        mode: StoreMode,
        mutable: &[&str],
        seed: Option<u64>,
        device: Device,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            mutable: mutable.iter().map(|s| (*s).to_owned()).collect(),
            seed,
            device,
            variables: RefCell::new(variables),
            rng_counters: RefCell::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All variables currently held.
    pub fn variables(&self) -> Variables {
        self.variables.borrow().clone()
    }

    /// Only the mutable collections, which is what `init`/`apply` return.
    pub fn mutable_variables(&self) -> Variables {
        let mut vars = self.variables();
        vars.retain(|name| self.mutable.contains(name));
        vars
    }
}

/// A view of a [`Store`] at one path in the layer tree.
#[derive(Clone)]
pub struct Scope {
    store: Rc<Store>,
    path: Vec<String>,
}

impl Scope {
    pub fn root(store: Rc<Store>) -> Self {
        Self {
            store,
            path: Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Scope {
        let mut path = self.path.clone();
        path.push(name.to_owned());
        Scope {
            store: self.store.clone(),
            path,
        }
    }

    /// The scope at the root of this scope's store.
    pub fn root_scope(&self) -> Scope {
        Scope::root(self.store.clone())
    }

    pub fn store(&self) -> &Rc<Store> {
        &self.store
    }

    pub fn root_id(&self) -> ScopeId {
        self.store.id
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Slash-joined path, empty at the root.
    pub fn path_text(&self) -> String {
        self.path.join("/")
    }

    /// Path of a variable called `name` in this scope.
    pub fn full_name(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{name}", self.path_text())
        }
    }

    fn key(&self, name: &str) -> Vec<String> {
        let mut key = self.path.clone();
        key.push(name.to_owned());
        key
    }

    pub fn is_mutable(&self, collection: &str) -> bool {
        self.store.mutable.contains(collection)
    }

    pub fn is_initializing(&self) -> bool {
        matches!(self.store.mode, StoreMode::Init | StoreMode::AbstractInit)
    }

    pub fn is_abstract(&self) -> bool {
        self.store.mode == StoreMode::AbstractInit
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    pub fn has_variable(&self, collection: &str, name: &str) -> bool {
        self.get(collection, name).is_some()
    }

    pub fn get(&self, collection: &str, name: &str) -> Option<Slot> {
        self.store
            .variables
            .borrow()
            .get(collection, &self.key(name))
            .cloned()
    }

    /// Writes a variable; the collection must be mutable.
    pub fn put(&self, collection: &str, name: &str, slot: Slot) -> Result<()> {
        if !self.is_mutable(collection) {
            return Err(precondition(format!(
                "cannot update {} in immutable collection {collection:?}",
                self.full_name(name)
            )));
        }
        self.store
            .variables
            .borrow_mut()
            .insert(collection, &self.key(name), slot);
        Ok(())
    }

    /// Returns the existing variable, or creates it with `init` when the
    /// collection is mutable.
    pub fn get_or_init(
        &self,
        collection: &str,
        name: &str,
        init: impl FnOnce() -> Result<Slot>,
    ) -> Result<Slot> {
        if let Some(existing) = self.get(collection, name) {
            return Ok(existing);
        }
        if !self.is_mutable(collection) {
            return Err(precondition(format!(
                "variable {} not found in immutable collection {collection:?}",
                self.full_name(name)
            )));
        }
        let slot = init()?;
        self.put(collection, name, slot.clone())?;
        Ok(slot)
    }

    /// Accumulates `value` into a mutable collection.
    ///
    /// The first value is stored as-is; later ones are combined with
    /// `reduce(existing, value)`. Returns `false` without evaluating
    /// `reduce` when the collection is immutable.
    pub fn sow(
        &self,
        collection: &str,
        name: &str,
        value: Slot,
        reduce: impl FnOnce(Slot, Slot) -> Result<Slot>,
    ) -> Result<bool> {
        if !self.is_mutable(collection) {
            return Ok(false);
        }
        let next = match self.get(collection, name) {
            Some(existing) => reduce(existing, value)?,
            None => value,
        };
        self.put(collection, name, next)?;
        Ok(true)
    }

    /// Draws a fresh seed from `stream`, distinct per scope and per call.
    pub fn make_rng(&self, stream: &str) -> Result<u64> {
        let seed = self.store.seed.ok_or_else(|| {
            precondition(format!(
                "no seed for rng stream {stream:?} at {}",
                self.full_name("")
            ))
        })?;
        let label = format!("{stream}:{}", self.path_text());
        let mut counters = self.store.rng_counters.borrow_mut();
        let counter = counters.entry(label.clone()).or_insert(0);
        *counter += 1;
        Ok(fold_in(fold_in(seed, &label), &counter.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn store(mode: StoreMode, mutable: &[&str]) -> Rc<Store> {
        Store::new(Variables::new(), mode, mutable, Some(0), Device::Cpu)
    }

    #[test]
    fn immutable_collections_reject_writes() -> Result<()> {
        let scope = Scope::root(store(StoreMode::Apply, &[SUMMARIES])).child("layer");
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        assert!(scope.put(PARAMS, "w", Slot::Tensor(t.clone())).is_err());
        assert!(!scope.sow(AUX_LOSS, "l", Slot::Tensor(t.clone()), |_, v| Ok(v))?);
        assert!(scope.sow(SUMMARIES, "s", Slot::Tensor(t), |_, v| Ok(v))?);
        assert!(scope.has_variable(SUMMARIES, "s"));
        assert_eq!(scope.full_name("s"), "layer/s");
        Ok(())
    }

    #[test]
    fn get_or_init_runs_once() -> Result<()> {
        let scope = Scope::root(store(StoreMode::Init, &DEFAULT_INIT_MUTABLE));
        let mut calls = 0;
        for _ in 0..2 {
            scope.get_or_init(PARAMS, "w", || {
                calls += 1;
                Ok(Slot::Tensor(Tensor::ones(1, DType::F32, &Device::Cpu)?))
            })?;
        }
        assert_eq!(calls, 1);
        Ok(())
    }

    #[test]
    fn rng_streams_differ_per_scope_and_call() -> Result<()> {
        let root = Scope::root(store(StoreMode::Init, &[]));
        let a = root.child("a");
        let first = a.make_rng(PARAMS_RNG)?;
        let second = a.make_rng(PARAMS_RNG)?;
        let other = root.child("b").make_rng(PARAMS_RNG)?;
        assert_ne!(first, second);
        assert_ne!(first, other);

        let unseeded = Scope::root(Store::new(
            Variables::new(),
            StoreMode::Apply,
            &[],
            None,
            Device::Cpu,
        ));
        assert!(unseeded.make_rng(RANDOM_RNG).is_err());
        Ok(())
    }

    #[test]
    fn variables_unbox_and_report_metadata() -> Result<()> {
        let mut vars = Variables::new();
        let value = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        let meta = WeightHParams::new(vec![2, 2]);
        vars.insert(PARAMS, &["dense", "w"], Slot::Param(BoxedParam::new(value, meta.clone())));
        vars.insert(SUMMARIES, &["x_scalar"], Slot::Tensor(Tensor::new(0f32, &Device::Cpu)?));

        let metadata = vars.metadata();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[PARAMS].leaf_at(&["dense", "w"]), Some(&meta));
        assert!(matches!(
            vars.unboxed().get(PARAMS, &["dense", "w"]),
            Some(Slot::Tensor(_))
        ));
        Ok(())
    }
}
