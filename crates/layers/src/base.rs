//! The layer base: configuration, lazy setup and variable management.
//!
//! A concrete layer is a type implementing [`LayerDef`] (its fields and how
//! to construct it from built arguments) and [`LayerBehavior`] (its setup
//! and optional quantization overrides). [`LayerDef::config`] returns a
//! [`Config`] carrying the shared base fields plus the layer's own; building
//! it yields a [`Layer`] that owns the behavior.
//!
//! A layer does nothing until bound to a variable [`Scope`] by
//! [`Layer::init`] / [`Layer::apply`]. On first use after binding it runs
//! setup exactly once, which is where variables are declared with
//! [`Layer::create_variable`] and children with [`Layer::create_child`].
//! Children inherit the parent's dtype, forward dtype, regularization flag,
//! mesh layout and default initializer unless their config overrides them.

use std::{
    any::Any,
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fmt,
    rc::Rc,
};

use blueprint::{
    compatible, instantiate_as, template_field, Arguments, BoxError, Config, Field, FromValue,
    Object, Target, Value, DO_NOT_BUILD,
};
use candle_core::{DType, Device, Tensor};

use crate::{
    boxed::BoxedParam,
    context::{current_context, scoped, AmbientContext, ContextParams, SharedLayerEntry},
    dtypes::{cast_floating, dtype_name, parse_dtype},
    init::init_var,
    nested::Nested,
    precondition,
    sharding::{
        effective_mesh_shape, maybe_shard, weight_hparams_to_pspec, MeshAxis, PartitionSpec,
        SplitDimsMapping,
    },
    summary::{prepare_summary_tensor, unique_summary_key, SummaryType},
    variables::{
        AuxLoss, Scope, Slot, Store, StoreMode, Variables, AUX_LOSS, DECODE_CACHE,
        DEFAULT_INIT_MUTABLE, HYPER_PARAMS, NON_TRAINABLE, PARAMS, PARAMS_RNG, RANDOM_RNG,
        SUMMARIES,
    },
    weights::{collection, WeightHParams, WeightInit},
    LayerError, QuietLogs, Result,
};

/// Marker carried by every layer target.
pub const LAYER_MARKER: &str = "layer";

/// Suffix of the scale variable created by [`Layer::create_quantized_variable`].
pub const QUANTIZED_SCALE_SUFFIX: &str = "_quantized_scale";
/// Suffix of the zero-point variable created by [`Layer::create_quantized_variable`].
pub const QUANTIZED_ZP_SUFFIX: &str = "_quantized_zp";

pub type LayerRef = Rc<Layer>;

/// Per-layer hooks. Every method has a default.
pub trait LayerBehavior: Any {
    /// Declares variables and children. Runs once per binding.
    fn setup(&mut self, layer: &Layer) -> Result<()> {
        let _ = layer;
        Ok(())
    }

    /// Quantized weights of this layer and its children, keyed by
    /// collection then name. Overrides must handle children themselves.
    fn quantize_weight(&self, layer: &Layer) -> Result<Nested<Tensor>> {
        layer.default_quantize_weight()
    }

    /// Partition specs matching [`LayerBehavior::quantize_weight`].
    fn quantized_partition_specs(&self, layer: &Layer) -> Result<Nested<PartitionSpec>> {
        layer.default_quantized_partition_specs()
    }

    fn as_any(&self) -> &dyn Any;
}

/// A layer type that can be described by a [`Config`].
pub trait LayerDef: LayerBehavior + Sized {
    /// Target name, also used as the layer's default display name.
    const NAME: &'static str;

    /// Fields on top of the base fields. A field named like a base field
    /// replaces it (used to narrow the sharding templates).
    fn fields() -> Result<Vec<Field>> {
        Ok(Vec::new())
    }

    fn from_args(args: &Arguments) -> Result<Self>;

    fn target() -> Result<Target> {
        layer_target::<Self>()
    }

    fn config() -> Result<Config> {
        Ok(Config::new(Self::target()?))
    }
}

/// Target for sharding annotations: each field holds an optional
/// split-dims mapping.
pub fn sharding_target(name: &str, fields: &[&str]) -> Result<Target> {
    Ok(Target::builder(name)
        .fields(fields.iter().map(|f| Field::with_default(*f, Value::None)))
        .build(|args: &Arguments| -> std::result::Result<Value, BoxError> {
            Ok(Value::Map(
                args.iter().map(|(k, v)| (k.to_owned(), v.clone())).collect(),
            ))
        })?)
}

fn base_fields() -> Result<Vec<Field>> {
    Ok(vec![
        Field::with_default("name", Value::None),
        Field::with_default("dtype", dtype_name(DType::F32)),
        Field::with_default("fprop_dtype", Value::None),
        Field::with_factory("params_init", "default_param_init", || {
            WeightInit::default().to_value()
        }),
        Field::with_default("skip_lp_regularization", Value::None),
        Field::with_default("ici_mesh_shape", Value::None),
        Field::with_default("dcn_mesh_shape", Value::None),
        Field::with_default("contiguous_submeshes", false),
        Field::with_default("mesh_axis_names", Value::None),
        Field::with_default("shared_weight_layer_id", Value::None),
        template_field(
            "weight_split_dims_mapping",
            Some(sharding_target("WeightSharding", &["wt"])?),
        ),
        template_field(
            "activation_split_dims_mapping",
            Some(sharding_target("ActivationSharding", &["out"])?),
        ),
    ])
}

/// Target for layer type `L`: base fields, then `L`'s fields.
pub fn layer_target<L: LayerDef>() -> Result<Target> {
    Ok(Target::builder(L::NAME)
        .fields(base_fields()?)
        .fields(L::fields()?)
        .marker(LAYER_MARKER)
        .build(|args: &Arguments| -> std::result::Result<Value, BoxError> {
            Layer::from_def::<L>(args)
                .map(|layer| Value::Object(Object::new(layer)))
                .map_err(into_box_error)
        })?)
}

// Configuration errors go back unwrapped so the builder can recognize them.
fn into_box_error(err: LayerError) -> BoxError {
    match err {
        LayerError::Blueprint(inner) => Box::new(inner),
        other => Box::new(other),
    }
}

pub fn is_layer_config(config: &Config) -> bool {
    config.target().has_marker(LAYER_MARKER)
}

/// Whether a field value is a sub-layer template (or a collection of them).
pub fn is_sublayer_template(value: &Value) -> bool {
    match value {
        Value::Config(config) => is_layer_config(config),
        Value::List(items) => {
            items.iter().any(is_sublayer_template)
                && items.iter().all(|v| v.is_none() || is_sublayer_template(v))
        }
        Value::Map(entries) => {
            !entries.is_empty() && entries.values().all(is_sublayer_template)
        }
        _ => false,
    }
}

/// Builds a layer config into an unbound layer.
pub fn build_layer(config: &Config) -> Result<LayerRef> {
    Ok(instantiate_as::<Layer>(config)?)
}

trait FieldSource {
    fn read<T: FromValue>(&self, name: &str) -> Result<T>;
}

impl FieldSource for Arguments {
    fn read<T: FromValue>(&self, name: &str) -> Result<T> {
        Ok(self.get(name)?)
    }
}

impl FieldSource for Config {
    fn read<T: FromValue>(&self, name: &str) -> Result<T> {
        Ok(self.get_as(name)?)
    }
}

/// The base hyper-parameters every layer carries.
#[derive(Clone, Debug, PartialEq)]
pub struct BaseParams {
    pub name: Option<String>,
    pub dtype: DType,
    /// `None` means "same as `dtype`".
    pub fprop_dtype: Option<DType>,
    pub params_init: WeightInit,
    pub skip_lp_regularization: Option<bool>,
    pub ici_mesh_shape: Option<Vec<usize>>,
    pub dcn_mesh_shape: Option<Vec<usize>>,
    pub contiguous_submeshes: bool,
    pub mesh_axis_names: Option<Vec<String>>,
    pub shared_weight_layer_id: Option<String>,
    pub weight_split_dims_mapping: Option<Config>,
    pub activation_split_dims_mapping: Option<Config>,
}

impl BaseParams {
    fn read(source: &impl FieldSource) -> Result<Self> {
        let dtype = parse_dtype(&source.read::<String>("dtype")?)?;
        let fprop_dtype = source
            .read::<Option<String>>("fprop_dtype")?
            .map(|name| parse_dtype(&name))
            .transpose()?;
        Ok(Self {
            name: source.read("name")?,
            dtype,
            fprop_dtype,
            params_init: source.read("params_init")?,
            skip_lp_regularization: source.read("skip_lp_regularization")?,
            ici_mesh_shape: source.read("ici_mesh_shape")?,
            dcn_mesh_shape: source.read("dcn_mesh_shape")?,
            contiguous_submeshes: source.read("contiguous_submeshes")?,
            mesh_axis_names: source.read("mesh_axis_names")?,
            shared_weight_layer_id: source.read("shared_weight_layer_id")?,
            weight_split_dims_mapping: source.read("weight_split_dims_mapping")?,
            activation_split_dims_mapping: source.read("activation_split_dims_mapping")?,
        })
    }

    /// Reads the base fields of a layer config.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::read(config)
    }

    /// The dtype forward passes compute in.
    pub fn resolved_fprop_dtype(&self) -> DType {
        self.fprop_dtype.unwrap_or(self.dtype)
    }

    pub fn mesh_shape(&self) -> Result<Option<Vec<usize>>> {
        effective_mesh_shape(
            self.ici_mesh_shape.as_deref(),
            self.dcn_mesh_shape.as_deref(),
            self.mesh_axis_names.as_deref(),
        )
    }
}

fn copy_base_fields(source: &BaseParams, target: &mut Config) -> Result<()> {
    let current = BaseParams::from_config(target)?;
    if current.dtype == DType::F32 {
        target.set("dtype", dtype_name(source.dtype))?;
    }
    if current.fprop_dtype.is_none() {
        target.set("fprop_dtype", source.fprop_dtype.map(dtype_name))?;
    }
    if current.skip_lp_regularization.is_none() {
        target.set("skip_lp_regularization", source.skip_lp_regularization)?;
    }
    if current.ici_mesh_shape.is_none() {
        target.set("ici_mesh_shape", source.ici_mesh_shape.clone())?;
    }
    if current.dcn_mesh_shape.is_none() {
        target.set("dcn_mesh_shape", source.dcn_mesh_shape.clone())?;
    }
    if current.mesh_axis_names.is_none() {
        target.set("mesh_axis_names", source.mesh_axis_names.clone())?;
    }
    if current.params_init.is_default() {
        target.set("params_init", source.params_init.to_value())?;
    }
    Ok(())
}

fn copy_down(source: &BaseParams, value: &mut Value) -> Result<()> {
    match value {
        Value::Config(config) => {
            let inherited;
            let source = if is_layer_config(config) {
                copy_base_fields(source, config)?;
                inherited = BaseParams::from_config(config)?;
                &inherited
            } else {
                source
            };
            for name in config.argument_names() {
                if config.has_tag(&name, DO_NOT_BUILD) {
                    continue;
                }
                if let Some(arg) = config.explicit_mut(&name) {
                    copy_down(source, arg)?;
                }
            }
        }
        Value::List(items) => {
            for item in items {
                copy_down(source, item)?;
            }
        }
        Value::Map(entries) => {
            for item in entries.values_mut() {
                copy_down(source, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Copies inheritable base fields from `source` into `target` and, from
/// there, down through nested layer configs (skipping templates).
///
/// A field is overwritten only while it still holds its "unset" value:
/// `dtype` equal to f32, a `None` for the optional fields, or the default
/// Xavier `params_init`.
pub fn copy_base_hparams(source: &BaseParams, target: &mut Config) -> Result<()> {
    if !is_layer_config(target) {
        return Err(LayerError::Config(format!(
            "copy_base_hparams target is not a layer config: {}",
            target.target().name()
        )));
    }
    let mut value = Value::Config(target.clone());
    copy_down(source, &mut value)?;
    if let Value::Config(updated) = value {
        *target = updated;
    }
    Ok(())
}

/// Lifecycle of a layer's setup for its current binding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetupPhase {
    #[default]
    Pending,
    Running,
    Done,
}

#[derive(Default)]
struct LayerState {
    scope: Option<Scope>,
    phase: SetupPhase,
    weight_hparams: BTreeMap<String, WeightHParams>,
    children: BTreeMap<String, LayerRef>,
    child_groups: BTreeMap<String, Vec<LayerRef>>,
}

/// Summary payload: a tensor, or a closure evaluated only if recorded.
pub enum SummaryValue<'a> {
    Tensor(Tensor),
    Deferred(Box<dyn FnOnce() -> Result<Tensor> + 'a>),
}

impl SummaryValue<'_> {
    fn evaluate(self) -> Result<Tensor> {
        match self {
            SummaryValue::Tensor(tensor) => Ok(tensor),
            SummaryValue::Deferred(producer) => producer(),
        }
    }
}

impl From<Tensor> for SummaryValue<'_> {
    fn from(tensor: Tensor) -> Self {
        SummaryValue::Tensor(tensor)
    }
}

impl From<&Tensor> for SummaryValue<'_> {
    fn from(tensor: &Tensor) -> Self {
        SummaryValue::Tensor(tensor.clone())
    }
}

/// A built layer.
pub struct Layer {
    base: BaseParams,
    hparams: Config,
    field_names: BTreeSet<String>,
    behavior: RefCell<Box<dyn LayerBehavior>>,
    state: RefCell<LayerState>,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("type", &self.type_name())
            .field("name", &self.name())
            .field("phase", &self.state.borrow().phase)
            .finish()
    }
}

impl Layer {
    fn from_def<L: LayerDef>(args: &Arguments) -> Result<Self> {
        let base = BaseParams::read(args)?;
        base.mesh_shape()?;
        let behavior = L::from_args(args)?;
        Ok(Self {
            base,
            hparams: args.config().clone(),
            field_names: args.config().field_names().into_iter().collect(),
            behavior: RefCell::new(Box::new(behavior)),
            state: RefCell::new(LayerState::default()),
        })
    }

    pub fn base(&self) -> &BaseParams {
        &self.base
    }

    /// The configuration this layer was built from.
    pub fn hparams(&self) -> &Config {
        &self.hparams
    }

    pub fn type_name(&self) -> &str {
        self.hparams.target().name()
    }

    /// The configured name, or the type name for unnamed (root) layers.
    pub fn name(&self) -> &str {
        self.base.name.as_deref().unwrap_or_else(|| self.type_name())
    }

    pub fn dtype(&self) -> DType {
        self.base.dtype
    }

    pub fn fprop_dtype(&self) -> DType {
        self.base.resolved_fprop_dtype()
    }

    pub fn mesh_axis_names(&self) -> Option<&[String]> {
        self.base.mesh_axis_names.as_deref()
    }

    pub fn mesh_shape(&self) -> Result<Option<Vec<usize>>> {
        self.base.mesh_shape()
    }

    /// Base params as children inherit them: the forward dtype is resolved.
    pub fn inherited_params(&self) -> BaseParams {
        BaseParams {
            fprop_dtype: Some(self.fprop_dtype()),
            ..self.base.clone()
        }
    }

    pub fn setup_phase(&self) -> SetupPhase {
        self.state.borrow().phase
    }

    pub fn scope(&self) -> Result<Scope> {
        self.state.borrow().scope.clone().ok_or_else(|| {
            precondition(format!("layer {} is not bound to a variable scope", self.name()))
        })
    }

    /// Scope path of this layer, for messages.
    pub fn path_name(&self) -> String {
        match &self.state.borrow().scope {
            Some(scope) if !scope.path().is_empty() => scope.path_text(),
            _ => self.name().to_owned(),
        }
    }

    fn bind(&self, scope: Scope) {
        *self.state.borrow_mut() = LayerState {
            scope: Some(scope),
            ..LayerState::default()
        };
    }

    /// Runs setup if it has not run for the current binding.
    ///
    /// Calls made while setup is already running (from inside setup)
    /// return immediately. A failed setup can be retried.
    pub fn try_setup(&self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            match state.phase {
                SetupPhase::Done | SetupPhase::Running => return Ok(()),
                SetupPhase::Pending if state.scope.is_none() => {
                    return Err(precondition(format!(
                        "layer {} must be bound before setup",
                        self.name()
                    )));
                }
                SetupPhase::Pending => state.phase = SetupPhase::Running,
            }
        }
        let result = match self.behavior.try_borrow_mut() {
            Ok(mut behavior) => behavior.setup(self),
            Err(_) => Err(precondition(format!(
                "layer {} re-entered setup while in use",
                self.name()
            ))),
        };
        let mut state = self.state.borrow_mut();
        match result {
            Ok(()) => {
                state.phase = SetupPhase::Done;
                Ok(())
            }
            Err(err) => {
                state.phase = SetupPhase::Pending;
                state.weight_hparams.clear();
                state.children.clear();
                state.child_groups.clear();
                Err(err)
            }
        }
    }

    /// Sets up this layer and every descendant.
    pub fn setup_tree(&self) -> Result<()> {
        self.try_setup()?;
        for (_, child) in self.children() {
            child.setup_tree()?;
        }
        Ok(())
    }

    /// Runs `f` with this layer's behavior as concrete type `B`.
    pub fn with_behavior<B: LayerBehavior, R>(
        &self,
        f: impl FnOnce(&B, &Layer) -> Result<R>,
    ) -> Result<R> {
        self.try_setup()?;
        let behavior = self.behavior.try_borrow().map_err(|_| {
            precondition(format!("layer {} is still running setup", self.name()))
        })?;
        let typed = behavior.as_any().downcast_ref::<B>().ok_or_else(|| {
            precondition(format!(
                "layer {} is a {}, not a {}",
                self.name(),
                self.type_name(),
                std::any::type_name::<B>()
            ))
        })?;
        f(typed, self)
    }

    fn check_name_free(&self, name: &str, what: &str) -> Result<()> {
        if self.field_names.contains(name) {
            return Err(LayerError::Config(format!(
                "{what} {name:?} of layer {} collides with a field of the same name",
                self.name()
            )));
        }
        let state = self.state.borrow();
        if state.children.contains_key(name)
            || state.child_groups.contains_key(name)
            || state.weight_hparams.contains_key(name)
        {
            return Err(LayerError::Config(format!(
                "{what} {name:?} is already defined on layer {}",
                self.name()
            )));
        }
        Ok(())
    }

    // --- variables -------------------------------------------------------

    /// Declares a variable and returns its current value.
    ///
    /// Missing `init`/`dtype` are taken from the layer. Trainable variables
    /// live in `params` and are read back through [`Layer::theta`];
    /// non-trainable ones live in `non_trainable` and are read through
    /// [`Layer::get_var`].
    pub fn create_variable(
        &self,
        name: &str,
        hparams: &WeightHParams,
        trainable: bool,
    ) -> Result<Tensor> {
        self.check_name_free(name, "variable")?;
        let scope = self.scope()?;
        let mut hp = hparams.clone();
        if hp.init.is_none() {
            hp.init = Some(self.base.params_init.clone());
        }
        if hp.dtype.is_none() {
            hp.dtype = Some(self.base.dtype);
        }
        if let Some(mesh_shape) = self.mesh_shape()? {
            let sharded_dims = hp.shape.iter().filter(|&&d| d > 1).count();
            if sharded_dims > 1 && hp.tensor_split_dims_mapping.is_none() {
                log_at!(
                    warn,
                    "tensor_split_dims_mapping missing for {}: shape={:?}",
                    scope.full_name(name),
                    hp.shape
                );
            }
            if hp.mesh_shape.is_none() {
                hp.mesh_shape = Some(mesh_shape);
            }
        }
        if self.base.skip_lp_regularization == Some(true) {
            hp.collections
                .insert(collection::SKIP_LP_REGULARIZATION.to_owned());
        }
        if !trainable {
            hp.collections.insert(collection::NON_TRAINABLE.to_owned());
        }
        let hp = hp.normalized()?;

        self.state
            .borrow_mut()
            .weight_hparams
            .insert(name.to_owned(), hp.clone());

        let target = if trainable { PARAMS } else { NON_TRAINABLE };
        let full_name = scope.full_name(name);
        scope.get_or_init(target, name, || {
            let seed = scope.make_rng(PARAMS_RNG)?;
            let value = if scope.is_abstract() {
                let dtype = hp.dtype.unwrap_or(DType::F32);
                Tensor::zeros(hp.shape.as_slice(), dtype, scope.device())?
            } else {
                init_var(&hp, seed, &full_name, scope.device())?
            };
            Ok(Slot::Param(BoxedParam::new(value, hp.clone())))
        })?;

        if trainable {
            self.theta(name)
        } else {
            self.get_var(name)
        }
    }

    /// Metadata of a variable declared by this layer.
    pub fn weight_hparams(&self, name: &str) -> Option<WeightHParams> {
        self.state.borrow().weight_hparams.get(name).cloned()
    }

    /// Names of the variables declared by this layer.
    pub fn variable_names(&self) -> Vec<String> {
        self.state.borrow().weight_hparams.keys().cloned().collect()
    }

    /// A trainable variable, cast to the forward dtype.
    ///
    /// Floating values are cast to `fprop_dtype`, except that variables
    /// tagged `disallow_bfloat16_conversion` keep their dtype when the
    /// forward dtype is bf16. Integer values are never cast.
    pub fn theta(&self, name: &str) -> Result<Tensor> {
        self.try_setup()?;
        let scope = self.scope()?;
        let value = scope
            .get(PARAMS, name)
            .and_then(|slot| slot.tensor().cloned())
            .ok_or_else(|| {
                precondition(format!(
                    "layer {} has no theta.{name} defined",
                    self.path_name()
                ))
            })?;
        let fprop_dtype = self.fprop_dtype();
        let keep = fprop_dtype == DType::BF16
            && self
                .weight_hparams(name)
                .is_some_and(|hp| hp.disallows_bfloat16_conversion());
        if keep {
            Ok(value)
        } else {
            cast_floating(&value, fprop_dtype)
        }
    }

    pub fn has_theta(&self, name: &str) -> bool {
        self.scope()
            .map(|scope| scope.has_variable(PARAMS, name))
            .unwrap_or(false)
    }

    /// A non-trainable variable, uncast.
    pub fn get_var(&self, name: &str) -> Result<Tensor> {
        self.try_setup()?;
        self.scope()?
            .get(NON_TRAINABLE, name)
            .and_then(|slot| slot.tensor().cloned())
            .ok_or_else(|| {
                precondition(format!(
                    "layer {} has no non-trainable variable {name}",
                    self.path_name()
                ))
            })
    }

    /// Overwrites a non-trainable variable.
    ///
    /// Takes effect only when `non_trainable` is mutable and the store is
    /// not initializing; otherwise it is a no-op.
    pub fn update_var(&self, name: &str, value: &Tensor) -> Result<()> {
        self.try_setup()?;
        let scope = self.scope()?;
        let old = scope.get(NON_TRAINABLE, name).ok_or_else(|| {
            precondition(format!(
                "layer {} has no non-trainable variable {name}",
                self.path_name()
            ))
        })?;
        if !scope.is_mutable(NON_TRAINABLE) || scope.is_initializing() {
            return Ok(());
        }
        if let Some(current) = old.tensor() {
            if current.dims() != value.dims() {
                return Err(precondition(format!(
                    "cannot update {} of shape {:?} with shape {:?}",
                    scope.full_name(name),
                    current.dims(),
                    value.dims()
                )));
            }
        }
        scope.put(NON_TRAINABLE, name, old.with_tensor(value.clone()))
    }

    pub fn get_decode_state(&self, name: &str) -> Result<Tensor> {
        self.try_setup()?;
        self.scope()?
            .get(DECODE_CACHE, name)
            .and_then(|slot| slot.tensor().cloned())
            .ok_or_else(|| {
                precondition(format!(
                    "layer {} has no decode state {name}",
                    self.path_name()
                ))
            })
    }

    /// Stores a decode-cache entry when the cache is mutable.
    pub fn update_decode_state(&self, name: &str, value: &Tensor) -> Result<()> {
        let scope = self.scope()?;
        if scope.is_mutable(DECODE_CACHE) {
            scope.put(DECODE_CACHE, name, Slot::Tensor(value.clone()))?;
        }
        Ok(())
    }

    /// Declares an integer weight plus its scale (and zero point when
    /// asymmetric). Only the shape and mesh of `hparams` are used.
    pub fn create_quantized_variable(
        &self,
        name: &str,
        hparams: &WeightHParams,
        scale_shape: &[usize],
        dtype: DType,
        use_symmetric: bool,
    ) -> Result<()> {
        let mut quantized = hparams.clone();
        quantized.dtype = Some(dtype);
        quantized.init = Some(WeightInit::constant(0.0));
        self.create_variable(name, &quantized, true)?;
        self.create_variable(
            &format!("{name}{QUANTIZED_SCALE_SUFFIX}"),
            &WeightHParams::new(scale_shape.to_vec()),
            true,
        )?;
        if !use_symmetric {
            self.create_variable(
                &format!("{name}{QUANTIZED_ZP_SUFFIX}"),
                &WeightHParams::new(scale_shape.to_vec()),
                true,
            )?;
        }
        Ok(())
    }

    /// Weight, scale and (for asymmetric quantization) zero point.
    pub fn get_quantized_weight(
        &self,
        name: &str,
        use_symmetric: bool,
    ) -> Result<(Tensor, Tensor, Option<Tensor>)> {
        let weight = self.theta(name)?;
        let scale = self.theta(&format!("{name}{QUANTIZED_SCALE_SUFFIX}"))?;
        let zero_point = if use_symmetric {
            None
        } else {
            Some(self.theta(&format!("{name}{QUANTIZED_ZP_SUFFIX}"))?)
        };
        Ok((weight, scale, zero_point))
    }

    // --- summaries, losses, randomness ---------------------------------

    /// Records a summary under `name` suffixed with its type.
    ///
    /// Skipped when a context is active and `verbosity` exceeds its
    /// summary verbosity; deferred values are then never evaluated.
    /// Repeated names get `name1_<type>`, `name2_<type>`, ... keys.
    pub fn add_summary<'a>(
        &self,
        name: &str,
        value: impl Into<SummaryValue<'a>>,
        summary_type: SummaryType,
        verbosity: i32,
    ) -> Result<()> {
        if let Some(context) = AmbientContext::top() {
            if verbosity > context.summary_verbosity() {
                return Ok(());
            }
        }
        let tensor = value.into().evaluate()?;
        let scope = self.scope()?;
        let key = unique_summary_key(name, summary_type, |k| scope.has_variable(SUMMARIES, k));
        let tensor = prepare_summary_tensor(&tensor, summary_type)?;
        scope.sow(SUMMARIES, &key, Slot::Tensor(tensor), |_, new| Ok(new))?;
        Ok(())
    }

    /// Adds an auxiliary loss; repeated calls under one name are summed,
    /// values and weights separately. The weight defaults to ones.
    pub fn add_aux_loss(&self, name: &str, value: &Tensor, weight: Option<&Tensor>) -> Result<()> {
        let weight = match weight {
            Some(weight) => weight.clone(),
            None => value.ones_like()?,
        };
        let entry = Slot::AuxLoss(AuxLoss {
            value: value.clone(),
            weight,
        });
        self.scope()?.sow(AUX_LOSS, name, entry, |existing, new| match (existing, new) {
            (Slot::AuxLoss(a), Slot::AuxLoss(b)) => Ok(Slot::AuxLoss(AuxLoss {
                value: a.value.broadcast_add(&b.value)?,
                weight: a.weight.broadcast_add(&b.weight)?,
            })),
            _ => Err(precondition(format!("{name} is not an aux loss entry"))),
        })?;
        Ok(())
    }

    /// A fresh seed from the `random` stream.
    pub fn next_prng_key(&self) -> Result<u64> {
        self.scope()?.make_rng(RANDOM_RNG)
    }

    // --- children ------------------------------------------------------

    /// Instantiates a child layer from a template.
    ///
    /// The template is copied, inherits this layer's base params, and is
    /// named `name`. Templates with a `shared_weight_layer_id` resolve to
    /// the layer registered under that id in the current context (creating
    /// it on first use), and must match its configuration up to name.
    pub fn create_child(&self, name: &str, template: &Config) -> Result<LayerRef> {
        self.check_name_free(name, "child")?;
        let child = self.instantiate_child(name, template)?;
        self.state
            .borrow_mut()
            .children
            .insert(name.to_owned(), child.clone());
        Ok(child)
    }

    /// Instantiates children `name_0`, `name_1`, ... and records them as a group.
    pub fn create_children(&self, name: &str, templates: &[Config]) -> Result<Vec<LayerRef>> {
        self.check_name_free(name, "children")?;
        let mut group = Vec::with_capacity(templates.len());
        for (i, template) in templates.iter().enumerate() {
            group.push(self.create_child(&format!("{name}_{i}"), template)?);
        }
        self.state
            .borrow_mut()
            .child_groups
            .insert(name.to_owned(), group.clone());
        Ok(group)
    }

    fn instantiate_child(&self, name: &str, template: &Config) -> Result<LayerRef> {
        if !is_layer_config(template) {
            return Err(LayerError::Config(format!(
                "child {name:?} of layer {} is not a layer config: {}",
                self.name(),
                template.to_text()
            )));
        }
        let mut config = template.deep_clone();
        copy_base_hparams(&self.inherited_params(), &mut config)?;
        config.set("name", name)?;
        let scope = self.scope()?;
        match config.get_as::<Option<String>>("shared_weight_layer_id")? {
            Some(shared_id) => instantiate_shared(&config, &shared_id, &scope.root_scope()),
            None => {
                let child = build_layer(&config)?;
                child.bind(scope.child(name));
                Ok(child)
            }
        }
    }

    pub fn child(&self, name: &str) -> Option<LayerRef> {
        self.state.borrow().children.get(name).cloned()
    }

    pub fn child_group(&self, name: &str) -> Option<Vec<LayerRef>> {
        self.state.borrow().child_groups.get(name).cloned()
    }

    /// Children in name order.
    pub fn children(&self) -> Vec<(String, LayerRef)> {
        self.state
            .borrow()
            .children
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // --- sharding ------------------------------------------------------

    fn read_sharding(template: Option<&Config>, field: &str) -> Result<Option<SplitDimsMapping>> {
        match template {
            Some(config) => Ok(config.get_as::<Option<Vec<MeshAxis>>>(field)?),
            None => Ok(None),
        }
    }

    /// A weight mapping from the `weight_split_dims_mapping` template.
    pub fn weight_sharding(&self, field: &str) -> Result<Option<SplitDimsMapping>> {
        Self::read_sharding(self.base.weight_split_dims_mapping.as_ref(), field)
    }

    /// An activation mapping from the `activation_split_dims_mapping` template.
    pub fn activation_sharding(&self, field: &str) -> Result<Option<SplitDimsMapping>> {
        Self::read_sharding(self.base.activation_split_dims_mapping.as_ref(), field)
    }

    /// Sharding constraint for `x` under this layer's mesh axis names.
    pub fn maybe_shard(
        &self,
        x: &Tensor,
        split_dims_mapping: Option<&[MeshAxis]>,
        unconstrained_dims: Option<&[usize]>,
    ) -> Result<Option<PartitionSpec>> {
        maybe_shard(x, split_dims_mapping, self.mesh_axis_names(), unconstrained_dims)
    }

    // --- quantization --------------------------------------------------

    pub fn quantize_weight(&self) -> Result<Nested<Tensor>> {
        self.try_setup()?;
        let behavior = self.behavior.try_borrow().map_err(|_| {
            precondition(format!("layer {} is still running setup", self.name()))
        })?;
        behavior.quantize_weight(self)
    }

    pub fn quantized_partition_specs(&self) -> Result<Nested<PartitionSpec>> {
        self.try_setup()?;
        let behavior = self.behavior.try_borrow().map_err(|_| {
            precondition(format!("layer {} is still running setup", self.name()))
        })?;
        behavior.quantized_partition_specs(self)
    }

    /// Results of `from_child` for every child, regrouped as
    /// `collection -> child name -> subtree`.
    pub fn merge_child_results<T>(
        &self,
        from_child: impl Fn(&Layer) -> Result<Nested<T>>,
    ) -> Result<Nested<T>> {
        let mut out = Nested::new();
        for (name, child) in self.children() {
            if let Nested::Map(per_collection) = from_child(&child)? {
                for (collection, subtree) in per_collection {
                    insert_subtree(&mut out, &collection, &name, subtree);
                }
            }
        }
        Ok(out)
    }

    fn collect_quantized<T>(
        &self,
        from_child: impl Fn(&Layer) -> Result<Nested<T>>,
        from_var: impl Fn(&str, &WeightHParams, &Slot) -> Result<T>,
    ) -> Result<Nested<T>> {
        let mut out = self.merge_child_results(from_child)?;
        let scope = self.scope()?;
        let declared: Vec<(String, WeightHParams)> = self
            .state
            .borrow()
            .weight_hparams
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for collection in [PARAMS, NON_TRAINABLE] {
            for (name, hp) in &declared {
                if let Some(slot) = scope.get(collection, name) {
                    out.insert_path(&[collection, name.as_str()], from_var(name, hp, &slot)?);
                }
            }
        }
        Ok(out)
    }

    /// Every declared weight returned as-is, children included.
    pub fn default_quantize_weight(&self) -> Result<Nested<Tensor>> {
        self.collect_quantized(
            |child| child.quantize_weight(),
            |name, _, slot| {
                slot.tensor()
                    .cloned()
                    .ok_or_else(|| precondition(format!("{name} does not hold a tensor")))
            },
        )
    }

    /// Partition spec of every declared weight, children included.
    pub fn default_quantized_partition_specs(&self) -> Result<Nested<PartitionSpec>> {
        let names = self.mesh_axis_names().unwrap_or_default().to_vec();
        self.collect_quantized(
            |child| child.quantized_partition_specs(),
            |_, hp, _| weight_hparams_to_pspec(hp, &names),
        )
    }

    // --- hyper-params --------------------------------------------------

    /// Records this layer's configuration (sub-layer templates cleared) in
    /// `hyper_params`, then recurses into children.
    pub fn post_init_hparams(&self) -> Result<()> {
        self.try_setup()?;
        let mut hparams = self.hparams.clone();
        for name in hparams.field_names() {
            let value = hparams.get(&name)?;
            let holds_layer = value.as_object().is_some_and(|o| o.is::<Layer>());
            if holds_layer || is_sublayer_template(&value) {
                hparams.set(&name, Value::None)?;
            }
        }
        self.scope()?
            .put(HYPER_PARAMS, "_hparams", Slot::HParams(hparams))?;
        for (_, child) in self.children() {
            child.post_init_hparams()?;
        }
        Ok(())
    }

    // --- entry points --------------------------------------------------

    fn run_bound<R>(
        self: &Rc<Self>,
        store: Rc<Store>,
        method: impl FnOnce(&LayerRef) -> Result<R>,
    ) -> Result<(R, Variables)> {
        self.bind(Scope::root(store.clone()));
        match store.mode() {
            StoreMode::Apply => self.try_setup()?,
            StoreMode::Init | StoreMode::AbstractInit => self.setup_tree()?,
        }
        let out = method(self)?;
        let variables = store.mutable_variables();
        let variables = match store.mode() {
            StoreMode::AbstractInit => variables,
            StoreMode::Init | StoreMode::Apply => variables.unboxed(),
        };
        Ok((out, variables))
    }

    /// Creates all variables from `seed` and returns them.
    pub fn init(self: &Rc<Self>, seed: u64) -> Result<Variables> {
        self.init_with(seed, &DEFAULT_INIT_MUTABLE, |_| Ok(()))
            .map(|(_, variables)| variables)
    }

    /// Initializes, then runs `method`; returns its output and the mutable
    /// collections.
    pub fn init_with<R>(
        self: &Rc<Self>,
        seed: u64,
        mutable: &[&str],
        method: impl FnOnce(&LayerRef) -> Result<R>,
    ) -> Result<(R, Variables)> {
        self.init_on(&Device::Cpu, seed, mutable, method)
    }

    pub fn init_on<R>(
        self: &Rc<Self>,
        device: &Device,
        seed: u64,
        mutable: &[&str],
        method: impl FnOnce(&LayerRef) -> Result<R>,
    ) -> Result<(R, Variables)> {
        log_at!(info, "initializing {} with seed {seed}", self.name());
        let store = Store::new(Variables::new(), StoreMode::Init, mutable, Some(seed), device.clone());
        self.run_bound(store, method)
    }

    /// Runs `method` against existing variables. Only the collections in
    /// `mutable` can change; they are returned afterwards.
    pub fn apply<R>(
        self: &Rc<Self>,
        variables: &Variables,
        mutable: &[&str],
        method: impl FnOnce(&LayerRef) -> Result<R>,
    ) -> Result<(R, Variables)> {
        self.apply_with_rng(variables, None, mutable, method)
    }

    /// Like [`Layer::apply`], with a seed for [`Layer::next_prng_key`].
    pub fn apply_with_rng<R>(
        self: &Rc<Self>,
        variables: &Variables,
        seed: Option<u64>,
        mutable: &[&str],
        method: impl FnOnce(&LayerRef) -> Result<R>,
    ) -> Result<(R, Variables)> {
        let device = variables.device().unwrap_or(Device::Cpu);
        let store = Store::new(variables.clone(), StoreMode::Apply, mutable, seed, device);
        self.run_bound(store, method)
    }

    /// Weight metadata of every variable, without materializing values.
    ///
    /// Runs an initialization with placeholder values inside a context
    /// whose `do_eval` is set as given, with this thread's logging reduced
    /// to errors.
    pub fn abstract_init_with_metadata(
        self: &Rc<Self>,
        do_eval: bool,
        method: impl FnOnce(&LayerRef) -> Result<()>,
    ) -> Result<BTreeMap<String, Nested<WeightHParams>>> {
        let _quiet = QuietLogs::new();
        let params = ContextParams {
            do_eval: Some(do_eval),
            ..AmbientContext::top()
                .map(|ctx| ctx.params().clone())
                .unwrap_or_default()
        };
        scoped(Some(params), |_| {
            let store = Store::new(
                Variables::new(),
                StoreMode::AbstractInit,
                &DEFAULT_INIT_MUTABLE,
                Some(0),
                Device::Cpu,
            );
            let (_, variables) = self.run_bound(store, method)?;
            Ok(variables.metadata())
        })
    }

    /// Whether the active context requests evaluation mode.
    pub fn do_eval(&self) -> Result<Option<bool>> {
        Ok(current_context()?.do_eval())
    }
}

fn insert_subtree<T>(out: &mut Nested<T>, collection: &str, child: &str, subtree: Nested<T>) {
    let mut holder = match out.remove_path(&[collection]) {
        Some(existing @ Nested::Map(_)) => existing,
        _ => Nested::new(),
    };
    holder.insert(child, subtree);
    out.insert(collection, holder);
}

/// Wraps a shared layer so its variables live under the shared id at the root.
struct SharedWeightWrapper {
    child_tpl: Config,
}

impl LayerBehavior for SharedWeightWrapper {
    fn setup(&mut self, layer: &Layer) -> Result<()> {
        let name = layer.name().to_owned();
        layer.create_child(&name, &self.child_tpl)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LayerDef for SharedWeightWrapper {
    const NAME: &'static str = "SharedWeightWrapper";

    fn fields() -> Result<Vec<Field>> {
        Ok(vec![template_field("child_tpl", None)])
    }

    fn from_args(args: &Arguments) -> Result<Self> {
        Ok(Self {
            child_tpl: args.get("child_tpl")?,
        })
    }
}

fn instantiate_shared(config: &Config, shared_id: &str, root: &Scope) -> Result<LayerRef> {
    let context = current_context()?;
    if let Some(entry) = context.lookup_shared_layer(root.root_id(), shared_id) {
        if !compatible(&entry.hparams, config) {
            return Err(LayerError::Config(format!(
                "shared layer {shared_id:?} was created with\n{}\nbut is requested with\n{}",
                entry.hparams.to_text(),
                config.to_text()
            )));
        }
        return Ok(entry.layer);
    }

    let mut wrapped = config.clone();
    wrapped.set("shared_weight_layer_id", Value::None)?;
    let wrapper_config = SharedWeightWrapper::config()?
        .with("name", shared_id)?
        .with("child_tpl", wrapped)?;
    let wrapper = build_layer(&wrapper_config)?;
    wrapper.bind(root.child(shared_id));
    wrapper.try_setup()?;
    let layer = wrapper.child(shared_id).ok_or_else(|| {
        precondition(format!("shared wrapper {shared_id:?} did not create its child"))
    })?;
    context.set_shared_layer(
        root.root_id(),
        shared_id,
        SharedLayerEntry {
            layer: layer.clone(),
            wrapper,
            hparams: config.clone(),
        },
    )?;
    Ok(layer)
}
