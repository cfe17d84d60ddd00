use std::any::Any;

use blueprint::{template_field, Arguments, Config, Field, Value};
use candle_core::{DType, Device, Tensor};
use layers::{
    base::{build_layer, LayerBehavior, LayerDef, SetupPhase},
    linear::Linear,
    variables::{Slot, DEFAULT_INIT_MUTABLE, HYPER_PARAMS, NON_TRAINABLE, PARAMS},
    weights::{collection, WeightHParams, WeightInit},
    Layer, LayerError, LayerRef,
};

/// A stack of square projections with a step counter and a full-precision scale.
struct Tower {
    dims: usize,
    depth: usize,
    block_tpl: Config,
}

impl Tower {
    fn forward(layer: &Layer, x: &Tensor) -> layers::Result<Tensor> {
        layer.with_behavior(|_: &Tower, layer| {
            let mut h = x.clone();
            for block in layer.child_group("blocks").unwrap_or_default() {
                h = Linear::forward(&block, &h)?;
            }
            let steps = layer.get_var("steps")?;
            layer.update_var("steps", &steps.affine(1.0, 1.0)?)?;
            Ok(h.broadcast_mul(&layer.theta("scale")?)?)
        })
    }
}

impl LayerBehavior for Tower {
    fn setup(&mut self, layer: &Layer) -> layers::Result<()> {
        let block = self
            .block_tpl
            .clone()
            .with("input_dims", self.dims)?
            .with("output_dims", self.dims)?;
        layer.create_children("blocks", &vec![block; self.depth])?;
        layer.create_variable(
            "steps",
            &WeightHParams::new(vec![1]).with_init(WeightInit::constant(0.0)),
            false,
        )?;
        layer.create_variable(
            "scale",
            &WeightHParams::new(vec![self.dims])
                .with_init(WeightInit::constant(1.0))
                .with_collection(collection::DISALLOW_BFLOAT16_CONVERSION),
            true,
        )?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LayerDef for Tower {
    const NAME: &'static str = "Tower";

    fn fields() -> layers::Result<Vec<Field>> {
        Ok(vec![
            Field::required("dims"),
            Field::with_default("depth", 2usize),
            template_field("block_tpl", Some(Linear::target()?)),
        ])
    }

    fn from_args(args: &Arguments) -> layers::Result<Self> {
        Ok(Self {
            dims: args.get("dims")?,
            depth: args.get("depth")?,
            block_tpl: args.get("block_tpl")?,
        })
    }
}

/// Declares whatever `clash` asks for twice, or a variable named after a field.
struct Collider {
    clash: String,
}

impl LayerBehavior for Collider {
    fn setup(&mut self, layer: &Layer) -> layers::Result<()> {
        let hp = WeightHParams::new(vec![2]);
        let child = Linear::config()?
            .with("input_dims", 2usize)?
            .with("output_dims", 2usize)?;
        match self.clash.as_str() {
            "field" => {
                layer.create_variable("clash", &hp, true)?;
            }
            "variable" => {
                layer.create_variable("w", &hp, true)?;
                layer.create_variable("w", &hp, true)?;
            }
            "child" => {
                layer.create_child("proj", &child)?;
                layer.create_child("proj", &child)?;
            }
            _ => {
                layer.create_variable("proj", &hp, true)?;
                layer.create_child("proj", &child)?;
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LayerDef for Collider {
    const NAME: &'static str = "Collider";

    fn fields() -> layers::Result<Vec<Field>> {
        Ok(vec![Field::required("clash")])
    }

    fn from_args(args: &Arguments) -> layers::Result<Self> {
        Ok(Self {
            clash: args.get("clash")?,
        })
    }
}

fn tower(config: impl FnOnce(Config) -> blueprint::Result<Config>) -> anyhow::Result<LayerRef> {
    let config = config(Tower::config()?.with("dims", 4usize)?)?;
    Ok(build_layer(&config)?)
}

fn dims_of(t: Option<&Tensor>) -> Option<Vec<usize>> {
    t.map(|t| t.dims().to_vec())
}

#[test]
fn init_creates_children_and_own_variables() -> anyhow::Result<()> {
    let layer = tower(Ok)?;
    assert_eq!(layer.setup_phase(), SetupPhase::Pending);
    let variables = layer.init(5)?;
    assert_eq!(layer.setup_phase(), SetupPhase::Done);

    assert_eq!(dims_of(variables.tensor(PARAMS, &["blocks_0", "w"])), Some(vec![4, 4]));
    assert_eq!(dims_of(variables.tensor(PARAMS, &["blocks_1", "w"])), Some(vec![4, 4]));
    assert_eq!(dims_of(variables.tensor(PARAMS, &["scale"])), Some(vec![4]));
    assert_eq!(dims_of(variables.tensor(NON_TRAINABLE, &["steps"])), Some(vec![1]));
    assert!(variables.tensor(PARAMS, &["steps"]).is_none());

    let group = layer.child_group("blocks").unwrap_or_default();
    let names: Vec<_> = group.iter().map(|c| c.name().to_owned()).collect();
    assert_eq!(names, vec!["blocks_0", "blocks_1"]);
    Ok(())
}

#[test]
fn init_is_deterministic_per_seed() -> anyhow::Result<()> {
    let w = |seed| -> anyhow::Result<Vec<Vec<f32>>> {
        let variables = tower(Ok)?.init(seed)?;
        let w = variables
            .tensor(PARAMS, &["blocks_0", "w"])
            .ok_or_else(|| anyhow::anyhow!("missing w"))?;
        Ok(w.to_vec2::<f32>()?)
    };
    assert_eq!(w(5)?, w(5)?);
    assert_ne!(w(5)?, w(6)?);
    Ok(())
}

#[test]
fn sibling_children_get_distinct_weights() -> anyhow::Result<()> {
    let variables = tower(Ok)?.init(1)?;
    let first = variables.tensor(PARAMS, &["blocks_0", "w"]).map(|t| t.to_vec2::<f32>());
    let second = variables.tensor(PARAMS, &["blocks_1", "w"]).map(|t| t.to_vec2::<f32>());
    assert_ne!(first.transpose()?, second.transpose()?);
    Ok(())
}

#[test]
fn non_trainable_updates_need_a_mutable_collection() -> anyhow::Result<()> {
    let layer = tower(Ok)?;
    let x = Tensor::ones((3, 4), DType::F32, &Device::Cpu)?;

    // Updates during init are dropped.
    let (_, variables) = layer.init_with(0, &DEFAULT_INIT_MUTABLE, |l| Tower::forward(l, &x))?;
    let steps = |v: &layers::Variables| -> anyhow::Result<Vec<f32>> {
        Ok(v.tensor(NON_TRAINABLE, &["steps"])
            .ok_or_else(|| anyhow::anyhow!("missing steps"))?
            .to_vec1::<f32>()?)
    };
    assert_eq!(steps(&variables)?, vec![0.0]);

    let (out, updated) = layer.apply(&variables, &[NON_TRAINABLE], |l| Tower::forward(l, &x))?;
    assert_eq!(out.dims(), &[3, 4]);
    assert_eq!(steps(&updated)?, vec![1.0]);
    assert!(!updated.contains_collection(PARAMS));

    let (_, frozen) = layer.apply(&variables, &[], |l| Tower::forward(l, &x))?;
    assert!(!frozen.contains_collection(NON_TRAINABLE));
    Ok(())
}

#[test]
fn mismatched_state_update_is_rejected() -> anyhow::Result<()> {
    let layer = tower(Ok)?;
    let variables = layer.init(0)?;
    let result = layer.apply(&variables, &[NON_TRAINABLE], |l| {
        l.update_var("steps", &Tensor::zeros(3, DType::F32, &Device::Cpu)?)
    });
    assert!(matches!(result, Err(LayerError::Precondition(_))));
    Ok(())
}

#[test]
fn children_inherit_base_fields() -> anyhow::Result<()> {
    let custom_init = WeightInit::gaussian(0.5);
    let block = Linear::config()?.with("params_init", custom_init.to_value())?;
    let layer = tower(move |c| {
        c.with("dtype", "bf16")?
            .with("skip_lp_regularization", true)?
            .with("block_tpl", block)
    })?;
    let variables = layer.init(0)?;
    assert_eq!(
        variables.tensor(PARAMS, &["blocks_0", "w"]).map(Tensor::dtype),
        Some(DType::BF16)
    );

    let child = layer.child("blocks_0").ok_or_else(|| anyhow::anyhow!("no child"))?;
    assert_eq!(child.dtype(), DType::BF16);
    assert_eq!(child.base().skip_lp_regularization, Some(true));
    let hp = child.weight_hparams("w").ok_or_else(|| anyhow::anyhow!("no hparams"))?;
    assert_eq!(hp.init, Some(custom_init));
    assert!(hp.skips_lp_regularization());
    Ok(())
}

#[test]
fn theta_casts_to_the_forward_dtype() -> anyhow::Result<()> {
    let layer = tower(|c| c.with("fprop_dtype", "bf16"))?;
    let variables = layer.init(0)?;
    let (dtypes, _) = layer.apply(&variables, &[], |l| {
        let block = l
            .child("blocks_0")
            .ok_or_else(|| LayerError::Precondition("no blocks_0".into()))?;
        Ok((block.theta("w")?.dtype(), l.theta("scale")?.dtype(), block.fprop_dtype()))
    })?;
    assert_eq!(dtypes, (DType::BF16, DType::F32, DType::BF16));

    let missing = layer.apply(&variables, &[], |l| l.theta("nope"));
    assert!(matches!(missing, Err(LayerError::Precondition(_))));
    Ok(())
}

#[test]
fn name_collisions_are_configuration_errors() -> anyhow::Result<()> {
    for clash in ["field", "variable", "child", "mixed"] {
        let layer = build_layer(&Collider::config()?.with("clash", clash)?)?;
        let result = layer.init(0);
        assert!(
            matches!(result, Err(LayerError::Config(_))),
            "{clash}: {result:?}"
        );
    }
    Ok(())
}

#[test]
fn post_init_hparams_records_configs_without_templates() -> anyhow::Result<()> {
    let layer = tower(Ok)?;
    let (_, variables) = layer.init_with(0, &[PARAMS, NON_TRAINABLE, HYPER_PARAMS], |l| {
        l.post_init_hparams()
    })?;
    let Some(Slot::HParams(root)) = variables.get(HYPER_PARAMS, &["_hparams"]) else {
        anyhow::bail!("root hparams missing");
    };
    assert_eq!(root.get("block_tpl")?, Value::None);
    assert_eq!(root.get_as::<usize>("dims")?, 4);

    let Some(Slot::HParams(child)) = variables.get(HYPER_PARAMS, &["blocks_1", "_hparams"]) else {
        anyhow::bail!("child hparams missing");
    };
    assert_eq!(child.get_as::<Option<String>>("name")?, Some("blocks_1".to_owned()));
    assert_eq!(child.get_as::<usize>("input_dims")?, 4);
    Ok(())
}

#[test]
fn abstract_init_reports_metadata_only() -> anyhow::Result<()> {
    let layer = tower(|c| c.with("depth", 1usize))?;
    let metadata = layer.abstract_init_with_metadata(true, |l| {
        assert_eq!(l.do_eval()?, Some(true));
        Ok(())
    })?;
    let w = metadata[PARAMS]
        .leaf_at(&["blocks_0", "w"])
        .ok_or_else(|| anyhow::anyhow!("no w metadata"))?;
    assert_eq!(w.shape, vec![4, 4]);
    assert_eq!(w.dtype, Some(DType::F32));
    let steps = metadata[NON_TRAINABLE]
        .leaf_at(&["steps"])
        .ok_or_else(|| anyhow::anyhow!("no steps metadata"))?;
    assert!(!steps.is_trainable());
    assert!(!layers::AmbientContext::has_context());
    Ok(())
}

#[test]
fn unbound_layers_cannot_set_up() -> anyhow::Result<()> {
    let layer = tower(Ok)?;
    assert!(matches!(layer.try_setup(), Err(LayerError::Precondition(_))));
    Ok(())
}
