//! Recursive construction of configuration trees.

use std::{collections::BTreeMap, collections::HashMap, fmt, rc::Rc};

use log::debug;

use crate::{
    config::Config,
    error::{BlueprintError, BoxError, Result},
    target::{FieldDefault, DO_NOT_BUILD},
    value::{FromValue, Value},
};

/// Arguments handed to a target constructor.
///
/// Every declared field is present: explicit arguments and defaults are
/// built, except for fields tagged `DoNotBuild`, which arrive as-is.
#[derive(Debug)]
pub struct Arguments {
    config: Config,
    values: BTreeMap<String, Value>,
}

impl Arguments {
    /// The configuration these arguments were built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target_name(&self) -> &str {
        self.config.target().name()
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reads a built argument as `T`.
    pub fn get<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| self.config.target().unknown_field(name))?;
        T::from_value(value).ok_or_else(|| BlueprintError::TypeMismatch {
            target: self.target_name().to_owned(),
            field: name.to_owned(),
            expected: T::EXPECTED,
            found: value.kind(),
        })
    }

    /// Reads a built argument that must be an object of type `T`.
    pub fn object<T: 'static>(&self, name: &str) -> Result<Rc<T>> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| self.config.target().unknown_field(name))?;
        downcast_value(value)
    }
}

#[derive(Clone, Debug)]
enum PathElement {
    Attr(String),
    Index(usize),
    Key(String),
}

/// Location of a node relative to the root of the tree being built.
#[derive(Clone, Debug, Default)]
struct BuildPath(Vec<PathElement>);

impl BuildPath {
    fn with(&self, element: PathElement) -> Self {
        let mut path = self.0.clone();
        path.push(element);
        Self(path)
    }
}

impl fmt::Display for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<root>")?;
        for element in &self.0 {
            match element {
                PathElement::Attr(name) => write!(f, ".{name}")?,
                PathElement::Index(i) => write!(f, "[{i}]")?,
                PathElement::Key(k) => write!(f, "[{k:?}]")?,
            }
        }
        Ok(())
    }
}

/// Built values keyed by node address. The config is held alongside its
/// value so the address cannot be reused by a later node in the same build.
struct Builder {
    memo: HashMap<usize, (Config, Value)>,
}

impl Builder {
    fn build_value(&mut self, value: &Value, path: &BuildPath) -> Result<Value> {
        match value {
            Value::Config(config) => self.build_config(config, path),
            Value::Placeholder(tag) => Err(BlueprintError::TaggedValueNotFilled { tag: *tag }),
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.build_value(item, &path.with(PathElement::Index(i))))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| {
                    self.build_value(v, &path.with(PathElement::Key(k.clone())))
                        .map(|built| (k.clone(), built))
                })
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Value::Map),
            other => Ok(other.clone()),
        }
    }

    fn build_config(&mut self, config: &Config, path: &BuildPath) -> Result<Value> {
        if let Some((_, done)) = self.memo.get(&config.node_id()) {
            return Ok(done.clone());
        }
        let target = config.target().clone();
        let mut values = BTreeMap::new();
        for field in target.fields() {
            let name = field.name();
            let raw = match config.explicit(name) {
                Some(value) => value.clone(),
                None => match field.default() {
                    FieldDefault::Value(value) => value.clone(),
                    FieldDefault::Factory(factory) => factory.produce(),
                    FieldDefault::Required => {
                        let missing = BlueprintError::MissingArgument {
                            target: target.name().to_owned(),
                            field: name.to_owned(),
                        };
                        return Err(wrap(path, target.name(), Box::new(missing)));
                    }
                },
            };
            let built = if config.has_tag(name, DO_NOT_BUILD) {
                raw
            } else {
                self.build_value(&raw, &path.with(PathElement::Attr(name.to_owned())))?
            };
            values.insert(name.to_owned(), built);
        }

        let args = Arguments {
            config: config.clone(),
            values,
        };
        debug!("building {} at {path}", target.name());
        let built = target.construct(&args).map_err(|source| {
            match source.downcast::<BlueprintError>() {
                Ok(inner) => match *inner {
                    tagged @ BlueprintError::TaggedValueNotFilled { .. } => tagged,
                    other => wrap(path, target.name(), Box::new(other)),
                },
                Err(source) => wrap(path, target.name(), source),
            }
        })?;
        self.memo
            .insert(config.node_id(), (config.clone(), built.clone()));
        Ok(built)
    }
}

fn wrap(path: &BuildPath, target: &str, source: BoxError) -> BlueprintError {
    BlueprintError::Build {
        path: path.to_string(),
        target: target.to_owned(),
        source,
    }
}

/// Builds a value tree.
///
/// Configurations are replaced by the result of calling their target on
/// built arguments; lists and maps are rebuilt element-wise; other values
/// pass through. A configuration node reached twice is built once and the
/// same result is reused. Constructor failures are wrapped with the path to
/// the failing node, except unfilled placeholders, which propagate as-is.
pub fn build(value: &Value) -> Result<Value> {
    Builder {
        memo: HashMap::new(),
    }
    .build_value(value, &BuildPath::default())
}

/// Builds a single configuration.
pub fn build_config(config: &Config) -> Result<Value> {
    Builder {
        memo: HashMap::new(),
    }
    .build_config(config, &BuildPath::default())
}

/// Applies `overrides` to a copy of `config` and builds it.
pub fn instantiate<'a, I>(config: &Config, overrides: I) -> Result<Value>
where
    I: IntoIterator<Item = (&'a str, Value)>,
{
    let mut config = config.clone();
    for (name, value) in overrides {
        config.set(name, value)?;
    }
    build_config(&config)
}

/// Builds `config` and downcasts the resulting object to `T`.
pub fn instantiate_as<T: 'static>(config: &Config) -> Result<Rc<T>> {
    downcast_value(&build_config(config)?)
}

fn downcast_value<T: 'static>(value: &Value) -> Result<Rc<T>> {
    value
        .as_object()
        .and_then(|object| object.downcast::<T>())
        .ok_or_else(|| BlueprintError::UnexpectedObject {
            expected: std::any::type_name::<T>(),
            found: match value {
                Value::Object(object) => object.type_name().to_owned(),
                other => other.kind().to_owned(),
            },
        })
}
