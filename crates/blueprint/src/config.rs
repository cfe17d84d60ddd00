//! Copy-on-write configuration nodes.
//!
//! A [`Config`] records a [`Target`] and the arguments explicitly set on it.
//! Cloning a config is shallow and cheap; the first mutation through a clone
//! detaches it from the shared node, so edits never leak between copies.
//! Use [`Config::deep_clone`] when nested configurations must also be
//! independent allocations (for example before handing a template to a
//! builder that memoizes by identity).

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    rc::Rc,
};

use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::{
    error::{BlueprintError, Result},
    target::{FieldDefault, Tag, Target},
    value::{FromValue, Value},
};

#[derive(Clone)]
struct ConfigNode {
    target: Target,
    arguments: BTreeMap<String, Value>,
    tags: BTreeMap<String, BTreeSet<Tag>>,
}

/// A mutable, copyable description of a call to a [`Target`].
#[derive(Clone)]
pub struct Config(Rc<ConfigNode>);

impl Config {
    pub fn new(target: Target) -> Self {
        Self(Rc::new(ConfigNode {
            target,
            arguments: BTreeMap::new(),
            tags: BTreeMap::new(),
        }))
    }

    pub fn target(&self) -> &Target {
        &self.0.target
    }

    /// Identity of the underlying node, used for build memoization.
    pub fn node_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    fn node_mut(&mut self) -> &mut ConfigNode {
        Rc::make_mut(&mut self.0)
    }

    fn ensure_field(&self, name: &str) -> Result<()> {
        match self.target().field(name) {
            Some(_) => Ok(()),
            None => Err(self.target().unknown_field(name)),
        }
    }

    /// Sets an argument. Values are not type-checked until build time.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.ensure_field(name)?;
        self.node_mut()
            .arguments
            .insert(name.to_owned(), value.into());
        Ok(self)
    }

    /// Builder-style variant of [`Config::set`].
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Removes an explicit argument so the field falls back to its default.
    pub fn unset(&mut self, name: &str) -> Option<Value> {
        if !self.0.arguments.contains_key(name) {
            return None;
        }
        self.node_mut().arguments.remove(name)
    }

    pub fn has_argument(&self, name: &str) -> bool {
        self.0.arguments.contains_key(name)
    }

    /// The explicitly set argument, without falling back to defaults.
    pub fn explicit(&self, name: &str) -> Option<&Value> {
        self.0.arguments.get(name)
    }

    pub fn explicit_mut(&mut self, name: &str) -> Option<&mut Value> {
        if !self.0.arguments.contains_key(name) {
            return None;
        }
        self.node_mut().arguments.get_mut(name)
    }

    /// Names of explicitly set arguments, in sorted order.
    pub fn argument_names(&self) -> Vec<String> {
        self.0.arguments.keys().cloned().collect()
    }

    pub fn arguments(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.arguments.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reads a field: the explicit argument if set, otherwise its default.
    ///
    /// Default factories run on every read, so each read of an unset
    /// factory field yields a fresh value.
    pub fn get(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.0.arguments.get(name) {
            return Ok(value.clone());
        }
        let field = self
            .target()
            .field(name)
            .ok_or_else(|| self.target().unknown_field(name))?;
        match field.default() {
            FieldDefault::Value(value) => Ok(value.clone()),
            FieldDefault::Factory(factory) => Ok(factory.produce()),
            FieldDefault::Required => Err(BlueprintError::MissingArgument {
                target: self.target().name().to_owned(),
                field: name.to_owned(),
            }),
        }
    }

    /// Reads a field and converts it to `T`.
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get(name)?;
        T::from_value(&value).ok_or_else(|| BlueprintError::TypeMismatch {
            target: self.target().name().to_owned(),
            field: name.to_owned(),
            expected: T::EXPECTED,
            found: value.kind(),
        })
    }

    /// Attaches a tag to a field of this config.
    pub fn add_tag(&mut self, name: &str, tag: Tag) -> Result<()> {
        self.ensure_field(name)?;
        self.node_mut()
            .tags
            .entry(name.to_owned())
            .or_default()
            .insert(tag);
        Ok(())
    }

    /// Tags on a field: the schema's tags plus any added to this config.
    pub fn tags(&self, name: &str) -> BTreeSet<Tag> {
        let mut tags = self
            .target()
            .field(name)
            .map(|f| f.tags().clone())
            .unwrap_or_default();
        if let Some(extra) = self.0.tags.get(name) {
            tags.extend(extra.iter().copied());
        }
        tags
    }

    pub fn has_tag(&self, name: &str, tag: Tag) -> bool {
        self.tags(name).contains(&tag)
    }

    /// Names of every field the target declares, in declaration order.
    pub fn field_names(&self) -> Vec<String> {
        self.target()
            .fields()
            .iter()
            .map(|f| f.name().to_owned())
            .collect()
    }

    /// Copies the tree so that no node is shared with `self`.
    ///
    /// Nodes referenced more than once within the tree stay shared with
    /// each other in the copy.
    pub fn deep_clone(&self) -> Config {
        let mut memo = HashMap::new();
        self.deep_clone_with(&mut memo)
    }

    fn deep_clone_with(&self, memo: &mut HashMap<usize, Config>) -> Config {
        if let Some(done) = memo.get(&self.node_id()) {
            return done.clone();
        }
        let arguments = self
            .0
            .arguments
            .iter()
            .map(|(k, v)| (k.clone(), deep_clone_value(v, memo)))
            .collect();
        let copy = Config(Rc::new(ConfigNode {
            target: self.0.target.clone(),
            arguments,
            tags: self.0.tags.clone(),
        }));
        memo.insert(self.node_id(), copy.clone());
        copy
    }

    /// Copies every field of `source` into `self`.
    ///
    /// For each field declared on `self` (other than `name` and `parent`):
    /// an explicit source argument is copied, a plain source default is
    /// copied as a value, and a source default factory resets `self` to its
    /// own default if both factories are the same. A differing factory or
    /// a required source field with no value is an error. Every source
    /// field must exist on `self` unless listed in `missing_fields_in_self`.
    pub fn copy_fields_from(
        &mut self,
        source: &Config,
        missing_fields_in_self: &[&str],
    ) -> Result<()> {
        const SKIPPED: [&str; 2] = ["name", "parent"];

        for field in source.target().fields() {
            let name = field.name();
            if SKIPPED.contains(&name) {
                continue;
            }
            if self.target().field(name).is_none() && !missing_fields_in_self.contains(&name) {
                return Err(BlueprintError::IncompatibleCopy {
                    target: self.target().name().to_owned(),
                    field: name.to_owned(),
                });
            }
        }

        for name in self.field_names() {
            if SKIPPED.contains(&name.as_str()) {
                continue;
            }
            let Some(source_field) = source.target().field(&name) else {
                continue;
            };
            if let Some(value) = source.explicit(&name) {
                let value = value.clone();
                self.set(&name, value)?;
                continue;
            }
            match source_field.default() {
                FieldDefault::Value(value) => {
                    let value = value.clone();
                    self.set(&name, value)?;
                }
                FieldDefault::Factory(factory) => {
                    let same = matches!(
                        self.target().field(&name).map(|f| f.default()),
                        Some(FieldDefault::Factory(own)) if own == factory
                    );
                    if !same {
                        return Err(BlueprintError::DefaultFactoryConflict {
                            target: source.target().name().to_owned(),
                            field: name,
                        });
                    }
                    self.unset(&name);
                }
                FieldDefault::Required => {
                    return Err(BlueprintError::MissingRequiredCopy {
                        target: source.target().name().to_owned(),
                        field: name,
                    });
                }
            }
        }
        Ok(())
    }

    /// The same config with its `name` argument cleared, if it declares one.
    fn without_name(&self) -> Config {
        let mut copy = self.clone();
        if copy.target().field("name").is_some() {
            copy.node_mut()
                .arguments
                .insert("name".to_owned(), Value::Str(String::new()));
        }
        copy
    }

    /// Renders the tree as readable JSON, used in diagnostics.
    pub fn to_text(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

fn deep_clone_value(value: &Value, memo: &mut HashMap<usize, Config>) -> Value {
    match value {
        Value::Config(config) => Value::Config(config.deep_clone_with(memo)),
        Value::List(items) => Value::List(items.iter().map(|v| deep_clone_value(v, memo)).collect()),
        Value::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), deep_clone_value(v, memo)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Two configs are compatible when they are equal once their names are ignored.
pub fn compatible(a: &Config, b: &Config) -> bool {
    a.without_name() == b.without_name()
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
            || (self.0.target == other.0.target
                && self.0.arguments == other.0.arguments
                && self.0.tags == other.0.tags)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.target().name());
        for (name, value) in &self.0.arguments {
            s.field(name, value);
        }
        s.finish()
    }
}

impl Serialize for Config {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.arguments.len() + 1))?;
        map.serialize_entry("__fn_or_cls__", self.target().name())?;
        for (name, value) in &self.0.arguments {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
