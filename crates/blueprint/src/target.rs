//! Target schemas: the callable a configuration builds and the fields it accepts.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    rc::Rc,
};

use crate::{
    build::Arguments,
    config::Config,
    error::{BlueprintError, BoxError, Result},
    value::Value,
};

/// A marker attached to a field (or a placeholder) that changes how it is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(&'static str);

impl Tag {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Fields carrying this tag are passed to their constructor unbuilt.
pub const DO_NOT_BUILD: Tag = Tag::new("DoNotBuild");

/// Named default factory. Two factories are the same when their names match.
#[derive(Clone)]
pub struct Factory {
    name: String,
    make: Rc<dyn Fn() -> Value>,
}

impl Factory {
    pub fn new(name: impl Into<String>, make: impl Fn() -> Value + 'static) -> Self {
        Self {
            name: name.into(),
            make: Rc::new(make),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn produce(&self) -> Value {
        (self.make)()
    }
}

impl PartialEq for Factory {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Factory({})", self.name)
    }
}

/// Default value policy for a field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldDefault {
    Required,
    Value(Value),
    Factory(Factory),
}

/// A single declared field of a target.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    name: String,
    default: FieldDefault,
    tags: BTreeSet<Tag>,
    template: bool,
}

impl Field {
    /// A field that must be set explicitly.
    pub fn required(name: impl Into<String>) -> Self {
        Self::with(name, FieldDefault::Required)
    }

    /// A field with a plain default value.
    pub fn with_default(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with(name, FieldDefault::Value(value.into()))
    }

    /// A field whose default is produced fresh on every read.
    pub fn with_factory(
        name: impl Into<String>,
        factory_name: impl Into<String>,
        make: impl Fn() -> Value + 'static,
    ) -> Self {
        Self::with(name, FieldDefault::Factory(Factory::new(factory_name, make)))
    }

    fn with(name: impl Into<String>, default: FieldDefault) -> Self {
        Self {
            name: name.into(),
            default,
            tags: BTreeSet::new(),
            template: false,
        }
    }

    pub fn tagged(mut self, tag: Tag) -> Self {
        self.tags.insert(tag);
        self
    }

    /// Marks the field as holding an unbuilt configuration template.
    pub fn template(mut self) -> Self {
        self.template = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> &FieldDefault {
        &self.default
    }

    pub fn tags(&self) -> &BTreeSet<Tag> {
        &self.tags
    }

    pub fn is_template(&self) -> bool {
        self.template
    }
}

/// A field defaulting to a fresh configuration of `target`.
pub fn sub_field(name: impl Into<String>, target: Target) -> Field {
    let factory_name = format!("config<{}>", target.name());
    Field::with_factory(name, factory_name, move || {
        Value::Config(Config::new(target.clone()))
    })
}

/// A field holding an unbuilt template; tagged [`DO_NOT_BUILD`].
///
/// With `Some(target)` the default is a fresh configuration of that target,
/// otherwise the default is `None`.
pub fn template_field(name: impl Into<String>, target: Option<Target>) -> Field {
    let field = match target {
        Some(target) => sub_field(name, target),
        None => Field::with_default(name, Value::None),
    };
    field.template().tagged(DO_NOT_BUILD)
}

/// Constructor invoked with built arguments.
pub type Constructor = Rc<dyn Fn(&Arguments) -> std::result::Result<Value, BoxError>>;

struct TargetSpec {
    name: String,
    fields: Vec<Field>,
    markers: BTreeSet<&'static str>,
    constructor: Constructor,
}

/// A buildable callable together with its field schema.
#[derive(Clone)]
pub struct Target(Rc<TargetSpec>);

impl Target {
    pub fn builder(name: impl Into<String>) -> TargetBuilder {
        TargetBuilder {
            name: name.into(),
            fields: Vec::new(),
            markers: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.0.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.0.fields.iter().find(|f| f.name == name)
    }

    pub fn has_marker(&self, marker: &str) -> bool {
        self.0.markers.contains(marker)
    }

    pub(crate) fn construct(&self, args: &Arguments) -> std::result::Result<Value, BoxError> {
        (self.0.constructor)(args)
    }

    pub(crate) fn unknown_field(&self, field: &str) -> BlueprintError {
        BlueprintError::UnknownField {
            target: self.name().to_owned(),
            field: field.to_owned(),
        }
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0.name == other.0.name
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.0.name)
            .field(
                "fields",
                &self.0.fields.iter().map(Field::name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Accumulates fields before validating them into a [`Target`].
pub struct TargetBuilder {
    name: String,
    fields: Vec<Field>,
    markers: BTreeSet<&'static str>,
}

impl TargetBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Appends fields; a later field replaces an earlier one of the same name.
    pub fn fields(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        for field in fields {
            match self.fields.iter_mut().find(|f| f.name == field.name) {
                Some(slot) => *slot = field,
                None => self.fields.push(field),
            }
        }
        self
    }

    pub fn marker(mut self, marker: &'static str) -> Self {
        self.markers.insert(marker);
        self
    }

    /// Validates the schema and attaches the constructor.
    pub fn build<F>(self, constructor: F) -> Result<Target>
    where
        F: Fn(&Arguments) -> std::result::Result<Value, BoxError> + 'static,
    {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(BlueprintError::DuplicateField {
                    target: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if field.template && !field.tags.contains(&DO_NOT_BUILD) {
                return Err(BlueprintError::TemplateWithoutTag {
                    target: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if let FieldDefault::Value(Value::Config(_)) = field.default {
                return Err(BlueprintError::ConfigDefault {
                    target: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        Ok(Target(Rc::new(TargetSpec {
            name: self.name,
            fields: self.fields,
            markers: self.markers,
            constructor: Rc::new(constructor),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(_: &Arguments) -> std::result::Result<Value, BoxError> {
        Ok(Value::None)
    }

    #[test]
    fn template_fields_require_do_not_build() {
        let err = Target::builder("Outer")
            .field(Field::with_default("tpl", Value::None).template())
            .build(unit)
            .err();
        assert!(matches!(err, Some(BlueprintError::TemplateWithoutTag { .. })));

        let ok = Target::builder("Outer")
            .field(template_field("tpl", None))
            .build(unit);
        assert!(ok.is_ok());
    }

    #[test]
    fn rejects_shared_config_defaults_and_duplicates() -> Result<()> {
        let inner = Target::builder("Inner").build(unit)?;
        let err = Target::builder("Outer")
            .field(Field::with_default("child", Config::new(inner)))
            .build(unit)
            .err();
        assert!(matches!(err, Some(BlueprintError::ConfigDefault { .. })));

        let err = Target::builder("Outer")
            .field(Field::required("a"))
            .field(Field::required("a"))
            .build(unit)
            .err();
        assert!(matches!(err, Some(BlueprintError::DuplicateField { .. })));
        Ok(())
    }

    #[test]
    fn later_fields_override_earlier_ones() -> Result<()> {
        let target = Target::builder("T")
            .fields([Field::with_default("x", 1i64)])
            .fields([Field::with_default("x", 2i64)])
            .build(unit)?;
        assert_eq!(target.fields().len(), 1);
        assert_eq!(
            target.field("x").map(Field::default),
            Some(&FieldDefault::Value(Value::Int(2)))
        );
        Ok(())
    }
}
