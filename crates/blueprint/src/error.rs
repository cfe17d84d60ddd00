//! Error types raised while declaring, editing and building configurations.

use thiserror::Error;

use crate::target::Tag;

/// Boxed error returned by target constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, BlueprintError>;

/// Failures raised by configuration trees.
#[derive(Debug, Error)]
pub enum BlueprintError {
    /// A field name that the target schema does not declare.
    #[error("{target} has no field named {field:?}")]
    UnknownField { target: String, field: String },

    /// A field was declared twice on the same target.
    #[error("duplicate field {target}.{field}")]
    DuplicateField { target: String, field: String },

    /// A required field was read or built without an explicit value.
    #[error("missing required argument {target}.{field}")]
    MissingArgument { target: String, field: String },

    /// A built argument did not have the type the constructor asked for.
    #[error("argument {target}.{field}: expected {expected}, found {found}")]
    TypeMismatch {
        target: String,
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A template-typed field was declared without the do-not-build tag.
    #[error(
        "{target}.{field} has a template type, but does not have the DoNotBuild tag set; \
         declare it with `template_field`"
    )]
    TemplateWithoutTag { target: String, field: String },

    /// A field default is a configuration instance that every config would share.
    #[error("{target}.{field}'s default value is a mutable config; use a default factory instead")]
    ConfigDefault { target: String, field: String },

    /// `copy_fields_from` found a source field the destination does not declare.
    #[error("copying incompatible configs: {field:?} is not a field of {target}")]
    IncompatibleCopy { target: String, field: String },

    /// `copy_fields_from` hit a source default factory that differs from the destination's.
    #[error("can't copy from default factory {target}.{field}")]
    DefaultFactoryConflict { target: String, field: String },

    /// `copy_fields_from` hit a required source field with no value.
    #[error("can't copy from missing required value {target}.{field}")]
    MissingRequiredCopy { target: String, field: String },

    /// A placeholder value reached the builder without being replaced.
    #[error("value tagged {tag} was never filled")]
    TaggedValueNotFilled { tag: Tag },

    /// A built value had an unexpected concrete type.
    #[error("expected the built value to be {expected}, found {found}")]
    UnexpectedObject {
        expected: &'static str,
        found: String,
    },

    /// A constructor failed; `path` locates the failing node from the root.
    #[error("failed to build {target} at {path}: {source}")]
    Build {
        path: String,
        target: String,
        #[source]
        source: BoxError,
    },
}

impl BlueprintError {
    /// Walks `Build` wrappers down to the innermost failure.
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }
}
