//! Declarative configuration trees.
//!
//! A [`Config`] describes a call to a [`Target`]: which constructor to run
//! and the arguments to pass it. Configs nest, can be edited freely before
//! building, and are built recursively by [`build`]. Fields tagged
//! [`DO_NOT_BUILD`] hold templates that constructors receive unbuilt so they
//! can instantiate them later, possibly several times.

pub mod build;
pub mod config;
pub mod error;
pub mod target;
pub mod value;

pub use build::{build, build_config, instantiate, instantiate_as, Arguments};
pub use config::{compatible, Config};
pub use error::{BlueprintError, BoxError, Result};
pub use target::{
    sub_field, template_field, Factory, Field, FieldDefault, Tag, Target, TargetBuilder,
    DO_NOT_BUILD,
};
pub use value::{FromValue, Object, Value};
