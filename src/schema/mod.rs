//! SCIM schema model and attribute binding.
//!
//! Schemas and resource types are parsed by an external loader and registered
//! with a [`SchemaRegistry`]; the registry then answers every "what is the
//! attribute at this path" question the silo asks.

pub mod embedded;
pub mod registry;
pub mod types;

pub use registry::{BoundAttr, SchemaRegistry};
pub use types::{
    AttributeDefinition, AttributeType, Mutability, ResourceType, Schema, SchemaExtension,
    Uniqueness,
};
