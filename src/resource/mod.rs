//! Typed attribute trees for SCIM resources.

pub mod resource;
pub mod value;

pub use resource::{Attribute, ComplexAttr, Resource, SimpleAttr, SubAttrMap};
pub use value::AttrValue;
