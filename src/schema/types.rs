//! Core schema type definitions for SCIM resources.
//!
//! These structures mirror RFC 7643: a [`Schema`] is a list of attribute
//! definitions, a [`ResourceType`] binds a main schema and optional extension
//! schemas to a stored resource kind.

use serde::{Deserialize, Serialize};

/// A SCIM schema definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Unique schema identifier (URN).
    pub id: String,
    /// Human-readable schema name.
    pub name: String,
    /// Schema description.
    #[serde(default)]
    pub description: String,
    /// Attribute definitions.
    pub attributes: Vec<AttributeDefinition>,
}

impl Schema {
    /// Finds a top-level attribute by case-insensitive name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes
            .iter()
            .find(|at| at.name.eq_ignore_ascii_case(name))
    }
}

/// Definition of a single SCIM attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDefinition {
    /// Attribute name.
    pub name: String,
    /// Data type of the attribute.
    #[serde(rename = "type")]
    pub data_type: AttributeType,
    /// Whether this attribute can have multiple values.
    #[serde(default)]
    pub multi_valued: bool,
    /// Whether this attribute is required.
    #[serde(default)]
    pub required: bool,
    /// Whether string comparison is case-sensitive.
    #[serde(default)]
    pub case_exact: bool,
    /// Mutability characteristics.
    #[serde(default)]
    pub mutability: Mutability,
    /// Uniqueness constraints.
    #[serde(default)]
    pub uniqueness: Uniqueness,
    /// Allowed values for string attributes.
    #[serde(default)]
    pub canonical_values: Vec<String>,
    /// Sub-attributes for complex types.
    #[serde(default)]
    pub sub_attributes: Vec<AttributeDefinition>,
    /// How the attribute is returned in responses.
    #[serde(default)]
    pub returned: Option<String>,
}

impl AttributeDefinition {
    /// Finds a sub-attribute by case-insensitive name.
    pub fn sub_attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.sub_attributes
            .iter()
            .find(|at| at.name.eq_ignore_ascii_case(name))
    }

    pub fn is_complex(&self) -> bool {
        self.data_type == AttributeType::Complex
    }

    pub fn is_read_only(&self) -> bool {
        self.mutability == Mutability::ReadOnly
    }

    pub fn is_unique(&self) -> bool {
        self.uniqueness != Uniqueness::None
    }
}

impl Default for AttributeDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            data_type: AttributeType::String,
            multi_valued: false,
            required: false,
            case_exact: false,
            mutability: Mutability::ReadWrite,
            uniqueness: Uniqueness::None,
            canonical_values: Vec::new(),
            sub_attributes: Vec::new(),
            returned: None,
        }
    }
}

/// SCIM attribute data types as defined in RFC 7643.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AttributeType {
    String,
    Boolean,
    Decimal,
    Integer,
    DateTime,
    Binary,
    Reference,
    Complex,
}

impl Default for AttributeType {
    fn default() -> Self {
        Self::String
    }
}

/// Attribute mutability characteristics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Mutability {
    /// Managed by the server; client writes are rejected.
    ReadOnly,
    ReadWrite,
    /// Set once, never modified afterwards.
    Immutable,
    /// Accepted on write, never returned.
    WriteOnly,
}

impl Default for Mutability {
    fn default() -> Self {
        Self::ReadWrite
    }
}

/// Attribute uniqueness constraints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Uniqueness {
    None,
    /// Unique within this server.
    Server,
    /// Globally unique.
    Global,
}

impl Default for Uniqueness {
    fn default() -> Self {
        Self::None
    }
}

/// A stored resource kind: main schema plus optional extension schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    /// Resource type name, e.g. `User`.
    pub name: String,
    /// Endpoint path, e.g. `/Users`. Used to build `$ref` values.
    pub endpoint: String,
    /// URN of the main schema.
    pub schema: String,
    /// Extension schemas.
    #[serde(default)]
    pub schema_extensions: Vec<SchemaExtension>,
}

/// Reference to an extension schema within a [`ResourceType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaExtension {
    pub schema: String,
    #[serde(default)]
    pub required: bool,
}
