//! Storage and indexing core for a SCIM 2.0 identity provider.
//!
//! Persists schema-typed, self-describing identity resources (users, groups,
//! devices) in an embedded transactional store, maintains per-attribute
//! secondary indices for equality/presence lookup and uniqueness enforcement,
//! and exposes create / read / replace / patch / delete / search operations.
//!
//! # Core Components
//!
//! - [`Silo`] - the transactional resource store facade
//! - [`SchemaRegistry`] - schema and resource-type maps with attribute binding
//! - [`PatchRequest`] - RFC 7644 patch parsing and application
//! - [`SearchContext`] - filter-driven search with index-backed candidates
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scim_silo::{Resource, SchemaRegistry, Silo, SiloConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(SchemaRegistry::with_embedded()?);
//! let silo = Silo::open("identities.db", &SiloConfig::default_config(), registry.clone())?;
//!
//! let rt = registry.resource_type("User").unwrap();
//! let user = Resource::from_json(
//!     &registry,
//!     rt,
//!     &serde_json::json!({"userName": "bjensen", "displayName": "Babs Jensen"}),
//! )?;
//! let stored = silo.insert(user)?;
//! println!("created {}", stored.id().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod resource;
pub mod schema;
pub mod silo;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{ResourceConf, SiloConfig};
pub use error::{ScimError, ScimResult};
pub use filter::{parse_filter, parse_path, Evaluator, Filter};
pub use resource::{Attribute, AttrValue, ComplexAttr, Resource, SimpleAttr};
pub use schema::{
    AttributeDefinition, AttributeType, Mutability, ResourceType, Schema, SchemaRegistry,
    Uniqueness,
};
pub use silo::{PatchRequest, SearchContext, Silo};
