//! Schema registry and attribute binding.
//!
//! The registry owns the schema and resource-type maps handed to the silo at
//! open time and resolves attribute paths against them. Resolution is
//! case-insensitive; extension attributes are addressable by bare name (when
//! unambiguous) or by their fully qualified URN path.

use std::collections::HashMap;

use crate::error::{ScimError, ScimResult};
use crate::schema::embedded;
use crate::schema::types::{AttributeDefinition, AttributeType, Mutability, ResourceType, Schema};

/// An attribute definition resolved against a resource type.
#[derive(Debug, Clone, Copy)]
pub struct BoundAttr<'a> {
    /// The resolved definition; a sub-attribute when the path was dotted.
    pub def: &'a AttributeDefinition,
    /// The complex parent when the path was dotted.
    pub parent: Option<&'a AttributeDefinition>,
    /// URN of the schema the attribute belongs to.
    pub schema: &'a str,
}

impl BoundAttr<'_> {
    /// Duplicate keys are allowed when the attribute, or its complex parent,
    /// is multi-valued.
    pub fn allow_dup_key(&self) -> bool {
        match self.parent {
            Some(parent) => parent.multi_valued,
            None => self.def.multi_valued,
        }
    }

    /// Value type used for index key encoding.
    pub fn value_type(&self) -> AttributeType {
        self.def.data_type
    }
}

/// Registry of schemas and resource types.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
    resource_types: HashMap<String, ResourceType>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry populated with the embedded schemas and resource
    /// types (User + enterprise extension, Group, Device).
    pub fn with_embedded() -> ScimResult<Self> {
        let mut reg = Self::new();
        for text in [
            embedded::core_user_schema(),
            embedded::core_group_schema(),
            embedded::enterprise_user_schema(),
            embedded::device_schema(),
        ] {
            let schema: Schema = serde_json::from_str(text)
                .map_err(|e| ScimError::internal(format!("embedded schema: {}", e)))?;
            reg.add_schema(schema);
        }

        let rtypes: Vec<ResourceType> = serde_json::from_str(embedded::resource_types())
            .map_err(|e| ScimError::internal(format!("embedded resource types: {}", e)))?;
        for rt in rtypes {
            reg.add_resource_type(rt)?;
        }

        Ok(reg)
    }

    /// Registers a schema, replacing any previous one with the same id.
    pub fn add_schema(&mut self, schema: Schema) {
        self.schemas.insert(schema.id.clone(), schema);
    }

    /// Registers a resource type. Its main and extension schemas must already
    /// be registered.
    pub fn add_resource_type(&mut self, rt: ResourceType) -> ScimResult<()> {
        if !self.schemas.contains_key(&rt.schema) {
            return Err(ScimError::internal(format!(
                "resource type {} references unknown schema {}",
                rt.name, rt.schema
            )));
        }
        for ext in &rt.schema_extensions {
            if !self.schemas.contains_key(&ext.schema) {
                return Err(ScimError::internal(format!(
                    "resource type {} references unknown extension schema {}",
                    rt.name, ext.schema
                )));
            }
        }
        self.resource_types.insert(rt.name.clone(), rt);
        Ok(())
    }

    pub fn schema(&self, id: &str) -> Option<&Schema> {
        self.schemas.get(id)
    }

    pub fn resource_type(&self, name: &str) -> Option<&ResourceType> {
        self.resource_types.get(name)
    }

    /// Resource type lookup that surfaces a SCIM error for unknown names.
    pub fn require_resource_type(&self, name: &str) -> ScimResult<&ResourceType> {
        self.resource_type(name)
            .ok_or_else(|| ScimError::not_found(format!("unknown resource type {}", name)))
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.resource_types.values()
    }

    /// All schemas applicable to a resource type, main schema first.
    pub fn schemas_for<'a>(&'a self, rt: &ResourceType) -> Vec<&'a Schema> {
        let mut out = Vec::with_capacity(1 + rt.schema_extensions.len());
        if let Some(s) = self.schemas.get(&rt.schema) {
            out.push(s);
        }
        for ext in &rt.schema_extensions {
            if let Some(s) = self.schemas.get(&ext.schema) {
                out.push(s);
            }
        }
        out
    }

    /// Resolves a dotted attribute path (`a`, `a.b`, or `urn:...:a.b`) against
    /// a resource type.
    ///
    /// Bare names are searched in the main schema first, then across
    /// extensions; a bare name matching attributes in more than one schema is
    /// rejected as ambiguous.
    pub fn resolve<'a>(&'a self, rt: &ResourceType, path: &str) -> ScimResult<BoundAttr<'a>> {
        let (schema_urn, bare) = self.split_urn(rt, path);

        if let Some(urn) = schema_urn {
            let schema = self
                .schemas
                .get(urn)
                .ok_or_else(|| ScimError::invalid_path(format!("unknown schema urn in {}", path)))?;
            return self
                .resolve_in_schema(schema, bare)
                .ok_or_else(|| ScimError::invalid_path(format!("no attribute at path {}", path)));
        }

        let mut found: Option<BoundAttr<'a>> = None;
        for schema in self.schemas_for(rt) {
            if let Some(bound) = self.resolve_in_schema(schema, bare) {
                if let Some(prev) = &found {
                    return Err(ScimError::invalid_path(format!(
                        "ambiguous attribute {}: defined in {} and {}",
                        path, prev.schema, bound.schema
                    )));
                }
                found = Some(bound);
            }
        }

        found.ok_or_else(|| ScimError::invalid_path(format!("no attribute at path {}", path)))
    }

    /// Rejects writes to attributes the server manages itself.
    pub fn check_writable(&self, rt: &ResourceType, path: &str) -> ScimResult<()> {
        let bound = self.resolve(rt, path)?;
        if bound.def.mutability == Mutability::ReadOnly
            || bound
                .parent
                .map(|p| p.mutability == Mutability::ReadOnly)
                .unwrap_or(false)
        {
            return Err(ScimError::mutability(format!(
                "attribute {} is readOnly",
                path
            )));
        }
        Ok(())
    }

    /// Derives the unique attribute paths of a resource type: writable simple
    /// attributes with `uniqueness != none`, plus sub-attributes of complex
    /// attributes carrying the same marker. Paths are lowercase.
    pub fn unique_attribute_paths(&self, rt: &ResourceType) -> Vec<String> {
        let mut paths = Vec::new();
        for schema in self.schemas_for(rt) {
            for at in &schema.attributes {
                if at.is_read_only() {
                    continue;
                }
                if at.is_complex() {
                    for sub in &at.sub_attributes {
                        if sub.is_unique() && !sub.is_read_only() {
                            paths.push(format!(
                                "{}.{}",
                                at.name.to_lowercase(),
                                sub.name.to_lowercase()
                            ));
                        }
                    }
                } else if at.is_unique() {
                    paths.push(at.name.to_lowercase());
                }
            }
        }
        paths
    }

    /// Splits an optional schema-URN prefix off an attribute path.
    fn split_urn<'p>(&self, rt: &ResourceType, path: &'p str) -> (Option<&'p str>, &'p str) {
        if !path.contains(':') {
            return (None, path);
        }
        // Longest matching registered URN wins; the remainder after the
        // separating colon is the bare attribute path.
        let lower = path.to_lowercase();
        let mut urns: Vec<&str> = Vec::with_capacity(1 + rt.schema_extensions.len());
        urns.push(rt.schema.as_str());
        urns.extend(rt.schema_extensions.iter().map(|e| e.schema.as_str()));
        for urn in urns {
            let prefix = format!("{}:", urn.to_lowercase());
            if lower.starts_with(&prefix) {
                return (Some(&path[..urn.len()]), &path[urn.len() + 1..]);
            }
        }
        // A colon that matches no registered schema is still a URN-shaped
        // path; let the unknown-urn error surface from resolve().
        match path.rfind(':') {
            Some(pos) => (Some(&path[..pos]), &path[pos + 1..]),
            None => (None, path),
        }
    }

    fn resolve_in_schema<'a>(&self, schema: &'a Schema, bare: &str) -> Option<BoundAttr<'a>> {
        let mut parts = bare.splitn(2, '.');
        let first = parts.next()?;
        let rest = parts.next();

        let at = schema.attribute(first)?;
        match rest {
            None => Some(BoundAttr {
                def: at,
                parent: None,
                schema: &schema.id,
            }),
            Some(sub) if !sub.contains('.') => {
                let sub_at = at.sub_attribute(sub)?;
                Some(BoundAttr {
                    def: sub_at,
                    parent: Some(at),
                    schema: &schema.id,
                })
            }
            // SCIM attribute paths nest at most one level deep.
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::with_embedded().unwrap()
    }

    #[test]
    fn test_resolve_simple_and_sub_attribute() {
        let reg = registry();
        let rt = reg.resource_type("User").unwrap();

        let bound = reg.resolve(rt, "userName").unwrap();
        assert_eq!(bound.def.name, "userName");
        assert!(!bound.allow_dup_key());

        let bound = reg.resolve(rt, "emails.value").unwrap();
        assert_eq!(bound.def.name, "value");
        assert!(bound.allow_dup_key());
        assert_eq!(bound.parent.unwrap().name, "emails");
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let reg = registry();
        let rt = reg.resource_type("Device").unwrap();
        assert!(reg.resolve(rt, "SERIALNUMBER").is_ok());
        assert!(reg.resolve(rt, "Location.Latitude").is_ok());
    }

    #[test]
    fn test_resolve_extension_by_bare_name_and_urn() {
        let reg = registry();
        let rt = reg.resource_type("User").unwrap();

        let bound = reg.resolve(rt, "employeeNumber").unwrap();
        assert_eq!(
            bound.schema,
            "urn:ietf:params:scim:schemas:extension:enterprise:2.0:User"
        );

        let bound = reg
            .resolve(
                rt,
                "urn:ietf:params:scim:schemas:extension:enterprise:2.0:User:employeeNumber",
            )
            .unwrap();
        assert_eq!(bound.def.name, "employeeNumber");
    }

    #[test]
    fn test_unknown_path_is_invalid_path() {
        let reg = registry();
        let rt = reg.resource_type("User").unwrap();
        let err = reg.resolve(rt, "nosuchattr").unwrap_err();
        assert_eq!(err.scim_type(), "invalidPath");

        let err = reg.resolve(rt, "emails.value.extra").unwrap_err();
        assert_eq!(err.scim_type(), "invalidPath");
    }

    #[test]
    fn test_readonly_write_rejected() {
        let reg = registry();
        let rt = reg.resource_type("User").unwrap();
        let err = reg.check_writable(rt, "id").unwrap_err();
        assert_eq!(err.scim_type(), "mutability");
        let err = reg.check_writable(rt, "groups.value").unwrap_err();
        assert_eq!(err.scim_type(), "mutability");
        assert!(reg.check_writable(rt, "emails.value").is_ok());
    }

    #[test]
    fn test_unique_paths_derived() {
        let reg = registry();
        let rt = reg.resource_type("User").unwrap();
        let uniques = reg.unique_attribute_paths(rt);
        assert_eq!(uniques, vec!["username".to_string()]);

        let rt = reg.resource_type("Device").unwrap();
        assert_eq!(
            reg.unique_attribute_paths(rt),
            vec!["serialnumber".to_string()]
        );
    }
}
