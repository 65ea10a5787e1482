//! The typed resource tree: simple and complex attributes, meta stamping,
//! schema-driven JSON conversion, and the deterministic byte codec.
//!
//! A [`Resource`] keeps attributes in `BTreeMap`s keyed by lowercase name, so
//! serializing the same logical state always yields identical bytes. That
//! byte-for-byte stability is what lets the patch engine detect idempotent
//! operations by comparing pre- and post-image encodings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ScimError, ScimResult};
use crate::resource::value::AttrValue;
use crate::schema::{AttributeDefinition, AttributeType, ResourceType, Schema, SchemaRegistry};

/// A simple attribute: a name and zero or more typed scalar values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAttr {
    /// Attribute name in its schema-declared casing.
    pub name: String,
    pub values: Vec<AttrValue>,
}

impl SimpleAttr {
    pub fn single(name: impl Into<String>, value: AttrValue) -> Self {
        Self {
            name: name.into(),
            values: vec![value],
        }
    }

    pub fn first(&self) -> Option<&AttrValue> {
        self.values.first()
    }
}

/// One entry of a complex attribute: lowercase sub-name → simple attribute.
pub type SubAttrMap = BTreeMap<String, SimpleAttr>;

/// A complex attribute: one entry for singular attributes, any number for
/// multi-valued ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexAttr {
    pub name: String,
    pub sub_ats: Vec<SubAttrMap>,
}

impl ComplexAttr {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_ats: Vec::new(),
        }
    }

    /// Number of entries whose `primary` sub-attribute is `true`.
    pub fn primary_count(&self) -> usize {
        self.sub_ats
            .iter()
            .filter(|map| {
                map.get("primary")
                    .and_then(|sa| sa.first())
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            })
            .count()
    }

    /// Clears the `primary` flag on every entry except the given index.
    pub fn clear_primary_except(&mut self, keep: usize) {
        for (i, map) in self.sub_ats.iter_mut().enumerate() {
            if i == keep {
                continue;
            }
            if let Some(sa) = map.get_mut("primary") {
                sa.values = vec![AttrValue::Boolean(false)];
            }
        }
    }
}

/// A simple or complex attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Simple(SimpleAttr),
    Complex(ComplexAttr),
}

impl Attribute {
    pub fn name(&self) -> &str {
        match self {
            Self::Simple(sa) => &sa.name,
            Self::Complex(ca) => &ca.name,
        }
    }

    pub fn as_simple(&self) -> Option<&SimpleAttr> {
        match self {
            Self::Simple(sa) => Some(sa),
            _ => None,
        }
    }

    pub fn as_complex(&self) -> Option<&ComplexAttr> {
        match self {
            Self::Complex(ca) => Some(ca),
            _ => None,
        }
    }

    pub fn as_complex_mut(&mut self) -> Option<&mut ComplexAttr> {
        match self {
            Self::Complex(ca) => Some(ca),
            _ => None,
        }
    }
}

/// A schema-typed identity resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource type name; not serialized, re-bound after decode.
    #[serde(skip)]
    resource_type: String,
    schemas: Vec<String>,
    /// Main-schema attributes, keyed by lowercase name.
    core: BTreeMap<String, Attribute>,
    /// Extension attributes, keyed by schema URN then lowercase name.
    extensions: BTreeMap<String, BTreeMap<String, Attribute>>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, main_schema: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            schemas: vec![main_schema.into()],
            core: BTreeMap::new(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn set_resource_type(&mut self, name: impl Into<String>) {
        self.resource_type = name.into();
    }

    pub fn schemas(&self) -> &[String] {
        &self.schemas
    }

    /// Records an extension schema URN in `schemas` if not yet present.
    pub fn add_schema_urn(&mut self, urn: &str) {
        if !self.schemas.iter().any(|s| s == urn) {
            self.schemas.push(urn.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Attribute access
    // ------------------------------------------------------------------

    /// Looks up a top-level attribute by lowercase bare name, searching the
    /// core map first and then every extension container.
    pub fn get_attr(&self, name: &str) -> Option<&Attribute> {
        let key = name.to_lowercase();
        self.core
            .get(&key)
            .or_else(|| self.extensions.values().find_map(|m| m.get(&key)))
    }

    pub fn get_attr_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        let key = name.to_lowercase();
        if self.core.contains_key(&key) {
            return self.core.get_mut(&key);
        }
        self.extensions.values_mut().find_map(|m| m.get_mut(&key))
    }

    /// Inserts or replaces an attribute. `extension_urn` selects the
    /// container; `None` targets the main schema.
    pub fn set_attr(&mut self, extension_urn: Option<&str>, attr: Attribute) {
        let key = attr.name().to_lowercase();
        match extension_urn {
            Some(urn) => {
                self.add_schema_urn(urn);
                self.extensions
                    .entry(urn.to_string())
                    .or_default()
                    .insert(key, attr);
            }
            None => {
                self.core.insert(key, attr);
            }
        }
    }

    /// Removes a top-level attribute by bare name; empty extension containers
    /// are dropped along with their `schemas` entry.
    pub fn remove_attr(&mut self, name: &str) -> Option<Attribute> {
        let key = name.to_lowercase();
        if let Some(at) = self.core.remove(&key) {
            return Some(at);
        }
        let mut removed = None;
        let mut emptied = None;
        for (urn, attrs) in self.extensions.iter_mut() {
            if let Some(at) = attrs.remove(&key) {
                removed = Some(at);
                if attrs.is_empty() {
                    emptied = Some(urn.clone());
                }
                break;
            }
        }
        if let Some(urn) = emptied {
            self.extensions.remove(&urn);
            self.schemas.retain(|s| s != &urn);
        }
        removed
    }

    /// Collects the scalar values at `attr` or `attr.sub` (lowercase path).
    /// Complex paths gather the sub-attribute across every entry.
    pub fn values_at(&self, path: &str) -> Vec<AttrValue> {
        let (name, sub) = match path.split_once('.') {
            Some((n, s)) => (n, Some(s)),
            None => (path, None),
        };
        match (self.get_attr(name), sub) {
            (Some(Attribute::Simple(sa)), None) => sa.values.clone(),
            (Some(Attribute::Complex(ca)), Some(sub)) => ca
                .sub_ats
                .iter()
                .filter_map(|map| map.get(sub))
                .flat_map(|sa| sa.values.iter().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Id and meta
    // ------------------------------------------------------------------

    pub fn id(&self) -> Option<&str> {
        self.get_attr("id")
            .and_then(|at| at.as_simple())
            .and_then(|sa| sa.first())
            .and_then(|v| v.as_str())
    }

    pub fn set_id(&mut self, rid: impl Into<String>) {
        self.set_attr(
            None,
            Attribute::Simple(SimpleAttr::single("id", AttrValue::String(rid.into()))),
        );
    }

    /// Stamps a fresh `meta` attribute at creation time.
    pub fn stamp_meta(&mut self, now_ms: i64) {
        let mut map = SubAttrMap::new();
        map.insert(
            "created".to_string(),
            SimpleAttr::single("created", AttrValue::DateTime(now_ms)),
        );
        map.insert(
            "lastmodified".to_string(),
            SimpleAttr::single("lastModified", AttrValue::DateTime(now_ms)),
        );
        map.insert(
            "resourcetype".to_string(),
            SimpleAttr::single(
                "resourceType",
                AttrValue::String(self.resource_type.clone()),
            ),
        );
        map.insert(
            "version".to_string(),
            SimpleAttr::single("version", AttrValue::String(now_ms.to_string())),
        );
        let mut ca = ComplexAttr::new("meta");
        ca.sub_ats.push(map);
        self.set_attr(None, Attribute::Complex(ca));
    }

    /// Advances `meta.lastModified` and the mirrored `version` string.
    pub fn touch_meta(&mut self, now_ms: i64) {
        if let Some(Attribute::Complex(ca)) = self.get_attr_mut("meta") {
            if let Some(map) = ca.sub_ats.first_mut() {
                map.insert(
                    "lastmodified".to_string(),
                    SimpleAttr::single("lastModified", AttrValue::DateTime(now_ms)),
                );
                map.insert(
                    "version".to_string(),
                    SimpleAttr::single("version", AttrValue::String(now_ms.to_string())),
                );
            }
        }
    }

    pub fn meta_last_modified(&self) -> Option<i64> {
        self.get_attr("meta")
            .and_then(|at| at.as_complex())
            .and_then(|ca| ca.sub_ats.first())
            .and_then(|map| map.get("lastmodified"))
            .and_then(|sa| sa.first())
            .and_then(|v| match v {
                AttrValue::DateTime(ms) => Some(*ms),
                _ => None,
            })
    }

    /// Strips every attribute the server manages itself (readOnly).
    pub fn remove_read_only(&mut self, reg: &SchemaRegistry, rt: &ResourceType) {
        for schema in reg.schemas_for(rt) {
            for at in &schema.attributes {
                if at.is_read_only() {
                    self.remove_attr(&at.name);
                }
            }
        }
    }

    /// Ensures every `required` writable attribute has a value.
    pub fn check_required(&self, reg: &SchemaRegistry, rt: &ResourceType) -> ScimResult<()> {
        for schema in reg.schemas_for(rt) {
            for at in &schema.attributes {
                if !at.required || at.is_read_only() {
                    continue;
                }
                let present = match self.get_attr(&at.name) {
                    Some(Attribute::Simple(sa)) => !sa.values.is_empty(),
                    Some(Attribute::Complex(ca)) => !ca.sub_ats.is_empty(),
                    None => false,
                };
                if !present {
                    return Err(ScimError::invalid_value(format!(
                        "required attribute {} is missing",
                        at.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rejects resources carrying more than one `primary=true` entry on any
    /// multi-valued complex attribute.
    pub fn check_primary_flags(&self) -> ScimResult<()> {
        let all = self
            .core
            .values()
            .chain(self.extensions.values().flat_map(|m| m.values()));
        for at in all {
            if let Attribute::Complex(ca) = at {
                if ca.primary_count() > 1 {
                    return Err(ScimError::invalid_value(format!(
                        "attribute {} has more than one primary value",
                        ca.name
                    )));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Byte codec
    // ------------------------------------------------------------------

    /// Deterministic byte encoding of the resource.
    pub fn to_bytes(&self) -> ScimResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ScimError::internal(format!("encode: {}", e)))
    }

    /// Decodes stored bytes; the caller re-binds the resource type.
    pub fn from_bytes(data: &[u8], resource_type: &str) -> ScimResult<Self> {
        let mut res: Resource = serde_json::from_slice(data)
            .map_err(|e| ScimError::internal(format!("decode: {}", e)))?;
        res.resource_type = resource_type.to_string();
        Ok(res)
    }

    // ------------------------------------------------------------------
    // JSON bridge
    // ------------------------------------------------------------------

    /// Parses a SCIM-shaped JSON object against the resource type's schemas.
    /// Unknown attributes are rejected.
    pub fn from_json(reg: &SchemaRegistry, rt: &ResourceType, data: &Value) -> ScimResult<Self> {
        let obj = data
            .as_object()
            .ok_or_else(|| ScimError::invalid_syntax("resource must be a JSON object"))?;

        let mut res = Resource::new(rt.name.clone(), rt.schema.clone());

        for (key, value) in obj {
            if key.eq_ignore_ascii_case("schemas") {
                continue;
            }
            // A key that names a registered extension schema holds a nested
            // object of that extension's attributes.
            if let Some(ext) = rt
                .schema_extensions
                .iter()
                .find(|e| e.schema.eq_ignore_ascii_case(key))
            {
                let schema = reg.schema(&ext.schema).ok_or_else(|| {
                    ScimError::internal(format!("unregistered schema {}", ext.schema))
                })?;
                let ext_obj = value.as_object().ok_or_else(|| {
                    ScimError::invalid_syntax(format!("extension {} must be an object", key))
                })?;
                for (name, sub_value) in ext_obj {
                    let at = schema.attribute(name).ok_or_else(|| {
                        ScimError::invalid_syntax(format!("unknown attribute {}:{}", key, name))
                    })?;
                    let attr = Self::parse_attribute(at, sub_value)?;
                    res.set_attr(Some(&schema.id), attr);
                }
                continue;
            }

            let bound = reg
                .resolve(rt, key)
                .map_err(|_| ScimError::invalid_syntax(format!("unknown attribute {}", key)))?;
            let attr = Self::parse_attribute(bound.def, value)?;
            let urn = if bound.schema == rt.schema {
                None
            } else {
                Some(bound.schema)
            };
            res.set_attr(urn, attr);
        }

        res.check_primary_flags()?;
        Ok(res)
    }

    /// Parses one attribute value according to its definition.
    pub fn parse_attribute(at: &AttributeDefinition, value: &Value) -> ScimResult<Attribute> {
        if at.is_complex() {
            let mut ca = ComplexAttr::new(at.name.clone());
            match value {
                Value::Array(items) if at.multi_valued => {
                    for item in items {
                        ca.sub_ats.push(Self::parse_sub_map(at, item)?);
                    }
                }
                Value::Object(_) if !at.multi_valued => {
                    ca.sub_ats.push(Self::parse_sub_map(at, value)?);
                }
                Value::Object(_) => {
                    // A single entry offered for a multi-valued attribute.
                    ca.sub_ats.push(Self::parse_sub_map(at, value)?);
                }
                _ => {
                    return Err(ScimError::invalid_value(format!(
                        "attribute {} expects {}",
                        at.name,
                        if at.multi_valued {
                            "an array of objects"
                        } else {
                            "an object"
                        }
                    )));
                }
            }
            Ok(Attribute::Complex(ca))
        } else {
            let mut sa = SimpleAttr {
                name: at.name.clone(),
                values: Vec::new(),
            };
            match value {
                Value::Array(items) if at.multi_valued => {
                    for item in items {
                        sa.values.push(AttrValue::from_json(at.data_type, item)?);
                    }
                }
                Value::Array(_) => {
                    return Err(ScimError::invalid_value(format!(
                        "attribute {} is single-valued",
                        at.name
                    )));
                }
                _ => sa.values.push(AttrValue::from_json(at.data_type, value)?),
            }
            Ok(Attribute::Simple(sa))
        }
    }

    /// Parses one entry of a complex attribute.
    pub fn parse_sub_map(at: &AttributeDefinition, value: &Value) -> ScimResult<SubAttrMap> {
        let obj = value.as_object().ok_or_else(|| {
            ScimError::invalid_value(format!("entries of {} must be objects", at.name))
        })?;
        let mut map = SubAttrMap::new();
        for (name, sub_value) in obj {
            let sub_at = at.sub_attribute(name).ok_or_else(|| {
                ScimError::invalid_syntax(format!("unknown sub-attribute {}.{}", at.name, name))
            })?;
            let mut sa = SimpleAttr {
                name: sub_at.name.clone(),
                values: Vec::new(),
            };
            match sub_value {
                Value::Array(items) if sub_at.multi_valued => {
                    for item in items {
                        sa.values
                            .push(AttrValue::from_json(sub_at.data_type, item)?);
                    }
                }
                _ => sa
                    .values
                    .push(AttrValue::from_json(sub_at.data_type, sub_value)?),
            }
            map.insert(sub_at.name.to_lowercase(), sa);
        }
        Ok(map)
    }

    /// Renders the resource in its SCIM JSON shape.
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "schemas".to_string(),
            Value::Array(self.schemas.iter().cloned().map(Value::String).collect()),
        );
        for attr in self.core.values() {
            obj.insert(attr.name().to_string(), Self::attr_to_json(attr));
        }
        for (urn, attrs) in &self.extensions {
            let mut ext = serde_json::Map::new();
            for attr in attrs.values() {
                ext.insert(attr.name().to_string(), Self::attr_to_json(attr));
            }
            obj.insert(urn.clone(), Value::Object(ext));
        }
        Value::Object(obj)
    }

    fn attr_to_json(attr: &Attribute) -> Value {
        match attr {
            Attribute::Simple(sa) => {
                if sa.values.len() == 1 {
                    sa.values[0].to_json()
                } else {
                    Value::Array(sa.values.iter().map(AttrValue::to_json).collect())
                }
            }
            Attribute::Complex(ca) => {
                let entries: Vec<Value> = ca
                    .sub_ats
                    .iter()
                    .map(|map| {
                        let mut entry = serde_json::Map::new();
                        for sa in map.values() {
                            let v = if sa.values.len() == 1 {
                                sa.values[0].to_json()
                            } else {
                                Value::Array(sa.values.iter().map(AttrValue::to_json).collect())
                            };
                            entry.insert(sa.name.clone(), v);
                        }
                        Value::Object(entry)
                    })
                    .collect();
                if entries.len() == 1 && !Self::is_multi_shaped(&ca.name) {
                    entries.into_iter().next().unwrap_or(Value::Null)
                } else {
                    Value::Array(entries)
                }
            }
        }
    }

    // Complex attributes that are conventionally rendered as arrays even with
    // a single entry. Schema-aware callers should prefer to_json_with().
    fn is_multi_shaped(name: &str) -> bool {
        !matches!(name.to_lowercase().as_str(), "meta" | "name" | "location")
    }

    /// Schema-aware JSON rendering: multi-valued attributes are always arrays.
    pub fn to_json_with(&self, reg: &SchemaRegistry, rt: &ResourceType) -> Value {
        let mut value = self.to_json();
        if let Value::Object(obj) = &mut value {
            for schema in reg.schemas_for(rt) {
                Self::fix_shapes(obj, schema);
            }
        }
        value
    }

    fn fix_shapes(obj: &mut serde_json::Map<String, Value>, schema: &Schema) {
        for at in &schema.attributes {
            if let Some(v) = obj.get_mut(&at.name) {
                let is_array = v.is_array();
                if at.multi_valued && !is_array {
                    let taken = v.take();
                    *v = Value::Array(vec![taken]);
                } else if !at.multi_valued && is_array && at.data_type != AttributeType::Complex {
                    if let Value::Array(items) = v {
                        if items.len() == 1 {
                            *v = items.remove(0);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (SchemaRegistry, ResourceType) {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let rt = reg.resource_type("User").unwrap().clone();
        (reg, rt)
    }

    fn sample_user(reg: &SchemaRegistry, rt: &ResourceType) -> Resource {
        Resource::from_json(
            reg,
            rt,
            &json!({
                "schemas": ["urn:ietf:params:scim:schemas:core:2.0:User"],
                "userName": "bjensen@example.com",
                "displayName": "Babs Jensen",
                "emails": [
                    {"value": "bjensen@example.com", "type": "work", "primary": true},
                    {"value": "babs@jensen.org", "type": "home"}
                ]
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_values_at() {
        let (reg, rt) = setup();
        let res = sample_user(&reg, &rt);
        assert_eq!(
            res.values_at("username"),
            vec![AttrValue::String("bjensen@example.com".to_string())]
        );
        let emails = res.values_at("emails.value");
        assert_eq!(emails.len(), 2);
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let (reg, rt) = setup();
        let err = Resource::from_json(&reg, &rt, &json!({"bogus": 1})).unwrap_err();
        assert_eq!(err.scim_type(), "invalidSyntax");
    }

    #[test]
    fn test_multiple_primary_rejected() {
        let (reg, rt) = setup();
        let err = Resource::from_json(
            &reg,
            &rt,
            &json!({
                "userName": "x",
                "emails": [
                    {"value": "a@x", "primary": true},
                    {"value": "b@x", "primary": true}
                ]
            }),
        )
        .unwrap_err();
        assert_eq!(err.scim_type(), "invalidValue");
    }

    #[test]
    fn test_byte_codec_round_trip_and_determinism() {
        let (reg, rt) = setup();
        let mut res = sample_user(&reg, &rt);
        res.set_id("2819c223-7f76-453a-919d-413861904646");
        res.stamp_meta(1_463_494_754_000);

        let bytes = res.to_bytes().unwrap();
        let decoded = Resource::from_bytes(&bytes, "User").unwrap();
        assert_eq!(decoded, res);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_meta_stamping() {
        let (reg, rt) = setup();
        let mut res = sample_user(&reg, &rt);
        res.stamp_meta(1000);
        assert_eq!(res.meta_last_modified(), Some(1000));
        res.touch_meta(2000);
        assert_eq!(res.meta_last_modified(), Some(2000));
        let meta = res.get_attr("meta").unwrap().as_complex().unwrap();
        let version = meta.sub_ats[0].get("version").unwrap().first().unwrap();
        assert_eq!(version, &AttrValue::String("2000".to_string()));
    }

    #[test]
    fn test_remove_read_only_strips_id_meta_groups() {
        let (reg, rt) = setup();
        let mut res = Resource::from_json(
            &reg,
            &rt,
            &json!({
                "id": "should-go",
                "userName": "x",
                "groups": [{"value": "g1"}]
            }),
        )
        .unwrap();
        res.stamp_meta(1);
        res.remove_read_only(&reg, &rt);
        assert!(res.get_attr("id").is_none());
        assert!(res.get_attr("meta").is_none());
        assert!(res.get_attr("groups").is_none());
        assert!(res.get_attr("username").is_some());
    }

    #[test]
    fn test_extension_attrs_round_trip() {
        let (reg, rt) = setup();
        let res = Resource::from_json(
            &reg,
            &rt,
            &json!({
                "userName": "x",
                "urn:ietf:params:scim:schemas:extension:enterprise:2.0:User": {
                    "employeeNumber": "1", "organization": "kodiak"
                }
            }),
        )
        .unwrap();
        assert_eq!(
            res.values_at("employeenumber"),
            vec![AttrValue::String("1".to_string())]
        );
        assert!(res
            .schemas()
            .iter()
            .any(|s| s.contains("extension:enterprise")));

        let out = res.to_json_with(&reg, &rt);
        assert_eq!(
            out["urn:ietf:params:scim:schemas:extension:enterprise:2.0:User"]["employeeNumber"],
            json!("1")
        );
    }

    #[test]
    fn test_required_enforced() {
        let (reg, rt) = setup();
        let res = Resource::from_json(&reg, &rt, &json!({"displayName": "no username"})).unwrap();
        let err = res.check_required(&reg, &rt).unwrap_err();
        assert_eq!(err.scim_type(), "invalidValue");
    }

    #[test]
    fn test_multi_valued_json_shape() {
        let (reg, rt) = setup();
        let res = Resource::from_json(
            &reg,
            &rt,
            &json!({"userName": "x", "emails": [{"value": "a@x"}]}),
        )
        .unwrap();
        let out = res.to_json_with(&reg, &rt);
        assert!(out["emails"].is_array());
        assert_eq!(out["emails"][0]["value"], json!("a@x"));
    }
}
