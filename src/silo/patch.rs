//! RFC 7644 PATCH: request parsing and the apply engine.
//!
//! [`PatchRequest::from_json`] validates operations up front — operation
//! names, path syntax, schema resolution, selector sub-attributes and operand
//! types — so a malformed request never reaches a write transaction.
//! [`PatchEngine::apply`] then mutates the attribute tree; the silo decides
//! afterwards, by comparing encodings, whether anything actually changed.

use serde_json::Value;

use crate::error::{ScimError, ScimResult};
use crate::filter::evaluator::{coerce_literal, Evaluator};
use crate::filter::{parse_path, Filter, PatchPath};
use crate::resource::{Attribute, AttrValue, ComplexAttr, Resource, SimpleAttr};
use crate::schema::{AttributeDefinition, Mutability, ResourceType, SchemaRegistry};

/// One of `add`, `replace`, `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOpKind {
    Add,
    Replace,
    Remove,
}

/// A single validated patch operation.
#[derive(Debug, Clone)]
pub struct PatchOperation {
    pub op: PatchOpKind,
    pub path: Option<PatchPath>,
    pub value: Option<Value>,
}

/// A validated patch request.
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub operations: Vec<PatchOperation>,
}

impl PatchRequest {
    /// Parses and validates a PATCH body against the resource type.
    pub fn from_json(reg: &SchemaRegistry, rt: &ResourceType, data: &Value) -> ScimResult<Self> {
        let obj = data
            .as_object()
            .ok_or_else(|| ScimError::invalid_syntax("patch request must be a JSON object"))?;
        let ops = obj
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("operations"))
            .map(|(_, v)| v)
            .and_then(Value::as_array)
            .ok_or_else(|| ScimError::invalid_syntax("patch request must carry Operations"))?;

        let mut operations = Vec::with_capacity(ops.len());
        for op_value in ops {
            operations.push(Self::parse_operation(reg, rt, op_value)?);
        }
        if operations.is_empty() {
            return Err(ScimError::invalid_syntax("Operations must not be empty"));
        }
        Ok(Self { operations })
    }

    fn parse_operation(
        reg: &SchemaRegistry,
        rt: &ResourceType,
        data: &Value,
    ) -> ScimResult<PatchOperation> {
        let obj = data
            .as_object()
            .ok_or_else(|| ScimError::invalid_syntax("patch operation must be an object"))?;

        let op_name = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| ScimError::invalid_syntax("patch operation requires op"))?;
        let op = match op_name.to_lowercase().as_str() {
            "add" => PatchOpKind::Add,
            "replace" => PatchOpKind::Replace,
            "remove" => PatchOpKind::Remove,
            other => {
                return Err(ScimError::invalid_syntax(format!(
                    "unsupported patch operation {}",
                    other
                )));
            }
        };

        let path = match obj.get("path") {
            Some(Value::String(p)) => {
                let parsed = parse_path(p)?;
                Self::validate_path(reg, rt, &parsed, op)?;
                Some(parsed)
            }
            Some(_) => return Err(ScimError::invalid_path("path must be a string")),
            None => None,
        };

        let value = match obj.get("value") {
            Some(Value::Null) | None => None,
            Some(v) => Some(v.clone()),
        };

        match op {
            PatchOpKind::Remove => {
                if path.is_none() {
                    return Err(ScimError::no_target("remove requires a path"));
                }
            }
            PatchOpKind::Add | PatchOpKind::Replace => {
                if value.is_none() {
                    return Err(ScimError::invalid_value(format!(
                        "{} requires a value",
                        op_name
                    )));
                }
            }
        }

        Ok(PatchOperation { op, path, value })
    }

    /// Binds the path against the schema: the attribute must exist and be
    /// writable, selector atoms must name typed sub-attributes, and a
    /// trailing sub-attribute must exist on the parent.
    fn validate_path(
        reg: &SchemaRegistry,
        rt: &ResourceType,
        path: &PatchPath,
        op: PatchOpKind,
    ) -> ScimResult<()> {
        let bound = reg.resolve(rt, &path.binder_path())?;
        reg.check_writable(rt, &path.binder_path())?;
        if bound.def.mutability == Mutability::Immutable && op != PatchOpKind::Add {
            return Err(ScimError::mutability(format!(
                "attribute {} is immutable",
                path.bare()
            )));
        }

        if let Some(selector) = &path.selector {
            if !bound.def.is_complex() || !bound.def.multi_valued {
                return Err(ScimError::invalid_path(format!(
                    "selector on {} requires a multi-valued complex attribute",
                    path.attr
                )));
            }
            Self::validate_selector(bound.def, selector)?;
            if let Some(sub) = &path.sub {
                let sub_def = bound.def.sub_attribute(sub).ok_or_else(|| {
                    ScimError::invalid_path(format!("unknown sub-attribute {}.{}", path.attr, sub))
                })?;
                if sub_def.is_read_only() {
                    return Err(ScimError::mutability(format!(
                        "attribute {}.{} is readOnly",
                        path.attr, sub
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_selector(parent: &AttributeDefinition, filter: &Filter) -> ScimResult<()> {
        match filter {
            Filter::And(a, b) | Filter::Or(a, b) => {
                Self::validate_selector(parent, a)?;
                Self::validate_selector(parent, b)
            }
            Filter::Not(inner) => Self::validate_selector(parent, inner),
            Filter::Present { path } => {
                if path.sub.is_some() || parent.sub_attribute(&path.attr).is_none() {
                    return Err(ScimError::invalid_path(format!(
                        "unknown sub-attribute {}.{}",
                        parent.name, path.attr
                    )));
                }
                Ok(())
            }
            Filter::Compare { path, value, .. } => {
                if path.sub.is_some() {
                    return Err(ScimError::invalid_path(
                        "selector atoms must name sub-attributes directly",
                    ));
                }
                let sub_def = parent.sub_attribute(&path.attr).ok_or_else(|| {
                    ScimError::invalid_path(format!(
                        "unknown sub-attribute {}.{}",
                        parent.name, path.attr
                    ))
                })?;
                coerce_literal(sub_def, value).map(|_| ()).ok_or_else(|| {
                    ScimError::invalid_path(format!(
                        "operand does not match the type of {}.{}",
                        parent.name, path.attr
                    ))
                })
            }
            Filter::ValuePath { .. } => Err(ScimError::invalid_path(
                "nested selectors are not supported",
            )),
        }
    }
}

/// Applies validated patch operations to an attribute tree.
pub struct PatchEngine<'a> {
    reg: &'a SchemaRegistry,
    rt: &'a ResourceType,
}

impl<'a> PatchEngine<'a> {
    pub fn new(reg: &'a SchemaRegistry, rt: &'a ResourceType) -> Self {
        Self { reg, rt }
    }

    /// Applies every operation in order; the first failure aborts the whole
    /// request.
    pub fn apply(&self, res: &mut Resource, req: &PatchRequest) -> ScimResult<()> {
        for op in &req.operations {
            match op.op {
                PatchOpKind::Add => self.apply_add(res, op.path.as_ref(), value_of(op)?)?,
                PatchOpKind::Replace => self.apply_replace(res, op.path.as_ref(), value_of(op)?)?,
                PatchOpKind::Remove => {
                    let path = op
                        .path
                        .as_ref()
                        .ok_or_else(|| ScimError::no_target("remove requires a path"))?;
                    self.apply_remove(res, path)?;
                }
            }
            res.check_primary_flags()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // add
    // ------------------------------------------------------------------

    fn apply_add(&self, res: &mut Resource, path: Option<&PatchPath>, value: &Value) -> ScimResult<()> {
        let Some(path) = path else {
            return self.merge_root(res, value, PatchOpKind::Add);
        };

        if let Some(selector) = &path.selector {
            return self.apply_selected(res, path, selector, value, PatchOpKind::Add);
        }

        let bound = self.reg.resolve(self.rt, &path.binder_path())?;
        let urn = self.extension_urn(bound.schema);
        match &path.sub {
            Some(sub) => self.set_sub_everywhere(res, urn, bound.def, sub, value),
            None => self.merge_attr(res, urn, bound.def, value, PatchOpKind::Add),
        }
    }

    // ------------------------------------------------------------------
    // replace
    // ------------------------------------------------------------------

    fn apply_replace(
        &self,
        res: &mut Resource,
        path: Option<&PatchPath>,
        value: &Value,
    ) -> ScimResult<()> {
        let Some(path) = path else {
            return self.merge_root(res, value, PatchOpKind::Replace);
        };

        if let Some(selector) = &path.selector {
            return self.apply_selected(res, path, selector, value, PatchOpKind::Replace);
        }

        let bound = self.reg.resolve(self.rt, &path.binder_path())?;
        let urn = self.extension_urn(bound.schema);
        match &path.sub {
            Some(sub) => self.set_sub_everywhere(res, urn, bound.def, sub, value),
            None => self.merge_attr(res, urn, bound.def, value, PatchOpKind::Replace),
        }
    }

    // ------------------------------------------------------------------
    // remove
    // ------------------------------------------------------------------

    fn apply_remove(&self, res: &mut Resource, path: &PatchPath) -> ScimResult<()> {
        let bound = self.reg.resolve(self.rt, &path.binder_path())?;

        if let Some(selector) = &path.selector {
            let parent_def = bound.def;
            let evaluator = Evaluator::new(self.reg, self.rt);
            let Some(Attribute::Complex(ca)) = res.get_attr_mut(&path.attr) else {
                return Err(ScimError::no_target(format!(
                    "no entries of {} match the selector",
                    path.attr
                )));
            };
            let matched: Vec<usize> = ca
                .sub_ats
                .iter()
                .enumerate()
                .filter(|(_, entry)| evaluator.matches_entry(selector, parent_def, entry))
                .map(|(i, _)| i)
                .collect();
            if matched.is_empty() {
                return Err(ScimError::no_target(format!(
                    "no entries of {} match the selector",
                    path.attr
                )));
            }
            match &path.sub {
                Some(sub) => {
                    for &i in &matched {
                        ca.sub_ats[i].remove(sub.as_str());
                    }
                    ca.sub_ats.retain(|entry| !entry.is_empty());
                }
                None => remove_indices(&mut ca.sub_ats, &matched),
            }
            let now_empty = ca.sub_ats.is_empty();
            if now_empty {
                res.remove_attr(&path.attr);
            }
            return Ok(());
        }

        match &path.sub {
            Some(sub) => {
                let mut now_empty = false;
                if let Some(Attribute::Complex(ca)) = res.get_attr_mut(&path.attr) {
                    for entry in ca.sub_ats.iter_mut() {
                        entry.remove(sub.as_str());
                    }
                    ca.sub_ats.retain(|entry| !entry.is_empty());
                    now_empty = ca.sub_ats.is_empty();
                }
                if now_empty {
                    res.remove_attr(&path.attr);
                }
                Ok(())
            }
            None => {
                if bound.def.required {
                    return Err(ScimError::invalid_value(format!(
                        "cannot remove required attribute {}",
                        path.attr
                    )));
                }
                res.remove_attr(&path.attr);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // shared pieces
    // ------------------------------------------------------------------

    /// Path-less add/replace: every top-level key of the value object is a
    /// sub-path. An array at the root is rejected.
    fn merge_root(&self, res: &mut Resource, value: &Value, op: PatchOpKind) -> ScimResult<()> {
        let obj = value.as_object().ok_or_else(|| {
            ScimError::invalid_syntax("a path-less patch value must be a JSON object")
        })?;

        for (key, sub_value) in obj {
            // Extension-URN keys carry a nested object of that schema's
            // attributes; the URN is recorded in `schemas`.
            if let Some(ext) = self
                .rt
                .schema_extensions
                .iter()
                .find(|e| e.schema.eq_ignore_ascii_case(key))
            {
                let schema = self.reg.schema(&ext.schema).ok_or_else(|| {
                    ScimError::internal(format!("unregistered schema {}", ext.schema))
                })?;
                let ext_obj = sub_value.as_object().ok_or_else(|| {
                    ScimError::invalid_syntax(format!("extension {} must be an object", key))
                })?;
                for (name, v) in ext_obj {
                    let def = schema.attribute(name).ok_or_else(|| {
                        ScimError::invalid_syntax(format!("unknown attribute {}:{}", key, name))
                    })?;
                    self.check_def_writable(def, name)?;
                    self.merge_attr(res, Some(&schema.id), def, v, op)?;
                }
                continue;
            }

            let bound = self
                .reg
                .resolve(self.rt, key)
                .map_err(|_| ScimError::invalid_path(format!("unknown attribute {}", key)))?;
            self.reg.check_writable(self.rt, key)?;
            let urn = self.extension_urn(bound.schema);
            match bound.parent {
                // A dotted key such as "location.latitude".
                Some(parent_def) => {
                    let sub = bound.def.name.to_lowercase();
                    self.set_sub_everywhere(res, urn, parent_def, &sub, sub_value)?;
                }
                None => self.merge_attr(res, urn, bound.def, sub_value, op)?,
            }
        }
        Ok(())
    }

    /// Merges a value into one top-level attribute.
    fn merge_attr(
        &self,
        res: &mut Resource,
        urn: Option<&str>,
        def: &AttributeDefinition,
        value: &Value,
        op: PatchOpKind,
    ) -> ScimResult<()> {
        if def.is_complex() {
            if def.multi_valued {
                return self.merge_complex_multi(res, urn, def, value, op);
            }
            // Singular complex: replace overwrites the map, add merges keys.
            if op == PatchOpKind::Replace {
                let attr = Resource::parse_attribute(def, value)?;
                res.set_attr(urn, attr);
                return Ok(());
            }
            let incoming = Resource::parse_sub_map(def, value)?;
            match res.get_attr_mut(&def.name.to_lowercase()) {
                Some(Attribute::Complex(ca)) if !ca.sub_ats.is_empty() => {
                    for (k, sa) in incoming {
                        ca.sub_ats[0].insert(k, sa);
                    }
                }
                _ => {
                    let mut ca = ComplexAttr::new(def.name.clone());
                    ca.sub_ats.push(incoming);
                    res.set_attr(urn, Attribute::Complex(ca));
                }
            }
            return Ok(());
        }

        if def.multi_valued && op == PatchOpKind::Add {
            // Append, skipping values already present.
            let new_values = parse_scalars(def, value)?;
            match res.get_attr_mut(&def.name.to_lowercase()) {
                Some(Attribute::Simple(sa)) => {
                    for v in new_values {
                        if !sa.values.iter().any(|e| e.matches(&v, def.case_exact)) {
                            sa.values.push(v);
                        }
                    }
                }
                _ => {
                    res.set_attr(
                        urn,
                        Attribute::Simple(SimpleAttr {
                            name: def.name.clone(),
                            values: new_values,
                        }),
                    );
                }
            }
            return Ok(());
        }

        // Singular simple attributes, and replace on multi-valued ones,
        // overwrite.
        let attr = Resource::parse_attribute(def, value)?;
        res.set_attr(urn, attr);
        Ok(())
    }

    /// Appends entries to a multi-valued complex attribute (add) or replaces
    /// the whole list (replace), keeping a single primary entry.
    fn merge_complex_multi(
        &self,
        res: &mut Resource,
        urn: Option<&str>,
        def: &AttributeDefinition,
        value: &Value,
        op: PatchOpKind,
    ) -> ScimResult<()> {
        let parsed = Resource::parse_attribute(def, value)?;
        let incoming = match parsed {
            Attribute::Complex(ca) => ca,
            Attribute::Simple(_) => {
                return Err(ScimError::internal(format!(
                    "attribute {} parsed without sub-attributes",
                    def.name
                )));
            }
        };
        if incoming.primary_count() > 1 {
            return Err(ScimError::invalid_value(format!(
                "attribute {} has more than one primary value",
                def.name
            )));
        }

        if op == PatchOpKind::Replace {
            res.set_attr(urn, Attribute::Complex(incoming));
            return Ok(());
        }

        match res.get_attr_mut(&def.name.to_lowercase()) {
            Some(Attribute::Complex(ca)) => {
                let first_new = ca.sub_ats.len();
                ca.sub_ats.extend(incoming.sub_ats);
                let new_primary = (first_new..ca.sub_ats.len())
                    .find(|&i| entry_is_primary(&ca.sub_ats[i]));
                if let Some(idx) = new_primary {
                    ca.clear_primary_except(idx);
                }
            }
            _ => {
                res.set_attr(urn, Attribute::Complex(incoming));
            }
        }
        Ok(())
    }

    /// add/replace on `attr[selector]` or `attr[selector].sub`: only existing
    /// matching entries are updated; no match is a `noTarget` error.
    fn apply_selected(
        &self,
        res: &mut Resource,
        path: &PatchPath,
        selector: &Filter,
        value: &Value,
        op: PatchOpKind,
    ) -> ScimResult<()> {
        let bound = self.reg.resolve(self.rt, &path.binder_path())?;
        let parent_def = bound.def;
        let evaluator = Evaluator::new(self.reg, self.rt);

        let Some(Attribute::Complex(ca)) = res.get_attr_mut(&path.attr) else {
            return Err(ScimError::no_target(format!(
                "no entries of {} match the selector",
                path.attr
            )));
        };
        let matched: Vec<usize> = ca
            .sub_ats
            .iter()
            .enumerate()
            .filter(|(_, entry)| evaluator.matches_entry(selector, parent_def, entry))
            .map(|(i, _)| i)
            .collect();
        if matched.is_empty() {
            return Err(ScimError::no_target(format!(
                "no entries of {} match the selector",
                path.attr
            )));
        }

        match &path.sub {
            Some(sub) => {
                let sub_def = parent_def.sub_attribute(sub).ok_or_else(|| {
                    ScimError::invalid_path(format!("unknown sub-attribute {}.{}", path.attr, sub))
                })?;
                let values = parse_scalars(sub_def, value)?;
                for &i in &matched {
                    ca.sub_ats[i].insert(
                        sub.clone(),
                        SimpleAttr {
                            name: sub_def.name.clone(),
                            values: values.clone(),
                        },
                    );
                }
                // Granting primary to the matched entries revokes it
                // elsewhere.
                if sub == "primary" && values.first().and_then(AttrValue::as_bool) == Some(true) {
                    if matched.len() > 1 {
                        return Err(ScimError::invalid_value(format!(
                            "attribute {} has more than one primary value",
                            path.attr
                        )));
                    }
                    ca.clear_primary_except(matched[0]);
                }
            }
            None => {
                if op == PatchOpKind::Replace {
                    // All matching entries are replaced wholesale by the
                    // single new entry.
                    let entry = Resource::parse_sub_map(parent_def, value)?;
                    remove_indices(&mut ca.sub_ats, &matched);
                    ca.sub_ats.push(entry);
                    let last = ca.sub_ats.len() - 1;
                    if entry_is_primary(&ca.sub_ats[last]) {
                        ca.clear_primary_except(last);
                    }
                } else {
                    let incoming = Resource::parse_sub_map(parent_def, value)?;
                    for &i in &matched {
                        for (k, sa) in incoming.clone() {
                            ca.sub_ats[i].insert(k, sa);
                        }
                    }
                    let turned_primary: Vec<usize> = matched
                        .iter()
                        .copied()
                        .filter(|&i| entry_is_primary(&ca.sub_ats[i]))
                        .collect();
                    if turned_primary.len() == 1 && incoming.contains_key("primary") {
                        ca.clear_primary_except(turned_primary[0]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Sets `attr.sub` on the single entry of a singular complex attribute,
    /// or on every entry of a multi-valued one.
    fn set_sub_everywhere(
        &self,
        res: &mut Resource,
        urn: Option<&str>,
        parent_def: &AttributeDefinition,
        sub: &str,
        value: &Value,
    ) -> ScimResult<()> {
        let sub_def = parent_def.sub_attribute(sub).ok_or_else(|| {
            ScimError::invalid_path(format!(
                "unknown sub-attribute {}.{}",
                parent_def.name, sub
            ))
        })?;
        let values = parse_scalars(sub_def, value)?;
        let sa = SimpleAttr {
            name: sub_def.name.clone(),
            values,
        };

        match res.get_attr_mut(&parent_def.name.to_lowercase()) {
            Some(Attribute::Complex(ca)) if !ca.sub_ats.is_empty() => {
                for entry in ca.sub_ats.iter_mut() {
                    entry.insert(sub.to_string(), sa.clone());
                }
            }
            _ => {
                let mut ca = ComplexAttr::new(parent_def.name.clone());
                let mut entry = crate::resource::SubAttrMap::new();
                entry.insert(sub.to_string(), sa);
                ca.sub_ats.push(entry);
                res.set_attr(urn, Attribute::Complex(ca));
            }
        }
        Ok(())
    }

    fn extension_urn<'s>(&self, schema: &'s str) -> Option<&'s str> {
        if schema == self.rt.schema {
            None
        } else {
            Some(schema)
        }
    }

    fn check_def_writable(&self, def: &AttributeDefinition, name: &str) -> ScimResult<()> {
        if def.is_read_only() {
            return Err(ScimError::mutability(format!(
                "attribute {} is readOnly",
                name
            )));
        }
        Ok(())
    }
}

fn value_of(op: &PatchOperation) -> ScimResult<&Value> {
    op.value
        .as_ref()
        .ok_or_else(|| ScimError::invalid_value("operation requires a value"))
}

/// Drops the entries at the given ascending indices.
fn remove_indices(list: &mut Vec<crate::resource::SubAttrMap>, indices: &[usize]) {
    let mut i = 0usize;
    list.retain(|_| {
        let drop = indices.contains(&i);
        i += 1;
        !drop
    });
}

fn entry_is_primary(entry: &crate::resource::SubAttrMap) -> bool {
    entry
        .get("primary")
        .and_then(|sa| sa.first())
        .and_then(AttrValue::as_bool)
        .unwrap_or(false)
}

/// Parses a scalar or array-of-scalars value against a simple definition.
fn parse_scalars(def: &AttributeDefinition, value: &Value) -> ScimResult<Vec<AttrValue>> {
    match value {
        Value::Array(items) => {
            if !def.multi_valued && items.len() > 1 {
                return Err(ScimError::invalid_value(format!(
                    "attribute {} is single-valued",
                    def.name
                )));
            }
            items
                .iter()
                .map(|v| AttrValue::from_json(def.data_type, v))
                .collect()
        }
        _ => Ok(vec![AttrValue::from_json(def.data_type, value)?]),
    }
}
