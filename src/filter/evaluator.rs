//! In-memory filter evaluation over decoded resources.
//!
//! The evaluator resolves each atom's path against the schema so that string
//! comparisons honor the attribute's `caseExact` setting and literals are
//! coerced to the attribute's declared type. An atom whose path does not
//! resolve, or whose operand cannot be coerced, simply matches nothing.

use std::cmp::Ordering;

use chrono::DateTime;

use crate::filter::{AttrPath, CompareOp, Filter, Literal};
use crate::resource::{Attribute, AttrValue, Resource, SubAttrMap};
use crate::schema::{AttributeDefinition, ResourceType, SchemaRegistry};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

/// Coerces a filter literal to the attribute's declared type.
pub fn coerce_literal(def: &AttributeDefinition, lit: &Literal) -> Option<AttrValue> {
    use crate::schema::AttributeType as T;
    match (def.data_type, lit) {
        (T::String, Literal::Str(s)) => Some(AttrValue::String(s.clone())),
        (T::Reference, Literal::Str(s)) => Some(AttrValue::Reference(s.clone())),
        (T::DateTime, Literal::Str(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| AttrValue::DateTime(dt.timestamp_millis())),
        (T::Binary, Literal::Str(s)) => B64.decode(s).ok().map(AttrValue::Binary),
        (T::Integer, Literal::Int(i)) => Some(AttrValue::Integer(*i)),
        (T::Decimal, Literal::Int(i)) => Some(AttrValue::Decimal(*i as f64)),
        (T::Decimal, Literal::Decimal(f)) => Some(AttrValue::Decimal(*f)),
        (T::Integer, Literal::Decimal(f)) if f.fract() == 0.0 => {
            Some(AttrValue::Integer(*f as i64))
        }
        (T::Boolean, Literal::Bool(b)) => Some(AttrValue::Boolean(*b)),
        _ => None,
    }
}

/// Evaluates filters against resources of one resource type.
pub struct Evaluator<'a> {
    reg: &'a SchemaRegistry,
    rt: &'a ResourceType,
}

impl<'a> Evaluator<'a> {
    pub fn new(reg: &'a SchemaRegistry, rt: &'a ResourceType) -> Self {
        Self { reg, rt }
    }

    /// True when the resource satisfies the filter.
    pub fn evaluate(&self, filter: &Filter, res: &Resource) -> bool {
        match filter {
            Filter::And(a, b) => self.evaluate(a, res) && self.evaluate(b, res),
            Filter::Or(a, b) => self.evaluate(a, res) || self.evaluate(b, res),
            Filter::Not(inner) => !self.evaluate(inner, res),
            Filter::Present { path } => self.present(path, res),
            Filter::Compare { path, op, value } => self.compare(path, *op, value, res),
            Filter::ValuePath { path, filter } => {
                let Ok(bound) = self.reg.resolve(self.rt, &path.to_string()) else {
                    return false;
                };
                if !bound.def.is_complex() {
                    return false;
                }
                match res.get_attr(&path.attr) {
                    Some(Attribute::Complex(ca)) => ca
                        .sub_ats
                        .iter()
                        .any(|entry| self.matches_entry(filter, bound.def, entry)),
                    _ => false,
                }
            }
        }
    }

    /// Evaluates a selector filter against one entry of a multi-valued
    /// complex attribute. Atom paths are sub-attribute names of the parent.
    pub fn matches_entry(
        &self,
        filter: &Filter,
        parent: &AttributeDefinition,
        entry: &SubAttrMap,
    ) -> bool {
        match filter {
            Filter::And(a, b) => {
                self.matches_entry(a, parent, entry) && self.matches_entry(b, parent, entry)
            }
            Filter::Or(a, b) => {
                self.matches_entry(a, parent, entry) || self.matches_entry(b, parent, entry)
            }
            Filter::Not(inner) => !self.matches_entry(inner, parent, entry),
            Filter::Present { path } => {
                if path.sub.is_some() {
                    return false;
                }
                entry
                    .get(&path.attr)
                    .map(|sa| !sa.values.is_empty())
                    .unwrap_or(false)
            }
            Filter::Compare { path, op, value } => {
                if path.sub.is_some() {
                    return false;
                }
                let Some(sub_def) = parent.sub_attribute(&path.attr) else {
                    return false;
                };
                let Some(operand) = coerce_literal(sub_def, value) else {
                    return false;
                };
                let values: Vec<AttrValue> = entry
                    .get(&path.attr)
                    .map(|sa| sa.values.clone())
                    .unwrap_or_default();
                apply_op(&values, *op, &operand, sub_def.case_exact)
            }
            Filter::ValuePath { .. } => false,
        }
    }

    fn present(&self, path: &AttrPath, res: &Resource) -> bool {
        let Ok(bound) = self.reg.resolve(self.rt, &path.to_string()) else {
            return false;
        };
        if bound.def.is_complex() && path.sub.is_none() {
            return matches!(res.get_attr(&path.attr),
                Some(Attribute::Complex(ca)) if !ca.sub_ats.is_empty());
        }
        !res.values_at(&path.bare()).is_empty()
    }

    fn compare(&self, path: &AttrPath, op: CompareOp, lit: &Literal, res: &Resource) -> bool {
        let Ok(bound) = self.reg.resolve(self.rt, &path.to_string()) else {
            return false;
        };
        // Comparing a complex attribute directly targets its "value"
        // sub-attribute, per RFC 7644.
        let (def, lookup) = if bound.def.is_complex() && path.sub.is_none() {
            match bound.def.sub_attribute("value") {
                Some(value_def) => (value_def, format!("{}.value", path.attr)),
                None => return false,
            }
        } else {
            (bound.def, path.bare())
        };
        let Some(operand) = coerce_literal(def, lit) else {
            return false;
        };
        apply_op(&res.values_at(&lookup), op, &operand, def.case_exact)
    }
}

fn apply_op(values: &[AttrValue], op: CompareOp, operand: &AttrValue, case_exact: bool) -> bool {
    match op {
        CompareOp::Eq => values.iter().any(|v| v.matches(operand, case_exact)),
        // `ne` holds only for attributes that are present with a different
        // value; an absent attribute matches neither `eq` nor `ne`.
        CompareOp::Ne => {
            !values.is_empty() && !values.iter().any(|v| v.matches(operand, case_exact))
        }
        CompareOp::Co | CompareOp::Sw | CompareOp::Ew => {
            let Some(needle) = operand.as_str() else {
                return false;
            };
            let needle = if case_exact {
                needle.to_string()
            } else {
                needle.to_lowercase()
            };
            values.iter().any(|v| {
                let Some(hay) = v.as_str() else { return false };
                let hay = if case_exact {
                    hay.to_string()
                } else {
                    hay.to_lowercase()
                };
                match op {
                    CompareOp::Co => hay.contains(&needle),
                    CompareOp::Sw => hay.starts_with(&needle),
                    CompareOp::Ew => hay.ends_with(&needle),
                    _ => unreachable!(),
                }
            })
        }
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => values.iter().any(|v| {
            match v.compare(operand, case_exact) {
                Some(Ordering::Greater) => matches!(op, CompareOp::Gt | CompareOp::Ge),
                Some(Ordering::Equal) => matches!(op, CompareOp::Ge | CompareOp::Le),
                Some(Ordering::Less) => matches!(op, CompareOp::Lt | CompareOp::Le),
                None => false,
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parse_filter;
    use serde_json::json;

    fn user(reg: &SchemaRegistry) -> Resource {
        let rt = reg.resource_type("User").unwrap();
        Resource::from_json(
            reg,
            rt,
            &json!({
                "userName": "bjensen@example.com",
                "displayName": "Babs Jensen",
                "active": true,
                "emails": [
                    {"value": "bjensen@Example.com", "type": "work", "primary": true},
                    {"value": "babs@jensen.org", "type": "home"}
                ]
            }),
        )
        .unwrap()
    }

    fn eval(reg: &SchemaRegistry, filter: &str, res: &Resource) -> bool {
        let rt = reg.resource_type("User").unwrap();
        let f = parse_filter(filter).unwrap();
        Evaluator::new(reg, rt).evaluate(&f, res)
    }

    #[test]
    fn test_eq_is_case_insensitive_by_default() {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let res = user(&reg);
        assert!(eval(&reg, r#"userName eq "BJENSEN@example.com""#, &res));
        assert!(!eval(&reg, r#"userName eq "other""#, &res));
    }

    #[test]
    fn test_sub_attribute_and_operators() {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let res = user(&reg);
        assert!(eval(&reg, r#"emails.value co "jensen""#, &res));
        assert!(eval(&reg, r#"userName sw "bjensen""#, &res));
        assert!(eval(&reg, r#"userName ew ".com""#, &res));
        assert!(eval(&reg, r#"active eq true"#, &res));
    }

    #[test]
    fn test_present_and_combinators() {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let res = user(&reg);
        assert!(eval(&reg, "emails pr", &res));
        assert!(!eval(&reg, "externalId pr", &res));
        assert!(eval(&reg, r#"emails pr and userName sw "b""#, &res));
        assert!(eval(&reg, r#"externalId pr or emails pr"#, &res));
        assert!(eval(&reg, r#"not (externalId pr)"#, &res));
    }

    #[test]
    fn test_ne_requires_presence() {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let res = user(&reg);
        assert!(eval(&reg, r#"userName ne "other""#, &res));
        assert!(!eval(&reg, r#"userName ne "bjensen@example.com""#, &res));
        // Absent attribute: neither eq nor ne matches.
        assert!(!eval(&reg, r#"externalId ne "x""#, &res));
    }

    #[test]
    fn test_value_path_filter() {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let res = user(&reg);
        assert!(eval(&reg, r#"emails[type eq "work" and primary eq true]"#, &res));
        assert!(!eval(&reg, r#"emails[type eq "work" and primary eq false]"#, &res));
    }

    #[test]
    fn test_complex_compare_targets_value_sub() {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let res = user(&reg);
        assert!(eval(&reg, r#"emails eq "babs@jensen.org""#, &res));
    }

    #[test]
    fn test_unresolvable_path_matches_nothing() {
        let reg = SchemaRegistry::with_embedded().unwrap();
        let res = user(&reg);
        assert!(!eval(&reg, r#"bogus eq "x""#, &res));
    }
}
