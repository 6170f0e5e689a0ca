//! Property schemas and the binder that decodes Blueprints values onto
//! them.
//!
//! Module factories describe the properties they accept as one or more
//! [`PropertyReceiver`]s, each a field schema plus a bag of decoded
//! values. The binder walks a module call's named arguments and fills
//! exactly one receiver per name. Mutators reuse the same entry point to
//! bind synthesized property maps onto modules they create.

use std::sync::Arc;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::parser::{Pos, Property, Value};

/// The shape of a single property field.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    String,
    Bool,
    Int,
    StringList,
    Map(PropertySchema),
}

impl PropertyKind {
    fn describe(&self) -> &'static str {
        match self {
            PropertyKind::String => "a string",
            PropertyKind::Bool => "a bool",
            PropertyKind::Int => "an integer",
            PropertyKind::StringList => "a list of strings",
            PropertyKind::Map(_) => "a map",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    kind: PropertyKind,
    /// Machine-writable only: mutators may set it, Blueprints files may
    /// not.
    mutated: bool,
}

/// A declared field schema. Built once per module type and shared between
/// all instances.
#[derive(Debug, Clone, Default)]
pub struct PropertySchema {
    fields: IndexMap<SmolStr, FieldSpec>,
    /// Recognize OS sub-sections (`darwin`, `linux`, `windows`) and merge
    /// the one matching the configured OS after the generic section.
    os_sections: bool,
}

/// Names recognized as OS sub-sections when a schema opts in.
pub const OS_SECTION_NAMES: &[&str] = &["darwin", "linux", "windows"];

impl PropertySchema {
    pub fn builder() -> PropertySchemaBuilder {
        PropertySchemaBuilder {
            schema: PropertySchema::default(),
        }
    }

    fn field(&self, name: &str) -> Option<(&SmolStr, &FieldSpec)> {
        // Matching is case-insensitive on the first character, so a
        // Blueprints `srcs` finds a declared `Srcs` and vice versa.
        if let Some((_, key, spec)) = self.fields.get_full(name) {
            return Some((key, spec));
        }
        self.fields.iter().find(|(key, _)| {
            let mut k = key.chars();
            let mut n = name.chars();
            match (k.next(), n.next()) {
                (Some(kc), Some(nc)) => {
                    kc.to_lowercase().eq(nc.to_lowercase()) && k.as_str() == n.as_str()
                }
                _ => false,
            }
        })
    }
}

pub struct PropertySchemaBuilder {
    schema: PropertySchema,
}

impl PropertySchemaBuilder {
    fn add(mut self, name: &str, kind: PropertyKind, mutated: bool) -> Self {
        let prev = self
            .schema
            .fields
            .insert(SmolStr::new(name), FieldSpec { kind, mutated });
        if prev.is_some() {
            panic!("property {name} declared twice in one schema. This is a bug.");
        }
        self
    }

    pub fn string(self, name: &str) -> Self {
        self.add(name, PropertyKind::String, false)
    }

    pub fn bool(self, name: &str) -> Self {
        self.add(name, PropertyKind::Bool, false)
    }

    pub fn int(self, name: &str) -> Self {
        self.add(name, PropertyKind::Int, false)
    }

    pub fn string_list(self, name: &str) -> Self {
        self.add(name, PropertyKind::StringList, false)
    }

    pub fn map(self, name: &str, sub: PropertySchema) -> Self {
        self.add(name, PropertyKind::Map(sub), false)
    }

    /// Declare a machine-writable-only field.
    pub fn mutated(self, name: &str, kind: PropertyKind) -> Self {
        self.add(name, kind, true)
    }

    /// Recognize and merge OS sub-sections.
    pub fn os_sections(mut self) -> Self {
        self.schema.os_sections = true;
        self
    }

    pub fn build(self) -> Arc<PropertySchema> {
        Arc::new(self.schema)
    }
}

/// A decoded property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    String(String),
    Bool(bool),
    Int(i64),
    StringList(Vec<String>),
    Map(PropertyMap),
}

/// Decoded values keyed by field name, in schema declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    values: IndexMap<SmolStr, PropValue>,
}

impl PropertyMap {
    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.values.get(name)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            PropValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn string_list(&self, name: &str) -> &[String] {
        match self.values.get(name) {
            Some(PropValue::StringList(l)) => l,
            _ => &[],
        }
    }

    pub fn map(&self, name: &str) -> Option<&PropertyMap> {
        match self.values.get(name)? {
            PropValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &PropValue)> {
        self.values.iter()
    }
}

/// A schema plus the values bound onto it. Splitting a module into
/// variants deep-copies its receivers, so variants diverge freely.
#[derive(Debug, Clone)]
pub struct PropertyReceiver {
    schema: Arc<PropertySchema>,
    values: PropertyMap,
}

impl PropertyReceiver {
    pub fn new(schema: Arc<PropertySchema>) -> Self {
        Self {
            schema,
            values: PropertyMap::default(),
        }
    }

    pub fn values(&self) -> &PropertyMap {
        &self.values
    }

    /// Set a field programmatically. Unlike the binder this accepts
    /// `mutated` fields; it still rejects unknown names and wrong shapes.
    pub fn set(&mut self, name: &str, value: PropValue) -> Result<(), BindError> {
        let Some((key, spec)) = self.schema.field(name) else {
            return Err(BindError::UnknownProperty {
                file: SmolStr::default(),
                pos: Pos::default(),
                name: SmolStr::new(name),
            });
        };
        let matches = matches!(
            (&spec.kind, &value),
            (PropertyKind::String, PropValue::String(_))
                | (PropertyKind::Bool, PropValue::Bool(_))
                | (PropertyKind::Int, PropValue::Int(_))
                | (PropertyKind::StringList, PropValue::StringList(_))
                | (PropertyKind::Map(_), PropValue::Map(_))
        );
        if !matches {
            return Err(BindError::TypeMismatch {
                file: SmolStr::default(),
                pos: Pos::default(),
                name: SmolStr::new(name),
                expected: spec.kind.describe(),
                found: "a different shape",
            });
        }
        let key = key.clone();
        self.values.values.insert(key, value);
        Ok(())
    }
}

/// Errors produced while binding properties onto receivers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    #[error("{file}:{pos}: unrecognized property {name:?}")]
    UnknownProperty {
        file: SmolStr,
        pos: Pos,
        name: SmolStr,
    },

    #[error("{file}:{pos}: expected {expected} for property {name:?}, found {found}")]
    TypeMismatch {
        file: SmolStr,
        pos: Pos,
        name: SmolStr,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{file}:{pos}: property {name:?} already set at {prev}")]
    DuplicateProperty {
        file: SmolStr,
        pos: Pos,
        name: SmolStr,
        prev: Pos,
    },

    #[error("{file}:{pos}: property {name:?} cannot be set from a Blueprints file")]
    MutatedProperty {
        file: SmolStr,
        pos: Pos,
        name: SmolStr,
    },
}

/// Bind a module call's properties onto `receivers`.
///
/// `target_os` selects which OS sub-section (if any) is merged after the
/// generic section. Errors accumulate; every property that can bind does.
pub fn bind(
    receivers: &mut [PropertyReceiver],
    props: &[Property],
    file: &SmolStr,
    target_os: &str,
    errors: &mut Vec<BindError>,
) {
    let mut seen: IndexMap<SmolStr, Pos> = IndexMap::new();
    let mut sections: Vec<&Property> = Vec::new();

    for prop in props {
        if let Some(prev) = seen.get(&prop.name) {
            errors.push(BindError::DuplicateProperty {
                file: file.clone(),
                pos: prop.pos,
                name: prop.name.clone(),
                prev: *prev,
            });
            continue;
        }
        seen.insert(prop.name.clone(), prop.pos);

        if OS_SECTION_NAMES.contains(&prop.name.as_str())
            && receivers.iter().any(|r| r.schema.os_sections)
        {
            sections.push(prop);
            continue;
        }

        bind_one(receivers, prop, file, false, errors);
    }

    // OS sections merge after the generic section: scalars override,
    // lists append.
    for section in sections {
        if section.name != target_os {
            continue;
        }
        let Value::Map(_, inner) = &section.value else {
            errors.push(BindError::TypeMismatch {
                file: file.clone(),
                pos: section.value.pos(),
                name: section.name.clone(),
                expected: "a map",
                found: section.value.type_name(),
            });
            continue;
        };
        for prop in inner {
            bind_one(receivers, prop, file, true, errors);
        }
    }
}

fn bind_one(
    receivers: &mut [PropertyReceiver],
    prop: &Property,
    file: &SmolStr,
    merge: bool,
    errors: &mut Vec<BindError>,
) {
    for receiver in receivers.iter_mut() {
        let Some((key, spec)) = receiver.schema.field(&prop.name) else {
            continue;
        };
        if spec.mutated {
            errors.push(BindError::MutatedProperty {
                file: file.clone(),
                pos: prop.pos,
                name: prop.name.clone(),
            });
            return;
        }
        let key = key.clone();
        let kind = spec.kind.clone();
        match decode(&kind, &prop.value, &prop.name, file, errors) {
            Some(value) => {
                let slot = receiver.values.values.entry(key);
                use indexmap::map::Entry;
                match (slot, merge) {
                    (Entry::Occupied(mut e), true) => merge_value(e.get_mut(), value),
                    (Entry::Occupied(mut e), false) => {
                        e.insert(value);
                    }
                    (Entry::Vacant(e), _) => {
                        e.insert(value);
                    }
                }
            }
            None => {}
        }
        return;
    }

    errors.push(BindError::UnknownProperty {
        file: file.clone(),
        pos: prop.pos,
        name: prop.name.clone(),
    });
}

fn merge_value(into: &mut PropValue, from: PropValue) {
    match (into, from) {
        (PropValue::StringList(a), PropValue::StringList(b)) => a.extend(b),
        (PropValue::Map(a), PropValue::Map(b)) => {
            for (k, v) in b.values {
                match a.values.get_mut(&k) {
                    Some(slot) => merge_value(slot, v),
                    None => {
                        a.values.insert(k, v);
                    }
                }
            }
        }
        (into, from) => *into = from,
    }
}

fn decode(
    kind: &PropertyKind,
    value: &Value,
    name: &SmolStr,
    file: &SmolStr,
    errors: &mut Vec<BindError>,
) -> Option<PropValue> {
    let mismatch = |errors: &mut Vec<BindError>| {
        errors.push(BindError::TypeMismatch {
            file: file.clone(),
            pos: value.pos(),
            name: name.clone(),
            expected: kind.describe(),
            found: value.type_name(),
        });
        None
    };

    match (kind, value) {
        (PropertyKind::String, Value::String(_, s)) => Some(PropValue::String(s.clone())),
        (PropertyKind::Bool, Value::Bool(_, b)) => Some(PropValue::Bool(*b)),
        (PropertyKind::Int, Value::Int(_, i)) => Some(PropValue::Int(*i)),
        (PropertyKind::StringList, Value::List(_, elems)) => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match e {
                    Value::String(_, s) => out.push(s.clone()),
                    other => {
                        errors.push(BindError::TypeMismatch {
                            file: file.clone(),
                            pos: other.pos(),
                            name: name.clone(),
                            expected: "a string",
                            found: other.type_name(),
                        });
                        return None;
                    }
                }
            }
            Some(PropValue::StringList(out))
        }
        (PropertyKind::Map(sub), Value::Map(_, props)) => {
            let mut receiver = PropertyReceiver::new(Arc::new(sub.clone()));
            let before = errors.len();
            for prop in props {
                bind_one(std::slice::from_mut(&mut receiver), prop, file, false, errors);
            }
            (errors.len() == before).then(|| PropValue::Map(receiver.values))
        }
        _ => mismatch(errors),
    }
}

/// Convert a decoded value back into AST shape, for mutators that build
/// property maps programmatically from existing values.
pub fn to_value(value: &PropValue) -> Value {
    let pos = Pos::default();
    match value {
        PropValue::String(s) => Value::String(pos, s.clone()),
        PropValue::Bool(b) => Value::Bool(pos, *b),
        PropValue::Int(i) => Value::Int(pos, *i),
        PropValue::StringList(l) => Value::List(
            pos,
            l.iter().map(|s| Value::String(pos, s.clone())).collect(),
        ),
        PropValue::Map(m) => Value::Map(
            pos,
            m.values
                .iter()
                .map(|(k, v)| Property {
                    name: k.clone(),
                    pos,
                    value: to_value(v),
                })
                .collect(),
        ),
    }
}
