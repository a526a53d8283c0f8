use std::panic::Location;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::error::{OdmError, Result};
use super::path::{self, FieldMap};

/// Reserved document identity field.
pub const ID_FIELD: &str = "_id";
/// Reserved version-marker field, present when a schema is versioned.
pub const VERSION_FIELD: &str = "__v";
/// Timestamp fields maintained when a schema enables timestamps.
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

/// True for paths the engine owns and application code must not write.
pub fn is_reserved(path: &str) -> bool {
    path == ID_FIELD || path == VERSION_FIELD
}

static ANY_TYPE: FieldType = FieldType::Any;

/// Declared type of a document field.
///
/// Every setter routes raw values through [`FieldType::cast`] before the
/// change tracker records them, so tracked payloads are always store-ready.
#[derive(Debug, Clone)]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// RFC 3339 timestamp, normalized on cast.
    DateTime,
    /// Document identifier (UUID), normalized to hyphenated lowercase.
    Id,
    Array(Box<FieldType>),
    Object(Schema),
    /// Identifier referencing a document in the named collection.
    Ref(String),
    /// No casting; value stored as given.
    Any,
}

/// A failed coercion: the expected type and the relative sub-path at which
/// casting failed (empty when the failure is at the addressed path itself).
#[derive(Debug)]
pub struct CastFailure {
    pub expected: String,
    pub at: String,
}

impl CastFailure {
    fn here(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
            at: String::new(),
        }
    }

    fn nested(self, segment: &str) -> Self {
        let at = if self.at.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", segment, self.at)
        };
        Self {
            expected: self.expected,
            at,
        }
    }
}

impl FieldType {
    pub fn type_name(&self) -> String {
        match self {
            FieldType::String => "String".into(),
            FieldType::Int => "Int".into(),
            FieldType::Float => "Float".into(),
            FieldType::Bool => "Bool".into(),
            FieldType::DateTime => "DateTime".into(),
            FieldType::Id => "Id".into(),
            FieldType::Array(inner) => format!("Array<{}>", inner.type_name()),
            FieldType::Object(_) => "Object".into(),
            FieldType::Ref(collection) => format!("Ref<{}>", collection),
            FieldType::Any => "Any".into(),
        }
    }

    /// Coerce `value` to this type.
    ///
    /// Null always passes; requiredness is a validation concern, not a cast
    /// concern. A scalar given for an array field is wrapped into a
    /// one-element array.
    pub fn cast(&self, value: Value) -> std::result::Result<Value, CastFailure> {
        if value.is_null() {
            return Ok(value);
        }
        match self {
            FieldType::Any => Ok(value),

            FieldType::String => match value {
                Value::String(_) => Ok(value),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(CastFailure::here(self.type_name())),
            },

            FieldType::Int => match &value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(i))
                    } else if let Some(f) = n.as_f64() {
                        if f.fract() == 0.0 && f.is_finite() {
                            Ok(Value::from(f as i64))
                        } else {
                            Err(CastFailure::here(self.type_name()))
                        }
                    } else {
                        Err(CastFailure::here(self.type_name()))
                    }
                }
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| CastFailure::here(self.type_name())),
                _ => Err(CastFailure::here(self.type_name())),
            },

            FieldType::Float => match &value {
                Value::Number(n) => n
                    .as_f64()
                    .map(Value::from)
                    .ok_or_else(|| CastFailure::here(self.type_name())),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| CastFailure::here(self.type_name())),
                _ => Err(CastFailure::here(self.type_name())),
            },

            FieldType::Bool => match &value {
                Value::Bool(_) => Ok(value),
                Value::String(s) => match s.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(CastFailure::here(self.type_name())),
                },
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(CastFailure::here(self.type_name())),
                },
                _ => Err(CastFailure::here(self.type_name())),
            },

            FieldType::DateTime => match &value {
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| Value::String(dt.with_timezone(&Utc).to_rfc3339()))
                    .map_err(|_| CastFailure::here(self.type_name())),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|dt| Value::String(dt.to_rfc3339()))
                    .ok_or_else(|| CastFailure::here(self.type_name())),
                _ => Err(CastFailure::here(self.type_name())),
            },

            FieldType::Id | FieldType::Ref(_) => match &value {
                Value::String(s) => Uuid::parse_str(s)
                    .map(|id| Value::String(id.hyphenated().to_string()))
                    .map_err(|_| CastFailure::here(self.type_name())),
                _ => Err(CastFailure::here(self.type_name())),
            },

            FieldType::Array(inner) => match value {
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        let casted = inner
                            .cast(item)
                            .map_err(|f| f.nested(&index.to_string()))?;
                        out.push(casted);
                    }
                    Ok(Value::Array(out))
                }
                single => Ok(Value::Array(vec![inner.cast(single)?])),
            },

            FieldType::Object(schema) => match value {
                Value::Object(map) => {
                    let mut out = FieldMap::new();
                    for (key, item) in map {
                        let casted = match schema.field_def(&key) {
                            Some(def) => def
                                .field_type
                                .cast(item)
                                .map_err(|f| f.nested(&key))?,
                            None => item,
                        };
                        out.insert(key, casted);
                    }
                    Ok(Value::Object(out))
                }
                _ => Err(CastFailure::here(self.type_name())),
            },
        }
    }
}

/// A single declared field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    name: String,
    field_type: FieldType,
    required: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }
}

/// Declares a model's fields and persistence options.
///
/// The schema is the explicit accessor layer between application values and
/// tracked state: mutations resolve their path against it, cast through it,
/// and `validate` runs against it before anything reaches the store.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldDef>,
    strict: bool,
    timestamps: bool,
    versioned: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            strict: true,
            timestamps: false,
            versioned: false,
        }
    }

    /// Declare a field.
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    /// Allow writes to undeclared paths (stored uncast).
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Maintain `created_at` / `updated_at` on persistence.
    pub fn timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Carry a `__v` version marker; updates are matched against it.
    pub fn versioned(mut self, versioned: bool) -> Self {
        self.versioned = versioned;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn has_timestamps(&self) -> bool {
        self.timestamps
    }

    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolve the declared type at a dotted path.
    ///
    /// Returns `None` for undeclared paths. Numeric segments descend into
    /// array element types; anything beneath `Any` is `Any`.
    pub fn type_at(&self, path: &str) -> Option<&FieldType> {
        let mut segs = path::segments(path);
        let first = segs.next()?;
        if first == ID_FIELD {
            return Some(&FieldType::Id);
        }
        let mut current = self.field_def(first)?.field_type();
        for seg in segs {
            current = match current {
                FieldType::Any => &ANY_TYPE,
                FieldType::Array(inner) => {
                    if seg.parse::<usize>().is_err() {
                        return None;
                    }
                    inner
                }
                FieldType::Object(schema) => schema.field_def(seg)?.field_type(),
                _ => return None,
            };
        }
        Some(current)
    }

    /// Cast a raw value bound for `path`, reporting failures against `model`
    /// anchored at `origin` (the caller that supplied the value).
    pub fn cast_path(
        &self,
        path: &str,
        value: Value,
        model: &str,
        origin: &'static Location<'static>,
    ) -> Result<Value> {
        match self.type_at(path) {
            Some(field_type) => field_type.cast(value.clone()).map_err(|failure| {
                let at = if failure.at.is_empty() {
                    path.to_string()
                } else {
                    format!("{}.{}", path, failure.at)
                };
                OdmError::cast_at(failure.expected, &value, at, model, origin)
            }),
            None if self.strict => Err(OdmError::Validation(format!(
                "path \"{}\" is not declared on model \"{}\"",
                path, model
            ))),
            None => Ok(value),
        }
    }

    /// Pre-persistence validation hook: required fields present and every
    /// declared field holding a value its type accepts.
    pub fn validate(&self, state: &FieldMap, model: &str) -> Result<()> {
        for def in &self.fields {
            match state.get(&def.name) {
                None | Some(Value::Null) => {
                    if def.required {
                        return Err(OdmError::Validation(format!(
                            "\"{}\" validation failed: field \"{}\" is required",
                            model, def.name
                        )));
                    }
                }
                Some(value) => {
                    if def.field_type.cast(value.clone()).is_err() {
                        return Err(OdmError::Validation(format!(
                            "\"{}\" validation failed: field \"{}\" is not a valid {}",
                            model,
                            def.name,
                            def.field_type.type_name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
