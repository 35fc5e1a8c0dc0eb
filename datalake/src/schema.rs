use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use once_cell::sync::Lazy;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::sync::Arc;

/// Column appended to every ingested frame: the 0-based position of the
/// record in its source, in file-then-line order.
pub const RECORD_SEQ: &str = "record_seq";

pub const GEO_PRECISION: u8 = 10;
pub const GEO_SCALE: i8 = 5;

// Raw source schemas
pub fn catalog_schema() -> Schema {
    Schema::new(vec![
        Field::new("num_songs", DataType::Int32, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new(
            "artist_latitude",
            DataType::Decimal128(GEO_PRECISION, GEO_SCALE),
            true,
        ),
        Field::new(
            "artist_longitude",
            DataType::Decimal128(GEO_PRECISION, GEO_SCALE),
            true,
        ),
        Field::new("artist_location", DataType::Utf8, true),
        Field::new("artist_name", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("duration", DataType::Float64, true),
        Field::new("year", DataType::Int32, true),
    ])
}

pub fn event_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist", DataType::Utf8, true),
        Field::new("auth", DataType::Utf8, true),
        Field::new("firstName", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("itemInSession", DataType::Int64, true),
        Field::new("lastName", DataType::Utf8, true),
        Field::new("length", DataType::Float64, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("method", DataType::Utf8, true),
        Field::new("page", DataType::Utf8, true),
        Field::new("registration", DataType::Float64, true),
        Field::new("sessionId", DataType::Int64, true),
        Field::new("song", DataType::Utf8, true),
        Field::new("status", DataType::Int64, true),
        Field::new("ts", DataType::Int64, true),
        Field::new("userAgent", DataType::Utf8, true),
        Field::new("userId", DataType::Utf8, true),
    ])
}

pub enum RecordSchemaKind {
    Catalog,
    Events,
}

pub fn get_record_schema(kind: RecordSchemaKind) -> &'static DeclaredSchema {
    match kind {
        RecordSchemaKind::Catalog => &CATALOG_SCHEMA,
        RecordSchemaKind::Events => &EVENT_SCHEMA,
    }
}

static CATALOG_SCHEMA: Lazy<DeclaredSchema> =
    Lazy::new(|| DeclaredSchema::new("catalog", catalog_schema(), &[]));

// Logged-out traffic carries an empty userId instead of omitting it
static EVENT_SCHEMA: Lazy<DeclaredSchema> =
    Lazy::new(|| DeclaredSchema::new("events", event_schema(), &["userId"]));

/// Why a single record was refused by a [`DeclaredSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub field: Option<String>,
    pub reason: String,
}

impl Rejection {
    fn record(reason: impl Into<String>) -> Self {
        Self {
            field: None,
            reason: reason.into(),
        }
    }

    fn field(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            reason: reason.into(),
        }
    }
}

/// A record dropped during ingestion. Never fatal to the run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    pub source: String,
    pub line: usize,
    pub field: Option<String>,
    pub reason: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "{}:{}: field '{}': {}",
                self.source, self.line, field, self.reason
            ),
            None => write!(f, "{}:{}: {}", self.source, self.line, self.reason),
        }
    }
}

/// An explicit field list that raw JSON records are checked and coerced
/// against before they are decoded into Arrow batches.
pub struct DeclaredSchema {
    name: &'static str,
    schema: SchemaRef,
    sequenced: SchemaRef,
    blank_as_null: &'static [&'static str],
}

impl DeclaredSchema {
    pub fn new(name: &'static str, schema: Schema, blank_as_null: &'static [&'static str]) -> Self {
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.push(Field::new(RECORD_SEQ, DataType::Int64, false));

        Self {
            name,
            schema: Arc::new(schema),
            sequenced: Arc::new(Schema::new(fields)),
            blank_as_null,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// The declared schema with [`RECORD_SEQ`] appended; the shape of every
    /// ingested frame.
    pub fn sequenced_schema(&self) -> SchemaRef {
        self.sequenced.clone()
    }

    /// Checks one raw record against the declared fields and returns the
    /// object restricted to them, with values normalized for the Arrow JSON
    /// decoder. Undeclared fields are dropped.
    pub fn coerce(&self, record: Value) -> Result<Map<String, Value>, Rejection> {
        let mut object = match record {
            Value::Object(map) => map,
            other => {
                return Err(Rejection::record(format!(
                    "expected a JSON object, found {}",
                    json_kind(&other)
                )));
            }
        };

        let mut coerced = Map::new();
        for field in self.schema.fields() {
            let name = field.name();
            let raw = object.remove(name.as_str()).unwrap_or(Value::Null);
            let raw = match raw {
                Value::String(s) if s.trim().is_empty() && self.blank_as_null.contains(&name.as_str()) => {
                    Value::Null
                }
                other => other,
            };

            if raw.is_null() {
                if !field.is_nullable() {
                    return Err(Rejection::field(name, "required field is missing"));
                }
                coerced.insert(name.clone(), Value::Null);
                continue;
            }

            let value = coerce_value(field.data_type(), raw).map_err(|reason| Rejection::field(name, reason))?;
            coerced.insert(name.clone(), value);
        }

        Ok(coerced)
    }
}

fn coerce_value(data_type: &DataType, value: Value) -> Result<Value, String> {
    match data_type {
        DataType::Utf8 => match value {
            Value::String(_) => Ok(value),
            other => Err(format!("expected string, found {}", json_kind(&other))),
        },
        DataType::Int32 => match value.as_i64() {
            Some(v) if i32::try_from(v).is_ok() => Ok(value),
            Some(v) => Err(format!("integer {} out of range for Int32", v)),
            None => Err(format!("expected integer, found {}", json_kind(&value))),
        },
        DataType::Int64 => match value.as_i64() {
            Some(_) => Ok(value),
            None => Err(format!("expected integer, found {}", json_kind(&value))),
        },
        DataType::Float64 => match value {
            Value::Number(_) => Ok(value),
            other => Err(format!("expected number, found {}", json_kind(&other))),
        },
        DataType::Decimal128(precision, scale) => {
            let number = match &value {
                Value::Number(n) => n,
                other => return Err(format!("expected number, found {}", json_kind(other))),
            };
            coerce_decimal(number, *precision, *scale).map(Value::String)
        }
        other => Err(format!("unsupported declared type {}", other)),
    }
}

/// Renders a JSON number with exactly `scale` fractional digits, refusing
/// values whose integral part does not fit `precision - scale` digits.
fn coerce_decimal(number: &Number, precision: u8, scale: i8) -> Result<String, String> {
    let v = number
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("number {} is not representable", number))?;
    let scale = scale.max(0) as usize;
    let rendered = format!("{:.*}", scale, v);

    let integral_digits = rendered
        .trim_start_matches('-')
        .split('.')
        .next()
        .map(|digits| digits.trim_start_matches('0').len())
        .unwrap_or(0);
    let max_integral = (precision as usize).saturating_sub(scale);
    if integral_digits > max_integral {
        return Err(format!(
            "number {} exceeds Decimal128({}, {})",
            number, precision, scale
        ));
    }

    Ok(rendered)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
