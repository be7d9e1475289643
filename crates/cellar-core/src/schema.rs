//! Typed field-encryption schema.
//!
//! [`SchemaMap`] describes which fields of which collections are encrypted,
//! with what algorithm and under which DEK. [`EncryptedFieldsMap`] is the
//! queryable-encryption variant that also declares supported query types.
//! Both validate at construction and render to the document shape the
//! collaborator's engine consumes.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{error::CellarError, vault::DekId};

/// Field encryption algorithm requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Same plaintext and key always give the same ciphertext; supports equality queries.
    #[serde(rename = "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic")]
    Deterministic,
    #[serde(rename = "AEAD_AES_256_CBC_HMAC_SHA_512-Random")]
    Random,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            Self::Random => "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
        }
    }

    /// Leading byte of an encrypted value produced with this algorithm.
    pub fn marker(&self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }

    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Random),
            _ => None,
        }
    }
}

impl FromStr for Algorithm {
    type Err = CellarError;

    /// Accepts the short names (`deterministic`, `random`) or the full engine names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deterministic" | "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic" => {
                Ok(Self::Deterministic)
            }
            "random" | "AEAD_AES_256_CBC_HMAC_SHA_512-Random" => Ok(Self::Random),
            other => Err(CellarError::config(
                "algorithm",
                format!("unknown algorithm '{other}'"),
            )),
        }
    }
}

/// BSON type of an encrypted field's plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Double,
    String,
    Object,
    Array,
    BinData,
    Bool,
    Date,
    Int,
    Long,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::BinData => "binData",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Int => "int",
            Self::Long => "long",
        }
    }

    /// BSON element type byte.
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Object => 0x03,
            Self::Array => 0x04,
            Self::BinData => 0x05,
            Self::Bool => 0x08,
            Self::Date => 0x09,
            Self::Int => 0x10,
            Self::Long => 0x12,
        }
    }

    pub fn from_type_byte(byte: u8) -> Option<Self> {
        [
            Self::Double,
            Self::String,
            Self::Object,
            Self::Array,
            Self::BinData,
            Self::Bool,
            Self::Date,
            Self::Int,
            Self::Long,
        ]
        .into_iter()
        .find(|t| t.type_byte() == byte)
    }

    /// Best-effort type of a JSON value; integers that fit in 32 bits are `int`.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::String(_) => Some(Self::String),
            Value::Array(_) => Some(Self::Array),
            Value::Object(_) => Some(Self::Object),
            Value::Number(n) => match n.as_i64() {
                Some(i) if i32::try_from(i).is_ok() => Some(Self::Int),
                Some(_) => Some(Self::Long),
                None => Some(Self::Double),
            },
        }
    }

    /// Deterministic encryption cannot be requested for these types.
    fn supports_deterministic(&self) -> bool {
        !matches!(self, Self::Double | Self::Bool | Self::Object | Self::Array)
    }

    fn supports_range(&self) -> bool {
        matches!(self, Self::Int | Self::Long | Self::Double | Self::Date)
    }
}

impl FromStr for DataType {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| CellarError::config("bsonType", format!("unknown bson type '{s}'")))
    }
}

/// Fully qualified field: `database.collection` plus a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    namespace: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(namespace: &str, field: &str) -> Result<Self, CellarError> {
        let invalid = || {
            CellarError::config(
                "schema_map",
                format!("invalid field path '{namespace}' / '{field}'"),
            )
        };
        match namespace.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {}
            _ => return Err(invalid()),
        }
        let segments: Vec<String> = field.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty() || s.starts_with('$')) {
            return Err(invalid());
        }
        Ok(Self {
            namespace: namespace.to_string(),
            segments,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn field(&self) -> String {
        self.segments.join(".")
    }
}

impl FromStr for FieldPath {
    type Err = CellarError;

    /// Parses `database.collection.field[.sub...]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(db), Some(coll), Some(field)) => Self::new(&format!("{db}.{coll}"), field),
            _ => Err(CellarError::config(
                "schema_map",
                format!("expected `database.collection.field`, got '{s}'"),
            )),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.field())
    }
}

/// How a single field is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDescriptor {
    pub data_type: DataType,
    pub algorithm: Algorithm,
    pub key_ids: Vec<DekId>,
}

impl EncryptionDescriptor {
    pub fn deterministic(data_type: DataType, key_id: DekId) -> Self {
        Self {
            data_type,
            algorithm: Algorithm::Deterministic,
            key_ids: vec![key_id],
        }
    }

    pub fn random(data_type: DataType, key_id: DekId) -> Self {
        Self {
            data_type,
            algorithm: Algorithm::Random,
            key_ids: vec![key_id],
        }
    }

    fn validate(&self, path: &FieldPath) -> Result<(), CellarError> {
        let reject = |reason: String| CellarError::config("schema_map", format!("{path}: {reason}"));
        if self.key_ids.is_empty() {
            return Err(reject("at least one key id is required".into()));
        }
        if self.algorithm == Algorithm::Deterministic {
            if self.key_ids.len() != 1 {
                return Err(reject("deterministic encryption takes exactly one key id".into()));
            }
            if !self.data_type.supports_deterministic() {
                return Err(reject(format!(
                    "deterministic encryption is not supported for {}",
                    self.data_type.as_str()
                )));
            }
        }
        Ok(())
    }

    fn to_document(&self) -> Value {
        let key_ids: Vec<Value> = self.key_ids.iter().map(DekId::to_extended_json).collect();
        json!({
            "encrypt": {
                "keyId": key_ids,
                "bsonType": self.data_type.as_str(),
                "algorithm": self.algorithm.as_str(),
            }
        })
    }
}

/// Field path to encryption descriptor, validated on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMap {
    fields: BTreeMap<FieldPath, EncryptionDescriptor>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema encrypting exactly one field, the common per-tenant shape.
    pub fn single(
        path: FieldPath,
        descriptor: EncryptionDescriptor,
    ) -> Result<Self, CellarError> {
        let mut schema = Self::new();
        schema.insert(path, descriptor)?;
        Ok(schema)
    }

    pub fn insert(
        &mut self,
        path: FieldPath,
        descriptor: EncryptionDescriptor,
    ) -> Result<(), CellarError> {
        descriptor.validate(&path)?;
        let conflicts = self.fields.keys().any(|existing| {
            existing.namespace == path.namespace
                && existing.segments != path.segments
                && (existing.segments.starts_with(&path.segments)
                    || path.segments.starts_with(&existing.segments))
        });
        if conflicts {
            return Err(CellarError::config(
                "schema_map",
                format!("{path} overlaps another encrypted field"),
            ));
        }
        self.fields.insert(path, descriptor);
        Ok(())
    }

    pub fn get(&self, path: &FieldPath) -> Option<&EncryptionDescriptor> {
        self.fields.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &EncryptionDescriptor)> {
        self.fields.iter()
    }

    /// Encrypted fields of one `database.collection`.
    pub fn fields_in<'a>(
        &'a self,
        namespace: &'a str,
    ) -> impl Iterator<Item = (&'a FieldPath, &'a EncryptionDescriptor)> + 'a {
        self.fields
            .iter()
            .filter(move |(path, _)| path.namespace == namespace)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// JSON-schema document keyed by namespace, nesting `properties` for dotted paths.
    pub fn to_document(&self) -> Value {
        let mut namespaces: BTreeMap<&str, SchemaNode<'_>> = BTreeMap::new();
        for (path, descriptor) in &self.fields {
            let mut node = namespaces.entry(path.namespace.as_str()).or_default();
            for segment in &path.segments {
                node = node.children.entry(segment.as_str()).or_default();
            }
            node.leaf = Some(descriptor.to_document());
        }
        Value::Object(
            namespaces
                .into_iter()
                .map(|(namespace, node)| (namespace.to_string(), node.render()))
                .collect(),
        )
    }
}

#[derive(Default)]
struct SchemaNode<'a> {
    children: BTreeMap<&'a str, SchemaNode<'a>>,
    leaf: Option<Value>,
}

impl SchemaNode<'_> {
    // Overlapping paths never get past `insert`, so a leaf has no children.
    fn render(self) -> Value {
        if let Some(leaf) = self.leaf {
            return leaf;
        }
        let properties: Map<String, Value> = self
            .children
            .into_iter()
            .map(|(name, child)| (name.to_string(), child.render()))
            .collect();
        json!({ "bsonType": "object", "properties": properties })
    }
}

/// Query capability of a queryable-encryption field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryType {
    Equality,
    Range { min: i64, max: i64 },
}

/// One field of a queryable-encryption collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub path: String,
    pub data_type: DataType,
    /// `None` lets the engine mint a key when the collection is created.
    pub key_id: Option<DekId>,
    pub queries: Vec<QueryType>,
}

impl EncryptedField {
    /// Equality-queryable fields need repeatable ciphertext; everything else is randomised.
    pub fn algorithm(&self) -> Algorithm {
        if self.queries.contains(&QueryType::Equality) {
            Algorithm::Deterministic
        } else {
            Algorithm::Random
        }
    }
}

/// `encryptedFields` definitions per namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedFieldsMap {
    collections: BTreeMap<String, Vec<EncryptedField>>,
}

impl EncryptedFieldsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, namespace: &str, field: EncryptedField) -> Result<(), CellarError> {
        let reject =
            |reason: String| CellarError::config("encrypted_fields", format!("{namespace}.{}: {reason}", field.path));
        if field.path.is_empty() || field.path.split('.').any(str::is_empty) {
            return Err(reject("empty field path".into()));
        }
        for query in &field.queries {
            if *query == QueryType::Equality && !field.data_type.supports_deterministic() {
                return Err(reject(format!(
                    "equality queries are not supported for {}",
                    field.data_type.as_str()
                )));
            }
            if let QueryType::Range { min, max } = query {
                if !field.data_type.supports_range() {
                    return Err(reject(format!(
                        "range queries are not supported for {}",
                        field.data_type.as_str()
                    )));
                }
                if min > max {
                    return Err(reject(format!("range min {min} exceeds max {max}")));
                }
            }
        }
        let fields = self.collections.entry(namespace.to_string()).or_default();
        if fields.iter().any(|f| f.path == field.path) {
            return Err(reject("field declared twice".into()));
        }
        fields.push(field);
        Ok(())
    }

    pub fn fields(&self, namespace: &str) -> &[EncryptedField] {
        self.collections
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every field together with its namespace.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EncryptedField)> + '_ {
        self.collections
            .iter()
            .flat_map(|(namespace, fields)| fields.iter().map(move |f| (namespace.as_str(), f)))
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn to_document(&self) -> Value {
        let map: Map<String, Value> = self
            .collections
            .iter()
            .map(|(ns, fields)| {
                let fields: Vec<Value> = fields.iter().map(encrypted_field_document).collect();
                (ns.clone(), json!({ "fields": fields }))
            })
            .collect();
        Value::Object(map)
    }
}

fn encrypted_field_document(field: &EncryptedField) -> Value {
    let mut doc = json!({
        "keyId": field.key_id.map(|id| id.to_extended_json()),
        "path": field.path,
        "bsonType": field.data_type.as_str(),
    });
    if !field.queries.is_empty() {
        let queries: Vec<Value> = field
            .queries
            .iter()
            .map(|q| match q {
                QueryType::Equality => json!({ "queryType": "equality" }),
                QueryType::Range { min, max } => {
                    json!({ "queryType": "range", "min": min, "max": max })
                }
            })
            .collect();
        doc["queries"] = Value::Array(queries);
    }
    doc
}
