use super::ids::parse_object_id;
use super::{BatchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Consistency level requested from the store for a batch write.
///
/// Opaque to the batching engine; handed to the gateway untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
}

/// A validated object upsert waiting to be sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectWrite {
    pub collection: String,
    pub uuid: Uuid,
    pub properties: Map<String, JsonValue>,
    pub vector: Option<Vec<f32>>,
    pub tenant: Option<String>,
}

/// Target side of a cross-reference. Multi-target references name the
/// collection the target ids live in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceTarget {
    pub uuids: Vec<Uuid>,
    pub target_collection: Option<String>,
}

/// A validated cross-reference write waiting to be sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceWrite {
    pub from_collection: String,
    pub from_uuid: Uuid,
    pub from_property: String,
    pub to: ReferenceTarget,
    pub tenant: Option<String>,
}

impl ReferenceWrite {
    /// Beacon strings of the referenced objects, in target order.
    pub fn beacons(&self) -> Vec<String> {
        self.to
            .uuids
            .iter()
            .map(|uuid| match &self.to.target_collection {
                Some(collection) => format!("weaviate://localhost/{}/{}", collection, uuid),
                None => format!("weaviate://localhost/{}", uuid),
            })
            .collect()
    }
}

/// Any write the engine can queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Object(ObjectWrite),
    Reference(ReferenceWrite),
}

impl From<ObjectWrite> for Operation {
    fn from(object: ObjectWrite) -> Self {
        Self::Object(object)
    }
}

impl From<ReferenceWrite> for Operation {
    fn from(reference: ReferenceWrite) -> Self {
        Self::Reference(reference)
    }
}

/// Common view over queued items used by results and retry bookkeeping.
pub trait BatchItem: Clone + Send + Sync + 'static {
    /// Human readable category name, used in logs.
    const KIND: &'static str;

    /// The id reported back when the item succeeds.
    fn item_uuid(&self) -> Uuid;
}

impl BatchItem for ObjectWrite {
    const KIND: &'static str = "object";

    fn item_uuid(&self) -> Uuid {
        self.uuid
    }
}

impl BatchItem for ReferenceWrite {
    const KIND: &'static str = "reference";

    fn item_uuid(&self) -> Uuid {
        self.from_uuid
    }
}

fn require_name(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BatchError::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

fn normalize_tenant(tenant: Option<String>) -> Result<Option<String>> {
    match tenant {
        Some(tenant) => require_name("tenant", &tenant).map(Some),
        None => Ok(None),
    }
}

/// Unvalidated object as supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ObjectInput {
    collection: String,
    properties: JsonValue,
    uuid: Option<String>,
    vector: Option<Vec<f32>>,
    tenant: Option<String>,
}

impl ObjectInput {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            properties: JsonValue::Null,
            ..Self::default()
        }
    }

    /// Object properties; must be a JSON object (or null for none).
    pub fn properties(mut self, properties: JsonValue) -> Self {
        self.properties = properties;
        self
    }

    /// Explicit id. Any form accepted by [`parse_object_id`] works.
    pub fn uuid(mut self, uuid: impl ToString) -> Self {
        self.uuid = Some(uuid.to_string());
        self
    }

    pub fn vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub(crate) fn set_collection_if_empty(&mut self, collection: &str) {
        if self.collection.trim().is_empty() {
            self.collection = collection.to_string();
        }
    }

    pub(crate) fn set_tenant_if_absent(&mut self, tenant: Option<&str>) {
        if self.tenant.is_none() {
            self.tenant = tenant.map(str::to_string);
        }
    }

    /// Validates the input and produces an immutable write.
    pub fn into_write(self) -> Result<ObjectWrite> {
        let collection = require_name("collection", &self.collection)?;

        let properties = match self.properties {
            JsonValue::Null => Map::new(),
            JsonValue::Object(map) => map,
            other => {
                return Err(BatchError::Validation(format!(
                    "properties must be a JSON object, got {}",
                    json_type_name(&other)
                )));
            }
        };

        let uuid = match self.uuid {
            Some(raw) => parse_object_id(&raw)?,
            None => Uuid::new_v4(),
        };

        if let Some(vector) = &self.vector {
            if vector.is_empty() {
                return Err(BatchError::Validation("vector must not be empty".into()));
            }
            if let Some(position) = vector.iter().position(|v| !v.is_finite()) {
                return Err(BatchError::Validation(format!(
                    "vector contains a non-finite value at position {}",
                    position
                )));
            }
        }

        Ok(ObjectWrite {
            collection,
            uuid,
            properties,
            vector: self.vector,
            tenant: normalize_tenant(self.tenant)?,
        })
    }
}

/// Unvalidated cross-reference as supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ReferenceInput {
    from_collection: String,
    from_uuid: String,
    from_property: String,
    to: Vec<String>,
    target_collection: Option<String>,
    tenant: Option<String>,
}

impl ReferenceInput {
    pub fn new(
        from_collection: impl Into<String>,
        from_uuid: impl ToString,
        from_property: impl Into<String>,
        to: impl ToString,
    ) -> Self {
        Self {
            from_collection: from_collection.into(),
            from_uuid: from_uuid.to_string(),
            from_property: from_property.into(),
            to: vec![to.to_string()],
            ..Self::default()
        }
    }

    /// Reference pointing at several objects of `target_collection`.
    pub fn to_multi_target<I, S>(
        from_collection: impl Into<String>,
        from_uuid: impl ToString,
        from_property: impl Into<String>,
        target_collection: impl Into<String>,
        to: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            from_collection: from_collection.into(),
            from_uuid: from_uuid.to_string(),
            from_property: from_property.into(),
            to: to.into_iter().map(|id| id.to_string()).collect(),
            target_collection: Some(target_collection.into()),
            tenant: None,
        }
    }

    /// Adds another target id.
    pub fn and_to(mut self, to: impl ToString) -> Self {
        self.to.push(to.to_string());
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub(crate) fn set_collection_if_empty(&mut self, collection: &str) {
        if self.from_collection.trim().is_empty() {
            self.from_collection = collection.to_string();
        }
    }

    pub(crate) fn set_tenant_if_absent(&mut self, tenant: Option<&str>) {
        if self.tenant.is_none() {
            self.tenant = tenant.map(str::to_string);
        }
    }

    pub fn into_write(self) -> Result<ReferenceWrite> {
        let from_collection = require_name("from_collection", &self.from_collection)?;
        let from_property = require_name("from_property", &self.from_property)?;
        let from_uuid = parse_object_id(&self.from_uuid)?;

        if self.to.is_empty() {
            return Err(BatchError::Validation(
                "reference must point at least at one object".into(),
            ));
        }
        let uuids = self
            .to
            .iter()
            .map(|raw| parse_object_id(raw))
            .collect::<Result<Vec<_>>>()?;

        let target_collection = match self.target_collection {
            Some(collection) => Some(require_name("target_collection", &collection)?),
            None => None,
        };

        Ok(ReferenceWrite {
            from_collection,
            from_uuid,
            from_property,
            to: ReferenceTarget {
                uuids,
                target_collection,
            },
            tenant: normalize_tenant(self.tenant)?,
        })
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
