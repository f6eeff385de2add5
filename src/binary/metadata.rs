//! Binary type metadata and schema merging.

use crate::error::MetadataError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type identifier.
pub type TypeId = i32;

/// One schema (field layout) registered for a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinarySchema {
    pub id: i32,
    pub fields: Vec<String>,
}

/// Description of a binary type.
///
/// Metadata only ever grows: merging adds fields, schemas and enum constants,
/// and rejects changes to anything already defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryMetadata {
    pub type_id: TypeId,
    pub type_name: String,
    pub affinity_key: Option<String>,
    /// Field name -> field type name.
    pub fields: BTreeMap<String, String>,
    pub schemas: Vec<BinarySchema>,
    pub is_enum: bool,
    /// Enum constant name -> ordinal.
    pub enum_values: BTreeMap<String, i32>,
}

impl BinaryMetadata {
    pub fn new(type_id: TypeId, type_name: impl Into<String>) -> Self {
        Self {
            type_id,
            type_name: type_name.into(),
            affinity_key: None,
            fields: BTreeMap::new(),
            schemas: Vec::new(),
            is_enum: false,
            enum_values: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), type_name.into());
        self
    }

    pub fn with_schema(mut self, id: i32, fields: &[&str]) -> Self {
        self.schemas.push(BinarySchema {
            id,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn with_affinity_key(mut self, field: impl Into<String>) -> Self {
        self.affinity_key = Some(field.into());
        self
    }

    pub fn with_enum_value(mut self, name: impl Into<String>, ordinal: i32) -> Self {
        self.is_enum = true;
        self.enum_values.insert(name.into(), ordinal);
        self
    }

    pub fn has_schema(&self, id: i32) -> bool {
        self.schemas.iter().any(|s| s.id == id)
    }

    /// Merge `new` into `self`.
    ///
    /// Returns the merged metadata and whether anything was added.
    pub fn merge(&self, new: &BinaryMetadata) -> Result<(BinaryMetadata, bool), MetadataError> {
        if self.type_name != new.type_name {
            return Err(MetadataError::TypeNameConflict {
                type_id: self.type_id,
                existing: self.type_name.clone(),
                new: new.type_name.clone(),
            });
        }

        let mut merged = self.clone();
        let mut changed = false;

        match (&self.affinity_key, &new.affinity_key) {
            (Some(existing), Some(key)) if existing != key => {
                return Err(MetadataError::AffinityKeyConflict {
                    type_id: self.type_id,
                    existing: existing.clone(),
                    new: key.clone(),
                })
            }
            (None, Some(key)) => {
                merged.affinity_key = Some(key.clone());
                changed = true;
            }
            _ => {}
        }

        for (name, type_name) in &new.fields {
            match merged.fields.get(name) {
                Some(existing) if existing != type_name => {
                    return Err(MetadataError::FieldTypeConflict {
                        type_id: self.type_id,
                        field: name.clone(),
                        existing: existing.clone(),
                        new: type_name.clone(),
                    })
                }
                Some(_) => {}
                None => {
                    merged.fields.insert(name.clone(), type_name.clone());
                    changed = true;
                }
            }
        }

        for schema in &new.schemas {
            if !merged.has_schema(schema.id) {
                merged.schemas.push(schema.clone());
                changed = true;
            }
        }

        if new.is_enum && !merged.is_enum {
            merged.is_enum = true;
            changed = true;
        }
        for (name, ordinal) in &new.enum_values {
            let ordinal_taken = merged
                .enum_values
                .iter()
                .any(|(n, o)| o == ordinal && n != name);
            match merged.enum_values.get(name) {
                Some(existing) if existing != ordinal => {
                    return Err(MetadataError::EnumValueConflict {
                        type_id: self.type_id,
                        name: name.clone(),
                    })
                }
                Some(_) => {}
                None if ordinal_taken => {
                    return Err(MetadataError::EnumValueConflict {
                        type_id: self.type_id,
                        name: name.clone(),
                    })
                }
                None => {
                    merged.enum_values.insert(name.clone(), *ordinal);
                    changed = true;
                }
            }
        }

        Ok((merged, changed))
    }
}

/// Metadata as stored in a `<typeId>.bin` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedMetadata {
    pub version: i32,
    pub metadata: BinaryMetadata,
}

impl VersionedMetadata {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        bincode::serialize(self).map_err(|e| MetadataError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        bincode::deserialize(bytes).map_err(|e| MetadataError::Serialization(e.to_string()))
    }
}

/// In-memory view of a type: the latest metadata, the version it was
/// registered under and the last version known to be on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMetadataHolder {
    pub metadata: BinaryMetadata,
    pub pending_version: i32,
    pub accepted_version: i32,
}

impl BinaryMetadataHolder {
    pub fn new(metadata: BinaryMetadata, pending_version: i32, accepted_version: i32) -> Self {
        Self {
            metadata,
            pending_version,
            accepted_version,
        }
    }
}
