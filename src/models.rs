//! Core data models for the metadata cache.
//!
//! Descriptors are produced only by the parser during a sync cycle and are
//! immutable once the batch that created them commits. Relationships and
//! field→enum links reference other descriptors by name — a weak-reference
//! graph resolved at query time, never in-memory pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entity definition: name, display label, fields, and outgoing
/// relationships. Replaced wholesale per sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub label: Option<String>,
    pub fields: Vec<FieldDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
    /// SHA-256 of the source document this entity was parsed from.
    pub revision: String,
}

/// A field belonging to exactly one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub entity_name: String,
    pub name: String,
    pub data_type: String,
    pub required: bool,
    /// Name of the enumeration this field draws its values from, if any.
    pub enum_ref: Option<String>,
    /// Position within the entity's field list, in document order.
    pub ordinal: i64,
}

/// Relationship cardinality from the perspective of the source entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ManyToOne,
    OneToMany,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::ManyToOne => "many_to_one",
            Cardinality::OneToMany => "one_to_many",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "many_to_one" => Some(Cardinality::ManyToOne),
            "one_to_many" => Some(Cardinality::OneToMany),
            _ => None,
        }
    }
}

/// A navigation property linking two entities by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub source_entity: String,
    pub nav_property: String,
    pub target_entity: String,
    pub cardinality: Cardinality,
}

/// One symbol of an enumeration, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumMember {
    pub symbol: String,
    pub value: i64,
    pub label: Option<String>,
}

/// An enumeration definition with its ordered members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDescriptor {
    pub name: String,
    pub members: Vec<EnumMember>,
}

/// The four record kinds the store indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entity,
    Field,
    Relationship,
    Enum,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entity => "entity",
            RecordKind::Field => "field",
            RecordKind::Relationship => "relationship",
            RecordKind::Enum => "enum",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entity" => Some(RecordKind::Entity),
            "field" => Some(RecordKind::Field),
            "relationship" => Some(RecordKind::Relationship),
            "enum" => Some(RecordKind::Enum),
            _ => None,
        }
    }
}

/// Parse phases, in the order batches must be applied to the store so that
/// cross-references resolve against already-committed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Entities,
    Fields,
    Relationships,
    Enums,
}

/// A single normalized record emitted by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    /// Entity name + label only; fields and relationships arrive in later
    /// phases so the store can commit owners before dependents.
    EntityShell {
        name: String,
        label: Option<String>,
        revision: String,
    },
    Field(FieldDescriptor),
    Relationship(RelationshipDescriptor),
    Enum(EnumDescriptor),
}

/// A bounded group of records committed to the store as one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub phase: Phase,
    pub records: Vec<ParsedRecord>,
}

/// A record assembled back out of the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CachedRecord {
    Entity(EntityDescriptor),
    Field(FieldDescriptor),
    Relationship(RelationshipDescriptor),
    Enum(EnumDescriptor),
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub name: String,
    pub label: Option<String>,
    pub kind: RecordKind,
    pub relevance: i64,
}

/// One page of ranked results plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl SearchPage {
    pub fn has_more(&self) -> bool {
        self.offset + (self.hits.len() as i64) < self.total
    }
}

/// Scheduler state machine: `Idle → Syncing → (Idle | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Failed,
}

/// Snapshot of the scheduler, published on every state transition.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub completed_runs: u64,
}

impl SyncStatus {
    /// True once at least one sync cycle has completed successfully.
    pub fn is_ready(&self) -> bool {
        self.last_success.is_some()
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
            completed_runs: 0,
        }
    }
}
