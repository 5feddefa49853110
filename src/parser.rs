//! Streaming EDMX parser.
//!
//! The `$metadata` document for a production instance runs to tens of
//! megabytes, so the parser walks it with an incremental tokenizer and never
//! builds a DOM. Records are normalized into phase-tagged batches (entity
//! shells, then fields, then relationships, then enums) and handed to a
//! [`BatchSink`] as soon as a batch fills, so peak memory is bounded by the
//! batch size rather than the document size.
//!
//! A malformed record is skipped and recorded as a warning; only a broken
//! document envelope aborts the parse.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::BufRead;
use tracing::{debug, info, warn};

use crate::error::{ParseError, StoreError, SyncError};
use crate::models::{
    Batch, Cardinality, EnumDescriptor, EnumMember, FieldDescriptor, ParsedRecord, Phase,
    RelationshipDescriptor,
};

/// Receives parsed batches in dependency order. Implemented by the store;
/// tests substitute a recording fake.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn apply_batch(&self, batch: Batch) -> Result<(), StoreError>;
}

/// A skipped record: what was being parsed and why it was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseWarning {
    pub context: String,
    pub reason: String,
}

/// Totals and warnings for one completed parse.
#[derive(Debug, Default)]
pub struct ParseSummary {
    pub entities: usize,
    pub fields: usize,
    pub relationships: usize,
    pub enums: usize,
    pub batches: usize,
    pub warnings: Vec<ParseWarning>,
}

pub struct BulkParser {
    batch_size: usize,
}

impl BulkParser {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    /// Parses a complete EDMX document, pushing batches to `sink` as they
    /// fill. Batches for dependent records are never emitted before the
    /// shells they reference.
    pub async fn parse<R: BufRead>(
        &self,
        reader: R,
        revision: &str,
        sink: &dyn BatchSink,
    ) -> Result<ParseSummary, SyncError> {
        let mut xml = Reader::from_reader(reader);
        xml.config_mut().trim_text(true);

        let mut emitter = Emitter::new(self.batch_size, sink);
        let mut warnings = Vec::new();

        let mut buf = Vec::new();
        let mut saw_root = false;
        let mut saw_schema = false;

        let mut entity: Option<EntityAccumulator> = None;
        let mut enumeration: Option<EnumAccumulator> = None;
        let mut in_key = false;

        // Names of all enumerations seen, for field link validation.
        let mut enum_names: HashSet<String> = HashSet::new();
        // (entity, field, enum) links to validate once the document is done.
        let mut enum_links: Vec<(String, String, String)> = Vec::new();

        loop {
            let event = xml.read_event_into(&mut buf).map_err(ParseError::from)?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let empty = matches!(event, Event::Empty(_));
                    let local = e.local_name();
                    let local = local.as_ref();

                    if !saw_root {
                        if local != b"Edmx" {
                            return Err(ParseError::InvalidEnvelope(format!(
                                "expected Edmx root, found {}",
                                String::from_utf8_lossy(local)
                            ))
                            .into());
                        }
                        saw_root = true;
                        buf.clear();
                        continue;
                    }

                    match local {
                        b"Schema" => saw_schema = true,
                        b"EntityType" => match attr(e, b"Name") {
                            Some(name) => {
                                let acc = EntityAccumulator::new(name);
                                if empty {
                                    emitter.entity(acc, revision, &mut warnings).await?;
                                } else {
                                    entity = Some(acc);
                                }
                            }
                            None => warnings.push(ParseWarning {
                                context: "EntityType".to_string(),
                                reason: "missing Name attribute".to_string(),
                            }),
                        },
                        b"Key" => in_key = true,
                        b"PropertyRef" => {
                            if in_key {
                                if let (Some(acc), Some(name)) = (entity.as_mut(), attr(e, b"Name"))
                                {
                                    acc.keys.insert(name);
                                }
                            }
                        }
                        b"Property" => {
                            if let Some(acc) = entity.as_mut() {
                                match parse_property(e, acc) {
                                    Ok(field) => {
                                        if let Some(enum_name) = &field.enum_ref {
                                            enum_links.push((
                                                field.entity_name.clone(),
                                                field.name.clone(),
                                                enum_name.clone(),
                                            ));
                                        }
                                        acc.fields.push(field);
                                    }
                                    Err(reason) => warnings.push(ParseWarning {
                                        context: format!("Property in {}", acc.name),
                                        reason,
                                    }),
                                }
                            }
                        }
                        b"NavigationProperty" => {
                            if let Some(acc) = entity.as_mut() {
                                match parse_nav_property(e, &acc.name) {
                                    Ok(rel) => acc.relationships.push(rel),
                                    Err(reason) => warnings.push(ParseWarning {
                                        context: format!("NavigationProperty in {}", acc.name),
                                        reason,
                                    }),
                                }
                            }
                        }
                        b"EnumType" => match attr(e, b"Name") {
                            Some(name) => {
                                enum_names.insert(name.clone());
                                let acc = EnumAccumulator {
                                    name,
                                    members: Vec::new(),
                                };
                                if empty {
                                    emitter.enumeration(acc).await?;
                                } else {
                                    enumeration = Some(acc);
                                }
                            }
                            None => warnings.push(ParseWarning {
                                context: "EnumType".to_string(),
                                reason: "missing Name attribute".to_string(),
                            }),
                        },
                        b"Member" => {
                            if let Some(acc) = enumeration.as_mut() {
                                match parse_enum_member(e) {
                                    Ok(member) => acc.members.push(member),
                                    Err(reason) => warnings.push(ParseWarning {
                                        context: format!("Member in {}", acc.name),
                                        reason,
                                    }),
                                }
                            }
                        }
                        b"Annotation" => {
                            // Label annotations attach to the innermost open
                            // definition: an enum member, else the entity.
                            if is_label_annotation(e) {
                                let label = attr(e, b"String");
                                if let Some(acc) = enumeration.as_mut() {
                                    if let Some(member) = acc.members.last_mut() {
                                        member.label = label;
                                    }
                                } else if let Some(acc) = entity.as_mut() {
                                    acc.label = label;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"Key" => in_key = false,
                    b"EntityType" => {
                        if let Some(acc) = entity.take() {
                            emitter.entity(acc, revision, &mut warnings).await?;
                        }
                    }
                    b"EnumType" => {
                        if let Some(acc) = enumeration.take() {
                            emitter.enumeration(acc).await?;
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !saw_root || !saw_schema {
            return Err(
                ParseError::InvalidEnvelope("document has no Schema element".to_string()).into(),
            );
        }

        for (entity_name, field_name, enum_name) in &enum_links {
            if !enum_names.contains(enum_name) {
                warn!(entity = %entity_name, field = %field_name, enumeration = %enum_name,
                    "field references an enumeration the document never defines");
                warnings.push(ParseWarning {
                    context: format!("{}.{}", entity_name, field_name),
                    reason: format!("unresolved enumeration reference {}", enum_name),
                });
            }
        }

        let mut summary = emitter.finish().await?;
        summary.warnings = warnings;

        info!(
            entities = summary.entities,
            fields = summary.fields,
            relationships = summary.relationships,
            enums = summary.enums,
            batches = summary.batches,
            warnings = summary.warnings.len(),
            "metadata document parsed"
        );
        Ok(summary)
    }
}

/// SHA-256 of the raw document, recorded as the revision of every entity
/// parsed from it.
pub fn document_revision(document: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Record extraction
// ============================================================================

struct EntityAccumulator {
    name: String,
    label: Option<String>,
    keys: HashSet<String>,
    fields: Vec<FieldDescriptor>,
    relationships: Vec<RelationshipDescriptor>,
}

impl EntityAccumulator {
    fn new(name: String) -> Self {
        Self {
            name,
            label: None,
            keys: HashSet::new(),
            fields: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

struct EnumAccumulator {
    name: String,
    members: Vec<EnumMember>,
}

fn parse_property(e: &BytesStart, acc: &EntityAccumulator) -> Result<FieldDescriptor, String> {
    let name = attr(e, b"Name").ok_or("missing Name attribute")?;
    let data_type = attr(e, b"Type").ok_or("missing Type attribute")?;

    let nullable = attr(e, b"Nullable").map(|v| v == "true").unwrap_or(true);
    let required = acc.keys.contains(&name) || !nullable;

    // Non-primitive, non-collection property types name an enumeration.
    let enum_ref = if !data_type.starts_with("Edm.") && !data_type.starts_with("Collection(") {
        data_type.rsplit('.').next().map(str::to_string)
    } else {
        None
    };

    Ok(FieldDescriptor {
        entity_name: acc.name.clone(),
        name,
        data_type,
        required,
        enum_ref,
        ordinal: acc.fields.len() as i64,
    })
}

fn parse_nav_property(e: &BytesStart, source: &str) -> Result<RelationshipDescriptor, String> {
    let name = attr(e, b"Name").ok_or("missing Name attribute")?;
    let type_attr = attr(e, b"Type").ok_or("missing Type attribute")?;

    let (target, cardinality) = match type_attr
        .strip_prefix("Collection(")
        .and_then(|t| t.strip_suffix(')'))
    {
        Some(inner) => (inner, Cardinality::OneToMany),
        None => (type_attr.as_str(), Cardinality::ManyToOne),
    };
    let target_entity = target
        .rsplit('.')
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| format!("unparseable Type attribute {}", type_attr))?;

    Ok(RelationshipDescriptor {
        source_entity: source.to_string(),
        nav_property: name,
        target_entity: target_entity.to_string(),
        cardinality,
    })
}

fn parse_enum_member(e: &BytesStart) -> Result<EnumMember, String> {
    let symbol = attr(e, b"Name").ok_or("missing Name attribute")?;
    let value = attr(e, b"Value")
        .ok_or("missing Value attribute")?
        .parse::<i64>()
        .map_err(|e| format!("non-integer Value attribute: {}", e))?;

    Ok(EnumMember {
        symbol,
        value,
        label: None,
    })
}

fn is_label_annotation(e: &BytesStart) -> bool {
    attr(e, b"Term")
        .map(|t| t.ends_with(".Label") || t == "Label")
        .unwrap_or(false)
}

fn attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| match a.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
        })
}

// ============================================================================
// Batch emission
// ============================================================================

/// Buffers records per phase and flushes full batches to the sink, keeping
/// the dependency order: a fields or relationships batch forces any pending
/// entity-shell batch out first so owners are committed before dependents.
struct Emitter<'a> {
    batch_size: usize,
    sink: &'a dyn BatchSink,
    entities: Vec<ParsedRecord>,
    fields: Vec<ParsedRecord>,
    relationships: Vec<ParsedRecord>,
    enums: Vec<ParsedRecord>,
    summary: ParseSummary,
}

impl<'a> Emitter<'a> {
    fn new(batch_size: usize, sink: &'a dyn BatchSink) -> Self {
        Self {
            batch_size,
            sink,
            entities: Vec::new(),
            fields: Vec::new(),
            relationships: Vec::new(),
            enums: Vec::new(),
            summary: ParseSummary::default(),
        }
    }

    async fn entity(
        &mut self,
        acc: EntityAccumulator,
        revision: &str,
        warnings: &mut Vec<ParseWarning>,
    ) -> Result<(), StoreError> {
        if acc.name.is_empty() {
            warnings.push(ParseWarning {
                context: "EntityType".to_string(),
                reason: "empty Name attribute".to_string(),
            });
            return Ok(());
        }

        self.summary.entities += 1;
        self.summary.fields += acc.fields.len();
        self.summary.relationships += acc.relationships.len();

        self.entities.push(ParsedRecord::EntityShell {
            name: acc.name,
            label: acc.label,
            revision: revision.to_string(),
        });
        self.fields.extend(acc.fields.into_iter().map(ParsedRecord::Field));
        self.relationships
            .extend(acc.relationships.into_iter().map(ParsedRecord::Relationship));

        if self.entities.len() >= self.batch_size {
            self.flush(Phase::Entities).await?;
        }
        if self.fields.len() >= self.batch_size {
            self.flush(Phase::Entities).await?;
            self.flush(Phase::Fields).await?;
        }
        if self.relationships.len() >= self.batch_size {
            self.flush(Phase::Entities).await?;
            self.flush(Phase::Relationships).await?;
        }
        Ok(())
    }

    async fn enumeration(&mut self, acc: EnumAccumulator) -> Result<(), StoreError> {
        self.summary.enums += 1;
        self.enums.push(ParsedRecord::Enum(EnumDescriptor {
            name: acc.name,
            members: acc.members,
        }));
        if self.enums.len() >= self.batch_size {
            self.flush(Phase::Enums).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, phase: Phase) -> Result<(), StoreError> {
        let pending = match phase {
            Phase::Entities => &mut self.entities,
            Phase::Fields => &mut self.fields,
            Phase::Relationships => &mut self.relationships,
            Phase::Enums => &mut self.enums,
        };
        if pending.is_empty() {
            return Ok(());
        }

        // An entity pushes all its fields at once, so a queue can overshoot
        // the bound; emit in chunks so no batch exceeds it.
        let records = std::mem::take(pending);
        for chunk in records.chunks(self.batch_size) {
            debug!(?phase, records = chunk.len(), "emitting batch");
            self.summary.batches += 1;
            self.sink
                .apply_batch(Batch {
                    phase,
                    records: chunk.to_vec(),
                })
                .await?;
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<ParseSummary, StoreError> {
        self.flush(Phase::Entities).await?;
        self.flush(Phase::Fields).await?;
        self.flush(Phase::Relationships).await?;
        self.flush(Phase::Enums).await?;
        Ok(self.summary)
    }
}
