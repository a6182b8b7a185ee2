//! Minimal catalog: relations and their attributes

use std::sync::Arc;

use hashbrown::HashMap;
use snafu::{Snafu, ensure};
use stratum_block::AttributeId;
use stratum_block::types::Type;

/// Identifier of the relation
pub type RelationId = u32;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum CatalogError {
    #[snafu(display("Relation `{relation_id}` already exists in the database `{database}`"))]
    DuplicateRelation {
        relation_id: RelationId,
        database: String,
    },
}

type Result<T> = std::result::Result<T, CatalogError>;

/// Attribute of the relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogAttribute {
    id: AttributeId,
    name: String,
    type_: Type,
}

impl CatalogAttribute {
    /// Id of the attribute, it is the position of the attribute in the relation
    #[inline]
    pub fn id(&self) -> AttributeId {
        self.id
    }

    /// Name of the attribute
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type of the attribute
    #[inline]
    pub fn type_(&self) -> Type {
        self.type_
    }
}

/// Schema of the relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRelationSchema {
    id: RelationId,
    name: String,
    attributes: Vec<CatalogAttribute>,
}

impl CatalogRelationSchema {
    /// Create a new schema, attributes get their ids in order
    pub fn new(
        id: RelationId,
        name: impl Into<String>,
        attributes: impl IntoIterator<Item = (impl Into<String>, Type)>,
    ) -> Self {
        let attributes = attributes
            .into_iter()
            .enumerate()
            .map(|(id, (name, type_))| CatalogAttribute {
                id,
                name: name.into(),
                type_,
            })
            .collect();
        Self {
            id,
            name: name.into(),
            attributes,
        }
    }

    /// Id of the relation
    #[inline]
    pub fn id(&self) -> RelationId {
        self.id
    }

    /// Name of the relation
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attributes of the relation
    #[inline]
    pub fn attributes(&self) -> &[CatalogAttribute] {
        &self.attributes
    }

    /// Get the attribute with the id
    #[inline]
    pub fn attribute_by_id(&self, id: AttributeId) -> Option<&CatalogAttribute> {
        self.attributes.get(id)
    }

    /// Returns true if the relation has the attribute
    #[inline]
    pub fn has_attribute_with_id(&self, id: AttributeId) -> bool {
        id < self.attributes.len()
    }
}

/// Database that holds the relation schemas
#[derive(Debug)]
pub struct CatalogDatabase {
    name: String,
    relations: HashMap<RelationId, Arc<CatalogRelationSchema>>,
}

impl CatalogDatabase {
    /// Create an empty database
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relations: HashMap::new(),
        }
    }

    /// Name of the database
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add the relation into the database
    pub fn add_relation(&mut self, relation: CatalogRelationSchema) -> Result<Arc<CatalogRelationSchema>> {
        ensure!(
            !self.relations.contains_key(&relation.id),
            DuplicateRelationSnafu {
                relation_id: relation.id,
                database: self.name.clone(),
            }
        );
        let relation = Arc::new(relation);
        self.relations.insert(relation.id, Arc::clone(&relation));
        Ok(relation)
    }

    /// Returns true if the relation exists
    #[inline]
    pub fn has_relation_with_id(&self, id: RelationId) -> bool {
        self.relations.contains_key(&id)
    }

    /// Get the relation schema
    #[inline]
    pub fn get_relation_schema_by_id(&self, id: RelationId) -> Option<&Arc<CatalogRelationSchema>> {
        self.relations.get(&id)
    }
}
