//! Relations and associations.
//!
//! A [`Schema`] is a registry of relations keyed by [`RelationId`].
//! Associations name the relations they connect by id, so the registry has
//! no reference cycles and can be frozen behind an `Arc` and shared by every
//! query built on it.
//!
//! ```
//! use relq::prelude::*;
//! use std::sync::Arc;
//!
//! let mut schema = Schema::new();
//! let trips = schema.add_table("trips");
//! let stops = schema.add_table("stops");
//! schema.has_many(trips, stops, AssociationOptions::default()).unwrap();
//! schema.belongs_to(stops, trips, AssociationOptions::default()).unwrap();
//!
//! let schema = Arc::new(schema);
//! let sql = schema.query(trips).unwrap().to_sql().unwrap();
//! assert_eq!(sql, "SELECT *\nFROM \"trips\" AS \"trips\"");
//! ```

use crate::error::{RelqError, RelqResult};
use crate::expr::Expression;
use crate::query::Query;
use crate::row::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Primary key assumed for tables registered without one.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Stable handle of a relation inside its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(usize);

/// Builds the join predicate between a master and a slave alias.
pub type JoinCondition = Arc<dyn Fn(&Row, &str, &str) -> Expression + Send + Sync>;

/// Which side of the relationship the declaring relation is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The declaring relation is the master (one side).
    HasMany,
    /// The declaring relation is the slave (many side).
    BelongsTo,
}

/// Options for [`Schema::has_many`] and [`Schema::belongs_to`].
#[derive(Debug, Clone, Default)]
pub struct AssociationOptions {
    pub alias: Option<String>,
    pub foreign_key: Option<String>,
    pub target_key: Option<String>,
}

impl AssociationOptions {
    /// Register the association under `alias` instead of the target's name.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn foreign_key(mut self, key: impl Into<String>) -> Self {
        self.foreign_key = Some(key.into());
        self
    }

    pub fn target_key(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }
}

/// A directed relationship between a master and a slave relation.
///
/// Both directions share one derivation: `belongs_to` builds the `has_many`
/// seen from the other side and only flips [`Direction`], so the join
/// predicate is the same whichever side declared it.
#[derive(Clone)]
pub struct Association {
    direction: Direction,
    master: RelationId,
    slave: RelationId,
    foreign_key: String,
    target_key: String,
    join_conditions: Vec<JoinCondition>,
}

impl Association {
    fn has_many(master: &Relation, slave: &Relation, options: &AssociationOptions) -> RelqResult<Self> {
        let foreign_key = options
            .foreign_key
            .clone()
            .unwrap_or_else(|| format!("{}Id", master.name));
        let target_key = options
            .target_key
            .clone()
            .or_else(|| master.primary_key.clone())
            .ok_or_else(|| RelqError::MissingTargetKey {
                master: master.name.clone(),
            })?;

        let (pk, fk) = (target_key.clone(), foreign_key.clone());
        let condition: JoinCondition = Arc::new(move |row: &Row, master: &str, slave: &str| {
            row.col_of(master, &pk).eq(row.col_of(slave, &fk))
        });

        Ok(Self {
            direction: Direction::HasMany,
            master: master.id,
            slave: slave.id,
            foreign_key,
            target_key,
            join_conditions: vec![condition],
        })
    }

    fn belongs_to(owner: &Relation, target: &Relation, options: &AssociationOptions) -> RelqResult<Self> {
        let mut association = Self::has_many(target, owner, options)?;
        association.direction = Direction::BelongsTo;
        Ok(association)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True when traversal reaches at most one row.
    pub fn is_single(&self) -> bool {
        self.direction == Direction::BelongsTo
    }

    pub fn master(&self) -> RelationId {
        self.master
    }

    pub fn slave(&self) -> RelationId {
        self.slave
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub fn join_conditions(&self) -> &[JoinCondition] {
        &self.join_conditions
    }

    /// Relation reached when traversing from the declaring relation.
    pub fn target(&self) -> RelationId {
        match self.direction {
            Direction::HasMany => self.slave,
            Direction::BelongsTo => self.master,
        }
    }

    /// Join predicate between the declaring side (`owner_alias`) and the
    /// traversed side (`target_alias`), all conditions AND-ed together.
    pub fn condition(&self, row: &Row, owner_alias: &str, target_alias: &str) -> Expression {
        let (master, slave) = match self.direction {
            Direction::HasMany => (owner_alias, target_alias),
            Direction::BelongsTo => (target_alias, owner_alias),
        };
        self.join_conditions
            .iter()
            .map(|condition| condition(row, master, slave))
            .reduce(|acc, condition| acc.and(condition))
            .unwrap_or_else(|| Expression::Literal("TRUE".to_string()))
    }
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("direction", &self.direction)
            .field("master", &self.master)
            .field("slave", &self.slave)
            .field("foreign_key", &self.foreign_key)
            .field("target_key", &self.target_key)
            .field("join_conditions", &self.join_conditions.len())
            .finish()
    }
}

/// A table or derived relation.
#[derive(Debug, Clone)]
pub struct Relation {
    id: RelationId,
    name: String,
    primary_key: Option<String>,
    associations: BTreeMap<String, Association>,
}

impl Relation {
    pub fn id(&self) -> RelationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn associations(&self) -> &BTreeMap<String, Association> {
        &self.associations
    }

    /// Look up an association by the name it was registered under.
    pub fn association(&self, name: &str) -> RelqResult<&Association> {
        self.associations
            .get(name)
            .ok_or_else(|| RelqError::unknown_association(&self.name, name))
    }
}

/// Registry of relations.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    relations: Vec<Relation>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table whose primary key is `id`.
    pub fn add_table(&mut self, name: impl Into<String>) -> RelationId {
        self.add_relation(name, Some(DEFAULT_PRIMARY_KEY))
    }

    pub fn add_table_with_key(&mut self, name: impl Into<String>, primary_key: &str) -> RelationId {
        self.add_relation(name, Some(primary_key))
    }

    /// Register a relation; derived relations may have no primary key.
    pub fn add_relation(&mut self, name: impl Into<String>, primary_key: Option<&str>) -> RelationId {
        let id = RelationId(self.relations.len());
        self.relations.push(Relation {
            id,
            name: name.into(),
            primary_key: primary_key.map(str::to_string),
            associations: BTreeMap::new(),
        });
        id
    }

    pub fn relation(&self, id: RelationId) -> RelqResult<&Relation> {
        self.relations
            .get(id.0)
            .ok_or_else(|| RelqError::UnknownRelation(format!("#{}", id.0)))
    }

    pub fn relation_by_name(&self, name: &str) -> RelqResult<RelationId> {
        self.relations
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.id)
            .ok_or_else(|| RelqError::UnknownRelation(name.to_string()))
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.iter()
    }

    /// `owner` has many `target`; registered on `owner`.
    pub fn has_many(
        &mut self,
        owner: RelationId,
        target: RelationId,
        options: AssociationOptions,
    ) -> RelqResult<()> {
        let association = Association::has_many(self.relation(owner)?, self.relation(target)?, &options)?;
        self.register(owner, target, options.alias, association)
    }

    /// `owner` belongs to `target`; registered on `owner`.
    pub fn belongs_to(
        &mut self,
        owner: RelationId,
        target: RelationId,
        options: AssociationOptions,
    ) -> RelqResult<()> {
        let association = Association::belongs_to(self.relation(owner)?, self.relation(target)?, &options)?;
        self.register(owner, target, options.alias, association)
    }

    fn register(
        &mut self,
        owner: RelationId,
        target: RelationId,
        alias: Option<String>,
        association: Association,
    ) -> RelqResult<()> {
        let name = match alias {
            Some(alias) => alias,
            None => self.relation(target)?.name.clone(),
        };
        let relation = self
            .relations
            .get_mut(owner.0)
            .ok_or_else(|| RelqError::UnknownRelation(format!("#{}", owner.0)))?;
        if relation.associations.contains_key(&name) {
            return Err(RelqError::AliasAlreadyUsed(name));
        }
        tracing::debug!(
            "Registered {:?} association '{}' on '{}'",
            association.direction,
            name,
            relation.name
        );
        relation.associations.insert(name, association);
        Ok(())
    }

    /// Shareable handle to one relation of this schema.
    pub fn reference(self: &Arc<Self>, id: RelationId) -> RelqResult<RelationRef> {
        self.relation(id)?;
        Ok(RelationRef {
            schema: Arc::clone(self),
            id,
        })
    }

    /// A base query over `id`, aliased by the relation's name.
    pub fn query(self: &Arc<Self>, id: RelationId) -> RelqResult<Query> {
        Ok(Query::from_relation(&self.reference(id)?, None))
    }

    /// Parse a schema description.
    ///
    /// ```toml
    /// [[relations]]
    /// name = "trips"
    ///
    /// [[relations]]
    /// name = "stops"
    ///
    /// [[associations]]
    /// kind = "has_many"
    /// owner = "trips"
    /// target = "stops"
    /// foreign_key = "tripId"
    /// ```
    pub fn from_toml_str(content: &str) -> RelqResult<Self> {
        let config: SchemaConfig = toml::from_str(content)
            .map_err(|e| RelqError::Config(format!("Failed to parse schema: {}", e)))?;

        let mut schema = Schema::new();
        for def in &config.relations {
            let primary_key = match (&def.primary_key, def.derived) {
                (Some(key), _) => Some(key.as_str()),
                (None, false) => Some(DEFAULT_PRIMARY_KEY),
                (None, true) => None,
            };
            schema.add_relation(def.name.as_str(), primary_key);
        }
        for def in config.associations {
            let owner = schema.relation_by_name(&def.owner)?;
            let target = schema.relation_by_name(&def.target)?;
            let options = AssociationOptions {
                alias: def.alias,
                foreign_key: def.foreign_key,
                target_key: def.target_key,
            };
            match def.kind {
                Direction::HasMany => schema.has_many(owner, target, options)?,
                Direction::BelongsTo => schema.belongs_to(owner, target, options)?,
            }
        }
        Ok(schema)
    }

    /// Load a schema description from a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> RelqResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| RelqError::Config(format!("Failed to read schema: {}", e)))?;
        let schema = Self::from_toml_str(&content)?;
        tracing::info!(
            "Loaded {} relations from {}",
            schema.relations.len(),
            path.display()
        );
        Ok(schema)
    }
}

/// A relation together with the schema it lives in.
#[derive(Clone)]
pub struct RelationRef {
    schema: Arc<Schema>,
    id: RelationId,
}

impl RelationRef {
    pub fn id(&self) -> RelationId {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn relation(&self) -> &Relation {
        // Ids are checked when the reference is created and schemas never shrink.
        &self.schema.relations[self.id.0]
    }

    pub fn name(&self) -> &str {
        self.relation().name()
    }

    pub fn association(&self, name: &str) -> RelqResult<&Association> {
        self.relation().association(name)
    }

    /// Another relation of the same schema.
    pub fn sibling(&self, id: RelationId) -> RelqResult<RelationRef> {
        self.schema.reference(id)
    }

    /// First association (by name) leading to `target`.
    pub fn association_to(&self, target: &RelationRef) -> Option<&Association> {
        if !Arc::ptr_eq(&self.schema, &target.schema) {
            return None;
        }
        self.relation()
            .associations
            .values()
            .find(|association| association.target() == target.id)
    }
}

impl PartialEq for RelationRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.schema, &other.schema) && self.id == other.id
    }
}

impl std::fmt::Debug for RelationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RelationRef({})", self.name())
    }
}

#[derive(Debug, Deserialize)]
struct SchemaConfig {
    #[serde(default)]
    relations: Vec<RelationDef>,
    #[serde(default)]
    associations: Vec<AssociationDef>,
}

#[derive(Debug, Deserialize)]
struct RelationDef {
    name: String,
    primary_key: Option<String>,
    #[serde(default)]
    derived: bool,
}

#[derive(Debug, Deserialize)]
struct AssociationDef {
    kind: Direction,
    owner: String,
    target: String,
    #[serde(rename = "as")]
    alias: Option<String>,
    foreign_key: Option<String>,
    target_key: Option<String>,
}
