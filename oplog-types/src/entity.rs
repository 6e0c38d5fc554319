//! Entity types and entity keys.

use crate::{EntityId, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of entity an operation can target.
///
/// `All` is used by full-state operations that replace every entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Task,
    Project,
    Tag,
    Note,
    TaskRepeatCfg,
    Reminder,
    SimpleCounter,
    GlobalConfig,
    Planner,
    All,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL_TYPES: [EntityType; 10] = [
        EntityType::Task,
        EntityType::Project,
        EntityType::Tag,
        EntityType::Note,
        EntityType::TaskRepeatCfg,
        EntityType::Reminder,
        EntityType::SimpleCounter,
        EntityType::GlobalConfig,
        EntityType::Planner,
        EntityType::All,
    ];

    /// Wire name of the entity type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "TASK",
            EntityType::Project => "PROJECT",
            EntityType::Tag => "TAG",
            EntityType::Note => "NOTE",
            EntityType::TaskRepeatCfg => "TASK_REPEAT_CFG",
            EntityType::Reminder => "REMINDER",
            EntityType::SimpleCounter => "SIMPLE_COUNTER",
            EntityType::GlobalConfig => "GLOBAL_CONFIG",
            EntityType::Planner => "PLANNER",
            EntityType::All => "ALL",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL_TYPES
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownEntityType(s.to_owned()))
    }
}

/// Addresses a single entity: `(entity_type, entity_id)`, rendered `TYPE:id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityKey {
    #[must_use]
    pub fn new(entity_type: EntityType, entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidEntityKey(s.to_owned()))?;
        if id.is_empty() {
            return Err(Error::InvalidEntityKey(s.to_owned()));
        }
        Ok(Self::new(ty.parse()?, id))
    }
}

// Keys travel as `TYPE:id` strings so snapshots stay readable.
impl Serialize for EntityKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
