// src/api/entities.rs

//! The entity registry consumed by the dispatch and fan-out layers.
//!
//! Entities themselves (drivers, hardware glue) live outside the protocol
//! core; the registry only records what the core needs: a stable key, naming
//! for list responses, the internal flag that excludes an entity from
//! fan-out, and the last serialized state.

use crate::api::message::{EntityKind, EntityState};

/// One registered entity.
#[derive(Debug, Clone)]
pub struct Entity {
    pub key: u32,
    pub object_id: String,
    pub name: String,
    /// Internal entities are never listed to or broadcast at clients.
    pub internal: bool,
    pub kind: EntityKind,
    pub state: EntityState,
}

/// Read-mostly set of entities, keyed by their stable `u32` key.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: Vec<Entity>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity. Keys must be unique; a duplicate key replaces
    /// the previous registration (latest driver wins, matching codegen
    /// behavior where a key collision is a build-time mistake).
    pub fn register(&mut self, entity: Entity) {
        if let Some(existing) = self.entities.iter_mut().find(|e| e.key == entity.key) {
            *existing = entity;
        } else {
            self.entities.push(entity);
        }
    }

    pub fn get(&self, key: u32) -> Option<&Entity> {
        self.entities.iter().find(|e| e.key == key)
    }

    /// Stores a new state for `key` and returns the updated entity.
    pub fn update_state(&mut self, key: u32, state: EntityState) -> Option<&Entity> {
        let entity = self.entities.iter_mut().find(|e| e.key == key)?;
        entity.state = state;
        Some(entity)
    }

    /// Iterates all entities visible to clients (internal ones filtered out).
    pub fn iter_external(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|e| !e.internal)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
