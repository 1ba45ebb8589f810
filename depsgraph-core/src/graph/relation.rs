//! Relation Store
//!
//! Typed directed edges between operation-nodes.
//!
//! A relation `A -> B` means B reads something A produces, so A must finish
//! first. Relations are never traversed through the nodes themselves: the
//! store keeps per-operation adjacency lists indexed by [`OperationId`].
//!
//! # Inactive relations
//!
//! The cycle resolver and the transitive reducer do not delete relations.
//! They deactivate them: the relation leaves the adjacency lists (so every
//! traversal ignores it) but stays in the store together with the reason.
//! An incremental rebuild reactivates everything and re-runs both passes, so
//! a relation that was redundant only because of a path that no longer
//! exists comes back.
//!
//! Slots of deleted relations are reused by later additions, so repeated
//! incremental patches keep the store at the size of the live relation set.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::node::OperationId;
use crate::scene::EntityId;

/// Handle of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(u32);

impl RelationId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Semantic kind of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationKind {
    /// B consumes a value A computes.
    Data,
    /// Pure ordering between operations of one entity.
    Operation,
    /// A is the time source; B changes with the frame.
    Time,
    /// Anchors an otherwise unconstrained operation to the graph root.
    Root,
    /// B writes A's result back into the original entity.
    CowSync,
}

impl RelationKind {
    /// Dropping an advisory relation only loses ordering, never data.
    pub fn is_advisory(self) -> bool {
        matches!(self, RelationKind::Operation | RelationKind::Time | RelationKind::Root)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationKind::Data => "data",
            RelationKind::Operation => "operation",
            RelationKind::Time => "time",
            RelationKind::Root => "root",
            RelationKind::CowSync => "cow-sync",
        };
        f.write_str(name)
    }
}

/// Whether a relation takes part in traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationStatus {
    Active,
    /// Removed to break a dependency cycle.
    Cyclic,
    /// Implied by another path.
    Reduced,
}

/// A directed edge between two operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub(crate) id: RelationId,
    pub(crate) from: OperationId,
    pub(crate) to: OperationId,
    pub(crate) kind: RelationKind,
    pub(crate) name: Cow<'static, str>,
    /// Entity whose relation pass created this edge.
    pub(crate) owner: Option<EntityId>,
    pub(crate) status: RelationStatus,
}

impl Relation {
    pub fn id(&self) -> RelationId {
        self.id
    }

    pub fn from(&self) -> OperationId {
        self.from
    }

    pub fn to(&self) -> OperationId {
        self.to
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    pub fn status(&self) -> RelationStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == RelationStatus::Active
    }
}

type Adjacency = SmallVec<[RelationId; 4]>;

/// Storage for all relations of a graph.
#[derive(Debug, Default)]
pub struct RelationStore {
    relations: Vec<Option<Relation>>,
    outgoing: Vec<Adjacency>,
    incoming: Vec<Adjacency>,
    /// Every stored relation per endpoint, active or not.
    touching: Vec<Adjacency>,
    free: Vec<RelationId>,
    active: usize,
}

impl RelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_capacity(&mut self, op: OperationId) {
        let needed = op.index() + 1;
        if self.outgoing.len() < needed {
            self.outgoing.resize_with(needed, Adjacency::new);
            self.incoming.resize_with(needed, Adjacency::new);
            self.touching.resize_with(needed, Adjacency::new);
        }
    }

    /// Add an active relation.
    pub fn add(
        &mut self,
        from: OperationId,
        to: OperationId,
        kind: RelationKind,
        name: impl Into<Cow<'static, str>>,
        owner: Option<EntityId>,
    ) -> RelationId {
        self.ensure_capacity(from);
        self.ensure_capacity(to);

        let id = self
            .free
            .pop()
            .unwrap_or(RelationId(self.relations.len() as u32));
        let relation = Some(Relation {
            id,
            from,
            to,
            kind,
            name: name.into(),
            owner,
            status: RelationStatus::Active,
        });
        match self.relations.get_mut(id.index()) {
            Some(slot) => *slot = relation,
            None => self.relations.push(relation),
        }
        self.outgoing[from.index()].push(id);
        self.incoming[to.index()].push(id);
        self.touching[from.index()].push(id);
        if from != to {
            self.touching[to.index()].push(id);
        }
        self.active += 1;
        id
    }

    pub fn get(&self, id: RelationId) -> Option<&Relation> {
        self.relations.get(id.index()).and_then(Option::as_ref)
    }

    /// Active relations leaving `op`.
    pub fn outgoing(&self, op: OperationId) -> &[RelationId] {
        self.outgoing.get(op.index()).map_or(&[], |list| list.as_slice())
    }

    /// Active relations entering `op`.
    pub fn incoming(&self, op: OperationId) -> &[RelationId] {
        self.incoming.get(op.index()).map_or(&[], |list| list.as_slice())
    }

    /// Operations `op` depends on directly.
    pub fn predecessors(&self, op: OperationId) -> impl Iterator<Item = OperationId> + '_ {
        self.incoming(op)
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|relation| relation.from)
    }

    /// Operations depending on `op` directly.
    pub fn successors(&self, op: OperationId) -> impl Iterator<Item = OperationId> + '_ {
        self.outgoing(op)
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|relation| relation.to)
    }

    /// Whether an active relation `from -> to` exists.
    pub fn has_relation(&self, from: OperationId, to: OperationId) -> bool {
        self.successors(from).any(|succ| succ == to)
    }

    /// Every stored relation, active or not.
    pub fn iter(&self) -> impl Iterator<Item = &Relation> {
        self.relations.iter().flatten()
    }

    /// Relations currently taking part in traversal.
    pub fn active(&self) -> impl Iterator<Item = &Relation> {
        self.iter().filter(|relation| relation.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Upper bound of relation handles.
    pub fn capacity(&self) -> usize {
        self.relations.len()
    }

    /// Count of stored relations with the given status.
    pub fn count_with_status(&self, status: RelationStatus) -> usize {
        self.iter().filter(|relation| relation.status == status).count()
    }

    fn unlink(&mut self, id: RelationId, from: OperationId, to: OperationId) {
        if let Some(list) = self.outgoing.get_mut(from.index()) {
            list.retain(|rel| *rel != id);
        }
        if let Some(list) = self.incoming.get_mut(to.index()) {
            list.retain(|rel| *rel != id);
        }
    }

    /// Take an active relation out of traversal, recording why.
    pub fn deactivate(&mut self, id: RelationId, status: RelationStatus) -> Option<&Relation> {
        let (from, to) = match self.get(id) {
            Some(relation) if relation.is_active() && status != RelationStatus::Active => {
                (relation.from, relation.to)
            }
            _ => return None,
        };
        self.unlink(id, from, to);
        self.active -= 1;
        let relation = self.relations[id.index()].as_mut()?;
        relation.status = status;
        Some(&*relation)
    }

    /// Put every inactive relation back into traversal.
    pub fn reactivate_all(&mut self) -> usize {
        let mut restored = Vec::new();
        for relation in self.relations.iter_mut().flatten() {
            if !relation.is_active() {
                relation.status = RelationStatus::Active;
                restored.push((relation.id, relation.from, relation.to));
            }
        }
        for (id, from, to) in &restored {
            self.outgoing[from.index()].push(*id);
            self.incoming[to.index()].push(*id);
        }
        self.active += restored.len();
        restored.len()
    }

    /// Delete a relation permanently.
    pub fn remove(&mut self, id: RelationId) -> Option<Relation> {
        let relation = self.relations.get_mut(id.index())?.take()?;
        if relation.is_active() {
            self.unlink(id, relation.from, relation.to);
            self.active -= 1;
        }
        for op in [relation.from, relation.to] {
            if let Some(list) = self.touching.get_mut(op.index()) {
                list.retain(|rel| *rel != id);
            }
        }
        self.free.push(id);
        Some(relation)
    }

    /// Delete every relation touching `op`, active or not.
    pub fn remove_incident(&mut self, op: OperationId) -> usize {
        let ids: Adjacency = self.touching.get(op.index()).cloned().unwrap_or_default();
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    /// Delete every relation created by `owner`'s relation pass.
    pub fn remove_owned_by(&mut self, owner: EntityId) -> usize {
        let ids: Vec<RelationId> = self
            .iter()
            .filter(|relation| relation.owner == Some(owner))
            .map(|relation| relation.id)
            .collect();
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    /// Delete every relation of the given kind.
    pub fn remove_kind(&mut self, kind: RelationKind) -> usize {
        let ids: Vec<RelationId> = self
            .iter()
            .filter(|relation| relation.kind == kind)
            .map(|relation| relation.id)
            .collect();
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }
}
