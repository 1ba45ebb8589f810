//! Graph Nodes
//!
//! This module defines the three node layers that live in the dependency
//! graph: ID-nodes (one per entity), component-nodes (one per evaluation
//! domain of an entity) and operation-nodes (the schedulable units).
//!
//! All nodes live in arenas owned by [`Graph`](super::Graph) and refer to
//! each other by small integer handles. Ownership is expressed by the arena;
//! a handle never keeps a node alive.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::eval::OperationFn;
use crate::scene::{EntityId, EntityKind};

macro_rules! arena_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            /// Position of the node in its arena.
            pub fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_handle!(
    /// Handle of an ID-node.
    IdNodeId,
    "id"
);
arena_handle!(
    /// Handle of a component-node.
    ComponentId,
    "comp"
);
arena_handle!(
    /// Handle of an operation-node.
    OperationId,
    "op"
);

/// Evaluation domain of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Creates the evaluated copy of the entity.
    CopyOnWrite,
    Animation,
    /// Generic properties and drivers.
    Parameters,
    Transform,
    Pose,
    Geometry,
    Particles,
    PointCache,
    Collection,
    NodeTree,
    /// Write-back of driven values into the original entity.
    Synchronization,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 11] = [
        ComponentKind::CopyOnWrite,
        ComponentKind::Animation,
        ComponentKind::Parameters,
        ComponentKind::Transform,
        ComponentKind::Pose,
        ComponentKind::Geometry,
        ComponentKind::Particles,
        ComponentKind::PointCache,
        ComponentKind::Collection,
        ComponentKind::NodeTree,
        ComponentKind::Synchronization,
    ];

    /// Whether the inner operations run one after another.
    ///
    /// Otherwise they fan out from the entry and join at the exit.
    pub fn is_chain(self) -> bool {
        !matches!(
            self,
            ComponentKind::Particles | ComponentKind::Parameters | ComponentKind::Pose
        )
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::CopyOnWrite => "CopyOnWrite",
            ComponentKind::Animation => "Animation",
            ComponentKind::Parameters => "Parameters",
            ComponentKind::Transform => "Transform",
            ComponentKind::Pose => "Pose",
            ComponentKind::Geometry => "Geometry",
            ComponentKind::Particles => "Particles",
            ComponentKind::PointCache => "PointCache",
            ComponentKind::Collection => "Collection",
            ComponentKind::NodeTree => "NodeTree",
            ComponentKind::Synchronization => "Synchronization",
        };
        f.write_str(name)
    }
}

/// What an operation-node does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCode {
    /// Component entry pseudo-operation.
    Entry,
    /// Component exit pseudo-operation.
    Exit,

    CopyOnWrite,
    AnimationEval,
    ParametersEval,
    /// Evaluate the driver of the named property.
    Driver(String),

    TransformLocal,
    TransformParent,
    TransformConstraints,
    TransformFinal,

    PoseInit,
    Bone(String),
    PoseDone,

    Modifier(String),
    GeometryEval,

    ParticleSystem(String),

    PointCacheReset,
    SimulationStep,

    CollectionEval,
    NodeTreeEval,

    SyncToOriginal,

    /// Graph-level anchor every otherwise unconstrained operation hangs off.
    Root,
    /// Graph-level source of frame changes.
    TimeSource,
}

impl OperationCode {
    /// Entry and exit operations only exist to simplify wiring.
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            OperationCode::Entry | OperationCode::Exit | OperationCode::Root | OperationCode::TimeSource
        )
    }
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationCode::Driver(property) => write!(f, "Driver[{property}]"),
            OperationCode::Bone(name) => write!(f, "Bone[{name}]"),
            OperationCode::Modifier(name) => write!(f, "Modifier[{name}]"),
            OperationCode::ParticleSystem(name) => write!(f, "ParticleSystem[{name}]"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Evaluation state of an operation-node.
///
/// `Clean -> Tagged -> Scheduled -> Running -> Clean`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationState {
    /// The last evaluated result is current.
    Clean = 0,

    /// An input changed; the operation must run on the next pass.
    Tagged = 1,

    /// Selected for the running pass, waiting on dependencies.
    Scheduled = 2,

    /// Currently executing on a worker.
    Running = 3,
}

impl OperationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => OperationState::Tagged,
            2 => OperationState::Scheduled,
            3 => OperationState::Running,
            _ => OperationState::Clean,
        }
    }
}

/// Where an operation sits in the node hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOwner {
    pub id_node: IdNodeId,
    pub component: ComponentId,
    pub entity: EntityId,
    pub kind: ComponentKind,
}

/// One node per entity in the graph.
#[derive(Debug)]
pub struct IdNode {
    pub(crate) id: IdNodeId,
    pub(crate) entity: EntityId,
    pub(crate) name: String,
    pub(crate) kind: EntityKind,
    pub(crate) components: IndexMap<ComponentKind, ComponentId>,
}

impl IdNode {
    pub fn id(&self) -> IdNodeId {
        self.id
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Components in creation order.
    pub fn components(&self) -> impl Iterator<Item = (ComponentKind, ComponentId)> + '_ {
        self.components.iter().map(|(kind, id)| (*kind, *id))
    }

    pub fn component(&self, kind: ComponentKind) -> Option<ComponentId> {
        self.components.get(&kind).copied()
    }
}

/// Groups the operations of one evaluation domain of an entity.
#[derive(Debug)]
pub struct ComponentNode {
    pub(crate) id: ComponentId,
    pub(crate) id_node: IdNodeId,
    pub(crate) kind: ComponentKind,
    pub(crate) entry: OperationId,
    pub(crate) exit: OperationId,
    /// Inner operations, excluding entry and exit.
    pub(crate) operations: Vec<OperationId>,
}

impl ComponentNode {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn id_node(&self) -> IdNodeId {
        self.id_node
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Operation that external dependencies point at.
    pub fn entry(&self) -> OperationId {
        self.entry
    }

    /// Operation that external dependents hang off.
    pub fn exit(&self) -> OperationId {
        self.exit
    }

    pub fn operations(&self) -> &[OperationId] {
        &self.operations
    }

    /// Entry, inner operations and exit.
    pub fn all_operations(&self) -> impl Iterator<Item = OperationId> + '_ {
        std::iter::once(self.entry)
            .chain(self.operations.iter().copied())
            .chain(std::iter::once(self.exit))
    }
}

/// The atomic schedulable unit.
pub struct OperationNode {
    pub(crate) id: OperationId,
    pub(crate) owner: Option<OperationOwner>,
    pub(crate) code: OperationCode,
    pub(crate) callable: Option<OperationFn>,
    /// Re-runs on every frame change.
    pub(crate) time_dependent: bool,
    /// Properties mirrored into the original by a `SyncToOriginal` operation.
    pub(crate) sync_properties: Vec<String>,
    /// Position in the computed execution order.
    pub(crate) rank: Option<u32>,

    state: AtomicU8,
    /// Unfinished dependencies during a pass.
    pending: AtomicUsize,
    executions: AtomicU64,
    failed: AtomicBool,
}

impl OperationNode {
    /// Create a new operation. New operations start tagged so that the first
    /// pass after creation evaluates them.
    pub(crate) fn new(
        id: OperationId,
        owner: Option<OperationOwner>,
        code: OperationCode,
        callable: Option<OperationFn>,
    ) -> Self {
        Self {
            id,
            owner,
            code,
            callable,
            time_dependent: false,
            sync_properties: Vec::new(),
            rank: None,
            state: AtomicU8::new(OperationState::Tagged as u8),
            pending: AtomicUsize::new(0),
            executions: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Owning entity and component; `None` for graph-level operations.
    pub fn owner(&self) -> Option<OperationOwner> {
        self.owner
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.owner.map(|owner| owner.entity)
    }

    pub fn component_kind(&self) -> Option<ComponentKind> {
        self.owner.map(|owner| owner.kind)
    }

    pub fn code(&self) -> &OperationCode {
        &self.code
    }

    pub fn is_time_dependent(&self) -> bool {
        self.time_dependent
    }

    pub fn rank(&self) -> Option<u32> {
        self.rank
    }

    pub fn sync_properties(&self) -> &[String] {
        &self.sync_properties
    }

    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: OperationState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move a clean operation to `Tagged`.
    ///
    /// Returns `false` if the operation was already tagged or in a pass.
    pub(crate) fn mark_tagged(&self) -> bool {
        self.state
            .compare_exchange(
                OperationState::Clean as u8,
                OperationState::Tagged as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_tagged(&self) -> bool {
        self.state() == OperationState::Tagged
    }

    pub(crate) fn set_pending(&self, count: usize) {
        self.pending.store(count, Ordering::Release);
    }

    /// Resolve one dependency. Returns the count before the decrement.
    pub(crate) fn resolve_dependency(&self) -> usize {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0)
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    /// How many times the operation has run since the graph was built.
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub(crate) fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::Release);
    }

    /// The last run of this operation returned an error.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for OperationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationNode")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("code", &self.code)
            .field("time_dependent", &self.time_dependent)
            .field("rank", &self.rank)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
