//! Update Scheduler
//!
//! The scheduler runs the tagged operations of a graph in dependency order.
//! It ensures that dependencies are always finished before their dependents
//! start.
//!
//! # Algorithm
//!
//! Kahn's algorithm, restricted to the tagged subset and spread over a pool
//! of workers:
//!
//! 1. Move every tagged operation to `Scheduled` and count, per operation,
//!    the active relations coming from other scheduled operations
//! 2. Operations with a zero count go into the ready queue
//! 3. A worker pops an operation, runs it without holding the queue lock,
//!    then resolves one dependency on each scheduled successor
//! 4. Successors whose count drops to zero join the ready queue
//!
//! Untagged operations are not part of the pass; their last results are
//! still valid, so they count as satisfied from the start.
//!
//! Working copies are per entity, so two operations of the same entity never
//! run at the same time: a ready operation whose entity is busy waits in the
//! queue while operations of other entities go ahead.
//!
//! A worker only sleeps when nothing in the queue can be dispatched while
//! other operations are still running. If the queue is empty, nothing is
//! running and work remains, the graph contains a cycle the resolver missed:
//! the pass aborts.
//!
//! Panics never leave a worker. With `catch_panics` they become recorded
//! failures; without it a panic aborts the pass like a broken invariant.

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::error;

use super::context::{EvalContext, FrameTime, OperationKey};
use super::copies::PassCopies;
use crate::error::{OperationError, SchedulerError};
use crate::graph::{ComponentKind, Graph, OperationCode, OperationId, OperationNode, OperationState};
use crate::scene::EntityId;

/// An operation that returned an error or panicked during a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationFailure {
    pub operation: OperationId,
    pub entity: EntityId,
    pub entity_name: String,
    pub component: ComponentKind,
    pub code: OperationCode,
    pub error: OperationError,
}

/// Result of one scheduling pass.
#[derive(Debug, Default)]
pub(crate) struct PassOutcome {
    /// Completed operations in completion order.
    pub executed: Vec<OperationId>,
    pub failures: Vec<OperationFailure>,
    pub abort: Option<SchedulerError>,
}

#[derive(Default)]
struct ReadyQueue {
    ready: VecDeque<OperationId>,
    in_flight: usize,
    remaining: usize,
    /// Entities with an operation in flight.
    busy: HashSet<EntityId>,
    outcome: PassOutcome,
}

type Released = SmallVec<[OperationId; 8]>;

pub(crate) struct Scheduler<'a> {
    graph: &'a Graph,
    copies: &'a PassCopies<'a>,
    time: FrameTime,
    catch_panics: bool,
    retiring: &'a AtomicBool,
    queue: Mutex<ReadyQueue>,
    wake: Condvar,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a Graph,
        copies: &'a PassCopies<'a>,
        time: FrameTime,
        catch_panics: bool,
        retiring: &'a AtomicBool,
    ) -> Self {
        Self {
            graph,
            copies,
            time,
            catch_panics,
            retiring,
            queue: Mutex::new(ReadyQueue::default()),
            wake: Condvar::new(),
        }
    }

    /// Select the tagged subset and compute its initial ready set.
    fn prepare(&self) -> (Vec<OperationId>, Vec<OperationId>) {
        let scheduled: Vec<OperationId> = self
            .graph
            .operations()
            .filter(|op| op.is_tagged())
            .map(OperationNode::id)
            .collect();
        for op in &scheduled {
            if let Some(node) = self.graph.operation(*op) {
                node.set_state(OperationState::Scheduled);
            }
        }

        let mut ready = Vec::new();
        for op in &scheduled {
            let pending = self
                .graph
                .relations()
                .predecessors(*op)
                .filter(|pred| self.is_scheduled(*pred))
                .count();
            if let Some(node) = self.graph.operation(*op) {
                node.set_pending(pending);
            }
            if pending == 0 {
                ready.push(*op);
            }
        }
        ready.sort_by_key(|op| (self.graph.operation(*op).and_then(OperationNode::rank), *op));
        (scheduled, ready)
    }

    fn is_scheduled(&self, op: OperationId) -> bool {
        self.graph
            .operation(op)
            .is_some_and(|node| node.state() == OperationState::Scheduled)
    }

    /// Run the pass on `workers` threads and block until it is over.
    pub fn run(&self, workers: usize) -> PassOutcome {
        let (scheduled, ready) = self.prepare();
        if scheduled.is_empty() {
            return PassOutcome::default();
        }

        {
            let mut queue = self.queue.lock();
            queue.ready = ready.into();
            queue.remaining = scheduled.len();
        }

        let workers = workers.clamp(1, scheduled.len());
        if workers == 1 {
            self.worker();
        } else {
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(move || self.worker());
                }
            });
        }

        let outcome = std::mem::take(&mut self.queue.lock().outcome);
        if outcome.abort.is_some() {
            // Results of this pass are discarded, so everything in it has to
            // run again next time.
            for op in &scheduled {
                if let Some(node) = self.graph.operation(*op) {
                    node.set_state(OperationState::Tagged);
                }
            }
        }
        outcome
    }

    fn worker(&self) {
        let mut queue = self.queue.lock();
        loop {
            if queue.outcome.abort.is_some() {
                return;
            }
            if self.retiring.load(Ordering::Acquire) {
                queue.outcome.abort = Some(SchedulerError::Retired);
                self.wake.notify_all();
                return;
            }

            let next = queue
                .ready
                .iter()
                .position(|op| self.entity_of(*op).map_or(true, |entity| !queue.busy.contains(&entity)));
            if let Some(op) = next.and_then(|index| queue.ready.remove(index)) {
                let entity = self.entity_of(op);
                if let Some(entity) = entity {
                    queue.busy.insert(entity);
                }
                queue.in_flight += 1;
                let result = MutexGuard::unlocked(&mut queue, || {
                    panic::catch_unwind(AssertUnwindSafe(|| self.execute(op)))
                });
                queue.in_flight -= 1;
                queue.remaining -= 1;
                if let Some(entity) = entity {
                    queue.busy.remove(&entity);
                }
                match result {
                    Ok((failure, released)) => {
                        queue.outcome.executed.push(op);
                        queue.outcome.failures.extend(failure);
                        match released {
                            Ok(released) => queue.ready.extend(released),
                            Err(err) => {
                                error!(error = %err, "scheduler invariant violated");
                                queue.outcome.abort.get_or_insert(err);
                            }
                        }
                    }
                    Err(payload) => {
                        let err = SchedulerError::OperationPanicked {
                            operation: op,
                            message: panic_message(&*payload),
                        };
                        error!(operation = %self.graph.describe(op), error = %err, "operation panicked");
                        queue.outcome.abort.get_or_insert(err);
                    }
                }
                self.wake.notify_all();
                continue;
            }

            if queue.remaining == 0 {
                self.wake.notify_all();
                return;
            }
            if queue.in_flight == 0 {
                let err = SchedulerError::CycleDetected {
                    remaining: queue.remaining,
                };
                error!(error = %err, "scheduler invariant violated");
                queue.outcome.abort = Some(err);
                self.wake.notify_all();
                return;
            }
            self.wake.wait(&mut queue);
        }
    }

    fn entity_of(&self, op: OperationId) -> Option<EntityId> {
        self.graph.operation(op).and_then(OperationNode::entity)
    }

    /// Run one operation and release its dependents.
    fn execute(
        &self,
        op: OperationId,
    ) -> (Option<OperationFailure>, Result<Released, SchedulerError>) {
        let Some(node) = self.graph.operation(op) else {
            return (None, Ok(Released::new()));
        };

        node.set_state(OperationState::Running);
        node.record_execution();
        let failure = self.run_operation(node);
        node.set_failed(failure.is_some());
        node.set_state(OperationState::Clean);

        let mut released = Released::new();
        for succ in self.graph.relations().successors(op) {
            let Some(succ_node) = self.graph.operation(succ) else {
                continue;
            };
            if succ_node.state() != OperationState::Scheduled {
                continue;
            }
            match succ_node.resolve_dependency() {
                0 => return (failure, Err(SchedulerError::PendingUnderflow { operation: succ })),
                1 => released.push(succ),
                _ => {}
            }
        }
        (failure, Ok(released))
    }

    fn run_operation(&self, node: &OperationNode) -> Option<OperationFailure> {
        let owner = node.owner()?;

        match node.code() {
            OperationCode::CopyOnWrite => self.copies.refresh_from_original(owner.entity),
            OperationCode::SyncToOriginal => {
                let copy = self.copies.working(owner.entity);
                let properties = copy.read();
                for property in node.sync_properties() {
                    if let Some(value) = properties.get(property) {
                        self.copies
                            .queue_original_write(owner.entity, property.clone(), value.clone());
                    }
                }
            }
            _ => {}
        }

        let callable = node.callable.as_ref()?;
        let ctx = EvalContext::new(
            self.time,
            OperationKey {
                entity: owner.entity,
                component: owner.kind,
                code: node.code().clone(),
            },
            self.copies,
        );

        let result = if self.catch_panics {
            panic::catch_unwind(AssertUnwindSafe(|| callable(&ctx)))
                .unwrap_or_else(|payload| Err(OperationError::Panicked(panic_message(&*payload))))
        } else {
            callable(&ctx)
        };

        let error = result.err()?;
        let entity_name = self
            .graph
            .id_node(owner.id_node)
            .map_or_else(|| owner.entity.to_string(), |id| id.name().to_string());
        error!(
            entity = %entity_name,
            component = %owner.kind,
            operation = %node.code(),
            error = %error,
            "operation failed"
        );
        Some(OperationFailure {
            operation: node.id(),
            entity: owner.entity,
            entity_name,
            component: owner.kind,
            code: node.code().clone(),
            error,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::eval::copies::EvaluatedStore;
    use crate::eval::{operation, OperationFn};
    use crate::graph::RelationKind;
    use crate::scene::{EntityKind, Scene};

    /// One entity with a Geometry component holding `ops` in a chain.
    fn chain_graph(callables: Vec<Option<OperationFn>>) -> (Graph, Vec<OperationId>) {
        let mut graph = Graph::new();
        let id_node = graph.add_id_node(EntityId::new(0), "Cube", EntityKind::Object);
        let comp = graph
            .add_component(id_node, ComponentKind::Geometry)
            .expect("id node exists");
        let mut ops = Vec::new();
        for (index, callable) in callables.into_iter().enumerate() {
            let op = graph
                .add_operation(comp, OperationCode::Modifier(format!("m{index}")), callable)
                .expect("component exists");
            if let Some(prev) = ops.last() {
                graph.add_relation(*prev, op, RelationKind::Operation, "chain", None);
            }
            ops.push(op);
        }
        for op in graph.operations() {
            op.set_state(OperationState::Clean);
        }
        (graph, ops)
    }

    fn tag(graph: &Graph, ops: &[OperationId]) {
        for node in ops.iter().filter_map(|op| graph.operation(*op)) {
            node.set_state(OperationState::Tagged);
        }
    }

    fn run(graph: &Graph, workers: usize) -> PassOutcome {
        let scene = Scene::new();
        let store = EvaluatedStore::new();
        let copies = PassCopies::new(&scene, &store);
        let retiring = AtomicBool::new(false);
        Scheduler::new(graph, &copies, FrameTime::from(1), true, &retiring).run(workers)
    }

    #[test]
    fn empty_tag_set_runs_nothing() {
        let (graph, _) = chain_graph(vec![None, None]);
        let outcome = run(&graph, 2);
        assert!(outcome.executed.is_empty());
        assert!(outcome.abort.is_none());
    }

    #[test]
    fn runs_in_dependency_order() {
        let (graph, ops) = chain_graph(vec![None, None, None]);
        tag(&graph, &ops);

        let outcome = run(&graph, 4);
        assert_eq!(outcome.executed, ops);
        assert!(ops
            .iter()
            .all(|op| graph.operation(*op).map(OperationNode::state) == Some(OperationState::Clean)));
    }

    #[test]
    fn failure_does_not_stop_dependents() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let (graph, ops) = chain_graph(vec![
            Some(operation(|_ctx| Err(OperationError::failed("boom")))),
            Some(operation(move |_ctx| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        ]);
        tag(&graph, &ops);

        let outcome = run(&graph, 1);
        assert_eq!(outcome.executed.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].operation, ops[0]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(graph.operation(ops[0]).is_some_and(OperationNode::has_failed));
    }

    #[test]
    fn panics_become_failures() {
        let (graph, ops) = chain_graph(vec![Some(operation(|_ctx| panic!("exploded")))]);
        tag(&graph, &ops);

        let outcome = run(&graph, 1);
        assert_eq!(
            outcome.failures.first().map(|f| f.error.clone()),
            Some(OperationError::Panicked("exploded".into()))
        );
    }

    #[test]
    fn cycle_aborts_pass_and_retags() {
        let (mut graph, ops) = chain_graph(vec![None, None]);
        graph.add_relation(ops[1], ops[0], RelationKind::Data, "back", None);
        tag(&graph, &ops);

        let outcome = run(&graph, 2);
        assert_eq!(outcome.abort, Some(SchedulerError::CycleDetected { remaining: 2 }));
        assert!(ops
            .iter()
            .all(|op| graph.operation(*op).is_some_and(OperationNode::is_tagged)));
    }

    #[test]
    fn uncaught_panic_aborts_pass() {
        for workers in [1, 4] {
            let (graph, ops) = chain_graph(vec![
                Some(operation(|_ctx| panic!("exploded"))),
                None,
                None,
            ]);
            tag(&graph, &ops);

            let scene = Scene::new();
            let store = EvaluatedStore::new();
            let copies = PassCopies::new(&scene, &store);
            let retiring = AtomicBool::new(false);
            let outcome =
                Scheduler::new(&graph, &copies, FrameTime::from(1), false, &retiring).run(workers);

            assert_eq!(
                outcome.abort,
                Some(SchedulerError::OperationPanicked {
                    operation: ops[0],
                    message: "exploded".into(),
                })
            );
            assert!(outcome.executed.is_empty());
            assert!(ops
                .iter()
                .all(|op| graph.operation(*op).is_some_and(OperationNode::is_tagged)));
        }
    }

    #[test]
    fn one_entity_runs_one_operation_at_a_time() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut graph = Graph::new();
        let id_node = graph.add_id_node(EntityId::new(0), "Rig", EntityKind::Object);
        let comp = graph
            .add_component(id_node, ComponentKind::Parameters)
            .expect("id node exists");
        let mut ops = Vec::new();
        for index in 0..6 {
            let (running, peak) = (running.clone(), peak.clone());
            let callable = operation(move |_ctx| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(std::time::Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
            let op = graph
                .add_operation(comp, OperationCode::Driver(format!("p{index}")), Some(callable))
                .expect("component exists");
            ops.push(op);
        }
        for op in graph.operations() {
            op.set_state(OperationState::Clean);
        }
        tag(&graph, &ops);

        let outcome = run(&graph, 4);
        assert!(outcome.abort.is_none());
        assert_eq!(outcome.executed.len(), ops.len());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retiring_graph_dispatches_nothing() {
        let (graph, ops) = chain_graph(vec![None]);
        tag(&graph, &ops);

        let scene = Scene::new();
        let store = EvaluatedStore::new();
        let copies = PassCopies::new(&scene, &store);
        let retiring = AtomicBool::new(true);
        let outcome =
            Scheduler::new(&graph, &copies, FrameTime::from(1), true, &retiring).run(1);
        assert_eq!(outcome.abort, Some(SchedulerError::Retired));
        assert!(outcome.executed.is_empty());
    }
}
