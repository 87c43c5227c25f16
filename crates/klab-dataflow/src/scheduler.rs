// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Dependency graph scheduler
//!
//! Builds the dependency graph of a resolved actuator tree, orders it
//! topologically and groups the order into execution ranks.
//!
//! ## Graph
//!
//! One vertex per non-reference actuator. Every structural child adds an
//! edge child -> parent. A reference child adds an edge referent -> parent
//! when the referent was declared earlier in the tree; otherwise it is
//! dropped, since an earlier resolution may already have produced it.
//!
//! ## Ranks
//!
//! The topological order is walked while keeping a current group. An actuator
//! with an incoming edge from a member of the group closes the group and
//! starts the next rank; it then joins the new group. Actuators in one rank
//! never share an edge, and every edge goes from a lower to a higher rank.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use tracing::{debug, trace};

use crate::actuator::{ActuatorId, ActuatorKind, ActuatorTree};
use crate::{DataflowError, DataflowResult};

/// `target` depends on the committed value of `source`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DependencyEdge {
    pub source: ActuatorId,
    pub target: ActuatorId,
    /// Rank of the source
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledActuator {
    pub actuator: ActuatorId,
    pub rank: usize,
}

/// Output of [`Scheduler::schedule`]
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Executable actuators in topological order
    order: Vec<ScheduledActuator>,
    /// Every vertex, including void actuators left out of `order`
    vertices: Vec<ActuatorId>,
    ranks: AHashMap<ActuatorId, usize>,
    edges: Vec<DependencyEdge>,
    incoming: AHashMap<ActuatorId, Vec<ActuatorId>>,
}

impl Schedule {
    pub fn order(&self) -> &[ScheduledActuator] {
        &self.order
    }

    /// All graph vertices in topological order
    pub fn vertices(&self) -> &[ActuatorId] {
        &self.vertices
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn rank_of(&self, actuator: ActuatorId) -> Option<usize> {
        self.ranks.get(&actuator).copied()
    }

    /// Direct dependencies of `actuator`
    pub fn dependencies(&self, actuator: ActuatorId) -> &[ActuatorId] {
        self.incoming.get(&actuator).map_or(&[], Vec::as_slice)
    }

    /// Number of ranks holding at least one executable actuator
    pub fn rank_count(&self) -> usize {
        self.groups().len()
    }

    /// Executable actuators grouped by rank, in increasing rank order; ranks
    /// left empty by void actuators are skipped
    pub fn groups(&self) -> Vec<Vec<ActuatorId>> {
        self.ranked_groups().into_iter().map(|(_, group)| group).collect()
    }

    /// [`groups`](Self::groups) paired with the rank each one runs at
    pub fn ranked_groups(&self) -> Vec<(usize, Vec<ActuatorId>)> {
        let mut groups: Vec<Vec<ActuatorId>> = Vec::new();
        for scheduled in &self.order {
            if groups.len() <= scheduled.rank {
                groups.resize_with(scheduled.rank + 1, Vec::new);
            }
            groups[scheduled.rank].push(scheduled.actuator);
        }
        groups
            .into_iter()
            .enumerate()
            .filter(|(_, group)| !group.is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Order and rank the actuators of `tree`
    ///
    /// # Errors
    ///
    /// `CycleDetected` if references close a cycle
    pub fn schedule(tree: &ActuatorTree) -> DataflowResult<Schedule> {
        let (vertices, edges) = Self::load_graph(tree);
        let order = Self::topological_order(tree, &vertices, &edges)?;

        let mut incoming: AHashMap<ActuatorId, Vec<ActuatorId>> = AHashMap::new();
        for &(source, target) in &edges {
            incoming.entry(target).or_default().push(source);
        }

        let mut ranks: AHashMap<ActuatorId, usize> = AHashMap::with_capacity(order.len());
        let mut group: AHashSet<ActuatorId> = AHashSet::new();
        let mut rank = 0usize;
        for &actuator in &order {
            let depends_on_group = incoming
                .get(&actuator)
                .is_some_and(|sources| sources.iter().any(|s| group.contains(s)));
            if depends_on_group {
                group.clear();
                rank += 1;
            }
            group.insert(actuator);
            ranks.insert(actuator, rank);
            trace!(target: "klab-dataflow", "{} -> rank {}", tree[actuator].name, rank);
        }

        let edges: Vec<DependencyEdge> = edges
            .into_iter()
            .map(|(source, target)| DependencyEdge {
                source,
                target,
                rank: ranks[&source],
            })
            .collect();

        // void actuators stay in the graph for ordering but have nothing to run
        let scheduled: Vec<ScheduledActuator> = order
            .iter()
            .filter(|&&id| !(tree[id].kind == ActuatorKind::Void && tree[id].computation.is_empty()))
            .map(|&id| ScheduledActuator {
                actuator: id,
                rank: ranks[&id],
            })
            .collect();

        debug!(
            target: "klab-dataflow",
            "Scheduled {} actuator(s) in {} rank(s), {} dependency edge(s)",
            scheduled.len(),
            scheduled.iter().map(|s| s.rank).collect::<AHashSet<_>>().len(),
            edges.len()
        );

        Ok(Schedule {
            order: scheduled,
            vertices: order,
            ranks,
            edges,
            incoming,
        })
    }

    /// Vertices in declaration order and deduplicated edges
    fn load_graph(tree: &ActuatorTree) -> (Vec<ActuatorId>, Vec<(ActuatorId, ActuatorId)>) {
        let mut vertices = Vec::new();
        let mut cache: AHashMap<&str, ActuatorId> = AHashMap::new();
        let mut seen: AHashSet<(ActuatorId, ActuatorId)> = AHashSet::new();
        let mut edges = Vec::new();

        // preorder, so the cache holds exactly the actuators declared before
        // the one being visited
        let mut stack: Vec<(ActuatorId, Option<ActuatorId>)> = vec![(tree.root(), None)];
        while let Some((id, parent)) = stack.pop() {
            let actuator = &tree[id];
            if actuator.is_reference() {
                match (cache.get(actuator.name.as_str()), parent) {
                    (Some(&referent), Some(parent)) => {
                        if seen.insert((referent, parent)) {
                            edges.push((referent, parent));
                        }
                    }
                    _ => debug!(
                        target: "klab-dataflow",
                        "Dropping dangling reference to {}",
                        actuator.name
                    ),
                }
                continue;
            }

            cache.insert(actuator.name.as_str(), id);
            vertices.push(id);
            if let Some(parent) = parent {
                if seen.insert((id, parent)) {
                    edges.push((id, parent));
                }
            }
            for &child in actuator.children().iter().rev() {
                stack.push((child, Some(id)));
            }
        }
        (vertices, edges)
    }

    /// Kahn's algorithm, ties broken by declaration order
    fn topological_order(
        tree: &ActuatorTree,
        vertices: &[ActuatorId],
        edges: &[(ActuatorId, ActuatorId)],
    ) -> DataflowResult<Vec<ActuatorId>> {
        let position: AHashMap<ActuatorId, usize> =
            vertices.iter().enumerate().map(|(i, &v)| (v, i)).collect();
        let mut in_degree = vec![0usize; vertices.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); vertices.len()];
        for (source, target) in edges {
            let (s, t) = (position[source], position[target]);
            in_degree[t] += 1;
            outgoing[s].push(t);
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(vertices.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(vertices[i]);
            for &t in &outgoing[i] {
                in_degree[t] -= 1;
                if in_degree[t] == 0 {
                    ready.push(Reverse(t));
                }
            }
        }

        if order.len() < vertices.len() {
            let stuck = in_degree
                .iter()
                .position(|&d| d > 0)
                .map_or_else(|| "unknown".to_string(), |i| tree[vertices[i]].name.clone());
            return Err(DataflowError::CycleDetected(stuck));
        }
        Ok(order)
    }
}
