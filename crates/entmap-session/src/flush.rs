//! Flush ordering for inserts and deletes.
//!
//! Nodes are the instances taking part in one flush; a [`Dependency`] says
//! that one row holds a foreign key to another. Inserts go dependency-first,
//! deletes dependent-first. Both orders are built with Kahn's algorithm over
//! adjacency lists; ties go to the lowest node index.

use entmap_core::{CycleError, Result};
use entmap_mapping::AttributePath;
use serde::Serialize;
use std::collections::BTreeSet;

/// `dependent` holds a foreign key (through `path`) to `dependency`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub dependent: usize,
    pub dependency: usize,
    pub path: AttributePath,
    /// Every foreign-key column of the edge accepts NULL
    pub nullable: bool,
}

/// A foreign key inserted as NULL and set by a follow-up update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredLink {
    pub node: usize,
    pub path: AttributePath,
}

/// Insert sequence plus the links broken to get it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOrder {
    pub order: Vec<usize>,
    pub deferred: Vec<DeferredLink>,
}

impl InsertOrder {
    /// Whether the insert of `node` writes NULL for `path`.
    pub fn is_deferred(&self, node: usize, path: &AttributePath) -> bool {
        self.deferred
            .iter()
            .any(|d| d.node == node && &d.path == path)
    }
}

/// Orders the rows of one flush by their foreign-key dependencies.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    nodes: Vec<String>,
    edges: Vec<Dependency>,
}

/// Edge indices grouped by node.
struct Adjacency {
    /// Edges whose `dependent` is the node
    outgoing: Vec<Vec<usize>>,
    /// Edges whose `dependency` is the node
    incoming: Vec<Vec<usize>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a row of `entity`; returns its node index.
    pub fn add_node(&mut self, entity: impl Into<String>) -> usize {
        self.nodes.push(entity.into());
        self.nodes.len() - 1
    }

    pub fn add_dependency(
        &mut self,
        dependent: usize,
        dependency: usize,
        path: AttributePath,
        nullable: bool,
    ) {
        self.edges.push(Dependency {
            dependent,
            dependency,
            path,
            nullable,
        });
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn adjacency(&self) -> Adjacency {
        let n = self.nodes.len();
        let mut outgoing = vec![Vec::new(); n];
        let mut incoming = vec![Vec::new(); n];
        for (i, edge) in self.edges.iter().enumerate() {
            outgoing[edge.dependent].push(i);
            incoming[edge.dependency].push(i);
        }
        Adjacency { outgoing, incoming }
    }

    /// Strongly connected components of the pending nodes over active
    /// edges. Done nodes get `usize::MAX`.
    fn components(&self, adjacency: &Adjacency, active: &[bool], done: &[bool]) -> Vec<usize> {
        const UNVISITED: usize = usize::MAX;
        let n = self.nodes.len();
        let mut index = vec![UNVISITED; n];
        let mut low = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut component = vec![UNVISITED; n];
        let mut next_index = 0;
        let mut next_component = 0;

        for root in 0..n {
            if done[root] || index[root] != UNVISITED {
                continue;
            }
            index[root] = next_index;
            low[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;
            let mut calls = vec![(root, 0usize)];

            while let Some(frame) = calls.last_mut() {
                let node = frame.0;
                if let Some(&edge) = adjacency.outgoing[node].get(frame.1) {
                    frame.1 += 1;
                    let next = self.edges[edge].dependency;
                    if !active[edge] || done[next] {
                        continue;
                    }
                    if index[next] == UNVISITED {
                        index[next] = next_index;
                        low[next] = next_index;
                        next_index += 1;
                        stack.push(next);
                        on_stack[next] = true;
                        calls.push((next, 0));
                    } else if on_stack[next] {
                        low[node] = low[node].min(index[next]);
                    }
                    continue;
                }

                calls.pop();
                if let Some(&(parent, _)) = calls.last() {
                    low[parent] = low[parent].min(low[node]);
                }
                if low[node] == index[node] {
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component[member] = next_component;
                        if member == node {
                            break;
                        }
                    }
                    next_component += 1;
                }
            }
        }
        component
    }

    /// Dependency-first insert order.
    ///
    /// When every pending node waits on another one, a nullable edge lying on
    /// a cycle is deferred. A cycle made only of non-nullable edges fails.
    #[tracing::instrument(level = "debug", skip(self), fields(nodes = self.nodes.len(), edges = self.edges.len()))]
    pub fn order_inserts(&self) -> Result<InsertOrder> {
        let n = self.nodes.len();
        let adjacency = self.adjacency();
        let mut active = vec![true; self.edges.len()];
        let mut done = vec![false; n];
        let mut waiting: Vec<usize> = adjacency.outgoing.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&node| waiting[node] == 0).collect();
        let mut result = InsertOrder::default();

        while result.order.len() < n {
            if let Some(node) = ready.pop_first() {
                done[node] = true;
                result.order.push(node);
                for &i in &adjacency.incoming[node] {
                    let dependent = self.edges[i].dependent;
                    if active[i] && !done[dependent] {
                        waiting[dependent] -= 1;
                        if waiting[dependent] == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
                continue;
            }

            // only cycles are left
            let component = self.components(&adjacency, &active, &done);
            let breakable = self.edges.iter().enumerate().find(|(i, e)| {
                active[*i]
                    && e.nullable
                    && !done[e.dependent]
                    && !done[e.dependency]
                    && component[e.dependent] == component[e.dependency]
            });
            let Some((i, edge)) = breakable else {
                return Err(self.cycle_error(&active, &done, &component).into());
            };
            tracing::debug!(
                entity = %self.nodes[edge.dependent],
                path = %edge.path,
                "Deferring nullable foreign key to break insert cycle"
            );
            active[i] = false;
            waiting[edge.dependent] -= 1;
            if waiting[edge.dependent] == 0 {
                ready.insert(edge.dependent);
            }
            result.deferred.push(DeferredLink {
                node: edge.dependent,
                path: edge.path.clone(),
            });
        }
        Ok(result)
    }

    /// Pending nodes that sit on a cycle of active edges.
    fn cycle_error(&self, active: &[bool], done: &[bool], component: &[usize]) -> CycleError {
        let mut cyclic = vec![false; self.nodes.len()];
        for (i, edge) in self.edges.iter().enumerate() {
            if active[i]
                && !done[edge.dependent]
                && !done[edge.dependency]
                && component[edge.dependent] == component[edge.dependency]
            {
                cyclic[edge.dependent] = true;
            }
        }
        let entities = (0..self.nodes.len())
            .filter(|&node| cyclic[node])
            .map(|node| self.nodes[node].clone())
            .collect();
        CycleError { entities }
    }

    /// Dependent-first delete order.
    ///
    /// Deleted rows referencing each other in a cycle cannot all be removed
    /// first; the lowest pending node goes next and the store decides.
    pub fn order_deletes(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let adjacency = self.adjacency();
        let mut done = vec![false; n];
        // pending rows still pointing at each node, self-references aside
        let mut referenced: Vec<usize> = adjacency
            .incoming
            .iter()
            .map(|edges| {
                edges
                    .iter()
                    .filter(|&&i| self.edges[i].dependent != self.edges[i].dependency)
                    .count()
            })
            .collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&node| referenced[node] == 0).collect();
        let mut lowest_pending = 0;
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            let node = match ready.pop_first() {
                Some(node) => node,
                None => {
                    while lowest_pending < n && done[lowest_pending] {
                        lowest_pending += 1;
                    }
                    if lowest_pending == n {
                        break;
                    }
                    let node = lowest_pending;
                    tracing::warn!(
                        entity = %self.nodes[node],
                        "Deleted rows reference each other; delete order is arbitrary"
                    );
                    node
                }
            };
            done[node] = true;
            order.push(node);
            for &i in &adjacency.outgoing[node] {
                let dependency = self.edges[i].dependency;
                if dependency != node && !done[dependency] {
                    referenced[dependency] -= 1;
                    if referenced[dependency] == 0 {
                        ready.insert(dependency);
                    }
                }
            }
        }
        order
    }
}

/// Counts of the row operations one flush executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Join-table rows written or removed, and target-row FK updates
    pub join_rows: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.join_rows
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entmap_core::Error;

    #[test]
    fn parents_insert_before_children() {
        let mut orderer = FlushOrderer::new();
        let order = orderer.add_node("Order");
        let customer = orderer.add_node("Customer");
        let line = orderer.add_node("OrderLine");
        orderer.add_dependency(line, order, "order".into(), false);
        orderer.add_dependency(order, customer, "customer".into(), false);

        let plan = orderer.order_inserts().unwrap();
        assert_eq!(plan.order, vec![customer, order, line]);
        assert!(plan.deferred.is_empty());

        assert_eq!(orderer.order_deletes(), vec![line, order, customer]);
    }

    #[test]
    fn nullable_cycle_is_broken() {
        let mut orderer = FlushOrderer::new();
        let employee = orderer.add_node("Employee");
        let department = orderer.add_node("Department");
        orderer.add_dependency(employee, department, "department".into(), false);
        orderer.add_dependency(department, employee, "manager".into(), true);

        let plan = orderer.order_inserts().unwrap();
        assert_eq!(plan.order, vec![department, employee]);
        assert_eq!(
            plan.deferred,
            vec![DeferredLink {
                node: department,
                path: "manager".into()
            }]
        );
        assert!(plan.is_deferred(department, &"manager".into()));
    }

    #[test]
    fn non_nullable_cycle_is_rejected() {
        let mut orderer = FlushOrderer::new();
        let a = orderer.add_node("A");
        let b = orderer.add_node("B");
        let c = orderer.add_node("C");
        orderer.add_dependency(a, b, "b".into(), false);
        orderer.add_dependency(b, a, "a".into(), false);
        orderer.add_dependency(c, a, "a".into(), false);

        let err = orderer.order_inserts().unwrap_err();
        let Error::CyclicDependency(cycle) = err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert_eq!(cycle.entities, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn self_reference() {
        let mut orderer = FlushOrderer::new();
        let node = orderer.add_node("Category");
        orderer.add_dependency(node, node, "parent".into(), true);
        let plan = orderer.order_inserts().unwrap();
        assert_eq!(plan.order, vec![node]);
        assert_eq!(plan.deferred.len(), 1);

        let mut orderer = FlushOrderer::new();
        let node = orderer.add_node("Category");
        orderer.add_dependency(node, node, "parent".into(), false);
        assert!(orderer.order_inserts().is_err());
        assert_eq!(orderer.order_deletes(), vec![node]);
    }

    #[test]
    fn long_chain_registered_backwards() {
        let mut orderer = FlushOrderer::new();
        let nodes: Vec<usize> = (0..2000)
            .map(|i| orderer.add_node(format!("Row{i}")))
            .collect();
        for pair in nodes.windows(2) {
            orderer.add_dependency(pair[0], pair[1], "next".into(), false);
        }

        let plan = orderer.order_inserts().unwrap();
        let expected: Vec<usize> = nodes.iter().rev().copied().collect();
        assert_eq!(plan.order, expected);
        assert!(plan.deferred.is_empty());
        assert_eq!(orderer.order_deletes(), nodes);
    }

    #[test]
    fn only_the_cycle_waits_for_a_deferred_link() {
        let mut orderer = FlushOrderer::new();
        let invoice = orderer.add_node("Invoice");
        let customer = orderer.add_node("Customer");
        let account = orderer.add_node("Account");
        let region = orderer.add_node("Region");
        orderer.add_dependency(invoice, customer, "customer".into(), false);
        orderer.add_dependency(customer, account, "account".into(), false);
        orderer.add_dependency(account, customer, "owner".into(), true);
        orderer.add_dependency(customer, region, "region".into(), false);

        let plan = orderer.order_inserts().unwrap();
        assert_eq!(plan.order, vec![region, account, customer, invoice]);
        assert_eq!(
            plan.deferred,
            vec![DeferredLink {
                node: account,
                path: "owner".into()
            }]
        );
        assert!(!plan.is_deferred(customer, &"account".into()));
    }

    #[test]
    fn cyclic_deletes_fall_back_to_registration_order() {
        let mut orderer = FlushOrderer::new();
        let a = orderer.add_node("A");
        let b = orderer.add_node("B");
        let c = orderer.add_node("C");
        orderer.add_dependency(a, b, "b".into(), true);
        orderer.add_dependency(b, a, "a".into(), true);
        orderer.add_dependency(c, a, "a".into(), true);

        assert_eq!(orderer.order_deletes(), vec![c, a, b]);
    }

    #[test]
    fn result_totals() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 1,
            join_rows: 3,
        };
        assert_eq!(result.total(), 7);
        assert!(FlushResult::new().is_empty());
    }
}
