//! The computation graph runtime.
//!
//! [`Graph`] owns every [`Node`] in an arena and is the only mutation
//! surface: callers address nodes through [`NodeId`] handles. One interior
//! mutex guards the structure, the property propagation and the action
//! routing; the data plane never takes it.
//!
//! Property propagation runs to a fixed point whenever a property changes on
//! a committed graph: starting from a dirty node, nodes are visited in
//! topological order, forward to the end, back to the start, and forward
//! again, for two full sweeps. One sweep would suffice if all edge
//! properties existed up front, but the first sweep can create dynamic edge
//! properties that default to dirty, so a second sweep propagates them.
//! After the sweeps, everything must be clean and both endpoints of every
//! non-propagating (back) edge must agree, or the commit fails.
//!
//! Actions are routed with a plain FIFO work queue: delivering an action to
//! a node returns the node's follow-up posts, which are appended to the
//! queue. Handlers therefore never re-enter the graph, and a cascade is
//! bounded by a fixed delivery cap.

use crate::action::Action;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::prop::{PropSource, PropValue};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::{Directed, Direction};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Handle to a node owned by a [`Graph`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(NodeIndex<u32>);

/// Edge attributes: which ports are connected and whether property
/// propagation crosses this edge. Actions flow regardless; disabling
/// propagation is how structural cycles are broken.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    /// Output port on the source node.
    pub src_port: usize,
    /// Input port on the destination node.
    pub dst_port: usize,
    /// Whether properties propagate across this edge.
    pub propagation_active: bool,
}

/// Cap on action deliveries per external post; exceeding it means a
/// cascading storm.
const MAX_ACTION_DELIVERIES: usize = 200;

/// Number of full bidirectional sweeps of the propagation loop.
const MAX_NUM_SWEEPS: usize = 2;

/// The graph runtime.
///
/// Create with [`Graph::new`]; the graph starts released, so property
/// changes accumulate without propagating until the first
/// [`Graph::commit`].
#[derive(Debug)]
pub struct Graph {
    inner: Mutex<GraphInner>,
}

#[derive(Debug)]
struct GraphInner {
    graph: StableGraph<Node, GraphEdge, Directed, u32>,
    release_count: usize,
    action_ctr: u64,
    action_queue: VecDeque<(NodeIndex<u32>, PropSource, Action)>,
}

impl Default for Graph {
    fn default() -> Graph {
        Graph::new()
    }
}

impl Graph {
    /// Creates an empty, released graph.
    pub fn new() -> Graph {
        Graph {
            inner: Mutex::new(GraphInner {
                graph: StableGraph::default(),
                release_count: 1,
                action_ctr: 1,
                action_queue: VecDeque::new(),
            }),
        }
    }

    /// Adds a node to the graph, running its resolvers once to bring its
    /// default properties into a consistent state.
    pub fn add_node(&self, mut node: Node) -> Result<NodeId> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .graph
            .node_weights()
            .any(|n| n.unique_id() == node.unique_id())
        {
            return Err(Error::Value(format!(
                "a node with id {} is already in the graph",
                node.unique_id()
            )));
        }
        node.init_props()?;
        tracing::debug!(node = %node.unique_id(), "adding node");
        Ok(NodeId(inner.graph.add_node(node)))
    }

    /// Connects an output port to an input port.
    ///
    /// Connecting the same edge twice with identical attributes is a no-op.
    /// Reconnecting an occupied port, or changing the attributes of an
    /// existing edge, is a value error. If `propagation_active` is set and
    /// the new edge closes a propagation cycle, the edge is removed again
    /// and a cycle error is returned, leaving the graph unchanged.
    pub fn connect(
        &self,
        src: NodeId,
        src_port: usize,
        dst: NodeId,
        dst_port: usize,
        propagation_active: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_node(src)?;
        inner.check_node(dst)?;
        if src_port >= inner.graph[src.0].num_output_ports() {
            return Err(Error::Value(format!(
                "{} has no output port {src_port}",
                inner.graph[src.0].unique_id()
            )));
        }
        if dst_port >= inner.graph[dst.0].num_input_ports() {
            return Err(Error::Value(format!(
                "{} has no input port {dst_port}",
                inner.graph[dst.0].unique_id()
            )));
        }
        tracing::debug!(
            src = %inner.graph[src.0].unique_id(),
            src_port,
            dst = %inner.graph[dst.0].unique_id(),
            dst_port,
            propagation_active,
            "connecting"
        );

        let new_edge = GraphEdge {
            src_port,
            dst_port,
            propagation_active,
        };
        for edge in inner.graph.edges_directed(src.0, Direction::Outgoing) {
            let existing = edge.weight();
            if edge.target() == dst.0
                && existing.src_port == src_port
                && existing.dst_port == dst_port
            {
                if *existing == new_edge {
                    tracing::debug!("ignoring repeated connect of an identical edge");
                    return Ok(());
                }
                return Err(Error::Value(
                    "attempt to modify attributes of an existing edge".to_string(),
                ));
            }
            if existing.src_port == src_port {
                return Err(Error::Value(format!(
                    "output port {src_port} of {} is already connected",
                    inner.graph[src.0].unique_id()
                )));
            }
        }
        for edge in inner.graph.edges_directed(dst.0, Direction::Incoming) {
            if edge.weight().dst_port == dst_port {
                return Err(Error::Value(format!(
                    "input port {dst_port} of {} is already connected",
                    inner.graph[dst.0].unique_id()
                )));
            }
        }

        let edge_idx = inner.graph.add_edge(src.0, dst.0, new_edge);
        if let Err(err) = inner.topo_order() {
            inner.graph.remove_edge(edge_idx);
            tracing::error!(
                "edge would close a propagation cycle; connect it with \
                 propagation disabled instead"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Commits the graph: decrements the release counter, and on the
    /// transition to zero checks every node's topology and resolves all
    /// properties.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.release_count > 0 {
            inner.release_count -= 1;
            if inner.release_count == 0 {
                if let Err(err) = inner.check_topology() {
                    inner.release_count += 1;
                    return Err(err);
                }
            }
        }
        tracing::debug!(release_count = inner.release_count, "commit");
        inner.resolve_all_properties()
    }

    /// Releases the graph: increments the release counter, suspending
    /// property propagation and action routing until the matching commit.
    pub fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.release_count += 1;
        tracing::debug!(release_count = inner.release_count, "release");
    }

    /// Writes a user property on a node and, if the graph is committed,
    /// resolves all properties.
    pub fn set_property(
        &self,
        node: NodeId,
        id: &str,
        instance: usize,
        value: impl Into<PropValue>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_node(node)?;
        inner.graph[node.0].user_set_property(id, instance, value.into())?;
        inner.resolve_all_properties()
    }

    /// Reads a user property on a node, resolving first if anything in the
    /// committed graph is dirty.
    pub fn get_property(&self, node: NodeId, id: &str, instance: usize) -> Result<PropValue> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_node(node)?;
        if inner.release_count == 0 && inner.graph.node_weights().any(Node::has_dirty_props) {
            inner.resolve_all_properties()?;
        }
        inner.graph[node.0].user_get_property(id, instance)
    }

    /// Reads any property on a node by id and source. Intended for
    /// inspection; does not trigger resolution.
    pub fn node_property(&self, node: NodeId, id: &str, source: PropSource) -> Result<PropValue> {
        let inner = self.inner.lock().unwrap();
        inner.check_node(node)?;
        let node = &inner.graph[node.0];
        let prop_ref = node.find_property(id, source).ok_or_else(|| {
            Error::Lookup(format!("no property {id}@{source} on {}", node.unique_id()))
        })?;
        node.value(prop_ref)
            .cloned()
            .ok_or_else(|| Error::Value(format!("property {id}@{source} has no value")))
    }

    /// Returns the unique id of a node.
    pub fn unique_id(&self, node: NodeId) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        inner.check_node(node)?;
        Ok(inner.graph[node.0].unique_id().to_string())
    }

    /// Returns the number of nodes in the graph.
    pub fn num_nodes(&self) -> usize {
        self.inner.lock().unwrap().graph.node_count()
    }

    /// Posts an action from a node into the graph and routes it, together
    /// with every follow-up action, until the queue is empty.
    ///
    /// `edge` names the port of `node` the action leaves through: posting to
    /// an input edge sends the action upstream. Posting on a released graph
    /// drops the action with a warning.
    pub fn post_action(&self, node: NodeId, edge: PropSource, action: Action) -> Result<()> {
        if !edge.is_edge() {
            return Err(Error::Value(
                "actions can only be posted to input or output edges".to_string(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.check_node(node)?;
        if inner.release_count > 0 {
            tracing::warn!(
                key = %action.key,
                "graph is not committed, not propagating action"
            );
            return Ok(());
        }
        let mut action = action;
        if action.id == 0 {
            action.id = inner.next_action_id();
        }
        inner.action_queue.push_back((node.0, edge, action));
        let result = inner.drain_action_queue();
        if result.is_err() {
            inner.action_queue.clear();
        }
        result
    }
}

impl GraphInner {
    fn check_node(&self, node: NodeId) -> Result<()> {
        if self.graph.node_weight(node.0).is_none() {
            return Err(Error::Lookup(format!("unknown node handle {node:?}")));
        }
        Ok(())
    }

    fn next_action_id(&mut self) -> u64 {
        let id = self.action_ctr;
        self.action_ctr += 1;
        id
    }

    /// Topological order over the propagation-active edges.
    fn topo_order(&self) -> Result<Vec<NodeIndex<u32>>> {
        let mut indegree: HashMap<NodeIndex<u32>, usize> =
            self.graph.node_indices().map(|n| (n, 0)).collect();
        for edge in self.graph.edge_references() {
            if edge.weight().propagation_active {
                *indegree.get_mut(&edge.target()).unwrap() += 1;
            }
        }
        let mut ready: VecDeque<NodeIndex<u32>> = self
            .graph
            .node_indices()
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                if !edge.weight().propagation_active {
                    continue;
                }
                let entry = indegree.get_mut(&edge.target()).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    ready.push_back(edge.target());
                }
            }
        }
        if order.len() != self.graph.node_count() {
            return Err(Error::Cycle(
                "graph has at least one propagation cycle".to_string(),
            ));
        }
        Ok(order)
    }

    fn check_topology(&self) -> Result<()> {
        let mut ok = true;
        for idx in self.graph.node_indices() {
            let connected_inputs: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| e.weight().dst_port)
                .collect();
            let connected_outputs: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| e.weight().src_port)
                .collect();
            let node = &self.graph[idx];
            if !node.check_topology(&connected_inputs, &connected_outputs) {
                tracing::error!(
                    node = %node.unique_id(),
                    num_inputs = connected_inputs.len(),
                    num_outputs = connected_outputs.len(),
                    "node cannot handle its current topology"
                );
                ok = false;
            }
        }
        if ok {
            Ok(())
        } else {
            Err(Error::Topology("graph topology is not valid".to_string()))
        }
    }

    /// Runs property propagation to a fixed point. See the module docs for
    /// the sweep strategy.
    fn resolve_all_properties(&mut self) -> Result<()> {
        if self.graph.node_count() == 0 || self.release_count > 0 {
            return Ok(());
        }
        let order = self.topo_order()?;

        let initial = self
            .graph
            .node_indices()
            .find(|&n| self.graph[n].has_dirty_props())
            .unwrap_or(order[0]);
        let mut pos = order
            .iter()
            .position(|&n| n == initial)
            .expect("initial node not in topological order");

        let mut forward = true;
        let mut sweeps = 0;
        loop {
            let current = order[pos];
            tracing::trace!(node = %self.graph[current].unique_id(), "resolving node");
            self.graph[current].resolve_props()?;
            self.forward_edge_props(current)?;
            self.graph[current].clean_props();

            if forward {
                pos += 1;
                if pos == order.len() {
                    forward = false;
                    pos -= 1;
                }
            }
            if !forward {
                if order.len() > 1 {
                    pos -= 1;
                    if pos == 0 {
                        forward = true;
                    }
                } else {
                    forward = true;
                }
            }
            if forward && order[pos] == initial {
                sweeps += 1;
                if sweeps == MAX_NUM_SWEEPS {
                    break;
                }
            }
        }

        let mut unresolved = Vec::new();
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            if node.has_dirty_props() {
                for name in node.dirty_prop_names() {
                    unresolved.push(format!("{}:{}", node.unique_id(), name));
                }
            }
        }
        if !unresolved.is_empty() {
            tracing::error!(?unresolved, "properties could not be resolved");
            return Err(Error::Resolve(format!(
                "could not resolve properties: {}",
                unresolved.join(", ")
            )));
        }
        self.check_back_edges()
    }

    /// Copies every edge property of `origin` to the neighbour across its
    /// port, for edges with propagation enabled.
    fn forward_edge_props(&mut self, origin: NodeIndex<u32>) -> Result<()> {
        for (id, source, value) in self.graph[origin].edge_props() {
            let Some(value) = value else {
                continue;
            };
            let Some((neighbour, local_source)) = self.find_neighbour(origin, source, true) else {
                continue;
            };
            self.graph[neighbour].forward_edge_property(&id, value, local_source)?;
        }
        Ok(())
    }

    /// Finds the node connected across the given port of `origin`, along
    /// with the port source seen from that neighbour. `require_propagation`
    /// restricts the search to propagation-active edges.
    fn find_neighbour(
        &self,
        origin: NodeIndex<u32>,
        port: PropSource,
        require_propagation: bool,
    ) -> Option<(NodeIndex<u32>, PropSource)> {
        let (neighbour, local_source, active) = match port {
            PropSource::OutputEdge(p) => self
                .graph
                .edges_directed(origin, Direction::Outgoing)
                .find(|e| e.weight().src_port == p)
                .map(|e| {
                    (
                        e.target(),
                        PropSource::InputEdge(e.weight().dst_port),
                        e.weight().propagation_active,
                    )
                })?,
            PropSource::InputEdge(p) => self
                .graph
                .edges_directed(origin, Direction::Incoming)
                .find(|e| e.weight().dst_port == p)
                .map(|e| {
                    (
                        e.source(),
                        PropSource::OutputEdge(e.weight().src_port),
                        e.weight().propagation_active,
                    )
                })?,
            _ => return None,
        };
        if require_propagation && !active {
            return None;
        }
        Some((neighbour, local_source))
    }

    /// Verifies that both endpoints of every non-propagating edge agree on
    /// the value of each edge property they both declare.
    fn check_back_edges(&self) -> Result<()> {
        let mut consistent = true;
        for edge in self.graph.edge_references() {
            if edge.weight().propagation_active {
                continue;
            }
            let src = &self.graph[edge.source()];
            let dst = &self.graph[edge.target()];
            for (id, src_value) in src.edge_props_on(PropSource::OutputEdge(edge.weight().src_port))
            {
                let Some(dst_ref) =
                    dst.find_property(&id, PropSource::InputEdge(edge.weight().dst_port))
                else {
                    continue;
                };
                let equal = match (&src_value, dst.value(dst_ref)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                if !equal {
                    tracing::error!(
                        id = %id,
                        src = %src.unique_id(),
                        dst = %dst.unique_id(),
                        "edge property inconsistent on back-edge"
                    );
                    consistent = false;
                }
            }
        }
        if consistent {
            Ok(())
        } else {
            Err(Error::Resolve("back-edges inconsistent".to_string()))
        }
    }

    /// Routes queued actions until the queue is empty.
    fn drain_action_queue(&mut self) -> Result<()> {
        let mut deliveries = 0;
        while let Some((src, src_edge, action)) = self.action_queue.pop_front() {
            if deliveries == MAX_ACTION_DELIVERIES {
                return Err(Error::ActionLoop(format!(
                    "action handling exceeded {MAX_ACTION_DELIVERIES} deliveries"
                )));
            }
            deliveries += 1;

            let Some((recipient, recipient_edge)) = self.find_neighbour(src, src_edge, false)
            else {
                tracing::warn!(
                    key = %action.key,
                    src = %self.graph[src].unique_id(),
                    edge = %src_edge,
                    "cannot forward action, no neighbour found"
                );
                continue;
            };
            tracing::trace!(
                key = %action.key,
                id = action.id,
                dst = %self.graph[recipient].unique_id(),
                "delivering action"
            );
            let posts = self.graph[recipient].handle_action(recipient_edge, action)?;
            for (edge, mut post) in posts {
                if !edge.is_edge() {
                    return Err(Error::Value(
                        "actions can only be posted to input or output edges".to_string(),
                    ));
                }
                if post.id == 0 {
                    post.id = self.next_action_id();
                }
                self.action_queue.push_back((recipient, edge, post));
            }
        }
        Ok(())
    }
}
