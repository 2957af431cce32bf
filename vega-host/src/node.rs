//! Graph participants.
//!
//! A [`Node`] is a vertex of the computation graph: it declares input and
//! output ports, owns a registry of [`Property`] slots, and carries the
//! resolvers and action handlers that give a block its behavior. Nodes are
//! plain data assembled by block constructors; the graph owns them and is
//! the only caller of the propagation entry points.
//!
//! Resolvers do not capture properties lexically. They receive a
//! [`ResolveContext`] that exposes this node's properties only, with write
//! access restricted to the resolver's declared outputs. A resolver that
//! writes outside its output set fails with an access error and aborts the
//! resolution; that is an author bug, not a recoverable condition.

use crate::action::Action;
use crate::error::{Error, Result};
use crate::prop::{AccessMode, PropSource, PropValue, Property};
use std::collections::{HashMap, HashSet, VecDeque};

/// Reference to a property registered on a node.
///
/// Only meaningful on the node that returned it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PropRef(pub(crate) usize);

/// What a node does with a property or action it has no specific handling
/// for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForwardingPolicy {
    /// Forward to the opposite port with the same index.
    OneToOne,
    /// Forward to all opposite ports.
    OneToFan,
    /// Forward to all input ports.
    OneToAllIn,
    /// Forward to all output ports.
    OneToAllOut,
    /// Forward to all ports.
    OneToAll,
    /// Propagation ends here.
    Drop,
}

/// Typed access to a node's properties during a resolver run.
pub struct ResolveContext<'a> {
    node_id: &'a str,
    props: &'a mut Vec<Property>,
}

impl ResolveContext<'_> {
    fn prop(&self, p: PropRef) -> &Property {
        &self.props[p.0]
    }

    /// Returns whether a property holds a value yet.
    pub fn is_valid(&self, p: PropRef) -> bool {
        self.prop(p).is_valid()
    }

    /// Returns the value of a property, or `None` while it is invalid.
    pub fn value(&self, p: PropRef) -> Option<&PropValue> {
        self.prop(p).value()
    }

    /// Returns the float value of a property that must be valid.
    pub fn get_f64(&self, p: PropRef) -> Result<f64> {
        self.value(p).and_then(PropValue::as_f64).ok_or_else(|| {
            Error::Value(format!(
                "property {} on {} has no float value",
                self.prop(p).id(),
                self.node_id
            ))
        })
    }

    /// Returns the integer value of a property that must be valid.
    pub fn get_i64(&self, p: PropRef) -> Result<i64> {
        self.value(p).and_then(PropValue::as_i64).ok_or_else(|| {
            Error::Value(format!(
                "property {} on {} has no integer value",
                self.prop(p).id(),
                self.node_id
            ))
        })
    }

    /// Writes a property. Only the outputs declared by the running resolver
    /// are writable; anything else is an access error.
    pub fn set(&mut self, p: PropRef, value: impl Into<PropValue>) -> Result<()> {
        self.set_value(p, value.into())
    }

    /// Writes a property from an already-built [`PropValue`].
    pub fn set_value(&mut self, p: PropRef, value: PropValue) -> Result<()> {
        self.props[p.0].set(value)
    }
}

/// Read access to a node's properties while an action handler runs.
pub struct ActionContext<'a> {
    unique_id: &'a str,
    props: &'a [Property],
}

impl ActionContext<'_> {
    /// Returns the node's unique id.
    pub fn unique_id(&self) -> &str {
        self.unique_id
    }

    /// Looks up a property value by id and source.
    pub fn value(&self, id: &str, source: PropSource) -> Option<&PropValue> {
        self.props
            .iter()
            .find(|p| p.id() == id && p.source() == source)
            .and_then(Property::value)
    }
}

type ResolverFn = Box<dyn FnMut(&mut ResolveContext<'_>) -> Result<()> + Send>;
type CleanCallback = Box<dyn FnMut(&PropValue) + Send>;
type TopologyCheckFn = Box<dyn Fn(&[usize], &[usize]) -> bool + Send>;

// An action handler receives the edge the action arrived on and the action
// itself (mutable, so transforms happen in place), and returns the posts to
// make next. Returning posts instead of calling back into the graph keeps
// the routing loop a plain work queue.
type ActionHandlerFn =
    Box<dyn FnMut(&ActionContext<'_>, PropSource, &mut Action) -> Result<Vec<(PropSource, Action)>> + Send>;

struct Resolver {
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    func: ResolverFn,
}

/// A participant in the computation graph.
pub struct Node {
    unique_id: String,
    num_inputs: usize,
    num_outputs: usize,
    props: Vec<Property>,
    clean_cbs: HashMap<usize, CleanCallback>,
    resolvers: Vec<Resolver>,
    prop_policies: HashMap<String, ForwardingPolicy>,
    action_policies: HashMap<String, ForwardingPolicy>,
    action_handlers: HashMap<String, ActionHandlerFn>,
    topology_check: Option<TopologyCheckFn>,
    dirtifier: PropRef,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("unique_id", &self.unique_id)
            .field("num_inputs", &self.num_inputs)
            .field("num_outputs", &self.num_outputs)
            .field("num_props", &self.props.len())
            .field("num_resolvers", &self.resolvers.len())
            .finish()
    }
}

impl Node {
    /// Creates a node with the given unique id and port counts.
    ///
    /// Both forwarding policies default to [`ForwardingPolicy::OneToOne`].
    pub fn new(unique_id: impl Into<String>, num_inputs: usize, num_outputs: usize) -> Node {
        let mut node = Node {
            unique_id: unique_id.into(),
            num_inputs,
            num_outputs,
            props: Vec::new(),
            clean_cbs: HashMap::new(),
            resolvers: Vec::new(),
            prop_policies: HashMap::from([(String::new(), ForwardingPolicy::OneToOne)]),
            action_policies: HashMap::from([(String::new(), ForwardingPolicy::OneToOne)]),
            action_handlers: HashMap::new(),
            topology_check: None,
            dirtifier: PropRef(0),
        };
        node.props.push(Property::dirtifier());
        node
    }

    /// Returns the unique id of this node.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Returns the number of input ports.
    pub fn num_input_ports(&self) -> usize {
        self.num_inputs
    }

    /// Returns the number of output ports.
    pub fn num_output_ports(&self) -> usize {
        self.num_outputs
    }

    /// Returns a reference to the framework dirtifier of this node.
    ///
    /// A resolver that lists it among its inputs runs on every resolution,
    /// which is how always-updating read-only properties are implemented.
    pub fn always_dirty(&self) -> PropRef {
        self.dirtifier
    }

    /// Registers a property. The `(id, source)` pair must be unique on this
    /// node.
    pub fn register_property(&mut self, prop: Property) -> Result<PropRef> {
        if self.find_property(prop.id(), prop.source()).is_some() {
            return Err(Error::Lookup(format!(
                "property {}@{} already registered on {}",
                prop.id(),
                prop.source(),
                self.unique_id
            )));
        }
        self.props.push(prop);
        Ok(PropRef(self.props.len() - 1))
    }

    /// Registers a property with a clean callback.
    ///
    /// The callback runs exactly when the property transitions from dirty to
    /// clean, which is the moment to poke hardware that must only be written
    /// on state changes.
    pub fn register_property_with_callback(
        &mut self,
        prop: Property,
        callback: impl FnMut(&PropValue) + Send + 'static,
    ) -> Result<PropRef> {
        let prop_ref = self.register_property(prop)?;
        self.clean_cbs.insert(prop_ref.0, Box::new(callback));
        Ok(prop_ref)
    }

    /// Adds a resolver. All referenced properties must be registered.
    pub fn add_resolver(
        &mut self,
        inputs: &[PropRef],
        outputs: &[PropRef],
        func: impl FnMut(&mut ResolveContext<'_>) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        for prop_ref in inputs.iter().chain(outputs) {
            if prop_ref.0 >= self.props.len() {
                return Err(Error::Lookup(format!(
                    "resolver on {} references an unregistered property",
                    self.unique_id
                )));
            }
        }
        self.resolvers.push(Resolver {
            inputs: inputs.iter().map(|p| p.0).collect(),
            outputs: outputs.iter().map(|p| p.0).collect(),
            func: Box::new(func),
        });
        Ok(())
    }

    /// Sets the forwarding policy for a property id, or the node default
    /// when `id` is `None`.
    pub fn set_prop_forwarding_policy(&mut self, policy: ForwardingPolicy, id: Option<&str>) {
        self.prop_policies.insert(id.unwrap_or("").to_string(), policy);
    }

    /// Sets the forwarding policy for an action key, or the node default
    /// when `key` is `None`.
    pub fn set_action_forwarding_policy(&mut self, policy: ForwardingPolicy, key: Option<&str>) {
        self.action_policies.insert(key.unwrap_or("").to_string(), policy);
    }

    /// Installs an action handler for a key, replacing any previous one.
    pub fn set_action_handler(
        &mut self,
        key: impl Into<String>,
        handler: impl FnMut(&ActionContext<'_>, PropSource, &mut Action) -> Result<Vec<(PropSource, Action)>>
            + Send
            + 'static,
    ) {
        self.action_handlers.insert(key.into(), Box::new(handler));
    }

    /// Installs a custom topology check, replacing the default "all
    /// connected ports in range" rule.
    pub fn set_topology_check(&mut self, check: impl Fn(&[usize], &[usize]) -> bool + Send + 'static) {
        self.topology_check = Some(Box::new(check));
    }

    /// Returns the ids of the user properties of this node.
    pub fn property_ids(&self) -> Vec<String> {
        self.props
            .iter()
            .filter(|p| matches!(p.source(), PropSource::User(_)))
            .map(|p| p.id().to_string())
            .collect()
    }

    /// Finds a property by id and source.
    pub fn find_property(&self, id: &str, source: PropSource) -> Option<PropRef> {
        self.props
            .iter()
            .position(|p| p.id() == id && p.source() == source)
            .map(PropRef)
    }

    /// Returns the value of a property, or `None` while it is invalid.
    pub fn value(&self, p: PropRef) -> Option<&PropValue> {
        self.props[p.0].value()
    }

    /// Returns whether a property is dirty.
    pub fn is_dirty(&self, p: PropRef) -> bool {
        self.props[p.0].is_dirty()
    }

    /*** Entry points for the graph runtime *********************************/

    pub(crate) fn check_topology(&self, connected_inputs: &[usize], connected_outputs: &[usize]) -> bool {
        let in_range = connected_inputs.iter().all(|&p| p < self.num_inputs)
            && connected_outputs.iter().all(|&p| p < self.num_outputs);
        match &self.topology_check {
            Some(check) => in_range && check(connected_inputs, connected_outputs),
            None => in_range,
        }
    }

    pub(crate) fn has_dirty_props(&self) -> bool {
        self.props.iter().any(|p| !p.is_dirtifier() && p.is_dirty())
    }

    pub(crate) fn dirty_prop_names(&self) -> Vec<String> {
        self.props
            .iter()
            .filter(|p| !p.is_dirtifier() && p.is_dirty())
            .map(|p| format!("{}[{}]", p.id(), p.source()))
            .collect()
    }

    /// Writes a user property on behalf of the API caller.
    pub(crate) fn user_set_property(
        &mut self,
        id: &str,
        instance: usize,
        value: PropValue,
    ) -> Result<()> {
        let prop_ref = self
            .find_property(id, PropSource::User(instance))
            .ok_or_else(|| {
                Error::Lookup(format!(
                    "no property {id}@USER:{instance} on {}",
                    self.unique_id
                ))
            })?;
        self.framework_write(prop_ref.0, value)
    }

    pub(crate) fn user_get_property(&self, id: &str, instance: usize) -> Result<PropValue> {
        let prop_ref = self
            .find_property(id, PropSource::User(instance))
            .ok_or_else(|| {
                Error::Lookup(format!(
                    "no property {id}@USER:{instance} on {}",
                    self.unique_id
                ))
            })?;
        self.props[prop_ref.0].value().cloned().ok_or_else(|| {
            Error::Value(format!("property {id} on {} has no value yet", self.unique_id))
        })
    }

    /// Writes a property with temporarily elevated access, as the framework
    /// does outside of resolver runs.
    fn framework_write(&mut self, idx: usize, value: PropValue) -> Result<()> {
        let prop = &mut self.props[idx];
        let previous = prop.access();
        prop.set_access(AccessMode::ReadWrite);
        let result = prop.set(value);
        prop.set_access(previous);
        result
    }

    /// Runs one resolver with its outputs writable. Outputs already written
    /// by an earlier resolver of the same pass are only lockable.
    fn run_resolver(&mut self, index: usize, written: &mut HashSet<usize>) -> Result<()> {
        let outputs = self.resolvers[index].outputs.clone();
        for &out in &outputs {
            let mode = if written.contains(&out) {
                AccessMode::ReadWriteLocked
            } else {
                AccessMode::ReadWrite
            };
            self.props[out].set_access(mode);
        }
        let mut func = std::mem::replace(&mut self.resolvers[index].func, Box::new(|_| Ok(())));
        let result = func(&mut ResolveContext {
            node_id: &self.unique_id,
            props: &mut self.props,
        });
        self.resolvers[index].func = func;
        for &out in &outputs {
            self.props[out].set_access(AccessMode::ReadOnly);
        }
        written.extend(outputs);
        result
    }

    /// Runs every resolver once to bring the default property values into a
    /// consistent state, then marks everything clean. Called when the node
    /// joins a graph.
    pub(crate) fn init_props(&mut self) -> Result<()> {
        let mut written = HashSet::new();
        for index in 0..self.resolvers.len() {
            self.run_resolver(index, &mut written)?;
        }
        self.clean_props();
        Ok(())
    }

    /// Finds dirty properties and runs the resolvers they trigger, following
    /// newly dirtied outputs until the worklist is exhausted.
    ///
    /// Does not mark anything clean; the graph does that after forwarding
    /// edge properties.
    pub(crate) fn resolve_props(&mut self) -> Result<()> {
        let mut written: HashSet<usize> = HashSet::new();
        let mut invoked: HashSet<(usize, usize)> = HashSet::new();
        let mut queue: VecDeque<usize> = (0..self.props.len())
            .filter(|&i| self.props[i].is_dirty())
            .collect();
        while let Some(prop_idx) = queue.pop_front() {
            for index in 0..self.resolvers.len() {
                if !self.resolvers[index].inputs.contains(&prop_idx) {
                    continue;
                }
                if !invoked.insert((prop_idx, index)) {
                    continue;
                }
                tracing::trace!(node = %self.unique_id, resolver = index, "running resolver");
                self.run_resolver(index, &mut written)?;
                for &out in &self.resolvers[index].outputs.clone() {
                    if self.props[out].is_dirty() && !queue.contains(&out) {
                        queue.push_back(out);
                    }
                }
            }
        }
        Ok(())
    }

    /// Marks all properties clean, firing clean callbacks on each
    /// dirty-to-clean transition.
    pub(crate) fn clean_props(&mut self) {
        for idx in 0..self.props.len() {
            if self.props[idx].mark_clean() {
                if let Some(callback) = self.clean_cbs.get_mut(&idx) {
                    if let Some(value) = self.props[idx].value() {
                        callback(value);
                    }
                }
            }
        }
    }

    /// Returns the edge properties of this node as (id, source, value)
    /// tuples, for forwarding across edges.
    pub(crate) fn edge_props(&self) -> Vec<(String, PropSource, Option<PropValue>)> {
        self.props
            .iter()
            .filter(|p| p.source().is_edge())
            .map(|p| (p.id().to_string(), p.source(), p.value().cloned()))
            .collect()
    }

    /// Returns the edge properties on one specific port.
    pub(crate) fn edge_props_on(&self, source: PropSource) -> Vec<(String, Option<PropValue>)> {
        self.props
            .iter()
            .filter(|p| p.source() == source)
            .map(|p| (p.id().to_string(), p.value().cloned()))
            .collect()
    }

    /// Takes delivery of a neighbour's edge property value.
    ///
    /// `local_source` is the port the value arrives on, seen from this node.
    /// Known properties are simply written. Unknown properties are created
    /// dynamically, and the forwarding policy decides which opposite ports
    /// get a twin property plus a copy resolver.
    pub(crate) fn forward_edge_property(
        &mut self,
        id: &str,
        value: PropValue,
        local_source: PropSource,
    ) -> Result<()> {
        debug_assert!(local_source.is_edge());
        if let Some(prop_ref) = self.find_property(id, local_source) {
            return self.framework_write(prop_ref.0, value);
        }

        tracing::debug!(
            node = %self.unique_id,
            id,
            source = %local_source,
            "creating dynamic edge property"
        );
        let incoming = self
            .register_property(Property::with_value(id, local_source, value.clone()))?;

        let policy = self
            .prop_policies
            .get(id)
            .or_else(|| self.prop_policies.get(""))
            .copied()
            .unwrap_or(ForwardingPolicy::OneToOne);
        let targets = self.policy_targets(policy, local_source);
        if targets.is_empty() {
            return Ok(());
        }

        let mut target_refs = Vec::with_capacity(targets.len());
        for target in targets {
            let prop_ref = match self.find_property(id, target) {
                Some(existing) => existing,
                None => self.register_property(Property::with_value(id, target, value.clone()))?,
            };
            target_refs.push(prop_ref);
        }
        let source_ref = incoming;
        let dst_refs = target_refs.clone();
        self.add_resolver(&[incoming], &target_refs, move |ctx| {
            if let Some(value) = ctx.value(source_ref).cloned() {
                for &dst in &dst_refs {
                    ctx.set_value(dst, value.clone())?;
                }
            }
            Ok(())
        })
    }

    /// Ports a forwarding policy fans out to, from the point of view of an
    /// item arriving on `incoming`.
    fn policy_targets(&self, policy: ForwardingPolicy, incoming: PropSource) -> Vec<PropSource> {
        let all_in = || (0..self.num_inputs).map(PropSource::InputEdge);
        let all_out = || (0..self.num_outputs).map(PropSource::OutputEdge);
        let targets: Vec<PropSource> = match policy {
            ForwardingPolicy::Drop => Vec::new(),
            ForwardingPolicy::OneToOne => match incoming {
                PropSource::InputEdge(p) if p < self.num_outputs => {
                    vec![PropSource::OutputEdge(p)]
                }
                PropSource::OutputEdge(p) if p < self.num_inputs => {
                    vec![PropSource::InputEdge(p)]
                }
                _ => Vec::new(),
            },
            ForwardingPolicy::OneToFan => match incoming {
                PropSource::InputEdge(_) => all_out().collect(),
                _ => all_in().collect(),
            },
            ForwardingPolicy::OneToAllIn => all_in().collect(),
            ForwardingPolicy::OneToAllOut => all_out().collect(),
            ForwardingPolicy::OneToAll => all_in().chain(all_out()).collect(),
        };
        targets.into_iter().filter(|&t| t != incoming).collect()
    }

    /// Dispatches an incoming action to the registered handler, or forwards
    /// it per the action forwarding policy. Returns the follow-up posts.
    pub(crate) fn handle_action(
        &mut self,
        edge: PropSource,
        mut action: Action,
    ) -> Result<Vec<(PropSource, Action)>> {
        let key = action.key.clone();
        if let Some(mut handler) = self.action_handlers.remove(&key) {
            let result = handler(
                &ActionContext {
                    unique_id: &self.unique_id,
                    props: &self.props,
                },
                edge,
                &mut action,
            );
            self.action_handlers.insert(key, handler);
            return result;
        }

        let policy = self
            .action_policies
            .get(&key)
            .or_else(|| self.action_policies.get(""))
            .copied()
            .unwrap_or(ForwardingPolicy::OneToOne);
        let targets = self.policy_targets(policy, edge);
        if targets.is_empty() {
            tracing::trace!(node = %self.unique_id, key = %key, "dropping unhandled action");
        }
        Ok(targets
            .into_iter()
            .map(|target| (target, action.clone()))
            .collect())
    }
}
