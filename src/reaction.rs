use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, trace, warn};

use crate::component::{Component, Handler, WeakComponent};
use crate::component_type::ReactionFn;
use crate::connection::{ConnectionString, Fanout, Segment};
use crate::error::{EventError, Result};
use crate::event::Event;
use crate::value::Value;


static NEXT_REACTION_ID: AtomicU64 = AtomicU64::new(1);


///////////////////////////////////////////////////////////////////////////////////////////////////
// EDGE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A resolved subscription of a reaction to an event type of a component.
#[derive(Clone)]
struct Edge {
  target    : WeakComponent,
  event_type: String,
  /// Set on structural dependencies: the index of the connection to re-resolve.
  reconnect : Option<usize>
}


impl Edge {
  fn same_as(&self, other: &Edge) -> bool {
    self.target.ptr_eq(&other.target) && self.event_type == other.event_type && self.reconnect == other.reconnect
  }
}


fn contains_edge(edges: &[Edge], edge: &Edge) -> bool {
  edges.iter().any(|e| e.same_as(edge))
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// REACTION
///////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct ReactionState {
  edges   : Vec<Vec<Edge>>,
  implicit: Vec<Edge>,
  pending : VecDeque<Event>,
  queued  : HashSet<usize>,
  warned  : HashSet<(usize, String)>,
  disposed: bool
}


struct ReactionInner {
  id         : u64,
  name       : String,
  owner      : WeakComponent,
  callback   : ReactionFn,
  connections: Vec<ConnectionString>,
  state      : RefCell<ReactionState>
}


/// A handler invoked once per batch with every event it received since its last run.
///
/// An explicit reaction subscribes through its connection strings, and re-resolves a string
/// whenever a property along its path changes. A reaction without connection strings is
/// implicit: it subscribes to exactly the properties it read during its previous run.
///
/// The owning component keeps its reactions alive; a reaction only refers back to it weakly.
#[derive(Clone)]
pub struct Reaction {
  inner: Rc<ReactionInner>
}


impl Reaction {
  pub(crate) fn new(owner: &Component, name: &str, connections: Vec<ConnectionString>, callback: ReactionFn) -> Self {
    let state = ReactionState { edges: vec![Vec::new(); connections.len()], ..ReactionState::default() };

    Reaction {
      inner: Rc::new(ReactionInner {
        id         : NEXT_REACTION_ID.fetch_add(1, Ordering::Relaxed),
        name       : name.to_string(),
        owner      : owner.downgrade(),
        callback   : callback,
        connections: connections,
        state      : RefCell::new(state)
      })
    }
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn owner(&self) -> Option<Component> {
    self.inner.owner.upgrade()
  }

  /// Whether the reaction was given connection strings.
  pub fn is_explicit(&self) -> bool {
    !self.inner.connections.is_empty()
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.state.borrow().disposed
  }

  pub fn connection_strings(&self) -> Vec<&str> {
    self.inner.connections.iter().map(ConnectionString::as_str).collect()
  }

  /// Each connection string with the `(component id, event type)` pairs it currently resolves to.
  pub fn connection_info(&self) -> Vec<(String, Vec<(String, String)>)> {
    let state = self.inner.state.borrow();

    self.inner.connections.iter().zip(state.edges.iter()).map(|(connection, edges)| {
      let targets = edges.iter()
        .filter(|edge| edge.reconnect.is_none())
        .filter_map(|edge| edge.target.upgrade().map(|c| (c.id().to_string(), edge.event_type.clone())))
        .collect();
      (connection.to_string(), targets)
    }).collect()
  }

  /// Number of events waiting for the next invocation.
  pub fn pending_count(&self) -> usize {
    self.inner.state.borrow().pending.len()
  }

  pub fn ptr_eq(&self, other: &Reaction) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  /// Calls the reaction right away with the given events, bypassing the loop.
  ///
  /// Implicit reactions refresh their subscriptions from the properties read during the call.
  pub fn invoke(&self, events: &[Event]) -> Result<()> {
    let owner = match self.inner.owner.upgrade() {
      Some(owner) => owner,
      None        => return Ok(())
    };

    if self.is_explicit() {
      return (self.inner.callback)(&owner, events);
    }

    let event_loop = owner.event_loop().clone();
    event_loop.start_recording();
    let result   = (self.inner.callback)(&owner, events);
    let accessed = event_loop.stop_recording();
    self.update_implicit_connections(accessed);

    result
  }

  /// Disconnects the reaction from everything and drops its pending events. Idempotent.
  pub fn dispose(&self) {
    let edges = {
      let mut state = self.inner.state.borrow_mut();
      if state.disposed {
        return;
      }
      state.disposed = true;
      state.pending.clear();
      state.queued.clear();

      let mut edges: Vec<Edge> = state.edges.iter_mut().flat_map(std::mem::take).collect();
      edges.append(&mut state.implicit);
      edges
    };

    for edge in edges {
      if let Some(target) = edge.target.upgrade() {
        target.remove_handlers_of(&edge.event_type, self);
      }
    }
    debug!(reaction = %self.inner.name, "reaction disposed");
  }

  ///////////////////////////////////////////////////////////////////////////////////////////////
  // PENDING EVENTS
  ///////////////////////////////////////////////////////////////////////////////////////////////

  /// Queues an event. Returns false when it is dropped: the reaction is disposed, or it already
  /// got this very event through another connection.
  pub(crate) fn push_pending(&self, event: Event) -> bool {
    let mut state = self.inner.state.borrow_mut();
    if state.disposed || !state.queued.insert(event.addr()) {
      return false;
    }
    state.pending.push_back(event);
    true
  }

  pub(crate) fn take_pending(&self) -> Vec<Event> {
    let mut state = self.inner.state.borrow_mut();
    state.queued.clear();
    state.pending.drain(..).collect()
  }

  ///////////////////////////////////////////////////////////////////////////////////////////////
  // CONNECTIONS
  ///////////////////////////////////////////////////////////////////////////////////////////////

  fn sort_key(&self, index: usize) -> String {
    self.inner.connections[index].sort_key(&self.inner.name).to_string()
  }

  /// Key used when the reaction gets scheduled through an implicit subscription.
  pub(crate) fn default_key(&self) -> &str {
    &self.inner.name
  }

  /// Resolves every connection string.
  pub(crate) fn connect(&self) -> Result<()> {
    for index in 0..self.inner.connections.len() {
      self.reconnect(index)?;
    }
    Ok(())
  }

  /// Re-resolves a connection after one of its structural dependencies changed.
  pub(crate) fn reconnect_logged(&self, index: usize) {
    if let Err(failure) = self.reconnect(index) {
      error!(reaction = %self.inner.name, error = %failure, "could not reconnect");
    }
  }

  /// Resolves a connection string against the live object graph, then subscribes to the new
  /// edges and unsubscribes from the ones that are gone.
  pub(crate) fn reconnect(&self, index: usize) -> Result<()> {
    if self.is_disposed() {
      return Ok(());
    }

    let owner = match self.inner.owner.upgrade() {
      Some(owner) => owner,
      None        => return Ok(())
    };

    let connection = &self.inner.connections[index];
    let mut edges   = Vec::new();
    let mut visited = HashSet::new();
    let resolved    = self.seek(index, connection, connection.path(), &owner, &mut edges, &mut visited);

    // on failure, keep the structural dependencies found so far so that a later change can fix it
    if resolved.is_err() {
      edges.retain(|edge| edge.reconnect.is_some());
    }

    let mut unique: Vec<Edge> = Vec::with_capacity(edges.len());
    for edge in edges {
      if !contains_edge(&unique, &edge) {
        unique.push(edge);
      }
    }

    let previous = std::mem::replace(&mut self.inner.state.borrow_mut().edges[index], unique.clone());
    self.swap_edges(&previous, &unique, &self.sort_key(index), Some((index, connection)));

    trace!(reaction = %self.inner.name, connection = %connection, edges = unique.len(), "connection resolved");
    resolved
  }

  /// Walks the remaining `path` from `object`, collecting leaf edges and structural dependencies.
  fn seek(
    &self,
    index     : usize,
    connection: &ConnectionString,
    path      : &[Segment],
    object    : &Component,
    edges     : &mut Vec<Edge>,
    visited   : &mut HashSet<usize>
  ) -> Result<()> {
    let (segment, rest) = match path.split_first() {
      Some(split) => split,
      None        => {
        edges.push(Edge { target: object.downgrade(), event_type: connection.event_type().to_string(), reconnect: None });
        return Ok(());
      }
    };

    let value = if object.kind().has_property(&segment.name) {
      edges.push(Edge { target: object.downgrade(), event_type: segment.name.clone(), reconnect: Some(index) });
      object.peek(&segment.name).unwrap_or(Value::Null)
    }
    else if let Some(value) = object.kind().attribute(&segment.name) {
      value.clone()
    }
    else {
      return Ok(());
    };

    match segment.fanout {
      Fanout::Single => match value {
        Value::Component(next) => self.seek(index, connection, rest, &next, edges, visited),
        _                      => Ok(())
      },

      Fanout::Each | Fanout::Recursive => {
        let items = match value {
          Value::List(items) => items,
          Value::Null        => return Ok(()),
          other              => return Err(EventError::connection(
            connection.as_str(),
            format!("`{}` of {} is a {}, not a list", segment.name, object.id(), other.type_name())
          ))
        };

        for item in items {
          let child = match item {
            Value::Component(child) => child,
            _                       => continue
          };

          if segment.fanout == Fanout::Recursive {
            // cycles in the object graph must not recurse forever
            if !visited.insert(child.addr()) {
              continue;
            }
            self.seek(index, connection, rest, &child, edges, visited)?;
            self.seek(index, connection, path, &child, edges, visited)?;
          }
          else {
            self.seek(index, connection, rest, &child, edges, visited)?;
          }
        }
        Ok(())
      }
    }
  }

  /// Replaces the subscriptions to the properties read during the last run.
  fn update_implicit_connections(&self, accessed: Vec<(Component, String)>) {
    if self.is_disposed() {
      return;
    }

    let mut current: Vec<Edge> = Vec::with_capacity(accessed.len());
    for (component, name) in accessed {
      let edge = Edge { target: component.downgrade(), event_type: name, reconnect: None };
      if !contains_edge(&current, &edge) {
        current.push(edge);
      }
    }

    let previous = std::mem::replace(&mut self.inner.state.borrow_mut().implicit, current.clone());
    self.swap_edges(&previous, &current, &self.inner.name, None);
  }

  fn swap_edges(&self, previous: &[Edge], current: &[Edge], key: &str, connection: Option<(usize, &ConnectionString)>) {
    for edge in previous.iter().filter(|edge| !contains_edge(current, edge)) {
      // another connection with the same key may still need this handler
      if self.holds_edge(edge, key) {
        continue;
      }
      if let Some(target) = edge.target.upgrade() {
        target.remove_handler(&edge.event_type, self, key, edge.reconnect);
      }
    }

    for edge in current.iter().filter(|edge| !contains_edge(previous, edge)) {
      let target = match edge.target.upgrade() {
        Some(target) => target,
        None         => continue
      };

      if let (Some((index, connection)), None) = (connection, edge.reconnect) {
        self.warn_if_unknown(index, connection, &target, &edge.event_type);
      }

      target.add_handler(&edge.event_type, Handler {
        key      : key.to_string(),
        reaction : self.clone(),
        reconnect: edge.reconnect
      });
    }
  }

  /// Whether an edge is still held under `key`, by any connection or by the implicit edges.
  fn holds_edge(&self, edge: &Edge, key: &str) -> bool {
    let state = self.inner.state.borrow();

    let explicit = state.edges.iter().enumerate()
      .any(|(index, edges)| self.inner.connections[index].sort_key(&self.inner.name) == key && contains_edge(edges, edge));
    explicit || (self.inner.name == key && contains_edge(&state.implicit, edge))
  }

  fn warn_if_unknown(&self, index: usize, connection: &ConnectionString, target: &Component, event_type: &str) {
    if connection.is_forced()
      || target.kind().knows_event_type(event_type)
      || !target.event_loop().config().warn_unknown_events {
      return;
    }

    let first_time = self.inner.state.borrow_mut().warned.insert((index, event_type.to_string()));
    if first_time {
      warn!(
        reaction   = %self.inner.name,
        connection = %connection,
        component  = %target.id(),
        "event type `{}` is unknown to {}; prefix the connection with `!` to silence this",
        event_type, target.kind().name()
      );
    }
  }

  /// Drops the edges pointing at `target`, optionally only those of one event type.
  /// Used when the target disconnects or disposes itself.
  pub(crate) fn forget_target(&self, target: &Component, event_type: Option<&str>) {
    let weak    = target.downgrade();
    let matches = |edge: &Edge| edge.target.ptr_eq(&weak) && event_type.map_or(true, |t| t == edge.event_type);

    let mut state = self.inner.state.borrow_mut();
    for edges in state.edges.iter_mut() {
      edges.retain(|edge| !matches(edge));
    }
    state.implicit.retain(|edge| !matches(edge));
  }
}


impl fmt::Debug for Reaction {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Reaction")
      .field("id", &self.inner.id)
      .field("name", &self.inner.name)
      .field("connections", &self.connection_strings())
      .finish()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use std::cell::RefCell;
  use std::io;
  use std::rc::Rc;
  use std::sync::{Arc, Mutex};

  use crate::component_type::ComponentType;
  use crate::event_loop::{Loop, LoopConfig};
  use crate::property::Property;
  use super::*;


  fn node_type() -> Rc<ComponentType> {
    ComponentType::builder("Node")
      .property(Property::component("parent").settable())
      .property(Property::list("children").settable())
      .property(Property::int("foo").settable())
      .emitter("pinged", |_, _| Ok(Some(Default::default())))
      .build()
      .unwrap()
  }

  fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&Component, &[Event]) -> Result<()>) {
    let seen   = Rc::new(RefCell::new(Vec::new()));
    let seen_2 = seen.clone();
    (seen, move |_: &Component, events: &[Event]| {
      for event in events {
        seen_2.borrow_mut().push(format!("{}.{}", event.source().id(), event.event_type()));
      }
      Ok(())
    })
  }

  fn set(component: &Component, name: &str, value: impl Into<Value>) {
    component.invoke(&format!("set_{}", name), vec![value.into()]).unwrap();
  }

  #[derive(Clone, Default)]
  struct Captured(Arc<Mutex<Vec<u8>>>);

  impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  /// Runs `body` under a capturing subscriber and counts the unknown event type warnings.
  fn unknown_type_warnings<F: FnOnce()>(body: F) -> usize {
    let captured = Captured::default();
    let writer   = captured.clone();
    let subscriber = tracing_subscriber::fmt()
      .with_writer(move || writer.clone())
      .with_max_level(tracing::Level::WARN)
      .with_ansi(false)
      .finish();

    tracing::subscriber::with_default(subscriber, body);

    let output = String::from_utf8_lossy(&captured.0.lock().unwrap()).to_string();
    output.matches("is unknown to").count()
  }

  fn warned(reaction: &Reaction) -> Vec<(usize, String)> {
    let mut warned: Vec<(usize, String)> = reaction.inner.state.borrow().warned.iter().cloned().collect();
    warned.sort();
    warned
  }

  fn noop(_: &Component, _: &[Event]) -> Result<()> {
    Ok(())
  }

  fn parent_of_two(event_loop: &Loop) -> Component {
    let kind   = node_type();
    let root   = Component::new(event_loop, &kind).unwrap();
    let first  = Component::new(event_loop, &kind).unwrap();
    let second = Component::new(event_loop, &kind).unwrap();
    set(&root, "children", vec![first, second]);
    event_loop.run().unwrap();
    root
  }

  #[test]
  fn star_fans_out_over_list_elements() {
    let event_loop = Loop::new();
    let kind       = node_type();
    let root       = Component::new(&event_loop, &kind).unwrap();
    let a          = Component::new(&event_loop, &kind).unwrap();
    let b          = Component::new(&event_loop, &kind).unwrap();
    set(&root, "children", vec![a.clone(), b.clone()]);
    event_loop.run().unwrap();

    let (seen, callback) = recorder();
    let reaction = root.reaction("watch", &["children*.pinged"], callback).unwrap();
    let info     = reaction.connection_info();
    assert_eq!(info[0].1, vec![
      (a.id().to_string(), "pinged".to_string()),
      (b.id().to_string(), "pinged".to_string())
    ]);

    b.invoke("pinged", vec![]).unwrap();
    event_loop.run().unwrap();
    assert_eq!(*seen.borrow(), vec![format!("{}.pinged", b.id())]);

    // dropping b from the list disconnects it
    set(&root, "children", vec![a.clone()]);
    event_loop.run().unwrap();
    b.invoke("pinged", vec![]).unwrap();
    a.invoke("pinged", vec![]).unwrap();
    event_loop.run().unwrap();
    assert_eq!(*seen.borrow(), vec![format!("{}.pinged", b.id()), format!("{}.pinged", a.id())]);
  }

  #[test]
  fn double_star_recurses_and_survives_cycles() {
    let event_loop = Loop::new();
    let kind       = node_type();
    let root       = Component::new(&event_loop, &kind).unwrap();
    let child      = Component::new(&event_loop, &kind).unwrap();
    let grandchild = Component::new(&event_loop, &kind).unwrap();
    set(&root, "children", vec![child.clone()]);
    set(&child, "children", vec![grandchild.clone()]);
    set(&grandchild, "children", vec![child.clone()]);
    event_loop.run().unwrap();

    let (_, callback) = recorder();
    let reaction = root.reaction("deep", &["children**.foo"], callback).unwrap();

    let mut ids: Vec<String> = reaction.connection_info()[0].1.iter().map(|(id, _)| id.clone()).collect();
    ids.sort();
    // the starting object is not part of its own descendants
    let mut expected = vec![child.id().to_string(), grandchild.id().to_string()];
    expected.sort();
    assert_eq!(ids, expected);
  }

  #[test]
  fn star_over_a_scalar_is_an_error() {
    let event_loop = Loop::new();
    let root       = Component::new(&event_loop, &node_type()).unwrap();
    let (_, callback) = recorder();

    let result = root.reaction("bad", &["foo*.pinged"], callback);
    assert!(matches!(result, Err(EventError::Connection { .. })));
  }

  #[test]
  fn unknown_event_types_still_connect() {
    let event_loop = Loop::new();
    let root       = Component::new(&event_loop, &node_type()).unwrap();
    let (seen, callback) = recorder();

    root.reaction("custom", &["whatever"], callback).unwrap();
    root.emit("whatever", Default::default()).unwrap();
    event_loop.run().unwrap();
    assert_eq!(seen.borrow().len(), 1);
  }

  #[test]
  fn unknown_event_type_is_warned_once_per_connection() {
    let event_loop = Loop::new();
    let root       = parent_of_two(&event_loop);
    let mut reaction = None;

    let count = unknown_type_warnings(|| {
      reaction = Some(root.reaction("loud", &["children*.whatever", "children*.foo"], noop).unwrap());
    });

    assert_eq!(count, 1);
    assert_eq!(warned(&reaction.unwrap()), vec![(0, "whatever".to_string())]);
  }

  #[test]
  fn forced_connections_are_not_warned() {
    let event_loop = Loop::new();
    let root       = parent_of_two(&event_loop);
    let mut reaction = None;

    let count = unknown_type_warnings(|| {
      reaction = Some(root.reaction("quiet", &["!children*.whatever"], noop).unwrap());
    });

    assert_eq!(count, 0);
    assert!(warned(&reaction.unwrap()).is_empty());
  }

  #[test]
  fn warnings_can_be_disabled_on_the_loop() {
    let event_loop = Loop::with_config(LoopConfig::default().warn_unknown_events(false));
    let root       = parent_of_two(&event_loop);
    let mut reaction = None;

    let count = unknown_type_warnings(|| {
      reaction = Some(root.reaction("quiet", &["children*.whatever"], noop).unwrap());
    });

    assert_eq!(count, 0);
    assert!(warned(&reaction.unwrap()).is_empty());
  }

  #[test]
  fn shared_edge_survives_when_one_connection_moves_away() {
    let event_loop = Loop::new();
    let kind       = node_type();
    let first      = Component::new(&event_loop, &kind).unwrap();
    let second     = Component::new(&event_loop, &kind).unwrap();
    let main       = Component::builder(&event_loop, &kind)
      .value("parent", &first)
      .value("children", vec![first.clone()])
      .build()
      .unwrap();
    event_loop.run().unwrap();

    let (seen, callback) = recorder();
    main.reaction("watch", &["parent.foo", "children*.foo"], callback).unwrap();
    assert_eq!(first.handlers("foo").len(), 1);

    set(&main, "parent", &second);
    event_loop.run().unwrap();
    assert_eq!(first.handlers("foo").len(), 1);
    assert_eq!(second.handlers("foo").len(), 1);

    set(&first, "foo", 1);
    event_loop.run().unwrap();
    assert_eq!(*seen.borrow(), vec![format!("{}.foo", first.id())]);
  }

  #[test]
  fn dispose_disconnects_everything() {
    let event_loop = Loop::new();
    let root       = Component::new(&event_loop, &node_type()).unwrap();
    let (seen, callback) = recorder();

    let reaction = root.reaction("watch", &["foo"], callback).unwrap();
    assert_eq!(root.handlers("foo").len(), 1);

    reaction.dispose();
    reaction.dispose();
    assert!(reaction.is_disposed());
    assert!(root.handlers("foo").is_empty());

    set(&root, "foo", 3);
    event_loop.run().unwrap();
    assert!(seen.borrow().is_empty());
  }

  #[test]
  fn same_event_through_two_connections_is_queued_once() {
    let event_loop = Loop::new();
    let root       = Component::new(&event_loop, &node_type()).unwrap();
    event_loop.run().unwrap();
    let (seen, callback) = recorder();

    root.reaction("twice", &["foo", "foo:other"], callback).unwrap();
    set(&root, "foo", 1);
    event_loop.run().unwrap();
    assert_eq!(seen.borrow().len(), 1);
  }
}
