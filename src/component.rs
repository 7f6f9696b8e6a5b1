use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::component_type::ComponentType;
use crate::connection::{is_identifier, ConnectionString};
use crate::error::{EventError, Result};
use crate::event::{Event, Fields};
use crate::event_loop::Loop;
use crate::mutation::{mutate_array, mutate_dict, Mutation};
use crate::reaction::Reaction;
use crate::value::Value;


/// Zero-argument producer bound to a property at construction.
type Producer = Rc<dyn Fn() -> Result<Value>>;


/// Subscription of a reaction to one event type of a component.
#[derive(Clone)]
pub(crate) struct Handler {
  pub(crate) key      : String,
  pub(crate) reaction : Reaction,
  /// Structural dependency: the event triggers a reconnect of this connection index
  /// instead of being delivered.
  pub(crate) reconnect: Option<usize>
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// COMPONENT
///////////////////////////////////////////////////////////////////////////////////////////////////

struct ComponentInner {
  id         : String,
  kind       : Rc<ComponentType>,
  event_loop : Loop,
  values     : RefCell<BTreeMap<String, Value>>,
  handlers   : RefCell<BTreeMap<String, Vec<Handler>>>,
  reactions  : RefCell<Vec<Reaction>>,
  anonymous  : RefCell<Vec<Reaction>>,
  init_events: RefCell<Option<Vec<Event>>>,
  disposed   : Cell<bool>
}


/// An instance of a `ComponentType`: property storage plus the reactions connected to it.
///
/// `Component` is a cheap handle; clones refer to the same instance and compare equal with
/// `ptr_eq`. Properties only change through `mutate` and `mutate_in_place`, which are allowed
/// while the loop runs actions, or during construction.
#[derive(Clone)]
pub struct Component {
  inner: Rc<ComponentInner>
}


/// Non-owning reference to a component.
#[derive(Clone)]
pub(crate) struct WeakComponent {
  inner: Weak<ComponentInner>
}


impl WeakComponent {
  pub(crate) fn upgrade(&self) -> Option<Component> {
    self.inner.upgrade().map(|inner| Component { inner: inner })
  }

  pub(crate) fn ptr_eq(&self, other: &WeakComponent) -> bool {
    Weak::ptr_eq(&self.inner, &other.inner)
  }
}


impl Component {
  /// Creates a component with default values, on `event_loop`.
  pub fn new(event_loop: &Loop, kind: &Rc<ComponentType>) -> Result<Component> {
    Component::builder(event_loop, kind).build()
  }

  /// Starts a component with initial values or bindings.
  pub fn builder(event_loop: &Loop, kind: &Rc<ComponentType>) -> ComponentBuilder {
    ComponentBuilder {
      event_loop: event_loop.clone(),
      kind      : kind.clone(),
      values    : Vec::new(),
      bindings  : Vec::new()
    }
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  pub fn kind(&self) -> &Rc<ComponentType> {
    &self.inner.kind
  }

  pub fn event_loop(&self) -> &Loop {
    &self.inner.event_loop
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.get()
  }

  pub fn ptr_eq(&self, other: &Component) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  pub(crate) fn addr(&self) -> usize {
    Rc::as_ptr(&self.inner) as usize
  }

  pub(crate) fn downgrade(&self) -> WeakComponent {
    WeakComponent { inner: Rc::downgrade(&self.inner) }
  }

  ///////////////////////////////////////////////////////////////////////////////////////////////
  // PROPERTIES
  ///////////////////////////////////////////////////////////////////////////////////////////////

  /// Current value of a property. Implicit reactions running now subscribe to it.
  pub fn get(&self, name: &str) -> Result<Value> {
    let value = self.peek(name).ok_or_else(|| self.unknown_property(name))?;
    self.inner.event_loop.register_prop_access(self, name);
    Ok(value)
  }

  /// Reads a property without being tracked.
  pub(crate) fn peek(&self, name: &str) -> Option<Value> {
    self.inner.values.borrow().get(name).cloned()
  }

  /// Read-only value declared on the type.
  pub fn attribute(&self, name: &str) -> Result<Value> {
    self.inner.kind.attribute(name).cloned().ok_or_else(|| {
      EventError::attribute(format!("{} has no attribute `{}`", self.inner.kind.name(), name))
    })
  }

  fn unknown_property(&self, name: &str) -> EventError {
    EventError::attribute(format!("{} has no property `{}`", self.inner.kind.name(), name))
  }

  fn check_mutable(&self, name: &str) -> Result<()> {
    if self.is_disposed() {
      return Err(EventError::state(format!("cannot mutate `{}` of disposed {}", name, self.id())));
    }
    if !self.inner.kind.has_property(name) {
      return Err(self.unknown_property(name));
    }
    if !self.inner.event_loop.can_mutate(self) {
      return Err(EventError::state(format!(
        "cannot mutate `{}` of {} outside of an action", name, self.id()
      )));
    }
    Ok(())
  }

  /// Validates and stores a new value, then emits the change event.
  ///
  /// Returns whether the value changed: storing an equal value emits nothing.
  pub fn mutate(&self, name: &str, value: impl Into<Value>) -> Result<bool> {
    self.check_mutable(name)?;

    let property = self.inner.kind.property(name).ok_or_else(|| self.unknown_property(name))?;
    let value    = property.validate(&value.into())?;

    let old_value = {
      let mut values = self.inner.values.borrow_mut();
      let slot       = values.entry(name.to_string()).or_default();
      if *slot == value {
        return Ok(false);
      }
      std::mem::replace(slot, value.clone())
    };

    trace!(component = %self.id(), property = name, "property set");
    self.dispatch(Event::property_set(self.clone(), name, old_value, value));
    Ok(true)
  }

  /// Changes part of a list or dict property.
  ///
  /// Lists need an `index`; `objects` holds the items, or the count for `remove`. Dicts take no
  /// index; `objects` holds the entries to update, or the list of keys for `remove`.
  /// A `set` mutation behaves like `mutate`.
  pub fn mutate_in_place(&self, name: &str, mutation: Mutation, index: Option<usize>, objects: impl Into<Value>) -> Result<()> {
    let objects = objects.into();
    if mutation == Mutation::Set {
      return self.mutate(name, objects).map(|_| ());
    }

    self.check_mutable(name)?;
    let property = self.inner.kind.property(name).ok_or_else(|| self.unknown_property(name))?;

    {
      let mut values = self.inner.values.borrow_mut();
      let current    = values.entry(name.to_string()).or_default();
      if !property.allows_in_place(current) {
        return Err(EventError::mutation(format!(
          "`{}` of {} holds a {} and cannot be mutated in place", name, self.id(), current.type_name()
        )));
      }

      match (current, index) {
        (Value::List(list), Some(index)) => mutate_array(list, mutation, index, &objects)?,
        (Value::Dict(dict), None)        => mutate_dict(dict, mutation, &objects)?,
        (Value::List(_), None)           => return Err(EventError::mutation(format!("`{}` of `{}` needs an index", mutation, name))),
        (_, Some(_))                     => return Err(EventError::mutation(format!("`{}` of `{}` takes no index", mutation, name))),
        (other, None)                    => return Err(EventError::mutation(format!("cannot mutate a {} in place", other.type_name())))
      }
    }

    trace!(component = %self.id(), property = name, mutation = %mutation, "property mutated");
    self.dispatch(Event::property_mutation(self.clone(), name, mutation, index, objects));
    Ok(())
  }

  ///////////////////////////////////////////////////////////////////////////////////////////////
  // ACTIONS AND EVENTS
  ///////////////////////////////////////////////////////////////////////////////////////////////

  /// Invokes an action or an emitter.
  ///
  /// Actions run right away when the loop is already running actions, and are queued otherwise.
  /// Emitters always run right away and emit the event they produce.
  pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<()> {
    if self.is_disposed() {
      return Err(EventError::state(format!("cannot invoke `{}` on disposed {}", name, self.id())));
    }

    if let Some(action) = self.inner.kind.action(name) {
      if self.inner.event_loop.is_processing_actions() {
        return action(self, &args);
      }
      self.inner.event_loop.add_action_invocation(self, name, action, args);
      return Ok(());
    }

    if let Some(emitter) = self.inner.kind.emitter(name) {
      if let Some(fields) = emitter(self, &args)? {
        self.emit(name, fields)?;
      }
      return Ok(());
    }

    Err(EventError::attribute(format!("{} has no action or emitter `{}`", self.inner.kind.name(), name)))
  }

  /// Emits an event of any type. A disposed component builds the event but delivers it nowhere.
  pub fn emit(&self, event_type: &str, fields: Fields) -> Result<Event> {
    if !is_identifier(event_type) {
      return Err(EventError::attribute(format!("`{}` is not a valid event type", event_type)));
    }

    let event = Event::new(event_type, self.clone(), fields);
    self.dispatch(event.clone());
    Ok(event)
  }

  /// Hands an event to every handler of its type, in key order.
  pub(crate) fn dispatch(&self, event: Event) {
    if self.is_disposed() {
      return;
    }

    {
      let mut init_events = self.inner.init_events.borrow_mut();
      if let Some(buffer) = init_events.as_mut() {
        // property changes during construction are folded into the initial events
        if !self.inner.kind.has_property(event.event_type()) {
          buffer.push(event);
        }
        return;
      }
    }

    let handlers = self.inner.handlers.borrow().get(event.event_type()).cloned().unwrap_or_default();
    for handler in handlers {
      match handler.reconnect {
        Some(index) => handler.reaction.reconnect_logged(index),
        None        => self.inner.event_loop.add_reaction_event(&handler.reaction, &handler.key, Some(event.clone()))
      }
    }
  }

  ///////////////////////////////////////////////////////////////////////////////////////////////
  // REACTIONS
  ///////////////////////////////////////////////////////////////////////////////////////////////

  /// Attaches a reaction owned by this component.
  ///
  /// Without connection strings, the reaction is implicit and first runs at the next batch.
  pub fn reaction<F>(&self, name: &str, connection_strings: &[&str], callback: F) -> Result<Reaction>
  where
    F: Fn(&Component, &[Event]) -> Result<()> + 'static
  {
    if self.is_disposed() {
      return Err(EventError::state(format!("cannot add reaction `{}` to disposed {}", name, self.id())));
    }

    let connections = connection_strings.iter()
      .map(|raw| ConnectionString::parse(raw))
      .collect::<Result<Vec<_>>>()?;

    let reaction = Reaction::new(self, name, connections, Rc::new(callback));
    self.start_reaction(&reaction)?;
    self.inner.reactions.borrow_mut().push(reaction.clone());
    Ok(reaction)
  }

  fn start_reaction(&self, reaction: &Reaction) -> Result<()> {
    if reaction.is_explicit() {
      if let Err(failure) = reaction.connect() {
        reaction.dispose();
        return Err(failure);
      }
    }
    else {
      self.inner.event_loop.add_reaction_event(reaction, reaction.default_key(), None);
    }
    Ok(())
  }

  /// Removes handlers from this component.
  ///
  /// `"type"` removes every handler of an event type, `"type:label"` only those with that label
  /// (or reaction name), and `":label"` those with that label on every event type.
  pub fn disconnect(&self, connection: &str) -> Result<()> {
    let (event_type, label) = match connection.split_once(':') {
      Some((_, ""))              => return Err(EventError::connection(connection, "the label after `:` is empty")),
      Some((event_type, label))  => (event_type, Some(label)),
      None                       => (connection, None)
    };

    if !event_type.is_empty() && !is_identifier(event_type) {
      return Err(EventError::connection(connection, format!("`{}` is not a valid event type", event_type)));
    }

    let mut removed = Vec::new();
    {
      let mut handlers = self.inner.handlers.borrow_mut();
      for (current_type, list) in handlers.iter_mut() {
        if !event_type.is_empty() && current_type != event_type {
          continue;
        }
        list.retain(|handler| {
          let matches = label.map_or(true, |label| handler.key == label);
          if matches {
            removed.push((current_type.clone(), handler.reaction.clone()));
          }
          !matches
        });
      }
      handlers.retain(|_, list| !list.is_empty());
    }

    for (event_type, reaction) in removed {
      reaction.forget_target(self, Some(&event_type));
    }
    debug!(component = %self.id(), connection = connection, "disconnected");
    Ok(())
  }

  /// Reactions receiving events of `event_type` from this component, in delivery order.
  pub fn handlers(&self, event_type: &str) -> Vec<Reaction> {
    self.inner.handlers.borrow().get(event_type).map_or_else(Vec::new, |list| {
      list.iter().filter(|handler| handler.reconnect.is_none()).map(|handler| handler.reaction.clone()).collect()
    })
  }

  /// Reactions owned by this component: declared, attached, then those of bindings.
  pub fn reactions(&self) -> Vec<Reaction> {
    let mut reactions = self.inner.reactions.borrow().clone();
    reactions.extend(self.inner.anonymous.borrow().iter().cloned());
    reactions
  }

  pub(crate) fn add_handler(&self, event_type: &str, handler: Handler) {
    if self.is_disposed() {
      return;
    }

    let mut handlers = self.inner.handlers.borrow_mut();
    let list         = handlers.entry(event_type.to_string()).or_default();

    let exists = list.iter().any(|h| {
      h.reaction.ptr_eq(&handler.reaction) && h.key == handler.key && h.reconnect == handler.reconnect
    });
    if !exists {
      let position = list.partition_point(|h| h.key <= handler.key);
      list.insert(position, handler);
    }
  }

  pub(crate) fn remove_handler(&self, event_type: &str, reaction: &Reaction, key: &str, reconnect: Option<usize>) {
    let mut handlers = self.inner.handlers.borrow_mut();
    if let Some(list) = handlers.get_mut(event_type) {
      list.retain(|h| !(h.reaction.ptr_eq(reaction) && h.key == key && h.reconnect == reconnect));
      if list.is_empty() {
        handlers.remove(event_type);
      }
    }
  }

  pub(crate) fn remove_handlers_of(&self, event_type: &str, reaction: &Reaction) {
    let mut handlers = self.inner.handlers.borrow_mut();
    if let Some(list) = handlers.get_mut(event_type) {
      list.retain(|h| !h.reaction.ptr_eq(reaction));
      if list.is_empty() {
        handlers.remove(event_type);
      }
    }
  }

  ///////////////////////////////////////////////////////////////////////////////////////////////
  // DISPOSAL
  ///////////////////////////////////////////////////////////////////////////////////////////////

  /// Disconnects every reaction owned by or connected to this component, and rejects later
  /// mutations. Events already queued are still delivered. Idempotent.
  pub fn dispose(&self) {
    if self.inner.disposed.replace(true) {
      return;
    }

    let owned: Vec<Reaction> = self.inner.reactions.borrow_mut().drain(..)
      .chain(self.inner.anonymous.borrow_mut().drain(..))
      .collect();
    for reaction in owned {
      reaction.dispose();
    }

    let handlers = std::mem::take(&mut *self.inner.handlers.borrow_mut());
    for (event_type, list) in handlers {
      for handler in list {
        handler.reaction.forget_target(self, Some(&event_type));
      }
    }

    debug!(component = %self.id(), "component disposed");
  }
}


impl fmt::Debug for Component {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Component")
      .field("id", &self.inner.id)
      .field("values", &*self.inner.values.borrow())
      .field("disposed", &self.inner.disposed.get())
      .finish()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// COMPONENT BUILDER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Initial values of a component under construction.
pub struct ComponentBuilder {
  event_loop: Loop,
  kind      : Rc<ComponentType>,
  values    : Vec<(String, Value)>,
  bindings  : Vec<(String, Producer)>
}


impl ComponentBuilder {
  /// Initial value of a property, validated like any mutation.
  pub fn value(mut self, name: &str, value: impl Into<Value>) -> Self {
    self.values.push((name.to_string(), value.into()));
    self
  }

  /// Keeps a settable property in sync with `producer`, which is re-run whenever a property it
  /// read changes.
  pub fn bind<F>(mut self, name: &str, producer: F) -> Self
  where
    F: Fn() -> Result<Value> + 'static
  {
    self.bindings.push((name.to_string(), Rc::new(producer)));
    self
  }

  fn check_name(&self, name: &str) -> Result<()> {
    if self.kind.has_property(name) {
      Ok(())
    }
    else if self.kind.attribute(name).is_some() {
      Err(EventError::attribute(format!("`{}.{}` is a read-only attribute", self.kind.name(), name)))
    }
    else {
      Err(EventError::attribute(format!("{} has no property `{}`", self.kind.name(), name)))
    }
  }

  /// Creates the component, runs the type's init hook, connects its reactions and then
  /// dispatches its initial events.
  pub fn build(self) -> Result<Component> {
    for (name, _) in &self.values {
      self.check_name(name)?;
    }
    for (name, _) in &self.bindings {
      self.check_name(name)?;
      let settable = self.kind.property(name).map_or(false, |p| p.is_settable());
      if !settable {
        return Err(EventError::attribute(format!(
          "cannot bind `{}.{}`: the property is not settable", self.kind.name(), name
        )));
      }
    }

    let defaults = self.kind.properties().iter()
      .map(|p| (p.name().to_string(), p.default_value().clone()))
      .collect();

    let component = Component {
      inner: Rc::new(ComponentInner {
        id         : self.kind.next_instance_id(),
        kind       : self.kind.clone(),
        event_loop : self.event_loop.clone(),
        values     : RefCell::new(defaults),
        handlers   : RefCell::new(BTreeMap::new()),
        reactions  : RefCell::new(Vec::new()),
        anonymous  : RefCell::new(Vec::new()),
        init_events: RefCell::new(Some(Vec::new())),
        disposed   : Cell::new(false)
      })
    };

    if let Err(failure) = self.initialize(&component) {
      component.dispose();
      return Err(failure);
    }

    debug!(component = %component.id(), "component created");
    Ok(component)
  }

  fn initialize(self, component: &Component) -> Result<()> {
    {
      let _context = self.event_loop.enter_context(component);
      for (name, value) in self.values {
        component.mutate(&name, value)?;
      }
      if let Some(init) = self.kind.init_hook() {
        init(component)?;
      }
    }

    for decl in self.kind.reaction_decls() {
      let reaction = Reaction::new(component, &decl.name, decl.connections.clone(), decl.callback.clone());
      component.inner.reactions.borrow_mut().push(reaction.clone());
      component.start_reaction(&reaction)?;
    }

    let bound: Vec<String> = self.bindings.iter().map(|(name, _)| name.clone()).collect();
    for (name, producer) in self.bindings {
      let setter   = format!("set_{}", name);
      let callback = move |c: &Component, _: &[Event]| c.invoke(&setter, vec![producer()?]);
      let reaction = Reaction::new(component, &format!("auto-{}", name), Vec::new(), Rc::new(callback));
      component.inner.anonymous.borrow_mut().push(reaction.clone());
      component.start_reaction(&reaction)?;
    }

    let emitted = component.inner.init_events.borrow_mut().take().unwrap_or_default();
    // bound properties announce themselves through their first update
    let initial: Vec<Event> = self.kind.properties().iter()
      .filter(|property| !bound.iter().any(|name| name == property.name()))
      .map(|property| {
        let value = component.peek(property.name()).unwrap_or_default();
        Event::property_set(component.clone(), property.name(), value.clone(), value)
      })
      .collect();

    for event in initial.into_iter().chain(emitted) {
      component.dispatch(event);
    }
    Ok(())
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
