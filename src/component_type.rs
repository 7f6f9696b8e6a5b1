use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use crate::component::Component;
use crate::connection::{is_identifier, ConnectionString};
use crate::error::{EventError, Result};
use crate::event::{Event, Fields};
use crate::property::Property;
use crate::value::Value;


/// Body of an action. Actions may mutate properties and return nothing.
pub type ActionFn = Rc<dyn Fn(&Component, &[Value]) -> Result<()>>;

/// Body of an emitter. The returned fields are emitted as an event named after the emitter.
pub type EmitterFn = Rc<dyn Fn(&Component, &[Value]) -> Result<Option<Fields>>>;

/// Body of a reaction, called with every event queued since its last invocation.
pub type ReactionFn = Rc<dyn Fn(&Component, &[Event]) -> Result<()>>;

/// Hook run once per instance, while the instance accepts mutations without an action.
pub type InitFn = Rc<dyn Fn(&Component) -> Result<()>>;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Member {
  Property,
  Action,
  Emitter,
  Reaction,
  Attribute
}


impl fmt::Display for Member {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(match self {
      Member::Property  => "property",
      Member::Action    => "action",
      Member::Emitter   => "emitter",
      Member::Reaction  => "reaction",
      Member::Attribute => "attribute"
    })
  }
}


/// A reaction declared on a type, instantiated for each component.
#[derive(Clone)]
pub(crate) struct ReactionDecl {
  pub(crate) name       : String,
  pub(crate) connections: Vec<ConnectionString>,
  pub(crate) callback   : ReactionFn
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// COMPONENT TYPE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Static schema shared by all components of a type: properties, actions, emitters,
/// reactions and attributes, looked up by name.
pub struct ComponentType {
  name      : String,
  properties: Vec<Property>,
  actions   : BTreeMap<String, ActionFn>,
  emitters  : BTreeMap<String, EmitterFn>,
  reactions : Vec<ReactionDecl>,
  attributes: BTreeMap<String, Value>,
  init      : Option<InitFn>,
  instances : Cell<usize>
}


impl ComponentType {
  /// Starts declaring a new type.
  pub fn builder(name: &str) -> ComponentTypeBuilder {
    ComponentTypeBuilder::new(name)
  }

  /// Starts declaring a type that inherits every member of `base`.
  /// Members can be overridden by declaring them again with the same kind.
  pub fn subtype(name: &str, base: &ComponentType) -> ComponentTypeBuilder {
    let mut builder = ComponentTypeBuilder::new(name);

    for property in &base.properties {
      builder.members.insert(property.name().to_string(), Member::Property);
    }
    for name in base.actions.keys() {
      builder.members.insert(name.clone(), Member::Action);
    }
    for name in base.emitters.keys() {
      builder.members.insert(name.clone(), Member::Emitter);
    }
    for decl in &base.reactions {
      builder.members.insert(decl.name.clone(), Member::Reaction);
    }
    for name in base.attributes.keys() {
      builder.members.insert(name.clone(), Member::Attribute);
    }
    builder.inherited = builder.members.keys().cloned().collect();

    builder.properties = base.properties.clone();
    builder.actions    = base.actions.clone();
    builder.emitters   = base.emitters.clone();
    builder.reactions  = base.reactions.clone();
    builder.attributes = base.attributes.clone();
    builder.init       = base.init.clone();
    builder
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Properties in declaration order.
  pub fn properties(&self) -> &[Property] {
    &self.properties
  }

  pub fn property(&self, name: &str) -> Option<&Property> {
    self.properties.iter().find(|p| p.name() == name)
  }

  pub fn has_property(&self, name: &str) -> bool {
    self.property(name).is_some()
  }

  pub fn action_names(&self) -> Vec<&str> {
    self.actions.keys().map(String::as_str).collect()
  }

  pub fn emitter_names(&self) -> Vec<&str> {
    self.emitters.keys().map(String::as_str).collect()
  }

  pub fn reaction_names(&self) -> Vec<&str> {
    self.reactions.iter().map(|r| r.name.as_str()).collect()
  }

  pub fn attribute(&self, name: &str) -> Option<&Value> {
    self.attributes.get(name)
  }

  /// Event types known statically: one per property and per emitter, sorted.
  pub fn event_types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.properties.iter().map(Property::name)
      .chain(self.emitters.keys().map(String::as_str))
      .collect();
    types.sort_unstable();
    types
  }

  pub fn knows_event_type(&self, event_type: &str) -> bool {
    self.has_property(event_type) || self.emitters.contains_key(event_type)
  }

  pub(crate) fn action(&self, name: &str) -> Option<ActionFn> {
    self.actions.get(name).cloned()
  }

  pub(crate) fn emitter(&self, name: &str) -> Option<EmitterFn> {
    self.emitters.get(name).cloned()
  }

  pub(crate) fn reaction_decls(&self) -> &[ReactionDecl] {
    &self.reactions
  }

  pub(crate) fn init_hook(&self) -> Option<InitFn> {
    self.init.clone()
  }

  /// Identifier of the next instance, e.g. `Person3`.
  pub(crate) fn next_instance_id(&self) -> String {
    let count = self.instances.get() + 1;
    self.instances.set(count);
    format!("{}{}", self.name, count)
  }
}


impl fmt::Debug for ComponentType {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ComponentType")
      .field("name", &self.name)
      .field("properties", &self.properties)
      .field("actions", &self.action_names())
      .field("emitters", &self.emitter_names())
      .field("reactions", &self.reaction_names())
      .finish()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// COMPONENT TYPE BUILDER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Collects declarations; errors are reported by `build`, the first one winning.
pub struct ComponentTypeBuilder {
  name      : String,
  properties: Vec<Property>,
  actions   : BTreeMap<String, ActionFn>,
  emitters  : BTreeMap<String, EmitterFn>,
  reactions : Vec<ReactionDecl>,
  attributes: BTreeMap<String, Value>,
  init      : Option<InitFn>,
  members   : BTreeMap<String, Member>,
  inherited : BTreeSet<String>,
  errors    : Vec<EventError>
}


impl ComponentTypeBuilder {
  fn new(name: &str) -> Self {
    let mut errors = Vec::new();
    if !is_identifier(name) {
      errors.push(EventError::attribute(format!("`{}` is not a valid component type name", name)));
    }

    ComponentTypeBuilder {
      name      : name.to_string(),
      properties: Vec::new(),
      actions   : BTreeMap::new(),
      emitters  : BTreeMap::new(),
      reactions : Vec::new(),
      attributes: BTreeMap::new(),
      init      : None,
      members   : BTreeMap::new(),
      inherited : BTreeSet::new(),
      errors    : errors
    }
  }

  /// Records a member name. Returns false (and records an error) on a collision.
  fn declare(&mut self, name: &str, member: Member) -> bool {
    if !is_identifier(name) {
      self.errors.push(EventError::attribute(format!("{} name `{}` is not a valid identifier", member, name)));
      return false;
    }

    match self.members.get(name).copied() {
      None => {
        self.members.insert(name.to_string(), member);
        true
      },
      Some(existing) if existing == member && self.inherited.remove(name) => true,
      Some(existing) => {
        self.errors.push(EventError::state(format!(
          "cannot declare {} `{}.{}`: already declared as {}", member, self.name, name, existing
        )));
        false
      }
    }
  }

  pub fn property(mut self, property: Property) -> Self {
    if self.declare(property.name(), Member::Property) {
      match self.properties.iter().position(|p| p.name() == property.name()) {
        Some(index) => self.properties[index] = property,
        None        => self.properties.push(property)
      }
    }
    self
  }

  pub fn action<F>(mut self, name: &str, action: F) -> Self
  where
    F: Fn(&Component, &[Value]) -> Result<()> + 'static
  {
    if self.declare(name, Member::Action) {
      self.actions.insert(name.to_string(), Rc::new(action));
    }
    self
  }

  pub fn emitter<F>(mut self, name: &str, emitter: F) -> Self
  where
    F: Fn(&Component, &[Value]) -> Result<Option<Fields>> + 'static
  {
    if self.declare(name, Member::Emitter) {
      self.emitters.insert(name.to_string(), Rc::new(emitter));
    }
    self
  }

  /// Declares a reaction. Without connection strings, the reaction is implicit: it subscribes
  /// to whatever properties it read during its previous run.
  pub fn reaction<F>(mut self, name: &str, connection_strings: &[&str], reaction: F) -> Self
  where
    F: Fn(&Component, &[Event]) -> Result<()> + 'static
  {
    let mut connections = Vec::with_capacity(connection_strings.len());
    for raw in connection_strings {
      match ConnectionString::parse(raw) {
        Ok(connection) => connections.push(connection),
        Err(error)     => {
          self.errors.push(error);
          return self;
        }
      }
    }

    if self.declare(name, Member::Reaction) {
      let decl = ReactionDecl { name: name.to_string(), connections: connections, callback: Rc::new(reaction) };
      match self.reactions.iter().position(|r| r.name == name) {
        Some(index) => self.reactions[index] = decl,
        None        => self.reactions.push(decl)
      }
    }
    self
  }

  /// Declares a read-only value shared by all instances.
  pub fn attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
    if self.declare(name, Member::Attribute) {
      self.attributes.insert(name.to_string(), value.into());
    }
    self
  }

  pub fn init<F>(mut self, init: F) -> Self
  where
    F: Fn(&Component) -> Result<()> + 'static
  {
    self.init = Some(Rc::new(init));
    self
  }

  /// Validates every declaration and generates the setters of settable properties.
  pub fn build(mut self) -> Result<Rc<ComponentType>> {
    if !self.errors.is_empty() {
      return Err(self.errors.remove(0));
    }

    let mut properties = Vec::with_capacity(self.properties.len());
    for property in self.properties {
      properties.push(property.checked()?);
    }

    for property in &properties {
      if !property.is_settable() {
        continue;
      }

      let setter = property.setter_name();
      match self.members.get(&setter) {
        Some(Member::Action) if self.actions.contains_key(&setter) => continue,
        Some(other) => return Err(EventError::state(format!(
          "cannot generate action `{}.{}`: already declared as {}", self.name, setter, other
        ))),
        None => ()
      }

      let name = property.name().to_string();
      let action: ActionFn = Rc::new(move |component: &Component, args: &[Value]| {
        let value = args.first().cloned().ok_or_else(|| {
          EventError::attribute(format!("set_{}() requires a value", name))
        })?;
        component.mutate(&name, value).map(|_| ())
      });
      self.members.insert(setter.clone(), Member::Action);
      self.actions.insert(setter, action);
    }

    Ok(Rc::new(ComponentType {
      name      : self.name,
      properties: properties,
      actions   : self.actions,
      emitters  : self.emitters,
      reactions : self.reactions,
      attributes: self.attributes,
      init      : self.init,
      instances : Cell::new(0)
    }))
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;


  fn noop_action(_: &Component, _: &[Value]) -> Result<()> {
    Ok(())
  }

  fn noop_reaction(_: &Component, _: &[Event]) -> Result<()> {
    Ok(())
  }

  #[test]
  fn settable_property_gets_a_setter() {
    let kind = ComponentType::builder("Person")
      .property(Property::string("name").settable())
      .property(Property::int("age"))
      .build()
      .unwrap();

    assert_eq!(kind.action_names(), vec!["set_name"]);
    assert_eq!(kind.event_types(), vec!["age", "name"]);
  }

  #[test]
  fn own_setter_takes_precedence() {
    let kind = ComponentType::builder("Person")
      .property(Property::string("name").settable())
      .action("set_name", |c: &Component, args: &[Value]| {
        let name = args.first().and_then(Value::as_str).unwrap_or_default().to_uppercase();
        c.mutate("name", name).map(|_| ())
      })
      .build()
      .unwrap();

    assert_eq!(kind.action_names(), vec!["set_name"]);
  }

  #[test]
  fn name_collisions_fail_at_build_time() {
    let result = ComponentType::builder("Thing")
      .property(Property::int("size"))
      .action("size", noop_action)
      .build();
    assert!(matches!(result, Err(EventError::State(_))));

    let result = ComponentType::builder("Thing")
      .property(Property::int("size").settable())
      .reaction("set_size", &["size"], noop_reaction)
      .build();
    assert!(matches!(result, Err(EventError::State(_))));

    let result = ComponentType::builder("Thing")
      .action("go", noop_action)
      .action("go", noop_action)
      .build();
    assert!(matches!(result, Err(EventError::State(_))));
  }

  #[test]
  fn bad_declarations_fail_at_build_time() {
    let result = ComponentType::builder("Thing").property(Property::int("not valid")).build();
    assert!(matches!(result, Err(EventError::Attribute(_))));

    let result = ComponentType::builder("Thing").reaction("r", &["a.b*"], noop_reaction).build();
    assert!(matches!(result, Err(EventError::Connection { .. })));

    let result = ComponentType::builder("Thing").property(Property::string("s").default(1)).build();
    assert!(matches!(result, Err(EventError::Validation { .. })));
  }

  #[test]
  fn subtype_overrides_same_kind_only() {
    let base = ComponentType::builder("Base")
      .property(Property::int("size").default(1))
      .action("grow", noop_action)
      .reaction("watch", &["size"], noop_reaction)
      .build()
      .unwrap();

    let derived = ComponentType::subtype("Derived", &base)
      .property(Property::int("size").default(5))
      .reaction("watch", &["!other"], noop_reaction)
      .emitter("pinged", |_, _| Ok(None))
      .build()
      .unwrap();

    assert_eq!(derived.property("size").unwrap().default_value(), &Value::Int(5));
    assert_eq!(derived.reaction_names(), vec!["watch"]);
    assert_eq!(derived.reaction_decls()[0].connections[0].event_type(), "other");
    assert_eq!(derived.action_names(), vec!["grow"]);
    assert_eq!(derived.event_types(), vec!["pinged", "size"]);

    let result = ComponentType::subtype("Broken", &base).emitter("grow", |_, _| Ok(None)).build();
    assert!(matches!(result, Err(EventError::State(_))));
  }

  #[test]
  fn instance_ids_count_up() {
    let kind = ComponentType::builder("Node").build().unwrap();
    assert_eq!(kind.next_instance_id(), "Node1");
    assert_eq!(kind.next_instance_id(), "Node2");
  }
}
