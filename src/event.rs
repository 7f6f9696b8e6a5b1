use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use crate::component::Component;
use crate::mutation::Mutation;
use crate::value::Value;


/// Named fields attached to an event.
pub type Fields = BTreeMap<String, Value>;


/// Builds a `Fields` map from literal pairs.
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Fields {
  pairs.into_iter().map(|(name, value)| (name.to_string(), value)).collect()
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// EVENT
///////////////////////////////////////////////////////////////////////////////////////////////////

/// One occurrence emitted by a component.
///
/// Events are frozen once built: cloning shares the same record, and there is no way to change
/// a field afterwards, so every reaction sees the same snapshot.
#[derive(Clone)]
pub struct Event {
  data: Rc<EventData>
}


struct EventData {
  event_type: String,
  source    : Component,
  fields    : Fields,
  emitted_at: Instant
}


impl Event {
  /// `type` and `source` are structural and cannot be overridden through `fields`.
  pub(crate) fn new(event_type: &str, source: Component, mut fields: Fields) -> Self {
    fields.remove("type");
    fields.remove("source");

    Event {
      data: Rc::new(EventData {
        event_type: event_type.to_string(),
        source    : source,
        fields    : fields,
        emitted_at: Instant::now()
      })
    }
  }

  /// Change event of a `set` mutation.
  pub(crate) fn property_set(source: Component, name: &str, old_value: Value, new_value: Value) -> Self {
    let fields = fields([
      ("old_value", old_value),
      ("new_value", new_value),
      ("mutation",  Value::from(Mutation::Set.as_str()))
    ]);
    Event::new(name, source, fields)
  }

  /// Change event of an in-place mutation. Dict mutations carry no index.
  pub(crate) fn property_mutation(
    source  : Component,
    name    : &str,
    mutation: Mutation,
    index   : Option<usize>,
    objects : Value
  ) -> Self {
    let mut fields = fields([
      ("mutation", Value::from(mutation.as_str())),
      ("objects",  objects)
    ]);
    if let Some(index) = index {
      fields.insert("index".to_string(), Value::from(index));
    }
    Event::new(name, source, fields)
  }

  pub fn event_type(&self) -> &str {
    &self.data.event_type
  }

  pub fn source(&self) -> &Component {
    &self.data.source
  }

  pub fn fields(&self) -> &Fields {
    &self.data.fields
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.data.fields.get(name)
  }

  pub fn old_value(&self) -> Option<&Value> {
    self.get("old_value")
  }

  pub fn new_value(&self) -> Option<&Value> {
    self.get("new_value")
  }

  pub fn mutation(&self) -> Option<Mutation> {
    self.get("mutation").and_then(Value::as_str).and_then(|m| m.parse().ok())
  }

  pub fn index(&self) -> Option<usize> {
    self.get("index").and_then(Value::as_int).and_then(|i| usize::try_from(i).ok())
  }

  /// Items of an in-place mutation, or the number of removed items for `remove`.
  pub fn objects(&self) -> Option<&Value> {
    self.get("objects")
  }

  pub fn emitted_at(&self) -> Instant {
    self.data.emitted_at
  }

  /// Whether both handles share the same record.
  pub fn ptr_eq(&self, other: &Event) -> bool {
    Rc::ptr_eq(&self.data, &other.data)
  }

  /// Identity of the shared record, stable while a handle is alive.
  pub(crate) fn addr(&self) -> usize {
    Rc::as_ptr(&self.data) as usize
  }
}


impl fmt::Debug for Event {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Event")
      .field("type", &self.data.event_type)
      .field("source", &self.data.source.id())
      .field("fields", &self.data.fields)
      .finish()
  }
}
