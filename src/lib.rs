//! `reactevent` is the reactive core of a component toolkit.
//!
//! Components declare typed properties, actions that mutate them, emitters of custom events and
//! reactions to events. Everything runs on an event loop in batches: first the queued actions,
//! then every reaction that received events, once, with all of them.
//!
//! Reactions subscribe through connection strings such as `"parent.children*.text"`, which
//! follow the component graph and reconnect by themselves when a property along the path
//! changes. A reaction without connection strings subscribes to whatever it reads.
//!
//! The toolkit itself (widgets, layout) is built on top of this crate and is not part of it.
//!


/// **Errors reported by the event system.**
///
/// Declaration mistakes are reported when a component type is built; runtime errors are
/// returned to the caller of the faulty operation. Batches collect the failures of their actions
/// and reactions into a single `EventError::Batch` instead of stopping at the first one.
pub mod error;

/// **Dynamically typed values stored in properties and event fields.**
pub mod value;

/// **Events: frozen records of what happened to a component.**
///
/// Property changes carry `old_value` and `new_value` for `set` mutations, or `mutation`,
/// `index` and `objects` for in-place ones. Emitters add whatever fields they want.
pub mod event;

/// **In-place mutations of list and dict values.**
///
/// The same functions are used by components to mutate their properties, and by reactions
/// that keep a local copy in sync by replaying mutation events (`apply_event`).
pub mod mutation;

/// **Property declarations: kind, default value, validation and settability.**
pub mod property;

/// **Parsing of connection strings.**
///
/// A connection string is a dot-separated path ending with an event type:
///
/// * `name*` fans out over the elements of a list;
/// * `name**` does so recursively, through the same-named lists of the elements;
/// * a leading `!` silences the warning about unknown event types;
/// * a trailing `:label` sets the delivery order and allows disconnecting by label.
pub mod connection;

/// **Component types: the schema shared by all instances of a kind of component.**
///
/// Types are declared once with a builder, which checks every declaration and generates the
/// `set_<name>` action of settable properties. Subtypes inherit and may override members.
pub mod component_type;

/// **Components: property storage, action invocation and event dispatch.**
///
/// A component is created on a loop, with initial values or bindings. Once its reactions are
/// connected, it emits one initial `set` event per property.
pub mod component;

/// **Reactions and the resolution of their connections.**
///
/// Each reaction keeps the edges its connection strings resolve to, and re-resolves a string
/// as soon as a property it traverses changes.
pub mod reaction;

/// **The event loop, which runs actions and reactions in batches.**
///
/// Within a batch, actions run in the order they were invoked, including those invoked by
/// other actions. Reactions then run once each, sorted by label. Actions invoked by reactions
/// go to the next batch.
pub mod event_loop;


pub use crate::component::{Component, ComponentBuilder};
pub use crate::component_type::{ComponentType, ComponentTypeBuilder};
pub use crate::connection::ConnectionString;
pub use crate::error::{EventError, Result};
pub use crate::event::{fields, Event, Fields};
pub use crate::event_loop::{Loop, LoopConfig, LoopHandle};
pub use crate::mutation::{apply_event, mutate_array, mutate_dict, Mutation};
pub use crate::property::{Property, PropertyKind};
pub use crate::reaction::Reaction;
pub use crate::value::Value;
