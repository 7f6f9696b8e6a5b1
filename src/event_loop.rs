use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::env;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::{debug, error, trace, warn};

use crate::component::Component;
use crate::component_type::ActionFn;
use crate::error::{EventError, Result};
use crate::event::Event;
use crate::reaction::Reaction;
use crate::value::Value;


/// Closure submitted from another thread, run by the loop on its own thread.
type RemoteCall = Box<dyn FnOnce(&Loop) + Send>;

/// Closure scheduled with `call_soon`.
type PendingCall = Box<dyn FnOnce(&Loop)>;


///////////////////////////////////////////////////////////////////////////////////////////////////
// LOOP CONFIG
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Tuning knobs of a `Loop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
  /// Upper bound on the number of batches a single `run` processes.
  pub max_batches        : usize,
  /// Log a warning when a reaction connects to an event type its target does not declare.
  pub warn_unknown_events: bool
}


impl Default for LoopConfig {
  fn default() -> Self {
    LoopConfig {
      max_batches        : 10_000,
      warn_unknown_events: true
    }
  }
}


impl LoopConfig {
  /// Defaults overridden by `REACTEVENT_MAX_BATCHES` and `REACTEVENT_WARN_UNKNOWN`.
  pub fn from_env() -> Self {
    let mut config = LoopConfig::default();

    if let Ok(raw) = env::var("REACTEVENT_MAX_BATCHES") {
      match raw.trim().parse::<usize>() {
        Ok(max) if max > 0 => config.max_batches = max,
        _ => warn!(value = %raw, "ignoring invalid REACTEVENT_MAX_BATCHES")
      }
    }

    if let Ok(raw) = env::var("REACTEVENT_WARN_UNKNOWN") {
      match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on"  => config.warn_unknown_events = true,
        "0" | "false" | "no" | "off" => config.warn_unknown_events = false,
        _ => warn!(value = %raw, "ignoring invalid REACTEVENT_WARN_UNKNOWN")
      }
    }

    config
  }

  pub fn max_batches(mut self, max_batches: usize) -> Self {
    self.max_batches = max_batches.max(1);
    self
  }

  pub fn warn_unknown_events(mut self, warn: bool) -> Self {
    self.warn_unknown_events = warn;
    self
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// LOOP
///////////////////////////////////////////////////////////////////////////////////////////////////

struct PendingAction {
  component: Component,
  name     : String,
  action   : ActionFn,
  args     : Vec<Value>
}


struct PendingReaction {
  key     : String,
  reaction: Reaction
}


#[derive(Default)]
struct LoopState {
  pending_calls       : VecDeque<PendingCall>,
  pending_actions     : VecDeque<PendingAction>,
  pending_reactions   : Vec<PendingReaction>,
  scheduled           : HashSet<u64>,
  draining            : bool,
  processing_actions  : bool,
  processing_reactions: bool,
  active_components   : Vec<usize>,
  recordings          : Vec<Vec<(Component, String)>>,
  batches             : u64
}


struct LoopInner {
  config  : LoopConfig,
  state   : RefCell<LoopState>,
  sender  : Sender<RemoteCall>,
  receiver: Receiver<RemoteCall>
}


/// Scheduler running actions and reactions in batches.
///
/// A batch first runs every queued action, including the ones queued by those actions,
/// then invokes each reaction that received events exactly once, in ascending order of
/// label (or name). Actions invoked by reactions are queued for the next batch, so no
/// property changes while reactions run.
///
/// `Loop` is a cheap handle; clones share the same queues. It is bound to the thread
/// that created it: use `handle()` to submit work from other threads.
#[derive(Clone)]
pub struct Loop {
  inner: Rc<LoopInner>
}


thread_local! {
  static GLOBAL_LOOP: Loop = Loop::with_config(LoopConfig::from_env());
}


impl Loop {
  pub fn new() -> Self {
    Loop::with_config(LoopConfig::default())
  }

  pub fn with_config(config: LoopConfig) -> Self {
    let (sender, receiver) = mpsc::channel();

    Loop {
      inner: Rc::new(LoopInner {
        config  : config,
        state   : RefCell::new(LoopState::default()),
        sender  : sender,
        receiver: receiver
      })
    }
  }

  /// Process-wide loop of the current thread, configured from the environment.
  pub fn global() -> Loop {
    GLOBAL_LOOP.with(Loop::clone)
  }

  pub fn config(&self) -> &LoopConfig {
    &self.inner.config
  }

  pub fn ptr_eq(&self, other: &Loop) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  /// Thread-safe handle feeding this loop.
  pub fn handle(&self) -> LoopHandle {
    LoopHandle { sender: self.inner.sender.clone() }
  }

  /// Drops every queued call, action and reaction, for test isolation.
  pub fn reset(&self) {
    while self.inner.receiver.try_recv().is_ok() {}

    let mut state = self.inner.state.borrow_mut();
    let batches   = state.batches;
    *state = LoopState::default();
    state.batches = batches;
  }

  /// Whether actions are being run, i.e. whether action invocations run synchronously.
  pub fn is_processing_actions(&self) -> bool {
    self.inner.state.borrow().processing_actions
  }

  pub fn is_processing_reactions(&self) -> bool {
    self.inner.state.borrow().processing_reactions
  }

  /// Number of batches processed so far.
  pub fn batch_count(&self) -> u64 {
    self.inner.state.borrow().batches
  }

  /// Whether a call to `iter` would do anything.
  pub fn has_pending(&self) -> bool {
    self.collect_remote_calls();

    let state = self.inner.state.borrow();
    !state.pending_calls.is_empty() || !state.pending_actions.is_empty() || !state.pending_reactions.is_empty()
  }

  /// Runs `call` at the start of the next batch.
  pub fn call_soon<F>(&self, call: F)
  where
    F: FnOnce() + 'static
  {
    self.inner.state.borrow_mut().pending_calls.push_back(Box::new(move |_: &Loop| call()));
  }

  /// Processes batches until nothing is pending, or until `max_batches` were processed.
  ///
  /// Failures of individual actions and reactions do not stop the loop; they are returned
  /// together once the loop is idle.
  pub fn run(&self) -> Result<()> {
    if self.inner.state.borrow().draining {
      return Err(EventError::state("cannot run the loop from inside a batch"));
    }

    let mut failures = Vec::new();
    let mut batches  = 0;

    while self.has_pending() {
      if batches == self.inner.config.max_batches {
        warn!(max_batches = batches, "event loop did not settle");
        failures.push(EventError::state(format!("event loop did not settle after {} batches", batches)));
        break;
      }

      if let Err(error) = self.iter() {
        failures.extend(error.into_failures());
      }
      batches += 1;
    }

    if failures.is_empty() {
      Ok(())
    }
    else {
      Err(EventError::Batch(failures))
    }
  }

  /// Processes a single batch: queued calls, then actions, then reactions.
  pub fn iter(&self) -> Result<()> {
    {
      let mut state = self.inner.state.borrow_mut();
      if state.draining {
        return Err(EventError::state("cannot process a batch while another batch is being processed"));
      }
      state.draining = true;
    }

    self.collect_remote_calls();

    let mut failures = Vec::new();
    self.process_calls();
    self.process_actions(&mut failures);
    self.process_reactions(&mut failures);

    let batch = {
      let mut state = self.inner.state.borrow_mut();
      state.draining = false;
      state.batches += 1;
      state.batches
    };
    debug!(batch = batch, failures = failures.len(), "batch processed");

    if failures.is_empty() {
      Ok(())
    }
    else {
      Err(EventError::Batch(failures))
    }
  }

  fn collect_remote_calls(&self) {
    let mut state = self.inner.state.borrow_mut();
    while let Ok(call) = self.inner.receiver.try_recv() {
      state.pending_calls.push_back(call);
    }
  }

  fn process_calls(&self) {
    let calls = std::mem::take(&mut self.inner.state.borrow_mut().pending_calls);
    for call in calls {
      call(self);
    }
  }

  fn process_actions(&self, failures: &mut Vec<EventError>) {
    self.inner.state.borrow_mut().processing_actions = true;

    loop {
      let next = self.inner.state.borrow_mut().pending_actions.pop_front();
      let pending = match next {
        Some(pending) => pending,
        None          => break
      };

      trace!(component = %pending.component.id(), action = %pending.name, "running action");
      if let Err(failure) = (pending.action)(&pending.component, &pending.args) {
        error!(component = %pending.component.id(), action = %pending.name, error = %failure, "action failed");
        failures.push(failure);
      }
    }

    self.inner.state.borrow_mut().processing_actions = false;
  }

  fn process_reactions(&self, failures: &mut Vec<EventError>) {
    let mut pending = {
      let mut state = self.inner.state.borrow_mut();
      state.processing_reactions = true;
      state.scheduled.clear();
      std::mem::take(&mut state.pending_reactions)
    };

    // stable: reactions sharing a key keep their scheduling order
    pending.sort_by(|a, b| a.key.cmp(&b.key));

    for PendingReaction { key, reaction } in pending {
      if reaction.is_disposed() {
        continue;
      }

      let events = reaction.take_pending();
      if events.is_empty() && reaction.is_explicit() {
        continue;
      }

      trace!(reaction = %reaction.name(), key = %key, events = events.len(), "invoking reaction");
      if let Err(failure) = reaction.invoke(&events) {
        error!(reaction = %reaction.name(), error = %failure, "reaction failed");
        failures.push(failure);
      }
    }

    self.inner.state.borrow_mut().processing_reactions = false;
  }

  /// Queues an action for the current batch (when called from an action) or the next one.
  pub(crate) fn add_action_invocation(&self, component: &Component, name: &str, action: ActionFn, args: Vec<Value>) {
    self.inner.state.borrow_mut().pending_actions.push_back(PendingAction {
      component: component.clone(),
      name     : name.to_string(),
      action   : action,
      args     : args
    });
  }

  /// Queues an event on a reaction and marks it for delivery. `None` schedules a run without
  /// any event, used for the first run of implicit reactions.
  pub(crate) fn add_reaction_event(&self, reaction: &Reaction, key: &str, event: Option<Event>) {
    if let Some(event) = event {
      if !reaction.push_pending(event) {
        return;
      }
    }

    let mut state = self.inner.state.borrow_mut();
    if state.scheduled.insert(reaction.id()) {
      state.pending_reactions.push(PendingReaction { key: key.to_string(), reaction: reaction.clone() });
    }
  }

  /// Mutations are allowed while running actions, and on components under construction.
  pub(crate) fn can_mutate(&self, component: &Component) -> bool {
    let state = self.inner.state.borrow();
    state.processing_actions || state.active_components.contains(&component.addr())
  }

  /// Lets `component` mutate its properties until the guard is dropped.
  pub(crate) fn enter_context(&self, component: &Component) -> ContextGuard {
    self.inner.state.borrow_mut().active_components.push(component.addr());
    ContextGuard { event_loop: self.clone(), addr: component.addr() }
  }

  pub(crate) fn start_recording(&self) {
    self.inner.state.borrow_mut().recordings.push(Vec::new());
  }

  pub(crate) fn stop_recording(&self) -> Vec<(Component, String)> {
    self.inner.state.borrow_mut().recordings.pop().unwrap_or_default()
  }

  /// Called by property reads; feeds the implicit reaction currently running, if any.
  pub(crate) fn register_prop_access(&self, component: &Component, name: &str) {
    let mut state = self.inner.state.borrow_mut();
    if let Some(recording) = state.recordings.last_mut() {
      recording.push((component.clone(), name.to_string()));
    }
  }
}


impl Default for Loop {
  fn default() -> Self {
    Loop::new()
  }
}


/// Ends a mutation context opened by `Loop::enter_context`.
pub(crate) struct ContextGuard {
  event_loop: Loop,
  addr      : usize
}


impl Drop for ContextGuard {
  fn drop(&mut self) {
    let mut state = self.event_loop.inner.state.borrow_mut();
    if let Some(position) = state.active_components.iter().rposition(|addr| *addr == self.addr) {
      state.active_components.remove(position);
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// LOOP HANDLE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Sendable handle queueing work on a `Loop` from any thread.
///
/// Submitted closures run on the loop's thread, in submission order, at the start of the next
/// batch; actions they invoke join that batch.
#[derive(Clone)]
pub struct LoopHandle {
  sender: Sender<RemoteCall>
}


impl LoopHandle {
  pub fn submit<F>(&self, call: F) -> Result<()>
  where
    F: FnOnce(&Loop) + Send + 'static
  {
    self.sender.send(Box::new(call)).map_err(|_| EventError::state("the event loop is gone"))
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use std::cell::{Cell, RefCell};
  use std::rc::Rc;
  use std::thread;

  use crate::component::Component;
  use crate::component_type::ComponentType;
  use crate::property::Property;
  use super::*;


  fn counter_type() -> Rc<ComponentType> {
    ComponentType::builder("Counter")
      .property(Property::int("count").settable())
      .action("increment", |c: &Component, _: &[Value]| {
        let count = c.get("count")?.as_int().unwrap_or(0);
        c.mutate("count", count + 1).map(|_| ())
      })
      .build()
      .unwrap()
  }

  #[test]
  fn idle_loop_has_nothing_to_do() {
    let event_loop = Loop::new();

    assert!(!event_loop.has_pending());
    event_loop.run().unwrap();
    assert_eq!(event_loop.batch_count(), 0);
  }

  #[test]
  fn calls_run_at_the_next_batch() {
    let event_loop = Loop::new();
    let ran        = Rc::new(Cell::new(0));
    let ran_2      = ran.clone();

    event_loop.call_soon(move || ran_2.set(ran_2.get() + 1));
    assert_eq!(ran.get(), 0);

    event_loop.iter().unwrap();
    assert_eq!(ran.get(), 1);
    assert!(!event_loop.has_pending());
  }

  #[test]
  fn actions_run_in_order_of_invocation() {
    let event_loop = Loop::new();
    let counter    = Component::new(&event_loop, &counter_type()).unwrap();
    event_loop.run().unwrap();

    counter.invoke("set_count", vec![Value::from(10)]).unwrap();
    counter.invoke("increment", vec![]).unwrap();
    counter.invoke("increment", vec![]).unwrap();
    assert_eq!(counter.get("count").unwrap(), Value::Int(0));

    event_loop.iter().unwrap();
    assert_eq!(counter.get("count").unwrap(), Value::Int(12));
  }

  #[test]
  fn reentrant_iteration_is_refused() {
    let event_loop = Loop::new();
    let result     = Rc::new(RefCell::new(None));
    let result_2   = result.clone();
    let loop_2     = event_loop.clone();

    event_loop.call_soon(move || { *result_2.borrow_mut() = Some(loop_2.iter()); });
    event_loop.iter().unwrap();

    assert!(matches!(*result.borrow(), Some(Err(EventError::State(_)))));
    assert!(!event_loop.has_pending());
  }

  #[test]
  fn runaway_reactions_are_cut_off() {
    let event_loop = Loop::with_config(LoopConfig::default().max_batches(5));
    let counter    = Component::new(&event_loop, &counter_type()).unwrap();

    counter.reaction("again", &["count"], |c: &Component, _: &[Event]| c.invoke("increment", vec![])).unwrap();
    counter.invoke("increment", vec![]).unwrap();

    let failures = event_loop.run().unwrap_err().into_failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0], EventError::State(_)));
    assert_eq!(event_loop.batch_count(), 5);
  }

  thread_local! {
    static TARGET: RefCell<Option<Component>> = RefCell::new(None);
  }

  #[test]
  fn handle_submits_from_other_threads() {
    let event_loop = Loop::new();
    let counter    = Component::new(&event_loop, &counter_type()).unwrap();
    event_loop.run().unwrap();
    TARGET.with(|target| *target.borrow_mut() = Some(counter.clone()));

    let handle = event_loop.handle();
    thread::spawn(move || {
      handle.submit(|_: &Loop| {
        TARGET.with(|target| {
          if let Some(counter) = target.borrow().as_ref() {
            counter.invoke("increment", vec![]).unwrap();
          }
        });
      }).unwrap();
    }).join().unwrap();

    assert!(event_loop.has_pending());
    event_loop.run().unwrap();
    assert_eq!(counter.get("count").unwrap(), Value::Int(1));
  }

  #[test]
  fn reset_drops_pending_work() {
    let event_loop = Loop::new();
    let counter    = Component::new(&event_loop, &counter_type()).unwrap();
    counter.invoke("increment", vec![]).unwrap();
    assert!(event_loop.has_pending());

    event_loop.reset();
    assert!(!event_loop.has_pending());
    assert_eq!(counter.get("count").unwrap(), Value::Int(0));
  }

  #[test]
  fn config_builders_clamp_and_toggle() {
    let config = LoopConfig::default().max_batches(0).warn_unknown_events(false);
    assert_eq!(config.max_batches, 1);
    assert!(!config.warn_unknown_events);
  }

  // The only test touching these variables, so it cannot race with another one.
  #[test]
  fn config_from_env_reads_and_falls_back() {
    let defaults = LoopConfig::default();

    env::set_var("REACTEVENT_MAX_BATCHES", "7");
    env::set_var("REACTEVENT_WARN_UNKNOWN", "Off");
    let config = LoopConfig::from_env();
    assert_eq!(config.max_batches, 7);
    assert!(!config.warn_unknown_events);

    env::set_var("REACTEVENT_MAX_BATCHES", "0");
    env::set_var("REACTEVENT_WARN_UNKNOWN", "maybe");
    let config = LoopConfig::from_env();
    assert_eq!(config.max_batches, defaults.max_batches);
    assert_eq!(config.warn_unknown_events, defaults.warn_unknown_events);

    env::remove_var("REACTEVENT_MAX_BATCHES");
    env::remove_var("REACTEVENT_WARN_UNKNOWN");
    let config = LoopConfig::from_env();
    assert_eq!(config.max_batches, defaults.max_batches);
    assert_eq!(config.warn_unknown_events, defaults.warn_unknown_events);
  }
}
