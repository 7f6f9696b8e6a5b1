use std::process::ExitCode;

use reactevent::{Component, ComponentType, Event, Loop, LoopConfig, Mutation, Property, Result, Value};
use tracing::{error, info};


/// Example program: a list of people whose names are greeted by a reaction connected to
/// `people*.name`, which follows the list as people are added and removed.
///
/// Set `RUST_LOG=reactevent=trace` to watch batches go by.
fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    )
    .init();

  match run() {
    Ok(())   => ExitCode::SUCCESS,
    Err(err) => {
      error!(error = %err, "greeter loop failed");
      ExitCode::FAILURE
    }
  }
}


fn run() -> Result<()> {
  let event_loop = Loop::with_config(LoopConfig::from_env());

  let person = ComponentType::builder("Person")
    .property(Property::string("name").settable().doc("How to greet this person"))
    .build()?;

  let room = ComponentType::builder("Room")
    .property(Property::list("people").doc("People in the room"))
    .action("enter", |room: &Component, args: &[Value]| {
      let count = room.get("people")?.as_list().map_or(0, |people| people.len());
      room.mutate_in_place("people", Mutation::Insert, Some(count), args.to_vec())
    })
    .action("leave_first", |room: &Component, _: &[Value]| {
      room.mutate_in_place("people", Mutation::Remove, Some(0), 1)
    })
    .reaction("greet", &["people*.name"], |_: &Component, events: &[Event]| {
      for event in events {
        if let Some(name) = event.new_value().and_then(Value::as_str) {
          info!(person = %event.source().id(), "hello, {}!", name);
        }
      }
      Ok(())
    })
    .build()?;

  let room  = Component::new(&event_loop, &room)?;
  let alice = Component::builder(&event_loop, &person).value("name", "Alice").build()?;
  let bob   = Component::builder(&event_loop, &person).value("name", "Bob").build()?;

  room.invoke("enter", vec![Value::from(&alice)])?;
  room.invoke("enter", vec![Value::from(&bob)])?;
  event_loop.run()?;

  alice.invoke("set_name", vec![Value::from("Alicia")])?;
  bob.invoke("set_name", vec![Value::from("Robert")])?;
  event_loop.run()?;

  // Alicia left: renaming her is no longer greeted
  room.invoke("leave_first", vec![])?;
  alice.invoke("set_name", vec![Value::from("Ali")])?;
  event_loop.run()?;

  info!(batches = event_loop.batch_count(), "done");
  Ok(())
}
