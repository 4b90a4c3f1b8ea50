//! Pure decision logic: given a fact, decide what IO to request, if any.

use crate::core::{Command, Event};

/// Holds internal state and makes synchronous decisions from events.
/// Machines never perform IO and are never async — if a decision needs data
/// that isn't already in the machine's state, model that as an event instead.
pub trait Machine: Send {
    type Event: Event;
    type Command: Command;

    fn decide(&mut self, event: &Self::Event) -> Option<Self::Command>;
}
