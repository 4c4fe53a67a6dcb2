//! Predicate helpers for [`crate::Multiplexer::subscribe`].
//!
//! Any `Fn(&Message) -> bool` works as a predicate; matching on
//! [`crate::Event`] variants directly is usually clearest:
//!
//! ```ignore
//! mux.subscribe("class-42", |m| matches!(m.event, Event::StudentEnrolled(_)), handler);
//! ```
//!
//! The helpers here cover the string-keyed cases (including [`crate::Event::Other`]).

use std::collections::HashSet;
use std::rc::Rc;

use crate::message::Message;

/// Shared, type-erased predicate.
pub type Predicate = Rc<dyn Fn(&Message) -> bool>;

/// Accept every message on the channel.
pub fn any() -> impl Fn(&Message) -> bool {
    |_| true
}

/// Accept messages whose wire `type` equals `kind`.
pub fn kind(kind: impl Into<String>) -> impl Fn(&Message) -> bool {
    let kind = kind.into();
    move |msg| msg.kind() == kind
}

/// Accept messages whose wire `type` is one of `kinds`.
pub fn kinds<I, S>(kinds: I) -> impl Fn(&Message) -> bool
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let set: HashSet<String> = kinds.into_iter().map(Into::into).collect();
    move |msg| set.contains(msg.kind())
}

/// Accept messages every predicate accepts.
pub fn all_of(predicates: Vec<Predicate>) -> impl Fn(&Message) -> bool {
    move |msg| predicates.iter().all(|p| p(msg))
}
