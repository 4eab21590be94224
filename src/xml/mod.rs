//! In-memory XML elements and the incremental stream reader.
//!
//! The element model mirrors what the game client expects on the wire:
//! the serializer emits an `xmlns` declaration on every namespaced element,
//! writes character data after children and never self-closes tags.

mod element;
mod stream;

pub use element::{escape, Attr, Element, Name, XmlError};
pub use stream::{ElementStream, StreamError};
