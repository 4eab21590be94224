//! Shared server state: the registry of live sessions and rooms, and the
//! stanza router.

mod registry;
mod room;

pub use registry::{ClientHandle, Outbound, Registry, RoomSnapshot};
pub use registry::{CONDITION_CONFLICT, CONDITION_NOT_AUTHORIZED};
pub use room::Room;
