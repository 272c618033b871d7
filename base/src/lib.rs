//! Foundation primitives shared by every kiln crate: interned strings,
//! typed ids, allocation groups with capture support, and the small set of
//! containers the rest of the engine is built from.

pub mod alloc_group;
pub mod event_queue;
pub mod id;
pub mod intern;
pub mod message;
pub mod scratch;
pub mod sorted;

pub use self::alloc_group::{
    begin_capture, AllocationEvent, AllocationEventKind, AllocationGroup, Capture, CapturedGroup,
};
pub use self::event_queue::{EventIterator, EventQueue};
pub use self::id::IdGenerator;
pub use self::intern::{intern, InternedString};
pub use self::message::clip_log_message;
pub use self::scratch::ScratchArena;
pub use self::sorted::SortedIndex;
