pub mod event;

pub use event::{ErrorMap, Event, ResultMap, SubEvent, Version};
