pub mod publisher;
pub mod types;

pub use publisher::{EventSink, RedisEventPublisher};
pub use types::{Action, Event, Status};
