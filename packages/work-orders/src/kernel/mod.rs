// Core infrastructure: store handle, clock, and the post-commit event bus.

pub mod bus;
pub mod clock;

mod kernel;

pub use bus::EventBus;
pub use clock::{Clock, ManualClock, SystemClock};
pub use kernel::WorkKernel;
