//! Test fixtures

mod events;
mod relay;

pub use events::EventProbe;
pub use relay::{MockRelay, RelaySession, TEST_TIMEOUT, registered_store};
