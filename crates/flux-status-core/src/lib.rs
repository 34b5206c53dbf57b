pub mod event;
pub mod flux;
pub mod notifier;
pub mod poller;

pub use event::{status_key, EventPhase, EventState, Status, StatusEvent, STATUS_ID};
pub use notifier::{MockNotifier, Notifier};
