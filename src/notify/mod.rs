//! Push notifications: payload parsing, rendering and click routing.

mod dispatcher;
mod payload;

pub use dispatcher::{
  ClickOutcome, Dispatcher, HeadlessClients, NotificationClick, Notifier, StdoutNotifier,
  WindowClients,
};
#[cfg(test)]
pub use dispatcher::WindowClient;
pub use payload::Notification;
#[cfg(test)]
pub use payload::UPDATE_TAG;
