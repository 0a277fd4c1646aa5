//! User notifications: fire-and-forget delivery to an external dispatcher.

mod dispatch;
mod notifier;

pub use dispatch::{DispatchNotifier, DispatchSettings};
pub use notifier::{
    NoopNotifier, Notification, NotificationError, NotificationKind, Notifier, format_amount,
};
