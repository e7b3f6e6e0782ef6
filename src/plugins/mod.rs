pub mod manager;
pub mod notifiers;
pub mod traits;

pub use manager::NotificationHub;
pub use traits::{ChangeEvent, NotifierPlugin};
