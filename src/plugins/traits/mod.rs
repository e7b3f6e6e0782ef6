pub mod notifier;

pub use notifier::{ChangeEvent, NotifierPlugin};
