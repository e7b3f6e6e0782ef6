pub mod backoff;
pub mod error;

pub use backoff::BackoffPolicy;
