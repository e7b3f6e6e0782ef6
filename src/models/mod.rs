use uuid::Uuid;

pub mod check_result;
pub mod task;

// Re-exports for convenience
pub use check_result::*;
pub use task::*;

// Helper function to generate UUIDs in the format expected by the database
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}
