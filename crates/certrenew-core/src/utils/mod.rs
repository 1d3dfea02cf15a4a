// Utils module - local process and filesystem helpers shared by the workflow
pub mod exec;

pub use exec::{local, shell_escape};
