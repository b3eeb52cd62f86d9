pub mod accounts;
pub mod registry;
pub mod types;
