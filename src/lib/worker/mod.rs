pub mod haproxy;
pub mod runner;
pub mod types;
pub mod worker;

#[cfg(test)]
mod tests;
