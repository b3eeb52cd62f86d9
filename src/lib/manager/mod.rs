pub mod manager;
pub mod types;

#[cfg(test)]
pub(crate) mod tests;
