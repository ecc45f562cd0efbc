pub mod config;
pub mod error;
pub mod inventory;
pub mod ops;

#[cfg(test)]
mod tests;
