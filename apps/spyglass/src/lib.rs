pub mod channel;
pub mod client;
pub mod config;
pub mod logging;
pub mod poll;
pub mod reconcile;
pub mod store;

#[cfg(test)]
mod tests;
