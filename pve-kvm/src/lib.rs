pub mod api;
pub mod config;
pub mod error;
pub mod kvm;
pub mod module;
pub mod parse;
pub mod resolver;
pub mod task;

#[cfg(test)]
pub(crate) mod test_helpers;
