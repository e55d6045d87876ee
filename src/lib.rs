pub mod adapters;
pub mod app;
pub mod domain;
pub mod roaming;

#[cfg(test)]
mod test_support;
