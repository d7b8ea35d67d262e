pub mod chat;
pub mod health;
pub mod sse;

#[cfg(test)]
pub(crate) mod testutil;
