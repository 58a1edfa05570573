pub mod channel;
pub mod discovery;
pub mod executor;
