pub mod host;
pub mod reconciler;
pub mod request;
