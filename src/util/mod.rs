pub mod async_queue;
pub mod backoff;
pub(crate) mod base64_serde;
pub(crate) mod double_serde;

pub use async_queue::AsyncQueue;
pub use backoff::ExponentialBackoff;
