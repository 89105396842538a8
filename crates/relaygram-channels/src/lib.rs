pub mod chat_api;
pub mod dispatch;
pub mod registration;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;
