pub mod app;
pub mod chat_state;
pub mod faq;
pub mod store;
pub mod transport;
pub mod types;
