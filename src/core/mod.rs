pub mod chat_stream;
pub mod config;
pub mod content;
pub mod conversations;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod message;
pub mod orchestrator;
pub mod tool_calls;
pub mod turn;
