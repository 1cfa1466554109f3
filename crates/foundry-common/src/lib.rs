pub mod auth;
pub mod message;
pub mod output;
pub mod telemetry;

pub use auth::{AuthError, SharedSecret};
pub use message::{
    conversation_chars, conversation_text, normalize_messages, ConversationInput, Message,
    NormalizeError, Role,
};
pub use output::{parse_output, ResponseEnvelope};
