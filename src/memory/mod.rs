//! 记忆层：对话消息与会话级对话状态

pub mod conversation;
pub mod state;

pub use conversation::{format_conversation, Message, Role};
pub use state::{ConversationState, ErrorState, OutletsContext, OutletsSnapshot};
