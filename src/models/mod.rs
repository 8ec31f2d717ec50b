pub mod conversation;
pub mod message;

pub use conversation::{Conversation, ConversationMember, ConversationType};
pub use message::{Message, MessageKind, Sender};
