//! Chat domain: conversation state and the on-disk chat library.

mod conversation;
mod library;

pub use conversation::{Conversation, Message, Role, DEFAULT_SYSTEM_PROMPT};
pub use library::{ChatError, ChatIndexEntry, ChatLibrary};
