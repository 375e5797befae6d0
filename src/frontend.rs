//! Collaborator interface the engine drives. Front-ends render; the engine
//! decides.

use crate::chat::Conversation;
use std::path::PathBuf;

pub trait Frontend {
    /// Ask the user for a model file. `None` when cancelled.
    fn pick_model_file(&mut self) -> Option<PathBuf>;

    /// Single-line input, pre-filled with `initial`. `None` when cancelled.
    fn prompt_text(&mut self, title: &str, initial: &str) -> Option<String>;

    /// Multi-line input, pre-filled with `initial`. `None` when cancelled.
    fn prompt_multiline(&mut self, title: &str, initial: &str) -> Option<String>;

    /// Redraw the whole conversation.
    fn render_conversation(&mut self, conversation: &Conversation);

    /// Append one streamed token to the in-progress reply.
    fn stream_token(&mut self, token: &str);

    /// Show an error attached to the current turn (transport failures).
    fn show_turn_error(&mut self, message: &str);

    /// Modal error notification (persistence, launch failures).
    fn notify_error(&mut self, message: &str);

    /// A send was attempted with no model selected.
    fn request_model_selection(&mut self);
}
