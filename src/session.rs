//! Session context: the one owner of catalog, settings, chats, server and
//! in-flight completions.
//!
//! Everything that mutates conversation state runs on the control thread that
//! owns the `Session`. Completion tasks only send events; the control loop
//! feeds them back through [`Session::handle_stream_event`].

use crate::chat::{ChatLibrary, Conversation};
use crate::config::AppConfig;
use crate::frontend::Frontend;
use crate::llm::{visible_reply, CompletionClient, StreamEvent, StreamHandle, TurnStats, WireMessage};
use crate::models::{scan_model, ModelCatalog, FIELD_ERROR};
use crate::server::{LaunchConfig, ServerState, SharedSupervisor, Supervisor};
use crate::settings::{LayerRef, MergedSettings, Setting, SettingValue, SettingsStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub const NEW_CHAT_TITLE: &str = "New chat";

/// Identifies which completion an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTag {
    pub chat_id: String,
    pub generation: u64,
}

pub type StreamEvents = UnboundedReceiver<(StreamTag, StreamEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A completion is streaming.
    Sent,
    /// Blank input; nothing happened.
    Blank,
    /// No model selected; the front-end was asked to pick one.
    NoModel,
    /// The turn was recorded but no request could be issued.
    Failed,
}

struct ActiveStream {
    generation: u64,
    handle: StreamHandle,
    stats: Option<TurnStats>,
}

pub struct Session {
    config: AppConfig,
    catalog: ModelCatalog,
    settings: SettingsStore,
    chats: ChatLibrary,
    supervisor: SharedSupervisor,
    client: CompletionClient,
    runtime: tokio::runtime::Handle,
    events: UnboundedSender<(StreamTag, StreamEvent)>,
    chat: Option<Conversation>,
    model: Option<PathBuf>,
    streams: HashMap<String, ActiveStream>,
    next_generation: u64,
}

impl Session {
    /// Open every store under `config`. Completions run on `runtime` and
    /// report through the returned receiver.
    pub fn new(
        config: AppConfig,
        supervisor: SharedSupervisor,
        runtime: tokio::runtime::Handle,
    ) -> (Self, StreamEvents) {
        let catalog = ModelCatalog::load(&config.catalog_file());
        let settings = SettingsStore::open(
            &config.profiles_dir(),
            &config.active_profile_file(),
            &config.chats_dir(),
        );
        let chats = ChatLibrary::open(&config.chats_dir());
        let (tx, rx) = unbounded_channel();

        let session = Self {
            config,
            catalog,
            settings,
            chats,
            supervisor,
            client: CompletionClient::new(),
            runtime,
            events: tx,
            chat: None,
            model: None,
            streams: HashMap::new(),
            next_generation: 0,
        };
        (session, rx)
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn settings(&mut self) -> &mut SettingsStore {
        &mut self.settings
    }

    pub fn chats(&self) -> &ChatLibrary {
        &self.chats
    }

    pub fn current_chat(&self) -> Option<&Conversation> {
        self.chat.as_ref()
    }

    pub fn current_model(&self) -> Option<&Path> {
        self.model.as_deref()
    }

    pub fn server_state(&self) -> ServerState {
        self.supervisor().state()
    }

    /// Whether the current chat has a completion in flight.
    pub fn is_streaming(&self) -> bool {
        self.chat
            .as_ref()
            .map(|c| self.streams.contains_key(&c.id))
            .unwrap_or(false)
    }

    /// Settings merged for the current chat and model.
    pub fn merged_settings(&mut self) -> MergedSettings {
        let chat_id = self.chat.as_ref().map(|c| c.id.clone());
        let model = self.model.clone();
        self.settings.resolve(chat_id.as_deref(), model.as_deref())
    }

    fn supervisor(&self) -> MutexGuard<'_, Supervisor> {
        self.supervisor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Models ──────────────────────────────────────────────────────────

    /// Pick a GGUF file and add it to the catalog.
    pub fn add_model(&mut self, ui: &mut dyn Frontend) -> Option<PathBuf> {
        let path = ui.pick_model_file()?;
        let entry = scan_model(&path);
        if entry.name == FIELD_ERROR {
            ui.notify_error(&format!("Could not read a GGUF header from {}", path.display()));
        }
        if let Err(e) = self.catalog.add_entry(entry) {
            ui.notify_error(&e.to_string());
        }
        Some(path)
    }

    pub fn remove_model(&mut self, path: &Path, ui: &mut dyn Frontend) {
        {
            let mut sup = self.supervisor();
            if sup.running_model() == Some(path) {
                sup.stop();
            }
        }
        if self.model.as_deref() == Some(path) {
            self.model = None;
        }
        if let Err(e) = self.catalog.remove_entry(path) {
            ui.notify_error(&e.to_string());
        }
        self.settings.forget_model(path);
        log::info!("[SESSION] Removed model {}", path.display());
    }

    /// Make `path` the current model and (re)start the server for it.
    /// Re-selecting the running model restarts it.
    pub fn select_model(&mut self, path: &Path, ui: &mut dyn Frontend) -> bool {
        if self.catalog.get(path).is_none() {
            if let Err(e) = self.catalog.add_entry(scan_model(path)) {
                ui.notify_error(&e.to_string());
            }
        }
        self.model = Some(path.to_path_buf());
        log::info!("[SESSION] Selected model {}", path.display());
        self.launch_server(path, ui)
    }

    fn launch_server(&mut self, path: &Path, ui: &mut dyn Frontend) -> bool {
        let merged = self.merged_settings();
        let layers = self.catalog.get(path).and_then(|e| e.layer_count());
        let launch = LaunchConfig::from_settings(path, layers, &merged, self.config.server_bin.as_deref())
            .and_then(|config| self.supervisor().launch(&config).map(|_| ()));

        match launch {
            Ok(()) => true,
            Err(e) => {
                ui.notify_error(&e.to_string());
                false
            }
        }
    }

    /// Relaunch if the server died or serves another model. Returns the
    /// completions endpoint when a server is up.
    fn ensure_server(&mut self, model: &Path, ui: &mut dyn Frontend) -> Option<String> {
        let up = {
            let mut sup = self.supervisor();
            sup.check_alive() && sup.running_model() == Some(model)
        };
        if !up && !self.launch_server(model, ui) {
            return None;
        }
        self.supervisor().handle().map(|h| h.endpoint())
    }

    // ── Chats ───────────────────────────────────────────────────────────

    pub fn new_chat(&mut self, ui: &mut dyn Frontend) -> bool {
        let model = self.model.clone();
        let system = self
            .settings
            .resolve(None, model.as_deref())
            .text(Setting::SystemPrompt);

        match self.chats.create(NEW_CHAT_TITLE, &system) {
            Ok(chat) => {
                ui.render_conversation(&chat);
                self.chat = Some(chat);
                true
            }
            Err(e) => {
                ui.notify_error(&e.to_string());
                false
            }
        }
    }

    pub fn open_chat(&mut self, filename: &str, ui: &mut dyn Frontend) -> bool {
        let model = self.model.clone();
        let fallback = self
            .settings
            .resolve(Some(filename), model.as_deref())
            .text(Setting::SystemPrompt);

        match self.chats.load(filename, &fallback) {
            Ok(chat) => {
                ui.render_conversation(&chat);
                self.chat = Some(chat);
                true
            }
            Err(e) => {
                ui.notify_error(&e.to_string());
                false
            }
        }
    }

    pub fn rename_chat(&mut self, ui: &mut dyn Frontend) {
        let Some(chat) = self.chat.as_mut() else {
            return;
        };
        let Some(title) = ui.prompt_text("Rename chat", &chat.title) else {
            return;
        };
        if let Err(e) = self.chats.rename(chat, &title) {
            ui.notify_error(&e.to_string());
        }
    }

    /// Delete a chat with its settings. On failure the chat stays listed and
    /// the user is warned.
    pub fn delete_chat(&mut self, filename: &str, ui: &mut dyn Frontend) {
        if let Some(active) = self.streams.remove(filename) {
            active.handle.cancel();
        }
        match self.chats.delete(filename, &mut self.settings) {
            Ok(()) => {
                if self.chat.as_ref().map(|c| c.id == filename).unwrap_or(false) {
                    self.chat = None;
                }
            }
            Err(e) => ui.notify_error(&format!("Could not delete chat: {}", e)),
        }
    }

    /// Edit the current chat's system prompt. Stored as a chat-scope
    /// override; the conversation picks it up on the next send.
    pub fn edit_system_prompt(&mut self, ui: &mut dyn Frontend) {
        let Some(chat_id) = self.chat.as_ref().map(|c| c.id.clone()) else {
            return;
        };
        let current = self.merged_settings().text(Setting::SystemPrompt);
        let Some(prompt) = ui.prompt_multiline("System prompt", &current) else {
            return;
        };

        let layer = self.settings.layer(LayerRef::Chat(&chat_id));
        let result = layer
            .set(Setting::SystemPrompt, SettingValue::Text(prompt))
            .and_then(|()| layer.set_override(true));
        if let Err(e) = result {
            ui.notify_error(&e.to_string());
        }
    }

    fn persist_chat(&self, ui: &mut dyn Frontend) {
        if let Some(chat) = self.chat.as_ref() {
            if let Err(e) = self.chats.save(chat) {
                log::warn!("[SESSION] {}", e);
                ui.notify_error(&e.to_string());
            }
        }
    }

    // ── Turns ───────────────────────────────────────────────────────────

    /// Append a user turn and stream the reply.
    pub fn send(&mut self, text: &str, ui: &mut dyn Frontend) -> SendOutcome {
        if text.trim().is_empty() {
            return SendOutcome::Blank;
        }
        let Some(model) = self.model.clone() else {
            log::info!("[SESSION] Send with no model selected");
            ui.request_model_selection();
            return SendOutcome::NoModel;
        };
        if self.chat.is_none() && !self.new_chat(ui) {
            return SendOutcome::Failed;
        }

        let system = self.merged_settings().text(Setting::SystemPrompt);
        let Some(chat) = self.chat.as_mut() else {
            return SendOutcome::Failed;
        };
        if chat.effective_system() != Some(system.as_str()) {
            log::info!("[SESSION] System prompt changed; appending it to {}", chat.id);
            chat.append_system(system);
        }
        chat.append_user(text);
        let wire = chat.project_legacy();
        let chat_id = chat.id.clone();

        self.persist_chat(ui);
        if let Some(chat) = self.chat.as_ref() {
            ui.render_conversation(chat);
        }
        self.stream_reply(&model, chat_id, wire, ui)
    }

    /// Re-issue the request anchored at the user turn `index` (default: the
    /// newest one), dropping everything after it.
    pub fn regenerate(&mut self, index: Option<usize>, ui: &mut dyn Frontend) -> SendOutcome {
        let Some(model) = self.model.clone() else {
            ui.request_model_selection();
            return SendOutcome::NoModel;
        };
        let Some(chat) = self.chat.as_mut() else {
            return SendOutcome::Failed;
        };
        let Some(anchor) = index.or_else(|| chat.last_user_index()) else {
            ui.notify_error("Nothing to regenerate");
            return SendOutcome::Failed;
        };
        let Some(wire) = chat.regenerate_from(anchor) else {
            ui.notify_error("Only user turns can be regenerated");
            return SendOutcome::Failed;
        };
        let chat_id = chat.id.clone();

        self.persist_chat(ui);
        if let Some(chat) = self.chat.as_ref() {
            ui.render_conversation(chat);
        }
        self.stream_reply(&model, chat_id, wire, ui)
    }

    pub fn delete_turn(&mut self, index: usize, ui: &mut dyn Frontend) -> bool {
        let Some(removed) = self.chat.as_mut().and_then(|c| c.delete_turn(index)) else {
            return false;
        };
        log::info!("[SESSION] Deleted {} turn {}", removed.role.as_str(), index);
        self.persist_chat(ui);
        if let Some(chat) = self.chat.as_ref() {
            ui.render_conversation(chat);
        }
        true
    }

    fn stream_reply(
        &mut self,
        model: &Path,
        chat_id: String,
        wire: Vec<WireMessage>,
        ui: &mut dyn Frontend,
    ) -> SendOutcome {
        let Some(endpoint) = self.ensure_server(model, ui) else {
            return SendOutcome::Failed;
        };

        if let Some(old) = self.streams.remove(&chat_id) {
            log::info!("[SESSION] Cancelling previous completion for {}", chat_id);
            old.handle.cancel();
        }

        self.next_generation += 1;
        let tag = StreamTag {
            chat_id: chat_id.clone(),
            generation: self.next_generation,
        };
        let handle = self
            .client
            .spawn(&self.runtime, endpoint, wire, tag, self.events.clone());
        self.streams.insert(
            chat_id,
            ActiveStream {
                generation: self.next_generation,
                handle,
                stats: None,
            },
        );
        SendOutcome::Sent
    }

    /// Cancel the current chat's completion. Tokens already shown are
    /// discarded.
    pub fn stop_generation(&mut self) -> bool {
        let Some(id) = self.chat.as_ref().map(|c| c.id.clone()) else {
            return false;
        };
        match self.streams.remove(&id) {
            Some(active) => {
                active.handle.cancel();
                log::info!("[SESSION] Stopped generation for {}", id);
                true
            }
            None => false,
        }
    }

    /// Apply one completion event. Events from cancelled or superseded
    /// streams are ignored.
    pub fn handle_stream_event(&mut self, tag: StreamTag, event: StreamEvent, ui: &mut dyn Frontend) {
        let Some(active) = self.streams.get_mut(&tag.chat_id) else {
            log::debug!("[SESSION] Dropping event for finished stream {:?}", tag);
            return;
        };
        if active.generation != tag.generation {
            log::debug!("[SESSION] Dropping stale event {:?}", tag);
            return;
        }
        let is_current = self.chat.as_ref().map(|c| c.id == tag.chat_id).unwrap_or(false);

        match event {
            StreamEvent::Token(token) => {
                if is_current {
                    ui.stream_token(&token);
                }
            }
            StreamEvent::Stats(raw) => {
                if let Some(stats) = TurnStats::from_chunk(&raw) {
                    match active.stats.as_mut() {
                        Some(acc) => acc.absorb(stats),
                        None => active.stats = Some(stats),
                    }
                }
            }
            StreamEvent::Completed(reply) => {
                let stats = self.streams.remove(&tag.chat_id).and_then(|a| a.stats);
                let visible = visible_reply(&reply).to_string();
                if is_current {
                    if let Some(chat) = self.chat.as_mut() {
                        chat.append_assistant(visible, stats);
                    }
                    self.persist_chat(ui);
                    if let Some(chat) = self.chat.as_ref() {
                        ui.render_conversation(chat);
                    }
                } else {
                    self.complete_in_background(&tag.chat_id, visible, stats, ui);
                }
            }
            StreamEvent::Error(message) => {
                self.streams.remove(&tag.chat_id);
                log::warn!("[SESSION] Completion for {} failed: {}", tag.chat_id, message);
                if is_current {
                    ui.show_turn_error(&message);
                }
            }
        }
    }

    /// A reply finished for a chat that is no longer on screen.
    fn complete_in_background(
        &mut self,
        chat_id: &str,
        reply: String,
        stats: Option<TurnStats>,
        ui: &mut dyn Frontend,
    ) {
        let model = self.model.clone();
        let fallback = self
            .settings
            .resolve(Some(chat_id), model.as_deref())
            .text(Setting::SystemPrompt);

        let saved = self.chats.load(chat_id, &fallback).and_then(|mut chat| {
            chat.append_assistant(reply, stats);
            self.chats.save(&chat)
        });
        if let Err(e) = saved {
            ui.notify_error(&e.to_string());
        }
    }

    /// Cancel every completion and stop the server.
    pub fn shutdown(&mut self) {
        for (_, active) in self.streams.drain() {
            active.handle.cancel();
        }
        let outcome = self.supervisor().stop();
        log::info!("[SESSION] Shutdown complete ({:?})", outcome);
    }
}
