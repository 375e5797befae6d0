//! Line-oriented terminal front-end.
//!
//! Stdin lines and completion events are funnelled into one inbox so the
//! control thread is the only place that touches the session.

use crate::chat::{Conversation, Role};
use crate::frontend::Frontend;
use crate::llm::{StreamEvent, STAT_UNAVAILABLE};
use crate::session::{SendOutcome, Session, StreamEvents, StreamTag};
use crate::settings::{LayerRef, Setting, SettingValue};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};

const HELP: &str = "\
Commands:
  /model [path]          add a GGUF model to the catalog
  /models                list cataloged models
  /use <n>               select model n and start the server
  /forget <n>            remove model n from the catalog
  /new                   start a new chat
  /chats                 list chats
  /open <n>              open chat n
  /rename                rename the current chat
  /delete-chat <n>       delete chat n
  /system                edit the current chat's system prompt
  /regen [turn]          regenerate from a user turn (default: last)
  /delete <turn>         delete a turn from the current chat
  /stop                  stop the reply being generated
  /profiles              list settings profiles
  /profile <name>        switch to (or create) a profile
  /set <scope> <key> <value>   set a setting (scope: profile, model, chat)
  /override <scope> on|off     toggle the model or chat override
  /quit                  stop the server and exit
Anything else is sent as a message.";

#[derive(Debug)]
pub enum Input {
    Line(String),
    Stream(StreamTag, StreamEvent),
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddModel(Option<PathBuf>),
    ListModels,
    UseModel(usize),
    ForgetModel(usize),
    NewChat,
    ListChats,
    OpenChat(usize),
    Rename,
    DeleteChat(usize),
    System,
    Regenerate(Option<usize>),
    DeleteTurn(usize),
    Stop,
    ListProfiles,
    Profile(String),
    Set { scope: String, key: String, value: String },
    Override { scope: String, enabled: bool },
    Help,
    Quit,
    Send(String),
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest.trim(), ""),
        };
        let index = |arg: &str| arg.parse::<usize>().ok();
        let invalid = || Command::Invalid(format!("Bad arguments for /{}; try /help", name));

        match name {
            "model" if arg.is_empty() => Command::AddModel(None),
            "model" => Command::AddModel(Some(PathBuf::from(arg))),
            "models" => Command::ListModels,
            "use" => index(arg).map(Command::UseModel).unwrap_or_else(invalid),
            "forget" => index(arg).map(Command::ForgetModel).unwrap_or_else(invalid),
            "new" => Command::NewChat,
            "chats" => Command::ListChats,
            "open" => index(arg).map(Command::OpenChat).unwrap_or_else(invalid),
            "rename" => Command::Rename,
            "delete-chat" => index(arg).map(Command::DeleteChat).unwrap_or_else(invalid),
            "system" => Command::System,
            "regen" if arg.is_empty() => Command::Regenerate(None),
            "regen" => index(arg).map(|i| Command::Regenerate(Some(i))).unwrap_or_else(invalid),
            "delete" => index(arg).map(Command::DeleteTurn).unwrap_or_else(invalid),
            "stop" => Command::Stop,
            "profiles" => Command::ListProfiles,
            "profile" if !arg.is_empty() => Command::Profile(arg.to_string()),
            "set" => {
                let mut parts = arg.splitn(3, char::is_whitespace);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(scope), Some(key), Some(value)) if !scope.is_empty() => Command::Set {
                        scope: scope.to_string(),
                        key: key.to_string(),
                        value: value.trim().to_string(),
                    },
                    _ => invalid(),
                }
            }
            "override" => match arg.split_once(char::is_whitespace) {
                Some((scope, "on")) => Command::Override { scope: scope.to_string(), enabled: true },
                Some((scope, "off")) => Command::Override { scope: scope.to_string(), enabled: false },
                _ => invalid(),
            },
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => Command::Invalid(format!("Unknown command /{}; try /help", name)),
        }
    }
}

pub struct Terminal {
    inbox: Receiver<Input>,
    pending: VecDeque<Input>,
    preselected: Option<PathBuf>,
    reply_open: bool,
}

impl Terminal {
    /// Start the stdin reader and the completion-event forwarder.
    pub fn start(runtime: &tokio::runtime::Handle, mut events: StreamEvents) -> Self {
        let (tx, inbox) = channel::<Input>();

        let stdin_tx: Sender<Input> = tx.clone();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if stdin_tx.send(Input::Line(line)).is_err() {
                    return;
                }
            }
            let _ = stdin_tx.send(Input::Eof);
        });

        runtime.spawn(async move {
            while let Some((tag, event)) = events.recv().await {
                if tx.send(Input::Stream(tag, event)).is_err() {
                    break;
                }
            }
        });

        Self {
            inbox,
            pending: VecDeque::new(),
            preselected: None,
            reply_open: false,
        }
    }

    fn next_input(&mut self) -> Input {
        if let Some(input) = self.pending.pop_front() {
            return input;
        }
        self.inbox.recv().unwrap_or(Input::Eof)
    }

    /// Read one line for a prompt, parking completion events for later.
    fn read_line(&mut self) -> Option<String> {
        loop {
            match self.inbox.recv() {
                Ok(Input::Line(line)) => return Some(line),
                Ok(Input::Eof) | Err(_) => {
                    self.pending.push_back(Input::Eof);
                    return None;
                }
                Ok(stream) => self.pending.push_back(stream),
            }
        }
    }

    fn close_reply(&mut self) {
        if self.reply_open {
            println!();
            self.reply_open = false;
        }
    }
}

impl Frontend for Terminal {
    fn pick_model_file(&mut self) -> Option<PathBuf> {
        if let Some(path) = self.preselected.take() {
            return Some(path);
        }
        let line = self.prompt_text("Model file (.gguf)", "")?;
        Some(PathBuf::from(line))
    }

    fn prompt_text(&mut self, title: &str, initial: &str) -> Option<String> {
        self.close_reply();
        if initial.is_empty() {
            print!("{}: ", title);
        } else {
            print!("{} [{}]: ", title, initial);
        }
        let _ = std::io::stdout().flush();
        let line = self.read_line()?;
        let line = line.trim();
        match (line.is_empty(), initial.is_empty()) {
            (true, true) => None,
            (true, false) => Some(initial.to_string()),
            (false, _) => Some(line.to_string()),
        }
    }

    fn prompt_multiline(&mut self, title: &str, initial: &str) -> Option<String> {
        self.close_reply();
        println!("{} (finish with a single '.', empty keeps the current text):", title);
        println!("{}", initial);
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            if line.trim() == "." {
                break;
            }
            lines.push(line);
        }
        if lines.is_empty() {
            return None;
        }
        Some(lines.join("\n"))
    }

    fn render_conversation(&mut self, conversation: &Conversation) {
        self.close_reply();
        println!("── {} ──", conversation.title);
        for (idx, message) in conversation.messages.iter().enumerate() {
            let label = match &message.role {
                Role::System => "system",
                Role::User => "you",
                Role::Assistant => "assistant",
                Role::Other(name) => name.as_str(),
            };
            println!("[{}] {}: {}", idx, label, message.display_content());
            if let Some(stats) = &message.stats {
                let line: Vec<String> = stats
                    .fields()
                    .iter()
                    .map(|f| match f.value {
                        Some(v) if f.unit.is_empty() => format!("{}: {}", f.label, v),
                        Some(v) => format!("{}: {:.1} {}", f.label, v, f.unit),
                        None => format!("{}: {}", f.label, STAT_UNAVAILABLE),
                    })
                    .collect();
                println!("    ({})", line.join(" | "));
            }
        }
    }

    fn stream_token(&mut self, token: &str) {
        if !self.reply_open {
            print!("assistant: ");
            self.reply_open = true;
        }
        print!("{}", token);
        let _ = std::io::stdout().flush();
    }

    fn show_turn_error(&mut self, message: &str) {
        self.close_reply();
        println!("!! {}", message);
    }

    fn notify_error(&mut self, message: &str) {
        self.close_reply();
        eprintln!("error: {}", message);
    }

    fn request_model_selection(&mut self) {
        self.close_reply();
        println!("No model selected. Add one with /model <path> and pick it with /use <n>.");
    }
}

/// Run the interactive loop until `/quit` or end of input.
pub fn run_loop(session: &mut Session, term: &mut Terminal) {
    println!("lmngen: type /help for commands.");
    loop {
        match term.next_input() {
            Input::Eof => break,
            Input::Stream(tag, event) => session.handle_stream_event(tag, event, term),
            Input::Line(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                if !dispatch(Command::parse(&line), session, term) {
                    break;
                }
            }
        }
    }
    term.close_reply();
}

/// Execute one command. Returns false to quit.
fn dispatch(command: Command, session: &mut Session, term: &mut Terminal) -> bool {
    match command {
        Command::AddModel(path) => {
            term.preselected = path;
            if let Some(path) = session.add_model(term) {
                if let Some(entry) = session.catalog().get(&path) {
                    println!(
                        "Added {} ({}, {}, {} layers)",
                        entry.display_name(),
                        entry.parameters,
                        entry.weights,
                        entry.layers
                    );
                }
            }
        }
        Command::ListModels => {
            let current = session.current_model().map(|p| p.to_path_buf());
            for (idx, entry) in session.catalog().entries().iter().enumerate() {
                let marker = if current.as_ref() == Some(&entry.path) { "*" } else { " " };
                println!(
                    "{}{} {} | {} | {} | {} layers | {}",
                    marker,
                    idx,
                    entry.display_name(),
                    entry.parameters,
                    entry.weights,
                    entry.layers,
                    entry.path.display()
                );
            }
        }
        Command::UseModel(idx) => match session.catalog().entries().get(idx).map(|e| e.path.clone()) {
            Some(path) => {
                if session.select_model(&path, term) {
                    println!("Server starting for {} ({:?})", path.display(), session.server_state());
                }
            }
            None => term.notify_error(&format!("No model #{}", idx)),
        },
        Command::ForgetModel(idx) => match session.catalog().entries().get(idx).map(|e| e.path.clone()) {
            Some(path) => session.remove_model(&path, term),
            None => term.notify_error(&format!("No model #{}", idx)),
        },
        Command::NewChat => {
            session.new_chat(term);
        }
        Command::ListChats => {
            let current = session.current_chat().map(|c| c.id.clone());
            for (idx, entry) in session.chats().entries().iter().enumerate() {
                let marker = if current.as_deref() == Some(entry.filename.as_str()) { "*" } else { " " };
                println!("{}{} {}", marker, idx, entry.title);
            }
        }
        Command::OpenChat(idx) => match chat_filename(session, idx) {
            Some(filename) => {
                session.open_chat(&filename, term);
            }
            None => term.notify_error(&format!("No chat #{}", idx)),
        },
        Command::Rename => session.rename_chat(term),
        Command::DeleteChat(idx) => match chat_filename(session, idx) {
            Some(filename) => session.delete_chat(&filename, term),
            None => term.notify_error(&format!("No chat #{}", idx)),
        },
        Command::System => session.edit_system_prompt(term),
        Command::Regenerate(idx) => {
            session.regenerate(idx, term);
        }
        Command::DeleteTurn(idx) => {
            if !session.delete_turn(idx, term) {
                term.notify_error(&format!("No turn #{}", idx));
            }
        }
        Command::Stop => {
            if session.stop_generation() {
                term.close_reply();
                println!("(stopped)");
            }
        }
        Command::ListProfiles => {
            let active = session.settings().active_profile().to_string();
            for name in session.settings().list_profiles() {
                let marker = if name == active { "*" } else { " " };
                println!("{} {}", marker, name);
            }
        }
        Command::Profile(name) => {
            let store = session.settings();
            let exists = store.list_profiles().contains(&name);
            let result = if exists {
                store.switch_profile(&name)
            } else {
                store.create_profile(&name).and_then(|()| store.switch_profile(&name))
            };
            if let Err(e) = result {
                term.notify_error(&e.to_string());
            }
        }
        Command::Set { scope, key, value } => set_setting(session, term, &scope, &key, value),
        Command::Override { scope, enabled } => toggle_override(session, term, &scope, enabled),
        Command::Help => println!("{}", HELP),
        Command::Quit => return false,
        Command::Send(text) => {
            if session.send(&text, term) == SendOutcome::Failed {
                log::warn!("[SESSION] Message recorded but not sent");
            }
        }
        Command::Invalid(message) => term.notify_error(&message),
    }
    true
}

fn chat_filename(session: &Session, idx: usize) -> Option<String> {
    session.chats().entries().get(idx).map(|e| e.filename.clone())
}

fn set_setting(session: &mut Session, term: &mut Terminal, scope: &str, key: &str, value: String) {
    let Some(setting) = Setting::from_key(key) else {
        term.notify_error(&format!("Unknown setting '{}'", key));
        return;
    };
    let model = session.current_model().map(|p| p.to_path_buf());
    let chat = session.current_chat().map(|c| c.id.clone());
    let target = match (scope, model.as_deref(), chat.as_deref()) {
        ("profile", _, _) => LayerRef::Profile,
        ("model", Some(path), _) => LayerRef::Model(path),
        ("chat", _, Some(id)) => LayerRef::Chat(id),
        _ => {
            term.notify_error(&format!("No {} layer to edit", scope));
            return;
        }
    };
    let value = match value.parse::<i64>() {
        Ok(n) => SettingValue::Integer(n),
        Err(_) => SettingValue::Text(value),
    };
    if let Err(e) = session.settings().layer(target).set(setting, value) {
        term.notify_error(&e.to_string());
    }
}

fn toggle_override(session: &mut Session, term: &mut Terminal, scope: &str, enabled: bool) {
    let model = session.current_model().map(|p| p.to_path_buf());
    let chat = session.current_chat().map(|c| c.id.clone());
    let target = match (scope, model.as_deref(), chat.as_deref()) {
        ("model", Some(path), _) => LayerRef::Model(path),
        ("chat", _, Some(id)) => LayerRef::Chat(id),
        _ => {
            term.notify_error(&format!("No {} layer to toggle", scope));
            return;
        }
    };
    if let Err(e) = session.settings().layer(target).set_override(enabled) {
        term.notify_error(&e.to_string());
    }
}
