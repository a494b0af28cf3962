//! Line-oriented presentation: input parsing and the stdout notifier.

use std::sync::Arc;

use dc_core::{DomainError, Notifier, Page, ThreadEntry};
use dc_proto::MessageStatus;
use dc_store::{Store, ThreadStore, UserStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Lookup(String),
    Select(String),
    Thread(Option<String>),
    Contacts,
    Status,
    Quit,
    Help,
    Say(String),
    Empty,
    Unknown(String),
}

pub fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Say(line.to_string());
    };
    let mut parts = rest.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty()).map(str::to_string);
    match (cmd, arg) {
        ("lookup", Some(user)) => Input::Lookup(user),
        ("to", Some(user)) => Input::Select(user),
        ("thread", arg) => Input::Thread(arg),
        ("contacts", None) => Input::Contacts,
        ("status", None) => Input::Status,
        ("quit" | "exit", None) => Input::Quit,
        ("help", _) => Input::Help,
        _ => Input::Unknown(line.to_string()),
    }
}

pub const HELP: &str = "commands: /lookup <user>  /to <user>  /thread [user]  /contacts  /status  /quit";

pub fn render_entry(me: &str, entry: &ThreadEntry) -> String {
    let when = entry.timestamp.format("%H:%M");
    let text = entry.text.as_deref().unwrap_or("<unreadable>");
    if entry.from == me {
        let mark = match entry.status {
            MessageStatus::Pending => " (sending)",
            MessageStatus::Sent => "",
            MessageStatus::Failed => " [failed]",
        };
        format!("[{when}] me: {text}{mark}")
    } else {
        format!("[{when}] {}: {text}", entry.from)
    }
}

/// Writes notifications to stdout/stderr. Reads contacts straight from the
/// local store.
pub struct Console {
    store: Arc<Store>,
}

impl Console {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn print_thread(&self, me: &str, peer: &str, entries: &[ThreadEntry]) {
        println!("── {peer} ──");
        for entry in entries {
            println!("{}", render_entry(me, entry));
        }
    }
}

impl Notifier for Console {
    fn notify_error(&self, error: &DomainError) {
        eprintln!("! {error}");
    }

    fn notify_navigate(&self, page: Page) {
        match page {
            Page::Inbox => println!("{HELP}"),
            Page::Login => println!("-- logged out"),
            Page::Register => println!("-- registration required"),
        }
    }

    fn notify_contacts_changed(&self) {
        let users = UserStore::new(&self.store).list();
        let peers = ThreadStore::new(&self.store).peers();
        match (users, peers) {
            (Ok(users), Ok(peers)) => {
                let mut names: Vec<String> = users.into_iter().map(|u| u.username).collect();
                for peer in peers {
                    if !names.contains(&peer) {
                        names.push(peer);
                    }
                }
                names.sort();
                println!("contacts: {}", if names.is_empty() { "(none)".to_string() } else { names.join(", ") });
            }
            (Err(e), _) | (_, Err(e)) => eprintln!("! cannot list contacts: {e}"),
        }
    }

    fn notify_thread_changed(&self, peer: &str) {
        tracing::debug!(peer, "thread changed");
    }

    fn notify_status(&self, text: &str) {
        println!("* {text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_line("/lookup bob"), Input::Lookup("bob".into()));
        assert_eq!(parse_line("  /to  bob "), Input::Select("bob".into()));
        assert_eq!(parse_line("/thread"), Input::Thread(None));
        assert_eq!(parse_line("/thread carol"), Input::Thread(Some("carol".into())));
        assert_eq!(parse_line("/quit"), Input::Quit);
        assert_eq!(parse_line("/lookup"), Input::Unknown("/lookup".into()));
        assert_eq!(parse_line(""), Input::Empty);
    }

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_line("hello there"), Input::Say("hello there".into()));
    }

    #[test]
    fn own_failed_messages_are_marked() {
        let entry = ThreadEntry {
            id: 1,
            from: "alice".into(),
            to: "bob".into(),
            status: MessageStatus::Failed,
            timestamp: Utc::now(),
            text: Some("hi".into()),
        };
        assert!(render_entry("alice", &entry).ends_with("me: hi [failed]"));
        assert!(render_entry("bob", &entry).ends_with("alice: hi"));
    }
}
