// `tandem join`: join a document session and edit it line by line.

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use tandem_session::config::{global_config_path, LocalUser};
use tandem_session::transport::SignalingTransport;
use tandem_session::{
    ActiveUser, ClientConfig, ConnectionStatus, CursorRange, SessionEvent, SessionManager,
    UserPatch,
};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct JoinArgs {
    /// Document to join
    document_id: String,
    /// Display name shown to other participants
    #[arg(long)]
    name: Option<String>,
    /// Cursor color, e.g. "#30bced"
    #[arg(long)]
    color: Option<String>,
    /// Stable user id (defaults to the configured or generated id)
    #[arg(long)]
    user_id: Option<String>,
    /// Signaling relay URL (overrides config and TANDEM_SIGNALING_URL)
    #[arg(long)]
    signaling_url: Option<String>,
    /// Explicit room name instead of `document-<id>`
    #[arg(long)]
    room: Option<String>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

/// One line typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Append(String),
    Undo,
    Redo,
    Show,
    Who,
    Cursor(CursorRange),
    Name(String),
    Quit,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let Some(command) = line.strip_prefix(':') else {
        return Ok(Input::Append(line.to_string()));
    };
    let mut words = command.split_whitespace();
    let name = words.next().unwrap_or_default();
    match name {
        "undo" => Ok(Input::Undo),
        "redo" => Ok(Input::Redo),
        "show" => Ok(Input::Show),
        "who" => Ok(Input::Who),
        "quit" | "q" => Ok(Input::Quit),
        "name" => {
            let rest = command.trim_start()["name".len()..].trim();
            if rest.is_empty() {
                return Err("usage: :name <display name>".into());
            }
            Ok(Input::Name(rest.to_string()))
        }
        "cursor" => {
            let parse = |word: &str| {
                word.parse::<u32>().map_err(|_| format!("`{word}` is not a character offset"))
            };
            let anchor = words.next().ok_or("usage: :cursor <anchor> [<head>]")?;
            let anchor = parse(anchor)?;
            let head = words.next().map(parse).transpose()?.unwrap_or(anchor);
            Ok(Input::Cursor(CursorRange { anchor, head }))
        }
        other => Err(format!("unknown command `:{other}`")),
    }
}

/// A session event as printed to stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventLine {
    Join { user: ActiveUser },
    Leave { user_id: String },
    Update { user: ActiveUser },
    Status { status: ConnectionStatus },
    Error { message: String, recoverable: bool },
}

impl From<SessionEvent> for EventLine {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::UserJoin(user) => Self::Join { user },
            SessionEvent::UserLeave(user_id) => Self::Leave { user_id },
            SessionEvent::UserUpdate(user) => Self::Update { user },
            SessionEvent::StatusChange(status) => Self::Status { status },
            SessionEvent::Error(error) => {
                Self::Error { message: error.to_string(), recoverable: error.is_recoverable() }
            }
        }
    }
}

fn format_event(line: &EventLine) -> String {
    match line {
        EventLine::Join { user } => format!("* {} ({}) joined", user.name, user.id),
        EventLine::Leave { user_id } => format!("* {user_id} left"),
        EventLine::Update { user } => match user.cursor {
            Some(cursor) => format!("* {} is at {}..{}", user.name, cursor.anchor, cursor.head),
            None => format!("* {} updated", user.name),
        },
        EventLine::Status { status } => format!("* {status}"),
        EventLine::Error { message, recoverable: true } => format!("! {message}"),
        EventLine::Error { message, recoverable: false } => format!("! {message} (connection affected)"),
    }
}

fn format_users(users: &[ActiveUser]) -> String {
    if users.is_empty() {
        return "Nobody else is here.".into();
    }
    let mut lines = vec![format!("Participants ({})", users.len())];
    for user in users {
        let cursor = user
            .cursor
            .map(|c| format!(" @ {}..{}", c.anchor, c.head))
            .unwrap_or_default();
        lines.push(format!("  {} ({}) {}{cursor}", user.name, user.id, user.color));
    }
    lines.join("\n")
}

/// Flag, then config file, then a fresh id that is saved for next time.
fn resolve_user(args: &JoinArgs, client: &mut ClientConfig) -> LocalUser {
    let id = match args.user_id.clone().or_else(|| client.user_id.clone()) {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            client.user_id = Some(id.clone());
            if let Some(path) = global_config_path() {
                if let Err(error) = client.save_to(&path) {
                    warn!(%error, path = %path.display(), "could not persist generated user id");
                }
            }
            id
        }
    };
    let name = args
        .name
        .clone()
        .or_else(|| client.display_name.clone())
        .unwrap_or_else(|| id.chars().take(8).collect());
    let user = LocalUser::new(id, name);
    match args.color.clone().or_else(|| client.color.clone()) {
        Some(color) => user.with_color(color),
        None => user,
    }
}

pub fn run(args: JoinArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match runtime.block_on(join(args, format)) {
        Ok(()) => Ok(()),
        Err(e) => {
            output::print_anyhow_error(format, &e);
            Err(e)
        }
    }
}

async fn join(args: JoinArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut client = ClientConfig::load();
    let user = resolve_user(&args, &mut client);
    let mut config = client.session_config(&args.document_id, user);
    if let Some(url) = &args.signaling_url {
        config = config.with_signaling_url(url);
    }
    if let Some(room) = &args.room {
        config = config.with_room(room);
    }

    let (mut session, mut events) = SessionManager::new(Arc::new(SignalingTransport::new()));
    session
        .join_session(config)
        .with_context(|| format!("failed to join document `{}`", args.document_id))?;
    info!(document_id = %args.document_id, "joined; reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                output::print_output(format, &EventLine::from(event), format_event)?;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Ok(Input::Quit) => break,
                    Ok(input) => apply(&mut session, input, format)?,
                    Err(message) => output::print_warning(format, "BAD_COMMAND", &message),
                }
            }
        }
    }

    session.destroy();
    Ok(())
}

#[derive(Debug, Serialize)]
struct ContentView {
    content: String,
}

fn apply(session: &mut SessionManager, input: Input, format: OutputFormat) -> anyhow::Result<()> {
    let Some(provider) = session.provider() else {
        return Ok(());
    };
    match input {
        Input::Append(text) => {
            let at = provider.text_len();
            let prefix = if at == 0 { "" } else { "\n" };
            provider.insert_text(at, &format!("{prefix}{text}"));
        }
        Input::Undo => {
            if !provider.undo().context("undo failed")? {
                output::print_warning(format, "NOTHING_TO_UNDO", "nothing to undo");
            }
        }
        Input::Redo => {
            if !provider.redo().context("redo failed")? {
                output::print_warning(format, "NOTHING_TO_REDO", "nothing to redo");
            }
        }
        Input::Show => {
            let view = ContentView { content: provider.content() };
            output::print_output(format, &view, |v| v.content.clone())?;
        }
        Input::Who => {
            let users = session.active_users();
            output::print_output(format, &users, |u| format_users(u))?;
        }
        Input::Cursor(range) => session.update_cursor_position(Some(range)),
        Input::Name(name) => session.update_user_info(UserPatch::name(name)),
        Input::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_session::SessionError;

    #[test]
    fn plain_lines_are_appended() {
        assert_eq!(parse_input("hello there"), Ok(Input::Append("hello there".into())));
        assert_eq!(parse_input(""), Ok(Input::Append(String::new())));
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_input(":undo"), Ok(Input::Undo));
        assert_eq!(parse_input(":redo"), Ok(Input::Redo));
        assert_eq!(parse_input(":show"), Ok(Input::Show));
        assert_eq!(parse_input(":who"), Ok(Input::Who));
        assert_eq!(parse_input(":quit"), Ok(Input::Quit));
        assert_eq!(parse_input(":name  Ada Lovelace "), Ok(Input::Name("Ada Lovelace".into())));
    }

    #[test]
    fn cursor_head_defaults_to_anchor() {
        assert_eq!(parse_input(":cursor 4"), Ok(Input::Cursor(CursorRange::caret(4))));
        assert_eq!(
            parse_input(":cursor 3 9"),
            Ok(Input::Cursor(CursorRange { anchor: 3, head: 9 }))
        );
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_input(":cursor").is_err());
        assert!(parse_input(":cursor left").is_err());
        assert!(parse_input(":name").is_err());
        assert_eq!(parse_input(":dance"), Err("unknown command `:dance`".into()));
    }

    #[test]
    fn events_render_for_humans_and_json() {
        let user = ActiveUser {
            replica_id: 7,
            id: "u-ada".into(),
            name: "Ada".into(),
            color: "#30bced".into(),
            cursor: Some(CursorRange { anchor: 1, head: 5 }),
            last_seen: None,
        };
        let join = EventLine::from(SessionEvent::UserJoin(user.clone()));
        assert_eq!(format_event(&join), "* Ada (u-ada) joined");
        let update = EventLine::from(SessionEvent::UserUpdate(user));
        assert_eq!(format_event(&update), "* Ada is at 1..5");

        let status = EventLine::from(SessionEvent::StatusChange(ConnectionStatus::Connected));
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value, serde_json::json!({"event": "status", "status": "connected"}));
    }

    #[test]
    fn error_lines_say_whether_the_link_survived() {
        let frame = EventLine::from(SessionEvent::Error(SessionError::Protocol("bad frame".into())));
        assert_eq!(format_event(&frame), "! malformed peer frame: bad frame");

        let exhausted =
            EventLine::from(SessionEvent::Error(SessionError::ReconnectExhausted { attempts: 5 }));
        assert_eq!(
            format_event(&exhausted),
            "! reconnect gave up after 5 attempts (connection affected)"
        );
        let value = serde_json::to_value(&exhausted).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["recoverable"], false);
    }

    #[test]
    fn explicit_flags_win_over_config() {
        let args = JoinArgs {
            document_id: "notes".into(),
            name: Some("Flag Name".into()),
            color: None,
            user_id: Some("u-flag".into()),
            signaling_url: None,
            room: None,
            json: false,
        };
        let mut client = ClientConfig {
            user_id: Some("u-config".into()),
            display_name: Some("Config Name".into()),
            color: Some("#ee6352".into()),
            ..Default::default()
        };
        let user = resolve_user(&args, &mut client);
        assert_eq!(user.id, "u-flag");
        assert_eq!(user.name, "Flag Name");
        assert_eq!(user.color.as_deref(), Some("#ee6352"));
    }
}
