use anyhow::Result;
use daybook_backend::chat::{ChatTurn, Sender};
use daybook_backend::journal::{JournalDraft, JournalEntry, MediaKind};
use daybook_backend::summarize::SIGN_IN_NOTICE;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::api::{ApiClient, SendReply, SummaryReply};

const HELP: &str = "\
Type a message to chat, or one of:
  /summarize                 summarize today's snippets
  /journalize                summarize today and save it as an entry
  /write <text>              set the draft entry text
  /attach <image|video|audio> <uri>
  /save                      save the draft entry
  /entries                   list saved entries
  /history [n]               show the last n chat turns
  /follow                    print entries whenever they change
  /user <id>                 switch the signed-in user (blank signs out)
  /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(String),
    Summarize { save: bool },
    Write(String),
    Attach(MediaKind, String),
    Save,
    Entries,
    History(Option<usize>),
    Follow,
    User(Option<String>),
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let command = match name.to_ascii_lowercase().as_str() {
        "summarize" => Command::Summarize { save: false },
        "journalize" => Command::Summarize { save: true },
        "write" => Command::Write(args.to_string()),
        "attach" => {
            let (kind, uri) = args
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /attach <image|video|audio> <uri>".to_string())?;
            Command::Attach(kind.parse()?, uri.trim().to_string())
        }
        "save" => Command::Save,
        "entries" => Command::Entries,
        "history" if args.is_empty() => Command::History(None),
        "history" => Command::History(Some(
            args.parse()
                .map_err(|_| "usage: /history [count]".to_string())?,
        )),
        "follow" => Command::Follow,
        "user" => Command::User(Some(args.to_string()).filter(|id| !id.is_empty())),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '/{}'; try /help", other)),
    };
    Ok(Some(command))
}

fn render_turn(turn: &ChatTurn) -> String {
    let who = match turn.sender {
        Sender::User => "you",
        Sender::Assistant => "assistant",
    };
    format!("{}> {}", who, turn.text)
}

/// Lines to print for a chat reply. A discarded reply prints nothing.
fn render_send_reply(reply: &SendReply) -> Vec<String> {
    match reply.status.as_str() {
        "replied" | "failed" => reply.turn.iter().map(render_turn).collect(),
        "discarded" => vec!["(reply dropped: session closed)".to_string()],
        other => vec![format!("(unexpected reply status '{}')", other)],
    }
}

fn render_summary(outcome: &SummaryReply) -> String {
    match outcome.status.as_str() {
        "summary" => format!(
            "assistant> {}\n(from {} snippet{})",
            outcome.text.as_deref().unwrap_or_default(),
            outcome.snippet_count.unwrap_or(0),
            if outcome.snippet_count == Some(1) { "" } else { "s" }
        ),
        "no_snippets" => format!(
            "assistant> {}",
            outcome.notice.as_deref().unwrap_or("No snippets found for today.")
        ),
        "signed_out" => format!("assistant> {}", SIGN_IN_NOTICE),
        "failed" => format!(
            "assistant> Sorry, I couldn't summarize today's snippets: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
        other => format!("(unexpected summary status '{}')", other),
    }
}

fn render_entry(entry: &JournalEntry) -> String {
    let mut line = format!("[{} {}] {}", entry.date, entry.time, entry.text);
    for media in &entry.media {
        line.push_str(&format!(" <{:?} {}>", media.kind, media.uri));
    }
    if let Some(audio) = entry.audio_uri.as_deref() {
        line.push_str(&format!(" <audio {}>", audio));
    }
    line
}

/// Interactive loop over stdin. One backend session lives as long as the loop.
pub async fn run(mut api: ApiClient) -> Result<()> {
    let mut session_id = api.open_session().await?;
    tracing::debug!("Opened backend session {}", session_id);
    println!("{}", HELP);

    let mut draft = JournalDraft::default();
    let mut follower: Option<JoinHandle<()>> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };

        match command {
            Command::Quit => break,
            Command::Help => println!("{}", HELP),
            Command::Send(text) => match api.send_message(&session_id, &text).await {
                Ok(reply) => {
                    render_send_reply(&reply)
                        .iter()
                        .for_each(|line| println!("{}", line));
                    if let Some(error) = reply.error.as_deref() {
                        tracing::debug!("Assistant reply failed: {}", error);
                    }
                }
                Err(error) => println!("{:#}", error),
            },
            Command::Summarize { save } => match api.summarize(&session_id, save).await {
                Ok(response) => {
                    println!("{}", render_summary(&response.outcome));
                    if let Some(entry) = response.entry {
                        println!("Saved: {}", render_entry(&entry));
                    } else if save && response.outcome.status != "summary" {
                        println!("Nothing was saved.");
                    }
                }
                Err(error) => println!("{:#}", error),
            },
            Command::Write(text) => {
                draft.text = text;
                println!("Draft text set.");
            }
            Command::Attach(kind, uri) => {
                draft.add_media(kind, uri);
                println!(
                    "Draft has {} attachment(s){}.",
                    draft.media.len(),
                    if draft.audio_uri.is_some() { " and audio" } else { "" }
                );
            }
            Command::Save => match api.save_journal(&session_id, &draft).await {
                Ok(entry) => {
                    println!("Saved: {}", render_entry(&entry));
                    draft.clear();
                }
                Err(error) => println!("{:#}", error),
            },
            Command::Entries => match api.list_journals().await {
                Ok(entries) if entries.is_empty() => println!("No entries yet."),
                Ok(entries) => entries.iter().for_each(|entry| println!("{}", render_entry(entry))),
                Err(error) => println!("{:#}", error),
            },
            Command::History(limit) => match api.list_turns(&session_id, limit).await {
                Ok(turns) if turns.is_empty() => println!("No chat turns yet."),
                Ok(turns) => turns.iter().for_each(|turn| println!("{}", render_turn(turn))),
                Err(error) => println!("{:#}", error),
            },
            Command::Follow => {
                if let Some(task) = follower.take() {
                    task.abort();
                    println!("Stopped following entries.");
                } else {
                    follower = Some(spawn_follower(api.clone()));
                    println!("Following entries; /follow again to stop.");
                }
            }
            Command::User(user) => {
                api.set_user(user);
                if let Some(task) = follower.take() {
                    task.abort();
                }
                // A fresh session starts with the new identity and an empty chat log.
                if let Err(error) = api.close_session(&session_id).await {
                    tracing::warn!("Failed to close session {}: {:#}", session_id, error);
                }
                session_id = api.open_session().await?;
                println!("Signed in as {}.", api.user().unwrap_or("nobody"));
            }
        }
    }

    if let Some(task) = follower {
        task.abort();
    }
    api.close_session(&session_id).await
}

fn spawn_follower(api: ApiClient) -> JoinHandle<()> {
    let (tx, rx) = flume::unbounded::<Vec<JournalEntry>>();
    tokio::spawn(async move {
        let stream = tokio::spawn(api.stream_journals_forever(tx));
        while let Ok(entries) = rx.recv_async().await {
            println!("-- {} entr{} --", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
            entries.iter().for_each(|entry| println!("{}", render_entry(entry)));
        }
        stream.abort();
    })
}
