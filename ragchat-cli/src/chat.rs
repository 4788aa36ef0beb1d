//! Interactive chat loop and streamed reply rendering

use anyhow::Result;
use chrono::Local;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use ragchat_client::{ChatEngine, ChatUpdate, IngestionMonitor};
use ragchat_core::session::{ChatMessage, Role, SourceResult, StreamState};
use ragchat_core::Error;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

/// Longest wait for any progress on a reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

pub fn print_message(message: &ChatMessage) {
    let time = message.timestamp.with_timezone(&Local).format("%H:%M");
    let label = match message.role {
        Role::User => style("you").cyan().bold(),
        Role::Assistant => style("assistant").green().bold(),
    };
    let suffix = match state_label(message) {
        Some(label) => format!(" {}", style(label).red()),
        None => String::new(),
    };
    println!("{} {} {}{}", style(time).dim(), label, message.content, suffix);
}

fn state_label(message: &ChatMessage) -> Option<&'static str> {
    match (message.stream_state, message.role) {
        (StreamState::Failed, Role::User) => Some("(no reply)"),
        (StreamState::Failed, Role::Assistant) => Some("(incomplete)"),
        _ => None,
    }
}

/// Shown after `ask` returns while the turn is still open on the engine
fn pending_reply_notice(busy: bool) -> Option<&'static str> {
    busy.then_some(
        "The reply is still in progress and new messages are refused until it ends. Use /reset to abandon it.",
    )
}

pub fn print_sources(sources: &[SourceResult]) {
    if sources.is_empty() {
        println!("{}", style("No sources for the last answer.").dim());
        return;
    }
    println!("{}", style("Sources:").bold());
    for (i, source) in sources.iter().enumerate() {
        let title = source.metadata.title.as_deref().unwrap_or(&source.article_id);
        let outlet = source
            .metadata
            .source
            .as_deref()
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        println!(
            "  [{}] {}{} {}",
            i + 1,
            title,
            outlet,
            style(format!("{:.0}%", source.score * 100.0)).dim()
        );
        if let Some(url) = &source.metadata.url {
            println!("      {}", style(url).dim().underlined());
        }
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        bar.set_style(template);
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Send one message and print the reply as it streams in
pub async fn ask(
    engine: &ChatEngine,
    updates: &mut broadcast::Receiver<ChatUpdate>,
    text: &str,
) -> Result<()> {
    // Drop notifications left over from earlier turns
    while updates.try_recv().is_ok() {}

    let before = engine.snapshot().messages.len();
    if let Err(e) = engine.send_message(text).await {
        match e {
            Error::Rejected(reason) => println!("{}", style(reason).yellow()),
            other => println!("{} {}", style("✗").red(), other.user_message()),
        }
        engine.take_error();
        return Ok(());
    }

    let waiting = spinner("Thinking...");
    let mut printed = 0usize;
    let mut started = false;

    loop {
        let snapshot = engine.snapshot();
        if let Some(reply) = snapshot
            .messages
            .get(before + 1)
            .filter(|m| m.role == Role::Assistant)
        {
            if !started {
                waiting.finish_and_clear();
                print!("{} ", style("assistant").green().bold());
                started = true;
            }
            if let Some(fresh) = reply.content.get(printed..) {
                print!("{}", fresh);
                std::io::stdout().flush()?;
            }
            printed = reply.content.len();
        }
        if !snapshot.busy {
            break;
        }

        match tokio::time::timeout(REPLY_TIMEOUT, updates.recv()).await {
            Err(_) => {
                waiting.finish_and_clear();
                println!("\n{}", style("Timed out waiting for the reply.").red());
                return Ok(());
            }
            Ok(Err(RecvError::Lagged(skipped))) => debug!(skipped, "render lagged behind updates"),
            Ok(Err(RecvError::Closed)) => break,
            Ok(Ok(ChatUpdate::Connection(_))) => {
                if let Some(notice) = engine.snapshot().notice {
                    waiting.println(format!("{}", style(notice).yellow()));
                }
            }
            Ok(Ok(_)) => {}
        }
    }

    waiting.finish_and_clear();
    if started {
        println!();
    }
    if let Some(error) = engine.take_error() {
        println!("{} {}", style("✗").red(), error.message);
        if let Some(detail) = error.detail {
            println!("  {}", style(detail).dim());
        }
    }
    Ok(())
}

fn print_help() {
    println!("{}", style("Commands:").bold());
    println!("  {}    show sources of the last answer", style("/sources").cyan());
    println!("  {}       show news ingestion status", style("/news").cyan());
    println!("  {}      clear this conversation", style("/clear").cyan());
    println!("  {}      start a new session", style("/reset").cyan());
    println!("  {}       leave", style("/quit").cyan());
}

/// Interactive session; returns when stdin closes or the user quits
pub async fn run_interactive(engine: &ChatEngine, monitor: Option<&IngestionMonitor>) -> Result<()> {
    let mut updates = engine.subscribe();

    println!("{}", style("ragchat").bold().cyan());
    println!("Ask about the news. Type {} for commands.\n", style("/help").cyan());

    let connecting = spinner("Connecting...");
    let started = engine.start().await;
    connecting.finish_and_clear();
    match started {
        Ok(session) => {
            debug!(session = %session.id, "chat session ready");
            for message in engine.snapshot().messages {
                print_message(&message);
            }
        }
        Err(e) => {
            engine.take_error();
            println!("{} {}", style("✗").red(), e.user_message());
            println!("Use {} to try again.", style("/reset").cyan());
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", style(">").cyan().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => print_help(),
            "/sources" => print_sources(&engine.snapshot().sources),
            "/news" => match monitor {
                Some(monitor) => match monitor.latest().await {
                    Some(status) => println!(
                        "{} articles, {}",
                        status.document_count,
                        status.summary(chrono::Utc::now())
                    ),
                    None => println!(
                        "{}",
                        style(monitor.last_error().await.unwrap_or_else(|| "No status yet".into()))
                            .dim()
                    ),
                },
                None => println!("{}", style("Ingestion status polling is disabled.").dim()),
            },
            "/clear" => match engine.clear_chat().await {
                Ok(()) => println!("{}", style("Conversation cleared.").green()),
                Err(e) => {
                    engine.take_error();
                    println!("{} {}", style("✗").red(), e.user_message());
                }
            },
            "/reset" => match engine.reset_session().await {
                Ok(session) => println!(
                    "{} {}",
                    style("New session").green(),
                    style(ragchat_core::utils::short_id(&session.id)).dim()
                ),
                Err(e) => {
                    engine.take_error();
                    println!("{} {}", style("✗").red(), e.user_message());
                }
            },
            command if command.starts_with('/') => {
                println!("Unknown command {}. Type /help.", style(command).yellow());
            }
            text => {
                ask(engine, &mut updates, text).await?;
                if let Some(notice) = pending_reply_notice(engine.is_busy()) {
                    println!("{}", style(notice).yellow());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_turns_are_labelled() {
        let user = ChatMessage::user("s1", "ping").with_state(StreamState::Failed);
        assert_eq!(state_label(&user), Some("(no reply)"));

        let reply = ChatMessage::assistant("m1", "s1", "po").with_state(StreamState::Failed);
        assert_eq!(state_label(&reply), Some("(incomplete)"));

        let done = ChatMessage::assistant("m2", "s1", "pong").with_state(StreamState::Complete);
        assert_eq!(state_label(&done), None);
    }

    #[test]
    fn test_pending_reply_points_to_reset() {
        assert!(pending_reply_notice(true).unwrap().contains("/reset"));
        assert!(pending_reply_notice(false).is_none());
    }
}
