use std::sync::Arc;

use anyhow::{bail, Result};
use chat_core::{ChatSession, ClientEvent, SessionConfig, WsEventChannel};
use clap::Parser;
use shared::domain::{ChatMessage, Role, UserId};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: String,
    /// The user on the other side of the mentoring chat.
    #[arg(long)]
    partner_id: String,
    /// Either "mentor" or "student".
    #[arg(long, default_value = "mentor")]
    role: String,
    /// Optional message to send once the session is active.
    #[arg(long)]
    message: Option<String>,
}

fn print_message(message: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.sender_id,
        message.content
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let role = match args.role.as_str() {
        "mentor" => Role::Mentor,
        "student" => Role::Student,
        other => bail!("unknown role: {other} (expected mentor or student)"),
    };

    let channel = Arc::new(WsEventChannel::new(&args.server_url)?);
    let session = ChatSession::new(
        SessionConfig {
            base_url: args.server_url,
            user_id: UserId::new(args.user_id),
            role,
        },
        channel,
    );
    session.on_message(print_message);
    let mut events = session.subscribe_events();

    let chat_id = session.resolve(UserId::new(args.partner_id)).await?;
    println!("Chat session active: {chat_id}");

    for section in session.snapshot().await.days {
        println!("--- {}", section.day);
        for message in &section.messages {
            print_message(message);
        }
    }

    if let Some(message) = args.message {
        let message_id = session.send(&message).await?;
        println!("Sent message {message_id}");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::ConnectionChanged(state)) => println!("Connection: {state:?}"),
                Ok(ClientEvent::MessageUpdated { message_id, status }) => {
                    println!("Message {message_id} is now {status:?}");
                }
                Ok(ClientEvent::SessionEnded { ended_by }) => {
                    println!("Session ended by {ended_by}");
                    return Ok(());
                }
                Ok(ClientEvent::Error(message)) => eprintln!("Error: {message}"),
                Ok(ClientEvent::MessageAccepted(_)) => {}
                Err(_) => break,
            },
        }
    }

    session.end().await?;
    Ok(())
}
