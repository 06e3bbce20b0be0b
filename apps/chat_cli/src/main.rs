use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{load_settings, ChatSession, ConversationSummary};
use shared::{
    domain::{AppActivity, ConversationId, UserId},
    protocol::{ClientFrame, InboundEvent},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Interactive client for the roommate chat backend")]
struct Args {
    /// Chat endpoint, e.g. wss://chat.example/ws. Falls back to chat.toml / CHAT_ADDRESS.
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    user_id: String,
    /// Conversation that plain input lines are sent to.
    #[arg(long)]
    conversation: String,
    /// The other participant of `--conversation`.
    #[arg(long)]
    peer: Option<String>,
    #[arg(long, default_value_t = 0)]
    unread: u32,
}

const HELP: &str =
    "commands: /read  /bg  /fg  /summaries  /quit  (anything else is sent as a message)";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings();
    let address = args
        .address
        .clone()
        .or_else(|| settings.default_address.clone())
        .ok_or_else(|| anyhow!("no chat address: pass --address or set CHAT_ADDRESS"))?;
    let user_id = UserId::new(args.user_id);
    let conversation_id = ConversationId::new(args.conversation);
    let peer = args.peer.map(UserId::new);

    let session = ChatSession::with_websocket(settings);
    session.status().replace_summaries(vec![ConversationSummary::new(
        conversation_id.clone(),
        peer.clone(),
    )
    .with_unread(args.unread)]);

    let (activity_tx, activity_rx) = watch::channel(AppActivity::Foreground);
    session.attach_app_lifecycle(activity_rx).await;
    session
        .connection()
        .set_on_reconnected(|| info!("chat: back in foreground, refresh missed messages here"))
        .await;

    let _printer = session.subscribe(|event: &InboundEvent| {
        match serde_json::to_string(event.payload()) {
            Ok(json) => println!("<< {json}"),
            Err(err) => println!("<< (unprintable event: {err})"),
        }
    });

    session.connect(&address, &user_id).await;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/read" => {
                let update = session
                    .mark_conversation_read(&conversation_id, &user_id)
                    .await;
                println!("marked {} read locally ({})", conversation_id, update.message);
            }
            "/bg" => {
                activity_tx.send_replace(AppActivity::Background);
            }
            "/fg" => {
                activity_tx.send_replace(AppActivity::Foreground);
            }
            "/summaries" => print_summaries(&session.summaries()),
            "/help" => println!("{HELP}"),
            text => {
                let frame = ClientFrame::message(
                    conversation_id.clone(),
                    user_id.clone(),
                    peer.clone(),
                    text,
                );
                session.send(&frame).await;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_summaries(summaries: &[ConversationSummary]) {
    for summary in summaries {
        let status = summary
            .last_message_status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "-".to_string());
        let origin = if summary.last_status_is_local {
            " (local)"
        } else {
            ""
        };
        println!(
            "{}  unread={}  last={}{}",
            summary.conversation_id, summary.unread_count, status, origin
        );
    }
}
