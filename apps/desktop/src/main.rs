use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rest_api::HttpConsultApi;
use shared::domain::{ConversationId, UserId};
use sync_core::{transport::PushTransport, SyncClient, SyncEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let user_id = UserId(args.user_id);
    let api = Arc::new(HttpConsultApi::new(
        args.server_url.clone(),
        user_id,
        args.token.clone(),
    ));
    let transport = PushTransport::new(args.server_url);
    let client = SyncClient::new(api, transport, user_id);
    client.start(&args.token).await?;

    print_conversations(&client).await;
    println!("commands: /list, /open <conversation_id>, /quit; anything else sends to the open conversation");

    let printer = {
        let client = Arc::clone(&client);
        let mut events = client.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SyncEvent::MessagesUpdated { conversation_id } => {
                        if client.active_conversation().await == Some(conversation_id) {
                            print_messages(&client, conversation_id).await;
                        }
                    }
                    SyncEvent::UnreadChanged { total } => {
                        println!("* unread total: {total}");
                    }
                    SyncEvent::Connection { state, error } => match error {
                        Some(error) => println!("* connection {state:?}: {error}"),
                        None => println!("* connection {state:?}"),
                    },
                    SyncEvent::AuthRequired => {
                        println!("* session expired, log in again");
                    }
                    SyncEvent::Error(message) => println!("* {message}"),
                    _ => {}
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/list" => print_conversations(&client).await,
            _ if line.starts_with("/open ") => {
                match line.trim_start_matches("/open ").trim().parse::<i64>() {
                    Ok(id) => {
                        let conversation_id = ConversationId(id);
                        client.open_conversation(conversation_id).await?;
                        print_messages(&client, conversation_id).await;
                    }
                    Err(_) => println!("usage: /open <conversation_id>"),
                }
            }
            text => match client.active_conversation().await {
                Some(conversation_id) => {
                    if let Err(err) = client
                        .send_message(conversation_id, Some(text.to_string()), None)
                        .await
                    {
                        println!("* send failed: {err}");
                    }
                }
                None => println!("open a conversation first: /open <conversation_id>"),
            },
        }
    }

    printer.abort();
    client.shutdown().await;
    Ok(())
}

async fn print_conversations(client: &SyncClient) {
    println!("conversations:");
    for entry in client.conversation_list().await {
        let preview = entry.preview.as_deref().unwrap_or("");
        println!(
            "  [{}] {} (unread {}) {}",
            entry.conversation_id.0, entry.display_name, entry.unread, preview
        );
    }
}

async fn print_messages(client: &SyncClient, conversation_id: ConversationId) {
    for run in client.grouped_messages(conversation_id).await {
        println!("-- user {}:", run.sender_id.0);
        for message in run.messages {
            let body = if message.recalled_for_everyone {
                "(message recalled)".to_string()
            } else {
                message.body.unwrap_or_else(|| "[image]".to_string())
            };
            println!("   {} {}", message.sent_at.format("%H:%M"), body);
        }
    }
}
