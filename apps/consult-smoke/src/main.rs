use std::env;
use std::sync::Arc;

use consult_client::{ConsultApi, ConsultBackend, ConversationDirectory, InMemoryBackend};
use consult_core::{ConversationSummary, MessageDraft, RosterFilter};
use tracing::info;

mod logging;

#[tokio::main]
async fn main() {
    logging::init();
    info!("consult smoke starting");

    match (env::var("CONSULT_API_URL"), env::var("CONSULT_TOKEN")) {
        (Ok(api_url), Ok(token)) => live_smoke(&api_url, &token).await,
        _ => {
            println!("CONSULT_API_URL and CONSULT_TOKEN not set; running the offline demo.");
            println!("Set both (plus CONSULT_WS_URL for the push channel) for a live smoke.");
            offline_smoke().await;
        }
    }
}

async fn live_smoke(api_url: &str, token: &str) {
    let api = match ConsultApi::new(api_url, token) {
        Ok(api) => api,
        Err(err) => {
            eprintln!("Invalid CONSULT_API_URL: {err}");
            std::process::exit(1);
        }
    };
    match api.list_conversations(true).await {
        Ok(conversations) => {
            println!("REST collaborator reachable: {} conversations.", conversations.len());
            for summary in conversations.iter().take(5) {
                println!(
                    "  case {} (unread {})",
                    summary.case_id, summary.unread_count
                );
            }
        }
        Err(err) => {
            eprintln!("Conversation list fetch failed: {err}");
            std::process::exit(1);
        }
    }
    match api.total_unread().await {
        Ok(total) => println!("Server-side total unread: {total}."),
        Err(err) => eprintln!("Unread total fetch failed: {err}"),
    }
}

async fn offline_smoke() {
    let backend = Arc::new(InMemoryBackend::default());
    backend.seed_conversation(ConversationSummary {
        id: Some("c-demo".to_owned()),
        case_id: "case-demo".to_owned(),
        participant_ids: vec!["u-doctor".to_owned(), "u-patient".to_owned()],
        last_message_preview: Some("Lab results attached".to_owned()),
        last_activity_ms: 1_000,
        unread_count: 2,
        archived: false,
        is_new: false,
    });

    let mut directory = ConversationDirectory::new(backend.clone());
    match directory.refresh().await {
        Ok(count) => println!("In-memory roster loaded: {count} conversation(s)."),
        Err(err) => {
            eprintln!("Roster refresh failed: {err}");
            std::process::exit(1);
        }
    }
    for summary in directory.list(&RosterFilter::default()).await.unwrap_or_default() {
        println!(
            "  case {} (unread {})",
            summary.case_id, summary.unread_count
        );
    }
    println!("Total unread: {}.", directory.total_unread());

    let request = consult_client::SendRequest {
        conversation_id: Some("c-demo".to_owned()),
        case_id: "case-demo".to_owned(),
        draft: MessageDraft::text("u-patient", "Please review the latest labs."),
        client_ref: "smoke-1".to_owned(),
    };
    match backend.send_message(&request).await {
        Ok(confirmed) => println!("Demo send confirmed as {}.", confirmed.id),
        Err(err) => eprintln!("Demo send failed: {err}"),
    }
}
