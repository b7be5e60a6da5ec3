//! Search the directory from a terminal.
//!
//! # Usage
//!
//! ```bash
//! # Log in once; the credential is persisted under $SEMKI_STATE_DIR
//! semki-search --email ada@example.com --password hunter2 --organization acme backend engineer
//!
//! # Filter by team and cap the result count
//! semki-search --teams t1,t2 --limit 5 "rust developer in Lisbon"
//!
//! # List past chats, then replay one without searching again
//! semki-search --history
//! semki-search --chat 65f0c0ffee
//! ```
//!
//! Ctrl-C cancels a search in flight; results received so far are still printed.

use std::sync::Arc;

use arrrg::CommandLine;
use tracing_subscriber::EnvFilter;

use semki::{
    CredentialStore, FileCredentialStorage, Gateway, LocationTracker, LoginRequest, SearchArgs,
    SearchResult, SearchSession, SessionSnapshot, StreamState,
};

const USAGE: &str = "semki-search [OPTIONS] QUERY...";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (args, free) = SearchArgs::from_command_line_relaxed(USAGE);
    let config = args.client_config();
    let storage = FileCredentialStorage::new(&config.storage_dir, &config.storage_namespace);
    let credentials = CredentialStore::open(Arc::new(storage));
    let location = Arc::new(LocationTracker::new("/search"));
    let gateway = Gateway::connect(config.clone(), credentials, location.clone())?;

    if args.logout {
        gateway.logout().await;
        println!("Logged out.");
        return Ok(());
    }

    if let (Some(email), Some(password)) = (&args.email, &args.password) {
        let organization = args.organization.clone().unwrap_or_default();
        gateway
            .login(&LoginRequest::new(email, password, organization))
            .await?;
    }
    if !gateway.credentials().is_authenticated() {
        eprintln!("Not logged in. Pass --email, --password and --organization.");
        std::process::exit(2);
    }

    if args.history {
        let mut cursor: Option<String> = None;
        loop {
            let page = gateway.chat_history(cursor.as_deref()).await?;
            for chat in &page.chats {
                println!("{}  {}", chat.id, chat.title);
            }
            match page.next_cursor {
                Some(next) if !page.chats.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        return Ok(());
    }

    let session = SearchSession::new(gateway);
    if let Some(chat_id) = &args.chat {
        session.replay(chat_id).await?;
        print_snapshot(&session.snapshot());
        return Ok(());
    }

    let query = free.join(" ");
    if query.trim().is_empty() {
        eprintln!("USAGE: {USAGE}");
        std::process::exit(2);
    }

    let interrupted = session.clone();
    ctrlc::set_handler(move || interrupted.cancel())?;

    let filters = args.filters(config.result_limit);
    if session.start(&query, filters).await == StreamState::Streaming {
        let mut updates = session.subscribe();
        let mut shown = 0;
        loop {
            {
                let snapshot = updates.borrow_and_update();
                for result in snapshot.results.iter().skip(shown) {
                    print_result(result);
                }
                shown = snapshot.results.len();
                if snapshot.state != StreamState::Streaming {
                    break;
                }
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
    }

    let snapshot = session.wait().await;
    println!();
    print_snapshot(&snapshot);
    if location.redirects() > 0 {
        eprintln!("Session expired. Log in again.");
    }
    if snapshot.state == StreamState::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_result(result: &SearchResult) {
    let user = &result.user;
    println!("{:>6.3}  {}  {}", result.score, user.name, user.email);
    if !result.description.is_empty() {
        println!("        {}", result.description);
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    if let Some(chat) = &snapshot.chat {
        println!(
            "chat {} \"{}\"",
            chat.chat_id.as_deref().unwrap_or("(draft)"),
            chat.query
        );
    }
    println!("{:?}: {} result(s)", snapshot.state, snapshot.results.len());
    for result in snapshot.ranked() {
        print_result(&result);
    }
    if let Some(message) = &snapshot.message {
        println!("{message}");
    }
}
