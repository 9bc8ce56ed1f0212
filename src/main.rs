use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use feedsync::config::{Cli, Command, Config};
use feedsync::db::models::Post;
use feedsync::feed::Feed;
use feedsync::projection::FeedItem;
use feedsync::remote::HttpRemote;
use feedsync::store::FeedStore;
use feedsync::sync::{NewPost, PollEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli)?;
    std::fs::create_dir_all(&data_dir)?;
    tracing::debug!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;

    // Open the cache
    let store = FeedStore::open(config.db_path()?)?;

    let remote = HttpRemote::new(
        &config.remote.base_url,
        config.remote.auth_token.clone(),
        config.remote.timeout(),
    )?;
    let feed = Feed::new(store, Arc::new(remote), &config.feed);

    match cli.command {
        Command::Refresh => {
            let outcome = feed.refresh().await?;
            println!("Loaded {} posts", outcome.loaded);
        }
        Command::SyncAll => {
            let outcome = feed.sync_all().await?;
            println!("Synced {} posts", outcome.loaded);
        }
        Command::More { direction } => {
            let outcome = feed.load_more(direction.into()).await?;
            if outcome.end_of_pagination {
                println!("Loaded {} posts (end of feed)", outcome.loaded);
            } else {
                println!("Loaded {} posts", outcome.loaded);
            }
        }
        Command::Show => print_feed(&feed)?,
        Command::Like { id } => print_post(&feed.like(id).await?),
        Command::Unlike { id } => print_post(&feed.unlike(id).await?),
        Command::Delete { id } => {
            feed.delete(id).await?;
            println!("Deleted post {}", id);
        }
        Command::Post { text, attach } => {
            let mut draft = NewPost::text(text);
            if let Some(path) = attach {
                let bytes = tokio::fs::read(&path).await?;
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload".to_string());
                draft = draft.with_attachment(Bytes::from(bytes), filename);
            }
            print_post(&feed.create(draft).await?);
        }
        Command::Edit { id, text } => print_post(&feed.edit(id, text).await?),
        Command::Watch => watch(&feed).await?,
    }

    Ok(())
}

async fn watch(feed: &Feed) -> anyhow::Result<()> {
    let mut events = feed.poll_events();
    let poller = feed.spawn_poller();
    tracing::info!("Watching for newer posts; Ctrl-C to show them and exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(PollEvent::Buffered { fetched, total }) if fetched > 0 => {
                    println!("{} new posts ({} waiting)", fetched, total);
                }
                Ok(PollEvent::Failed(err)) => {
                    eprintln!("Poll failed ({}), retrying", err.code());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} poll events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    feed.shutdown();
    poller.await?;

    let merged = feed.flush_newer().await?;
    println!("Merged {} newer posts", merged);
    Ok(())
}

fn print_feed(feed: &Feed) -> anyhow::Result<()> {
    for item in feed.items() {
        match item? {
            FeedItem::Post(post) => print_post(&post),
            FeedItem::DateSeparator { bucket } => println!("── {} ──", bucket.label()),
            FeedItem::Filler { payload_ref, .. } => println!("   [{}]", payload_ref),
        }
    }
    Ok(())
}

fn print_post(post: &Post) {
    let marker = if post.is_placeholder() { "*" } else { " " };
    let heart = if post.liked_by_me { "♥" } else { "♡" };
    println!(
        "{}{:>6}  {}  {}  {} {}",
        marker,
        post.id,
        post.published_at.format("%Y-%m-%d %H:%M"),
        post.author,
        heart,
        post.like_count
    );
    println!("        {}", post.content);
    if let Some(attachment) = &post.attachment {
        println!("        [{}]", attachment.url);
    }
}
