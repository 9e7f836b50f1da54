//! Demo command implementation.
//!
//! Plays a short scripted conversation between two participants sharing one
//! in-memory backend, including a dropped connection, then prints the
//! conversation as the second participant sees it.

use anyhow::{Context, Result};
use convo_sync_client::{
    AttachmentUpload, ConversationEngine, Draft, EngineConfig, MemoryBackend, MemoryBlobStore,
};
use convo_sync_core::FeedState;
use convo_sync_types::{Channel, ChannelId, Message, MessageBody, MessageId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type DemoEngine = ConversationEngine<MemoryBackend, MemoryBlobStore>;

const CHANNEL: &str = "general";
const SETTLE: Duration = Duration::from_millis(50);

/// What the observing participant ended up with.
#[derive(Debug)]
pub struct DemoReport {
    /// One rendered line per visible message, in order.
    pub lines: Vec<String>,
    /// Rendered pinned message, if any.
    pub pinned: Option<String>,
    /// Subscription state when the script finished.
    pub feed: FeedState,
}

/// A participant with its running event loop and poller.
struct Participant {
    engine: Arc<DemoEngine>,
    event_loop: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl Participant {
    async fn join(backend: &MemoryBackend, user: &str, config: &EngineConfig) -> Result<Self> {
        let engine = Arc::new(ConversationEngine::new(
            ChannelId::new(CHANNEL),
            UserId::new(user),
            config.clone(),
            Arc::new(backend.connect_as(UserId::new(user))),
            Arc::new(MemoryBlobStore::new()),
        ));
        engine
            .open()
            .await
            .with_context(|| format!("{} could not open #{}", user, CHANNEL))?;
        let event_loop = Arc::clone(&engine).spawn_loop();
        let poller = Arc::clone(&engine).spawn_poller();
        tracing::info!("{} joined #{}", user, CHANNEL);
        Ok(Self {
            engine,
            event_loop,
            poller,
        })
    }

    async fn leave(self) -> Result<()> {
        self.engine.close().await;
        self.poller.abort();
        self.event_loop.await.context("Event loop panicked")?;
        tracing::info!("{} left #{}", self.engine.user_id(), CHANNEL);
        Ok(())
    }
}

/// Run the demo and print the result.
pub async fn run(config: EngineConfig, quiet: bool) -> Result<()> {
    let report = play(config, !quiet).await?;

    println!();
    println!("=== #{} as seen by bob ===", CHANNEL);
    println!();
    for line in &report.lines {
        println!("  {}", line);
    }
    println!();
    match &report.pinned {
        Some(pinned) => println!("Pinned: {}", pinned),
        None => println!("Pinned: (none)"),
    }
    println!("Feed:   {:?}", report.feed);

    Ok(())
}

/// Play the scripted conversation and return bob's final view.
pub async fn play(config: EngineConfig, verbose: bool) -> Result<DemoReport> {
    let step = |text: &str| {
        if verbose {
            println!("-> {}", text);
        }
    };

    let backend = MemoryBackend::new();
    backend
        .seed_channel(&Channel {
            id: ChannelId::new(CHANNEL),
            name: "General".into(),
            description: Some("Team chat".into()),
            owner_id: Some(UserId::new("alice")),
            pinned_message_id: None,
            member_count: 2,
            restricted: false,
        })
        .context("Failed to seed channel")?;

    let alice = Participant::join(&backend, "alice", &config).await?;
    let bob = Participant::join(&backend, "bob", &config).await?;
    step("alice and bob joined #general");

    let welcome = first_id(alice.engine.send(Draft::text("Welcome to #general")).await?)?;
    step("alice: Welcome to #general");

    bob.engine.send(Draft::text("Glad to be here")).await?;
    step("bob: Glad to be here");

    let notes = Draft::text("Release notes")
        .attach(AttachmentUpload::new(
            "notes.txt",
            "text/plain",
            b"v0.1.0: first release".to_vec(),
        ))
        .attach(AttachmentUpload::new(
            "diagram.png",
            "image/png",
            vec![0x89, b'P', b'N', b'G'],
        ));
    let receipt = alice.engine.send(notes).await?;
    step(&format!(
        "alice posted {} attachments as one batch",
        receipt.message_ids.len()
    ));

    settle().await;
    bob.engine.toggle_reaction(&welcome, "👍").await?;
    alice.engine.toggle_reaction(&welcome, "🎉").await?;
    step("bob reacted 👍, alice reacted 🎉");

    alice.engine.pin(&welcome).await?;
    step("alice pinned the welcome message");

    let typo = first_id(bob.engine.send(Draft::text("teh build is green")).await?)?;
    bob.engine.delete_message(&typo).await?;
    step("bob sent a typo and deleted it");

    backend.set_online(false);
    step("connection dropped");
    alice
        .engine
        .send(Draft::text("Posted while the push feed was down"))
        .await?;
    step("alice: Posted while the push feed was down");
    settle().await;
    backend.set_online(true);
    step("connection restored");

    settle().await;
    settle().await;

    let report = report_for(&bob.engine).await;

    alice.leave().await?;
    bob.leave().await?;

    Ok(report)
}

async fn report_for(engine: &DemoEngine) -> DemoReport {
    let mut lines = Vec::new();
    for message in engine.snapshot().await {
        let reactions = engine.grouped_reactions(&message.id).await;
        let mut line = describe(&message);
        for (emoji, summary) in reactions {
            line.push_str(&format!("  {} {}", emoji, summary.count));
        }
        lines.push(line);
    }

    DemoReport {
        lines,
        pinned: engine.pinned().await.map(|message| describe(&message)),
        feed: engine.feed_state().await,
    }
}

/// Render one message as a single line.
fn describe(message: &Message) -> String {
    let batch = if message.is_batched() { " [batch]" } else { "" };
    let body = match &message.body {
        MessageBody::Text { content } => content.clone(),
        MessageBody::Attachment {
            caption,
            attachment,
        } => match caption {
            Some(caption) => format!(
                "{} <{} {}>",
                caption, attachment.name, attachment.mime_type
            ),
            None => format!("<{} {}>", attachment.name, attachment.mime_type),
        },
        MessageBody::Tombstone => "(message deleted)".to_string(),
    };
    format!("{:>6}: {}{}", message.author_id.as_str(), body, batch)
}

fn first_id(receipt: convo_sync_client::SendReceipt) -> Result<MessageId> {
    receipt
        .message_ids
        .into_iter()
        .next()
        .context("Send produced no messages")
}

async fn settle() {
    tokio::time::sleep(SETTLE).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_sync_types::Timestamp;

    #[tokio::test]
    async fn demo_converges_for_observer() {
        let report = play(EngineConfig::default(), false).await.unwrap();

        assert_eq!(report.lines.len(), 6);
        assert!(report.lines[0].contains("Welcome to #general"));
        assert!(report.lines[0].contains("👍 1"));
        assert!(report.lines[0].contains("🎉 1"));
        assert!(report.lines[2].contains("Release notes <notes.txt text/plain> [batch]"));
        assert!(report.lines[3].contains("<diagram.png image/png> [batch]"));
        assert!(report.lines[4].contains("(message deleted)"));
        assert!(report.lines[5].contains("Posted while the push feed was down"));
        assert_eq!(report.feed, FeedState::Live);
    }

    #[tokio::test]
    async fn demo_observer_sees_pin() {
        let report = play(EngineConfig::default(), false).await.unwrap();

        let pinned = report.pinned.unwrap();
        assert!(pinned.contains("alice"));
        assert!(pinned.contains("Welcome to #general"));
    }

    #[tokio::test]
    async fn run_prints_without_error() {
        run(EngineConfig::default(), true).await.unwrap();
    }

    #[test]
    fn describe_renders_each_body() {
        let text = Message::text(
            MessageId::new("m1"),
            ChannelId::new(CHANNEL),
            UserId::new("bob"),
            "hi",
            Timestamp::new(1),
        );
        assert_eq!(describe(&text), "   bob: hi");

        let tombstone = text.clone().into_tombstone();
        assert_eq!(describe(&tombstone), "   bob: (message deleted)");
    }
}
