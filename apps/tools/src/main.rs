use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, normalize_database_url},
    SyncEngine, TokioScheduler,
};
use shared::domain::{
    ChatMessage, EntityKind, FollowEdge, NewMutation, OperationKind, PostLike,
};
use storage::{MutationQueue, OptimisticWrite, Storage};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/sync.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queues a raw mutation without touching the local cache.
    Enqueue {
        entity_type: String,
        entity_id: String,
        operation: String,
        #[arg(default_value = "{}")]
        payload: String,
    },
    Follow {
        follower_id: String,
        following_id: String,
    },
    Unfollow {
        follower_id: String,
        following_id: String,
    },
    Like {
        user_id: String,
        post_id: String,
    },
    Unlike {
        user_id: String,
        post_id: String,
    },
    Message {
        chat_id: String,
        sender_id: String,
        content: String,
    },
    Pending,
    Counts,
    /// Drains the queue once against the configured API.
    SyncOnce {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    ResetStale {
        #[arg(long, default_value_t = 300)]
        older_than_secs: i64,
    },
    Purge {
        #[arg(long, default_value_t = 7)]
        older_than_days: i64,
    },
}

fn relationship(
    kind: EntityKind,
    entity_id: String,
    operation: OperationKind,
    write: OptimisticWrite,
) -> (OptimisticWrite, NewMutation) {
    (write, NewMutation::new(kind, entity_id, operation, "{}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();
    let storage = Storage::new(&normalize_database_url(&cli.database_url)).await?;

    let optimistic = match cli.command {
        Command::Enqueue {
            entity_type,
            entity_id,
            operation,
            payload,
        } => {
            let operation = operation
                .to_ascii_uppercase()
                .parse::<OperationKind>()
                .map_err(|err| anyhow!(err))?;
            serde_json::from_str::<serde_json::Value>(&payload)
                .map_err(|err| anyhow!("payload is not JSON: {err}"))?;
            let id = storage
                .enqueue(NewMutation::new(
                    EntityKind::from_tag(&entity_type),
                    entity_id,
                    operation,
                    payload,
                ))
                .await?;
            println!("queued mutation_id={id}");
            None
        }
        Command::Follow {
            follower_id,
            following_id,
        } => {
            let edge = FollowEdge::new(follower_id, following_id);
            Some(relationship(
                EntityKind::Follow,
                edge.entity_id(),
                OperationKind::Create,
                OptimisticWrite::Follow(edge),
            ))
        }
        Command::Unfollow {
            follower_id,
            following_id,
        } => {
            let edge = FollowEdge::new(follower_id, following_id);
            Some(relationship(
                EntityKind::Follow,
                edge.entity_id(),
                OperationKind::Delete,
                OptimisticWrite::Unfollow(edge),
            ))
        }
        Command::Like { user_id, post_id } => {
            let like = PostLike::new(user_id, post_id);
            Some(relationship(
                EntityKind::Like,
                like.entity_id(),
                OperationKind::Create,
                OptimisticWrite::Like(like),
            ))
        }
        Command::Unlike { user_id, post_id } => {
            let like = PostLike::new(user_id, post_id);
            Some(relationship(
                EntityKind::Like,
                like.entity_id(),
                OperationKind::Delete,
                OptimisticWrite::Unlike(like),
            ))
        }
        Command::Message {
            chat_id,
            sender_id,
            content,
        } => {
            let message = ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                chat_id,
                sender_id,
                content,
                media_url: None,
                sent_at: Utc::now(),
            };
            let mutation = NewMutation::new(
                EntityKind::ChatMessage,
                message.id.clone(),
                OperationKind::Create,
                serde_json::to_string(&message)?,
            );
            Some((OptimisticWrite::SendMessage(message), mutation))
        }
        Command::Pending => {
            for record in storage.pending_records().await? {
                println!(
                    "{}\t{}\t{}\t{}\tretries={}\t{}",
                    record.id,
                    record.entity_type,
                    record.entity_id,
                    record.operation,
                    record.retry_count,
                    record.created_at.to_rfc3339()
                );
            }
            None
        }
        Command::Counts => {
            let counts = storage.queue_counts().await?;
            println!(
                "pending={} in_progress={} completed={} failed={}",
                counts.pending, counts.in_progress, counts.completed, counts.failed
            );
            None
        }
        Command::SyncOnce { config } => {
            let settings = load_settings(config.as_deref())?;
            let engine = SyncEngine::build(
                &settings,
                storage.clone(),
                Arc::new(TokioScheduler::default()),
            )?;
            let report = engine.coordinator.sync_now().await?;
            println!(
                "examined={} completed={} retried={} failed={} recovered={}",
                report.examined, report.completed, report.retried, report.failed, report.recovered
            );
            if let Some(delay) = report.next_retry_in {
                println!("next retry in {}ms", delay.as_millis());
            }
            None
        }
        Command::ResetStale { older_than_secs } => {
            let reset = storage
                .reset_stale(Utc::now() - chrono::Duration::seconds(older_than_secs))
                .await?;
            println!("reset {reset} stale mutations");
            None
        }
        Command::Purge { older_than_days } => {
            let purged = storage
                .purge_terminal(Utc::now() - chrono::Duration::days(older_than_days))
                .await?;
            println!("purged {purged} terminal mutations");
            None
        }
    };

    if let Some((write, mutation)) = optimistic {
        let id = storage.apply_and_enqueue(write, mutation).await?;
        println!("applied locally and queued mutation_id={id}");
    }

    Ok(())
}
