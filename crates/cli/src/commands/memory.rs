//! `tandem memory` — Memory management commands.

use clap::Subcommand;
use tandem_agent::RelevanceEngine;
use tandem_core::validate::check_importance;
use tandem_core::{MemoryCategory, MemoryItem, MemoryStore};

use super::CmdResult;

#[derive(Subcommand)]
pub enum MemoryAction {
    /// Remember something about an owner
    Add {
        owner_id: String,
        /// project, interest, challenge, insight, distraction, goal,
        /// preference, win or context
        #[arg(long)]
        category: String,
        #[arg(long)]
        content: String,
        /// 1 (trivia) to 5 (core)
        #[arg(long, default_value_t = 3)]
        importance: i64,
        #[arg(long, default_value = "manual")]
        source: String,
    },

    /// Change an existing memory in place
    Update {
        owner_id: String,
        memory_id: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        importance: Option<i64>,
    },

    /// List an owner's memories
    List {
        owner_id: String,
        #[arg(long)]
        category: Option<String>,
    },

    /// Show which memories a task would surface, with scores
    Relevant {
        owner_id: String,
        #[arg(long)]
        task: String,
    },

    /// Forget a memory
    Remove { owner_id: String, memory_id: String },
}

pub async fn run(action: MemoryAction) -> CmdResult {
    let config = super::load_config()?;
    let store = super::open_store(&config).await?;
    let limits = config.input_limits();

    match action {
        MemoryAction::Add {
            owner_id,
            category,
            content,
            importance,
            source,
        } => {
            let category: MemoryCategory = category.parse()?;
            limits.check_memory(&content)?;
            let importance = check_importance(importance)?;

            let item = store
                .add_memory(
                    MemoryItem::new(&owner_id, category, content.trim(), importance)
                        .with_source(source),
                )
                .await?;
            println!("✅ Remembered [{}] {}", item.category, item.id);
        }
        MemoryAction::Update {
            owner_id,
            memory_id,
            category,
            content,
            importance,
        } => {
            let mut item = store
                .list_memories(&owner_id)
                .await?
                .into_iter()
                .find(|m| m.id == memory_id)
                .ok_or_else(|| format!("No memory {memory_id} for owner {owner_id}"))?;

            if let Some(category) = category {
                item.category = category.parse()?;
            }
            if let Some(content) = content {
                limits.check_memory(&content)?;
                item.content = content.trim().to_string();
            }
            if let Some(importance) = importance {
                item.importance = check_importance(importance)?;
            }

            if store.update_memory(&owner_id, &item).await? {
                println!("✅ Updated {}", item.id);
            } else {
                return Err(format!("No memory {memory_id} for owner {owner_id}").into());
            }
        }
        MemoryAction::List { owner_id, category } => {
            let filter: Option<MemoryCategory> = category.map(|c| c.parse()).transpose()?;
            let items: Vec<_> = store
                .list_memories(&owner_id)
                .await?
                .into_iter()
                .filter(|m| filter.is_none_or(|c| m.category == c))
                .collect();

            if items.is_empty() {
                println!("No memories yet.");
            }
            for item in items {
                println!(
                    "  [{}] ({}★) {}  {}",
                    item.category, item.importance, item.content, item.id
                );
            }
        }
        MemoryAction::Relevant { owner_id, task } => {
            limits.check_task(&task)?;
            let engine = RelevanceEngine::new(config.context.relevance_top_k);
            let ranked = engine.relevant(store.as_ref(), &owner_id, &task).await?;

            if ranked.is_empty() {
                println!("Nothing relevant to \"{task}\" yet.");
            }
            for (i, scored) in ranked.iter().enumerate() {
                println!(
                    "  {:>2}. [{:.1}] [{}] {}",
                    i + 1,
                    scored.score,
                    scored.item.category,
                    scored.item.content
                );
            }
        }
        MemoryAction::Remove {
            owner_id,
            memory_id,
        } => {
            if store.delete_memory(&owner_id, &memory_id).await? {
                println!("🗑️  Removed {memory_id}");
            } else {
                return Err(format!("No memory {memory_id} for owner {owner_id}").into());
            }
        }
    }

    Ok(())
}
