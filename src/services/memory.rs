//! In-process conversation memory.
//!
//! Entries live in a `DashMap` keyed by conversation id, each conversation an
//! append-only list in arrival order. Nothing survives a restart.

use crate::error::MemoryError;
use crate::services::{MemoryEntry, MemoryStore, Role};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

/// Words shorter than this carry no signal for `relevant`.
const MIN_KEYWORD_LEN: usize = 3;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: DashMap<String, Vec<MemoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_id(session_id: &str) -> Result<(), MemoryError> {
    if session_id.trim().is_empty() {
        return Err(MemoryError::InvalidConversation(session_id.to_string()));
    }
    Ok(())
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn append(&self, session_id: &str, text: &str, role: Role) -> Result<MemoryEntry, MemoryError> {
        check_id(session_id)?;
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.conversations
            .entry(session_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        check_id(session_id)?;
        Ok(self
            .conversations
            .get(session_id)
            .map(|entries| {
                let skip = entries.len().saturating_sub(limit);
                entries[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    /// Rank entries by how many keywords they share with `query`; ties go to
    /// the newer entry.
    async fn relevant(&self, session_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        let wanted = keywords(query);
        if wanted.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let Some(entries) = self.conversations.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(usize, usize, &MemoryEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.text.trim() != query.trim())
            .map(|(position, entry)| (keywords(&entry.text).intersection(&wanted).count(), position, entry))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, entry)| entry.clone())
            .collect())
    }

    async fn clear(&self, session_id: &str) -> Result<usize, MemoryError> {
        check_id(session_id)?;
        Ok(self
            .conversations
            .remove(session_id)
            .map_or(0, |(_, entries)| entries.len()))
    }
}
