//! Domain allow/deny lists.
//!
//! Lists are keyed by id (`domains:<id>` in the store) and map a domain to
//! `white` or `black`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::data::{DomainListRef, ListMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMark {
    White,
    Black,
}

#[async_trait]
pub trait DomainListStore: Send + Sync {
    async fn lookup(&self, list_id: u64, domain: &str) -> Option<ListMark>;
}

/// Whether `domain` passes `list`. No list configured means allowed.
pub async fn domain_passes(store: &dyn DomainListStore, list: Option<DomainListRef>, domain: &str) -> bool {
    let Some(list) = list else {
        return true;
    };
    match list.mode {
        ListMode::White => store.lookup(list.id, domain).await == Some(ListMark::White),
        ListMode::Black => store.lookup(list.id, domain).await != Some(ListMark::Black),
        ListMode::Unspecified => true,
    }
}

type Lists = HashMap<u64, HashMap<String, ListMark>>;

/// Lists held in memory, loaded from `{"<id>": {"<domain>": "white"|"black"}}`.
#[derive(Default)]
pub struct InMemoryDomainLists {
    lists: RwLock<Lists>,
}

impl InMemoryDomainLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let lists: Lists = serde_json::from_slice(raw).context("Failed to parse domain lists")?;
        Ok(Self {
            lists: RwLock::new(lists),
        })
    }

    pub async fn load_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn insert(&self, list_id: u64, domain: impl Into<String>, mark: ListMark) {
        self.lists
            .write()
            .entry(list_id)
            .or_default()
            .insert(domain.into(), mark);
    }

    /// Swaps in a whole new set of lists.
    pub fn replace(&self, other: InMemoryDomainLists) {
        *self.lists.write() = other.lists.into_inner();
    }

    pub fn list_count(&self) -> usize {
        self.lists.read().len()
    }
}

#[async_trait]
impl DomainListStore for InMemoryDomainLists {
    async fn lookup(&self, list_id: u64, domain: &str) -> Option<ListMark> {
        self.lists
            .read()
            .get(&list_id)
            .and_then(|list| list.get(domain))
            .copied()
    }
}
