//! In-memory [`Store`] implementation for testing.
//!
//! Documents and messages live behind `std::sync::RwLock`s. Every message
//! mutation happens under a single write lock, which serializes version
//! numbering per store. Phrase search is a case-insensitive token sequence
//! match, ranked by occurrence count.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Document, DocumentSummary, Message, MessageStatus, MessageSummary, NewVersion, Segment,
    Version,
};

use super::{AppendRejected, Store};

#[derive(Default)]
struct Evidence {
    docs: Vec<Document>,
    segments: Vec<Segment>,
    working_set: Vec<String>,
}

#[derive(Default)]
struct Ledger {
    messages: Vec<Message>,
    versions: HashMap<String, Vec<Version>>,
}

/// In-memory store for tests and embedding in other tools.
pub struct InMemoryStore {
    evidence: RwLock<Evidence>,
    ledger: RwLock<Ledger>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            evidence: RwLock::new(Evidence::default()),
            ledger: RwLock::new(Ledger::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Lowercased alphanumeric tokens, the same split FTS5's default
/// tokenizer performs.
fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn phrase_occurrences(phrase: &[String], haystack: &[String]) -> usize {
    if phrase.is_empty() || phrase.len() > haystack.len() {
        return 0;
    }
    haystack
        .windows(phrase.len())
        .filter(|w| w.iter().zip(phrase).all(|(a, b)| a == b))
        .count()
}

fn build_version(message_id: &str, number: i64, v: &NewVersion) -> Version {
    Version {
        message_id: message_id.to_string(),
        version_number: number,
        instruction: v.instruction.clone(),
        text: v.text.clone(),
        claims: v.claims.clone(),
        dropped_claims: v.dropped_claims.clone(),
        source: v.source,
        created_at: now(),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document, segments: &[Segment]) -> Result<()> {
        let mut ev = self.evidence.write().map_err(poisoned)?;
        if ev.docs.iter().any(|d| d.id == doc.id) {
            bail!("document {} already exists", doc.id);
        }
        if let Some(ext) = &doc.external_id {
            if ev.docs.iter().any(|d| d.external_id.as_ref() == Some(ext)) {
                bail!("document with external id {} already exists", ext);
            }
        }
        ev.docs.push(doc.clone());
        ev.segments.extend(segments.iter().cloned());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let ev = self.evidence.read().map_err(poisoned)?;
        Ok(ev.docs.iter().find(|d| d.id == id).cloned())
    }

    async fn find_document_by_external_id(&self, external_id: &str) -> Result<Option<Document>> {
        let ev = self.evidence.read().map_err(poisoned)?;
        Ok(ev
            .docs
            .iter()
            .find(|d| d.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_document_by_hash(&self, dedup_hash: &str) -> Result<Option<Document>> {
        let ev = self.evidence.read().map_err(poisoned)?;
        Ok(ev.docs.iter().find(|d| d.dedup_hash == dedup_hash).cloned())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut ev = self.evidence.write().map_err(poisoned)?;
        let before = ev.docs.len();
        ev.docs.retain(|d| d.id != id);
        if ev.docs.len() == before {
            return Ok(false);
        }
        ev.segments.retain(|s| s.document_id != id);
        ev.working_set.retain(|d| d != id);
        Ok(true)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let ev = self.evidence.read().map_err(poisoned)?;
        Ok(ev
            .docs
            .iter()
            .map(|d| DocumentSummary {
                id: d.id.clone(),
                external_id: d.external_id.clone(),
                title: d.title.clone(),
                source: d.source.clone(),
                status: d.status,
                segment_count: ev.segments.iter().filter(|s| s.document_id == d.id).count()
                    as i64,
            })
            .collect())
    }

    async fn segments_by_ids(&self, ids: &[String]) -> Result<Vec<Segment>> {
        let ev = self.evidence.read().map_err(poisoned)?;
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(ev
            .segments
            .iter()
            .filter(|s| wanted.contains(s.id.as_str()))
            .cloned()
            .collect())
    }

    async fn phrase_search(
        &self,
        phrase: &str,
        document_ids: &[String],
        limit: i64,
    ) -> Result<Vec<Segment>> {
        let phrase_tokens = tokens(phrase);
        if phrase_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let ev = self.evidence.read().map_err(poisoned)?;
        let mut hits: Vec<(usize, &Segment)> = ev
            .segments
            .iter()
            .filter(|s| document_ids.contains(&s.document_id))
            .filter_map(|s| {
                let n = phrase_occurrences(&phrase_tokens, &tokens(&s.content));
                (n > 0).then_some((n, s))
            })
            .collect();
        hits.sort_by(|(na, a), (nb, b)| {
            nb.cmp(na)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        Ok(hits
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn segments_in_order(
        &self,
        document_ids: &[String],
        limit: i64,
    ) -> Result<Vec<Segment>> {
        let ev = self.evidence.read().map_err(poisoned)?;
        let mut segs: Vec<Segment> = ev
            .segments
            .iter()
            .filter(|s| document_ids.contains(&s.document_id))
            .cloned()
            .collect();
        segs.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        segs.truncate(limit.max(0) as usize);
        Ok(segs)
    }

    async fn add_to_working_set(&self, document_id: &str) -> Result<()> {
        let mut ev = self.evidence.write().map_err(poisoned)?;
        if !ev.docs.iter().any(|d| d.id == document_id) {
            bail!("unknown document {}", document_id);
        }
        if !ev.working_set.iter().any(|d| d == document_id) {
            ev.working_set.push(document_id.to_string());
        }
        Ok(())
    }

    async fn remove_from_working_set(&self, document_id: &str) -> Result<bool> {
        let mut ev = self.evidence.write().map_err(poisoned)?;
        let before = ev.working_set.len();
        ev.working_set.retain(|d| d != document_id);
        Ok(ev.working_set.len() != before)
    }

    async fn working_set(&self) -> Result<Vec<String>> {
        let ev = self.evidence.read().map_err(poisoned)?;
        Ok(ev.working_set.clone())
    }

    async fn create_message(&self, first: &NewVersion) -> Result<(Message, Version)> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;
        let ts = now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            status: MessageStatus::Draft,
            created_at: ts,
            updated_at: ts,
        };
        let version = build_version(&message.id, 1, first);
        ledger
            .versions
            .insert(message.id.clone(), vec![version.clone()]);
        ledger.messages.push(message.clone());
        Ok((message, version))
    }

    async fn append_version(&self, message_id: &str, version: &NewVersion) -> Result<Version> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;
        let ts = now();
        let message = ledger
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| AppendRejected::UnknownMessage(message_id.to_string()))?;
        if version.source.requires_draft() && message.status != MessageStatus::Draft {
            return Err(AppendRejected::Finalized(message_id.to_string()).into());
        }
        message.updated_at = ts;
        let history = ledger.versions.entry(message_id.to_string()).or_default();
        let next = history.last().map(|v| v.version_number).unwrap_or(0) + 1;
        let stored = build_version(message_id, next, version);
        history.push(stored.clone());
        Ok(stored)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn set_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> Result<Option<Message>> {
        let mut ledger = self.ledger.write().map_err(poisoned)?;
        Ok(ledger.messages.iter_mut().find(|m| m.id == id).map(|m| {
            m.status = status;
            m.updated_at = now();
            m.clone()
        }))
    }

    async fn latest_version(&self, message_id: &str) -> Result<Option<Version>> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger
            .versions
            .get(message_id)
            .and_then(|h| h.last())
            .cloned())
    }

    async fn versions(&self, message_id: &str) -> Result<Vec<Version>> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger.versions.get(message_id).cloned().unwrap_or_default())
    }

    async fn list_messages(&self) -> Result<Vec<MessageSummary>> {
        let ledger = self.ledger.read().map_err(poisoned)?;
        Ok(ledger
            .messages
            .iter()
            .filter_map(|m| {
                let latest = ledger.versions.get(&m.id)?.last()?.clone();
                Some(MessageSummary {
                    id: m.id.clone(),
                    status: m.status,
                    created_at: m.created_at,
                    updated_at: m.updated_at,
                    latest_version: latest,
                })
            })
            .collect())
    }
}
