//! Resilient batched playlist writer.
//!
//! Inserts target ids in chunks, filtering out ids already present, and
//! recovers from partial failures by binary-splitting the failed batch down
//! to single ids. A single id that still fails is reported, never retried
//! forever.

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::{CatalogError, TargetCatalog};
use super::rate_limit::TokenBucket;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Top-level chunk size.
    pub batch_size: usize,
    /// Pause between chunks and between split halves.
    pub sleep: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 60,
            sleep: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct WriteReport {
    /// Ids newly inserted by this run.
    pub inserted_count: usize,
    /// Ids that kept failing even as single-item batches.
    pub failed_ids: Vec<String>,
}

struct WriteState {
    existing: HashSet<String>,
    failed: Vec<String>,
    inserted: usize,
}

pub struct ResilientWriter {
    catalog: Arc<dyn TargetCatalog>,
    limiter: TokenBucket,
    config: WriterConfig,
}

impl ResilientWriter {
    pub fn new(catalog: Arc<dyn TargetCatalog>, limiter: TokenBucket, config: WriterConfig) -> Self {
        Self {
            catalog,
            limiter,
            config,
        }
    }

    /// Add `ids` to the playlist. Caller is expected to have de-duplicated
    /// the input; ids already present on the target are skipped anyway.
    pub async fn add_all(&self, playlist_id: &str, ids: &[String]) -> WriteReport {
        self.limiter.acquire().await;
        let existing = self.catalog.existing_items(playlist_id).await;
        let mut state = WriteState {
            existing,
            failed: Vec::new(),
            inserted: 0,
        };

        tracing::info!(
            playlist = %playlist_id,
            total = ids.len(),
            chunk = self.config.batch_size,
            "adding tracks in chunks"
        );
        for chunk in ids.chunks(self.config.batch_size.max(1)) {
            self.add_chunk(playlist_id, chunk.to_vec(), &mut state).await;
            tokio::time::sleep(self.config.sleep).await;
        }

        WriteReport {
            inserted_count: state.inserted,
            failed_ids: state.failed,
        }
    }

    fn add_chunk<'a>(
        &'a self,
        playlist_id: &'a str,
        chunk: Vec<String>,
        state: &'a mut WriteState,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let filtered: Vec<String> = chunk
                .into_iter()
                .filter(|id| !id.is_empty() && !state.existing.contains(id))
                .collect();
            if filtered.is_empty() {
                return;
            }

            self.limiter.acquire().await;
            match self.catalog.add_items(playlist_id, &filtered).await {
                Ok(outcome) if outcome.success => {
                    state.existing.extend(filtered.iter().cloned());
                    state.inserted += filtered.len();
                    tracing::info!(inserted = filtered.len(), "inserted items");
                    return;
                }
                Ok(outcome) => {
                    tracing::error!(
                        items = filtered.len(),
                        detail = outcome.detail.as_deref().unwrap_or(""),
                        "add returned non-success"
                    );
                }
                Err(CatalogError::Conflict { detail }) => {
                    tracing::warn!(
                        items = filtered.len(),
                        detail = %detail,
                        "conflict on insert, will split and retry"
                    );
                }
                Err(e) => {
                    tracing::error!(items = filtered.len(), error = %e, "unexpected insert error");
                }
            }

            if filtered.len() == 1 {
                state.failed.extend(filtered);
                return;
            }

            let mid = filtered.len() / 2;
            let (left, right) = filtered.split_at(mid);
            let (left, right) = (left.to_vec(), right.to_vec());
            self.add_chunk(playlist_id, left, state).await;
            tokio::time::sleep(self.config.sleep).await;
            self.add_chunk(playlist_id, right, state).await;
            tokio::time::sleep(self.config.sleep).await;
        })
    }
}

/// First-occurrence-stable de-duplication of `(target id, label)` pairs.
/// Returns the unique ids in order plus the labels of dropped duplicates.
pub fn dedupe_by_target_id(entries: &[(String, String)]) -> (Vec<String>, Vec<String>) {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicate_labels = Vec::new();
    for (id, label) in entries {
        if id.is_empty() {
            continue;
        }
        if seen.insert(id.as_str()) {
            unique.push(id.clone());
        } else {
            duplicate_labels.push(label.clone());
        }
    }
    (unique, duplicate_labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Candidate, Provider};
    use crate::services::catalog::{AddOutcome, PlaylistPrivacy};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Script {
        Ok,
        NonSuccess,
        Conflict,
        Transient,
    }

    struct ScriptedCatalog {
        /// Keyed by the comma-joined batch; unlisted batches succeed.
        scripts: HashMap<String, Script>,
        existing: HashSet<String>,
        existing_fails: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedCatalog {
        fn new() -> Self {
            Self {
                scripts: HashMap::new(),
                existing: HashSet::new(),
                existing_fails: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn script(mut self, batch: &[&str], script: Script) -> Self {
            self.scripts.insert(batch.join(","), script);
            self
        }

        fn with_existing(mut self, ids: &[&str]) -> Self {
            self.existing = ids.iter().map(|s| s.to_string()).collect();
            self
        }

        fn recorded_calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TargetCatalog for ScriptedCatalog {
        fn provider(&self) -> Provider {
            Provider::Tidal
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Candidate>, CatalogError> {
            Ok(Vec::new())
        }

        async fn create_playlist(
            &self,
            _title: &str,
            _description: &str,
            _privacy: PlaylistPrivacy,
        ) -> Result<String, CatalogError> {
            Ok("scripted-playlist".to_string())
        }

        async fn existing_items(&self, _playlist_id: &str) -> HashSet<String> {
            if self.existing_fails {
                return HashSet::new();
            }
            self.existing.clone()
        }

        async fn add_items(
            &self,
            _playlist_id: &str,
            ids: &[String],
        ) -> Result<AddOutcome, CatalogError> {
            self.calls.lock().unwrap().push(ids.to_vec());
            match self.scripts.get(&ids.join(",")).copied().unwrap_or(Script::Ok) {
                Script::Ok => Ok(AddOutcome::ok()),
                Script::NonSuccess => Ok(AddOutcome::non_success("STATUS_FAILED")),
                Script::Conflict => Err(CatalogError::Conflict {
                    detail: "409".to_string(),
                }),
                Script::Transient => Err(CatalogError::Transient {
                    provider: Provider::Tidal,
                    detail: "503".to_string(),
                }),
            }
        }
    }

    fn writer(catalog: Arc<ScriptedCatalog>) -> ResilientWriter {
        ResilientWriter::new(
            catalog,
            TokenBucket::new(10_000.0),
            WriterConfig {
                batch_size: 60,
                sleep: Duration::ZERO,
            },
        )
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_clean_insert_single_batch() {
        let catalog = Arc::new(ScriptedCatalog::new());
        let report = writer(catalog.clone()).add_all("p", &ids(&["a", "b", "c"])).await;
        assert_eq!(report.inserted_count, 3);
        assert!(report.failed_ids.is_empty());
        assert_eq!(catalog.recorded_calls(), vec![ids(&["a", "b", "c"])]);
    }

    #[tokio::test]
    async fn test_conflict_splits_and_recovers_everything() {
        // batch fails, each half succeeds
        let catalog = Arc::new(
            ScriptedCatalog::new().script(&["a", "b", "c", "d"], Script::Conflict),
        );
        let report = writer(catalog.clone())
            .add_all("p", &ids(&["a", "b", "c", "d"]))
            .await;

        assert_eq!(report.inserted_count, 4);
        assert!(report.failed_ids.is_empty());
        assert_eq!(
            catalog.recorded_calls(),
            vec![ids(&["a", "b", "c", "d"]), ids(&["a", "b"]), ids(&["c", "d"])]
        );
    }

    #[tokio::test]
    async fn test_persistent_single_conflict_enters_failed_ids() {
        let catalog = Arc::new(
            ScriptedCatalog::new()
                .script(&["a", "b", "c", "d"], Script::Conflict)
                .script(&["a", "b"], Script::Conflict)
                .script(&["b"], Script::Conflict),
        );
        let report = writer(catalog.clone())
            .add_all("p", &ids(&["a", "b", "c", "d"]))
            .await;

        assert_eq!(report.inserted_count, 3);
        assert_eq!(report.failed_ids, vec!["b".to_string()]);
        // left half retried before the right half, depth first
        assert_eq!(
            catalog.recorded_calls(),
            vec![
                ids(&["a", "b", "c", "d"]),
                ids(&["a", "b"]),
                ids(&["a"]),
                ids(&["b"]),
                ids(&["c", "d"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_success_status_splits_like_conflict() {
        let catalog = Arc::new(
            ScriptedCatalog::new()
                .script(&["a", "b"], Script::NonSuccess)
                .script(&["a"], Script::Transient),
        );
        let report = writer(catalog.clone()).add_all("p", &ids(&["a", "b"])).await;
        assert_eq!(report.inserted_count, 1);
        assert_eq!(report.failed_ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_ids_are_never_reinserted() {
        let catalog = Arc::new(ScriptedCatalog::new().with_existing(&["a", "c"]));
        let report = writer(catalog.clone())
            .add_all("p", &ids(&["a", "b", "c", "d"]))
            .await;

        assert_eq!(report.inserted_count, 2);
        assert!(report.failed_ids.is_empty());
        assert_eq!(catalog.recorded_calls(), vec![ids(&["b", "d"])]);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let catalog = Arc::new(ScriptedCatalog::new().with_existing(&["a", "b"]));
        let report = writer(catalog.clone()).add_all("p", &ids(&["a", "b"])).await;
        assert_eq!(report.inserted_count, 0);
        assert!(report.failed_ids.is_empty());
        assert!(catalog.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_ids_are_dropped() {
        let catalog = Arc::new(ScriptedCatalog::new());
        let report = writer(catalog.clone())
            .add_all("p", &ids(&["a", "", "b"]))
            .await;
        assert_eq!(report.inserted_count, 2);
        assert_eq!(catalog.recorded_calls(), vec![ids(&["a", "b"])]);
    }

    #[tokio::test]
    async fn test_chunking_respects_batch_size() {
        let catalog = Arc::new(ScriptedCatalog::new());
        let writer = ResilientWriter::new(
            catalog.clone(),
            TokenBucket::new(10_000.0),
            WriterConfig {
                batch_size: 2,
                sleep: Duration::ZERO,
            },
        );
        let report = writer.add_all("p", &ids(&["a", "b", "c", "d", "e"])).await;
        assert_eq!(report.inserted_count, 5);
        assert_eq!(
            catalog.recorded_calls(),
            vec![ids(&["a", "b"]), ids(&["c", "d"]), ids(&["e"])]
        );
    }

    #[tokio::test]
    async fn test_accounting_invariant_holds() {
        // unique inputs = 4, pre-existing = 1, one permanent failure
        let catalog = Arc::new(
            ScriptedCatalog::new()
                .with_existing(&["d"])
                .script(&["a", "b", "c"], Script::Conflict)
                .script(&["a"], Script::Conflict),
        );
        let input = ids(&["a", "b", "c", "d"]);
        let report = writer(catalog.clone()).add_all("p", &input).await;

        let pre_existing = 1;
        assert_eq!(
            report.inserted_count + report.failed_ids.len(),
            input.len() - pre_existing
        );
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence_order() {
        let entries = vec![
            ("t1".to_string(), "A — One".to_string()),
            ("t2".to_string(), "B — Two".to_string()),
            ("t1".to_string(), "C — One Again".to_string()),
            ("".to_string(), "D — Empty".to_string()),
            ("t3".to_string(), "E — Three".to_string()),
        ];
        let (unique, duplicates) = dedupe_by_target_id(&entries);
        assert_eq!(unique, vec!["t1", "t2", "t3"]);
        assert_eq!(duplicates, vec!["C — One Again".to_string()]);
    }

    #[test]
    fn test_dedupe_empty_input() {
        let (unique, duplicates) = dedupe_by_target_id(&[]);
        assert!(unique.is_empty());
        assert!(duplicates.is_empty());
    }
}
