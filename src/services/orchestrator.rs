//! Job orchestration: a stage queue drained by a pool of background
//! workers, with every transition guarded by the store's FSM preconditions.
//!
//! Delivery is at-least-once; a stage that finds its job in the wrong state
//! refuses to run instead of double-executing.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::TransferSettings;
use crate::error::AppError;
use crate::models::{
    Classification, DuplicateReport, ImportItem, ImportReport, JobStage, JobState, MissedReport,
    Provider, SourceTrack,
};
use crate::services::catalog::{
    CredentialSink, PlaylistPrivacy, QobuzCatalog, SourceCatalog, SpotifyCatalog, TargetCatalog,
    TidalCatalog, YtmCatalog,
};
use crate::services::matching::match_track;
use crate::services::rate_limit::TokenBucket;
use crate::services::searcher::{ParallelSearcher, SearchSlot};
use crate::services::store::{JobStore, NewItem};
use crate::services::writer::{dedupe_by_target_id, ResilientWriter, WriteReport};

const DEFAULT_PLAYLIST_TITLE: &str = "Imported Playlist";
const PLAYLIST_DESCRIPTION: &str = "Migrated with Playlist Transfer";

#[derive(Debug, Clone, Copy)]
pub struct StageTask {
    pub job_id: Uuid,
    pub stage: JobStage,
}

/// Handle for enqueueing pipeline stages.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<StageTask>,
}

impl JobQueue {
    pub fn enqueue(&self, job_id: Uuid, stage: JobStage) {
        let task = StageTask { job_id, stage };
        if self.tx.send(task).is_err() {
            tracing::error!(%job_id, %stage, "job queue is closed, task dropped");
        }
    }
}

/// Persists rotated credentials through the store, inside the same
/// transaction boundary the connection upsert uses.
struct StoreCredentialSink {
    store: JobStore,
    user_id: Uuid,
}

#[async_trait]
impl CredentialSink for StoreCredentialSink {
    async fn credentials_rotated(
        &self,
        provider: Provider,
        credentials: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.store
            .upsert_connection(self.user_id, provider, credentials)
            .await
            .context("persisting rotated credentials")?;
        tracing::info!(user_id = %self.user_id, %provider, "persisted rotated credentials");
        Ok(())
    }
}

pub struct Orchestrator {
    store: JobStore,
    settings: TransferSettings,
}

/// Spawn the worker pool and return the queue handle.
pub fn start_workers(store: JobStore, settings: TransferSettings) -> JobQueue {
    let (tx, rx) = mpsc::unbounded_channel::<StageTask>();
    let rx = Arc::new(Mutex::new(rx));

    for worker_id in 0..settings.import_workers.max(1) {
        let rx = rx.clone();
        let orchestrator = Orchestrator {
            store: store.clone(),
            settings: settings.clone(),
        };
        tokio::spawn(async move {
            // One limiter per worker: all catalog calls this worker issues
            // share the same bucket.
            let limiter = TokenBucket::new(orchestrator.settings.qps);
            tracing::info!(worker_id, "import worker started");
            loop {
                let task = { rx.lock().await.recv().await };
                let Some(task) = task else {
                    tracing::info!(worker_id, "job queue closed, worker stopping");
                    break;
                };
                orchestrator.run_stage(task, &limiter).await;
            }
        });
    }

    JobQueue { tx }
}

impl Orchestrator {
    async fn run_stage(&self, task: StageTask, limiter: &TokenBucket) {
        tracing::info!(job_id = %task.job_id, stage = %task.stage, "dequeued stage");
        let result = match task.stage {
            JobStage::Match => self.run_match(task.job_id, limiter).await,
            JobStage::Finalize => self.run_finalize(task.job_id, limiter).await,
        };
        if let Err(e) = result {
            let reason = format!("{:#}", e);
            tracing::error!(job_id = %task.job_id, stage = %task.stage, error = %reason, "stage failed");
            if let Err(persist_err) = self.store.fail_job(task.job_id, &reason).await {
                tracing::error!(job_id = %task.job_id, error = %persist_err, "could not persist failure");
            }
        }
    }

    async fn run_match(&self, job_id: Uuid, limiter: &TokenBucket) -> anyhow::Result<()> {
        let Some(job) = self.store.job(job_id).await? else {
            tracing::warn!(%job_id, "match stage for unknown job");
            return Ok(());
        };
        // State guard: refuse duplicate deliveries and canceled jobs.
        if !self
            .store
            .transition(job_id, JobState::Queued, JobState::Running)
            .await?
        {
            tracing::warn!(%job_id, state = %job.state, "refusing match stage, job not queued");
            return Ok(());
        }

        let source = self.source_catalog(job.user_id).await?;
        let playlist = source
            .enumerate_playlist(&job.source_playlist_id)
            .await
            .context("enumerating source playlist")?;
        if job.source_playlist_name.is_none() && !playlist.name.is_empty() {
            self.store.set_playlist_name(job_id, &playlist.name).await?;
        }

        let target = self
            .target_catalog(job.user_id, job.target_provider)
            .await?;
        let searcher = ParallelSearcher::new(
            target,
            limiter.clone(),
            self.settings.searcher_config(),
        );
        let outcome = searcher
            .resolve_all(&playlist.tracks)
            .await
            .context("searching the target catalog")?;

        let items = build_items(&playlist.tracks, &outcome.slots);
        self.store.insert_items(job_id, &items).await?;

        if !self
            .store
            .transition(job_id, JobState::Running, JobState::WaitingReview)
            .await?
        {
            tracing::warn!(%job_id, "job left RUNNING while matching, results kept but state unchanged");
            return Ok(());
        }
        tracing::info!(
            %job_id,
            tracks = playlist.tracks.len(),
            found = outcome.found,
            "matching complete, waiting for review"
        );
        Ok(())
    }

    async fn run_finalize(&self, job_id: Uuid, limiter: &TokenBucket) -> anyhow::Result<()> {
        let Some(job) = self.store.job(job_id).await? else {
            tracing::warn!(%job_id, "finalize stage for unknown job");
            return Ok(());
        };
        if job.state != JobState::Importing {
            tracing::warn!(%job_id, state = %job.state, "refusing finalize stage, job not importing");
            return Ok(());
        }

        let matched = self.store.matched_items(job_id).await?;
        let entries: Vec<(String, String)> = matched
            .iter()
            .filter_map(|item| {
                item.selected_target_id
                    .clone()
                    .map(|id| (id, item.source_track.label()))
            })
            .collect();
        let (unique_ids, duplicate_labels) = dedupe_by_target_id(&entries);

        if unique_ids.is_empty() {
            tracing::warn!(%job_id, "no matched tracks to import");
            self.store.complete_job(job_id, None, None).await?;
            return Ok(());
        }

        let target = self
            .target_catalog(job.user_id, job.target_provider)
            .await?;

        let playlist_id = match &job.target_playlist_id {
            Some(existing) => existing.clone(),
            None => {
                let title = job
                    .source_playlist_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| DEFAULT_PLAYLIST_TITLE.to_string());
                limiter.acquire().await;
                let created = target
                    .create_playlist(&title, PLAYLIST_DESCRIPTION, PlaylistPrivacy::Private)
                    .await
                    .context("creating target playlist")?;
                self.store.set_target_playlist(job_id, &created).await?;
                tokio::time::sleep(self.settings.post_create_sleep).await;
                created
            }
        };

        let writer = ResilientWriter::new(
            target,
            limiter.clone(),
            self.settings.writer_config(),
        );
        let write_report = writer.add_all(&playlist_id, &unique_ids).await;

        let all_items = self.store.items_for_job(job_id).await?;
        let report = build_report(
            &playlist_id,
            &all_items,
            &entries,
            duplicate_labels,
            &write_report,
        );

        if !self
            .store
            .complete_job(job_id, Some(&playlist_id), Some(&report))
            .await?
        {
            tracing::warn!(%job_id, "job left IMPORTING during finalize, playlist may exist partially");
            return Ok(());
        }
        tracing::info!(
            %job_id,
            playlist = %playlist_id,
            inserted = report.inserted_count,
            missed = report.missed.count,
            "finalize complete"
        );
        Ok(())
    }

    async fn source_catalog(&self, user_id: Uuid) -> anyhow::Result<Arc<dyn SourceCatalog>> {
        Ok(build_source_catalog(&self.store, user_id).await?)
    }

    async fn target_catalog(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> anyhow::Result<Arc<dyn TargetCatalog>> {
        Ok(build_target_catalog(&self.store, user_id, provider).await?)
    }
}

/// Construct the Spotify read adapter for a user, wired to persist rotated
/// credentials back through the store.
pub async fn build_source_catalog(
    store: &JobStore,
    user_id: Uuid,
) -> Result<Arc<dyn SourceCatalog>, AppError> {
    let connection = store
        .connection(user_id, Provider::Spotify)
        .await?
        .ok_or(AppError::AuthMissing(Provider::Spotify))?;
    let sink: Arc<dyn CredentialSink> = Arc::new(StoreCredentialSink {
        store: store.clone(),
        user_id,
    });
    let catalog = SpotifyCatalog::from_credentials(&connection.credentials, Some(sink))?;
    Ok(Arc::new(catalog))
}

/// Construct the target adapter matching the provider tag carried on a job.
pub async fn build_target_catalog(
    store: &JobStore,
    user_id: Uuid,
    provider: Provider,
) -> Result<Arc<dyn TargetCatalog>, AppError> {
    if !provider.is_target() {
        return Err(AppError::BadRequest(format!(
            "{} is not a migration target",
            provider
        )));
    }
    let connection = store
        .connection(user_id, provider)
        .await?
        .ok_or(AppError::AuthMissing(provider))?;
    let sink: Arc<dyn CredentialSink> = Arc::new(StoreCredentialSink {
        store: store.clone(),
        user_id,
    });
    let catalog: Arc<dyn TargetCatalog> = match provider {
        Provider::YoutubeMusic => Arc::new(YtmCatalog::from_credentials(&connection.credentials)?),
        Provider::Tidal => Arc::new(TidalCatalog::from_credentials(
            &connection.credentials,
            Some(sink),
        )?),
        Provider::Qobuz => Arc::new(QobuzCatalog::from_credentials(&connection.credentials)?),
        Provider::Spotify => unreachable!("guarded by is_target"),
    };
    Ok(catalog)
}

/// Combine the searcher's aligned slots with the matcher's verdicts into
/// persistable items.
fn build_items(tracks: &[SourceTrack], slots: &[SearchSlot]) -> Vec<NewItem> {
    tracks
        .iter()
        .zip(slots)
        .enumerate()
        .map(|(position, (track, slot))| {
            let (best, classification) = match_track(track, &slot.candidates);
            let selected_target_id = if classification == Classification::Matched {
                best.as_ref().map(|b| b.target_id.clone())
            } else {
                None
            };
            NewItem {
                position: position as i32,
                source_track: track.clone(),
                best_match: best,
                classification,
                selected_target_id,
            }
        })
        .collect()
}

/// Assemble the finalize report: tracks that never made it (unmatched items
/// plus failed inserts) and duplicates dropped before writing.
fn build_report(
    playlist_id: &str,
    all_items: &[ImportItem],
    entries: &[(String, String)],
    duplicate_labels: Vec<String>,
    write_report: &WriteReport,
) -> ImportReport {
    let mut missed_tracks: Vec<String> = all_items
        .iter()
        .filter(|item| item.classification != Classification::Matched)
        .map(|item| item.source_track.label())
        .collect();

    let label_by_id: HashMap<&str, &str> = entries
        .iter()
        .map(|(id, label)| (id.as_str(), label.as_str()))
        .collect();
    for failed_id in &write_report.failed_ids {
        let label = label_by_id
            .get(failed_id.as_str())
            .map(|l| l.to_string())
            .unwrap_or_else(|| format!("[insert_failed] {}", failed_id));
        missed_tracks.push(label);
    }

    ImportReport {
        target_playlist_id: playlist_id.to_string(),
        missed: MissedReport {
            count: missed_tracks.len(),
            tracks: missed_tracks,
            duplicates: DuplicateReport {
                count: duplicate_labels.len(),
                items: duplicate_labels,
            },
        },
        inserted_count: write_report.inserted_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candidate;

    fn track(name: &str, artist: &str, duration_ms: u64) -> SourceTrack {
        SourceTrack {
            name: name.to_string(),
            artists: vec![artist.to_string()],
            album: None,
            duration_ms: Some(duration_ms),
            isrc: None,
            source_id: None,
        }
    }

    fn candidate(id: &str, title: &str, artist: &str, duration_secs: u64) -> Candidate {
        Candidate {
            target_id: id.to_string(),
            title: title.to_string(),
            artists: vec![artist.to_string()],
            album: None,
            duration_secs: Some(duration_secs),
            isrc: None,
            score: None,
        }
    }

    fn slot(candidates: Vec<Candidate>) -> SearchSlot {
        let resolved = candidates.first().cloned();
        SearchSlot {
            candidates,
            resolved,
        }
    }

    #[test]
    fn test_build_items_classifies_per_slot() {
        let tracks = vec![
            track("Hello", "Adele", 300_000),
            track("Hello", "Adele", 300_000),
            track("Obscure B-Side", "Nobody", 200_000),
        ];
        let slots = vec![
            slot(vec![candidate("t1", "Hello", "Adele", 300)]),
            // 20 s off: uncertain
            slot(vec![candidate("t2", "Hello", "Adele", 320)]),
            slot(vec![]),
        ];

        let items = build_items(&tracks, &slots);
        assert_eq!(items.len(), 3);

        assert_eq!(items[0].classification, Classification::Matched);
        assert_eq!(items[0].selected_target_id.as_deref(), Some("t1"));
        assert_eq!(items[0].position, 0);

        assert_eq!(items[1].classification, Classification::Uncertain);
        assert!(items[1].selected_target_id.is_none());
        assert_eq!(items[1].best_match.as_ref().unwrap().target_id, "t2");

        assert_eq!(items[2].classification, Classification::NotFound);
        assert!(items[2].best_match.is_none());
        assert!(items[2].selected_target_id.is_none());
    }

    #[test]
    fn test_build_items_positions_follow_input_order() {
        let tracks: Vec<SourceTrack> = (0..4)
            .map(|i| track(&format!("T{}", i), "A", 100_000))
            .collect();
        let slots: Vec<SearchSlot> = (0..4).map(|_| slot(vec![])).collect();
        let items = build_items(&tracks, &slots);
        let positions: Vec<i32> = items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_build_report_separates_duplicates_from_missed() {
        let items = vec![];
        let entries = vec![
            ("t1".to_string(), "Adele — Hello".to_string()),
            ("t2".to_string(), "Adele — Skyfall".to_string()),
        ];
        let duplicates = vec!["Adele — Hello (Again)".to_string()];
        let write_report = WriteReport {
            inserted_count: 2,
            failed_ids: vec![],
        };

        let report = build_report("pl-1", &items, &entries, duplicates, &write_report);
        assert_eq!(report.target_playlist_id, "pl-1");
        assert_eq!(report.inserted_count, 2);
        assert_eq!(report.missed.count, 0);
        assert_eq!(report.missed.duplicates.count, 1);
        assert_eq!(
            report.missed.duplicates.items,
            vec!["Adele — Hello (Again)".to_string()]
        );
    }

    #[test]
    fn test_build_report_labels_failed_inserts() {
        let entries = vec![("t1".to_string(), "Adele — Hello".to_string())];
        let write_report = WriteReport {
            inserted_count: 0,
            failed_ids: vec!["t1".to_string(), "ghost".to_string()],
        };
        let report = build_report("pl-1", &[], &entries, vec![], &write_report);
        assert_eq!(report.missed.count, 2);
        assert_eq!(report.missed.tracks[0], "Adele — Hello");
        assert_eq!(report.missed.tracks[1], "[insert_failed] ghost");
    }

    #[test]
    fn test_build_report_counts_unmatched_items() {
        let unmatched = ImportItem {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            position: 0,
            source_track: track("Lost", "Gone", 1000),
            best_match: None,
            classification: Classification::NotFound,
            selected_target_id: None,
        };
        let write_report = WriteReport {
            inserted_count: 1,
            failed_ids: vec![],
        };
        let report = build_report("pl-1", &[unmatched], &[], vec![], &write_report);
        assert_eq!(report.missed.count, 1);
        assert_eq!(report.missed.tracks, vec!["Gone — Lost".to_string()]);
    }
}
