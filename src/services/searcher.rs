//! Bounded parallel fan-out of per-track catalog searches.
//!
//! Results stay aligned with the input: `slots[i]` always belongs to
//! `tracks[i]` no matter which search finishes first. Individual search
//! failures are absorbed into empty slots; only a run where nothing at all
//! resolves is an error.

use std::sync::Arc;
use thiserror::Error;

use super::catalog::TargetCatalog;
use super::matching::normalize;
use super::rate_limit::TokenBucket;
use crate::models::{Candidate, SourceTrack};

#[derive(Debug, Clone)]
pub struct SearcherConfig {
    /// Maximum in-flight searches.
    pub workers: usize,
    /// Candidates requested per search.
    pub top_k: usize,
    /// How many of them the containment heuristic inspects.
    pub heuristic_depth: usize,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            top_k: 7,
            heuristic_depth: 5,
        }
    }
}

/// Per-track search result: everything the catalog returned, plus the
/// candidate the containment heuristic retained (if any).
#[derive(Debug, Clone, Default)]
pub struct SearchSlot {
    pub candidates: Vec<Candidate>,
    pub resolved: Option<Candidate>,
}

#[derive(Debug)]
pub struct SearchOutcome {
    /// Aligned with the input track list.
    pub slots: Vec<SearchSlot>,
    pub found: usize,
    /// Labels of tracks that resolved to nothing.
    pub missed: Vec<String>,
}

/// Every single search came back empty or failed.
#[derive(Debug, Error)]
#[error(
    "not a single track could be found on the target catalog; \
     verify the stored credentials"
)]
pub struct SearchExhausted;

pub struct ParallelSearcher {
    catalog: Arc<dyn TargetCatalog>,
    limiter: TokenBucket,
    config: SearcherConfig,
}

impl ParallelSearcher {
    pub fn new(catalog: Arc<dyn TargetCatalog>, limiter: TokenBucket, config: SearcherConfig) -> Self {
        Self {
            catalog,
            limiter,
            config,
        }
    }

    /// Resolve every source track, preserving input order.
    pub async fn resolve_all(&self, tracks: &[SourceTrack]) -> Result<SearchOutcome, SearchExhausted> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.workers.max(1)));
        let mut handles = Vec::with_capacity(tracks.len());

        for (index, track) in tracks.iter().enumerate() {
            let permit_source = semaphore.clone();
            let catalog = self.catalog.clone();
            let limiter = self.limiter.clone();
            let config = self.config.clone();
            let track = track.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit_source
                    .acquire_owned()
                    .await
                    .expect("searcher semaphore closed");
                limiter.acquire().await;

                let query = track.search_query();
                match catalog.search(&query, config.top_k).await {
                    Ok(candidates) => {
                        let resolved = retain_candidate(&track, &candidates, config.heuristic_depth);
                        SearchSlot {
                            candidates,
                            resolved,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(index, query = %query, error = %e, "search failed");
                        SearchSlot::default()
                    }
                }
            }));
        }

        let mut slots: Vec<SearchSlot> = Vec::with_capacity(tracks.len());
        for handle in handles {
            match handle.await {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    tracing::warn!(error = %e, "search task panicked");
                    slots.push(SearchSlot::default());
                }
            }
        }

        let mut found = 0;
        let mut missed = Vec::new();
        for (track, slot) in tracks.iter().zip(&slots) {
            if slot.resolved.is_some() {
                found += 1;
            } else {
                missed.push(track.label());
            }
        }

        tracing::info!(found, total = tracks.len(), "target catalog search complete");
        if !tracks.is_empty() && found == 0 {
            return Err(SearchExhausted);
        }
        Ok(SearchOutcome {
            slots,
            found,
            missed,
        })
    }
}

/// Containment heuristic: the first of the leading candidates whose
/// normalized title is contained in the source title and whose concatenated
/// artists are a sub- or superset of the first source artist. Falls back to
/// the first candidate; empty lists resolve to nothing.
fn retain_candidate(
    track: &SourceTrack,
    candidates: &[Candidate],
    depth: usize,
) -> Option<Candidate> {
    let source_title = normalize(&track.name);
    let source_artist = normalize(track.artists.first().map(String::as_str).unwrap_or(""));

    for candidate in candidates.iter().take(depth) {
        let title = normalize(&candidate.title);
        let artists = normalize(&candidate.artists.join(" "));
        if source_title.contains(&title)
            && (artists.contains(&source_artist) || source_artist.contains(&artists))
        {
            return Some(candidate.clone());
        }
    }
    candidates.first().cloned()
}
