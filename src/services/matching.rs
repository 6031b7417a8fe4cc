//! Track matching: normalization, similarity scoring and classification.
//!
//! Everything in this module is pure and deterministic; the scorer never
//! touches the network or the clock.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::models::{Candidate, Classification, SourceTrack};

/// Score above which a candidate is accepted without review.
pub const MATCHED_THRESHOLD: f64 = 0.90;
/// Score at or above which a candidate is surfaced for review.
pub const UNCERTAIN_THRESHOLD: f64 = 0.75;

const TITLE_WEIGHT: f64 = 0.50;
const ARTIST_WEIGHT: f64 = 0.35;
const DURATION_WEIGHT: f64 = 0.15;

/// Duration differences up to this many ms count as an exact match.
const DURATION_EXACT_MS: u64 = 5_000;
/// Differences up to this many ms count as a partial match.
const DURATION_NEAR_MS: u64 = 15_000;

fn feat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(feat\.[^)]*\)").expect("valid regex"))
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]").expect("valid regex"))
}

fn remaster_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)-\s*remastered.*$").expect("valid regex"))
}

fn punct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9\s\-:&]").expect("valid regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

/// Reduce a title or artist string to its comparable form: lowercase,
/// drop `(feat.…)` and `[…]` clauses and trailing `- remastered…` suffixes,
/// replace punctuation other than hyphen/colon/ampersand with spaces,
/// collapse whitespace. Total and idempotent.
pub fn normalize(s: &str) -> String {
    let s = s.to_lowercase();
    let s = feat_re().replace_all(&s, "");
    let s = bracket_re().replace_all(&s, "");
    let s = remaster_re().replace(&s, "");
    let s = punct_re().replace_all(&s, " ");
    whitespace_re().replace_all(&s, " ").trim().to_string()
}

/// Ratcliff/Obershelp similarity of two strings: `2·M / (|a| + |b|)` where
/// `M` sums matched block lengths from a recursive longest-common-substring
/// decomposition. Two empty strings are identical (1.0).
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matched = matched_total(&a, &b, 0, a.len(), 0, b.len());
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

fn matched_total(a: &[char], b: &[char], alo: usize, ahi: usize, blo: usize, bhi: usize) -> usize {
    let (i, j, size) = longest_match(a, b, alo, ahi, blo, bhi);
    if size == 0 {
        return 0;
    }
    size + matched_total(a, b, alo, i, blo, j)
        + matched_total(a, b, i + size, ahi, j + size, bhi)
}

/// Longest common substring of `a[alo..ahi]` and `b[blo..bhi]`; ties resolve
/// to the earliest position in `a`, then in `b`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let mut best = (alo, blo, 0usize);
    let mut run_lengths: HashMap<usize, usize> = HashMap::new();
    for i in alo..ahi {
        let mut new_runs: HashMap<usize, usize> = HashMap::new();
        for j in blo..bhi {
            if a[i] == b[j] {
                let prev = if j > blo {
                    run_lengths.get(&(j - 1)).copied().unwrap_or(0)
                } else {
                    0
                };
                let size = prev + 1;
                new_runs.insert(j, size);
                if size > best.2 {
                    best = (i + 1 - size, j + 1 - size, size);
                }
            }
        }
        run_lengths = new_runs;
    }
    best
}

/// Similarity of a source track and one candidate, in `[0, 1]`.
///
/// Equal non-empty ISRCs short-circuit to 1.0; otherwise a weighted blend
/// of title, artist and duration agreement.
pub fn score(source: &SourceTrack, candidate: &Candidate) -> f64 {
    if let (Some(src_isrc), Some(cand_isrc)) = (&source.isrc, &candidate.isrc) {
        if !src_isrc.is_empty() && src_isrc == cand_isrc {
            return 1.0;
        }
    }

    let title_score = sequence_ratio(&normalize(&source.name), &normalize(&candidate.title));

    let src_artists: Vec<String> = source.artists.iter().map(|a| normalize(a)).collect();
    let cand_artists: Vec<String> = candidate.artists.iter().map(|a| normalize(a)).collect();
    let mut artist_score = 0.0f64;
    if !src_artists.is_empty() && !cand_artists.is_empty() {
        for sa in &src_artists {
            for ca in &cand_artists {
                artist_score = artist_score.max(sequence_ratio(sa, ca));
            }
        }
    }

    let duration_score = duration_score(
        source.duration_ms.unwrap_or(0),
        candidate.duration_secs.unwrap_or(0).saturating_mul(1000),
    );

    title_score * TITLE_WEIGHT + artist_score * ARTIST_WEIGHT + duration_score * DURATION_WEIGHT
}

fn duration_score(src_ms: u64, cand_ms: u64) -> f64 {
    // Missing durations must never penalize a candidate.
    if src_ms == 0 || cand_ms == 0 {
        return 1.0;
    }
    let diff = src_ms.abs_diff(cand_ms);
    if diff <= DURATION_EXACT_MS {
        1.0
    } else if diff <= DURATION_NEAR_MS {
        0.5
    } else {
        0.0
    }
}

/// Annotate every candidate with its score, in place.
pub fn score_candidates(source: &SourceTrack, candidates: &mut [Candidate]) {
    for candidate in candidates.iter_mut() {
        candidate.score = Some(score(source, candidate));
    }
}

/// Pick the best candidate and classify the result. Ties resolve to the
/// first candidate in adapter-returned order; a best below the uncertain
/// threshold is discarded.
pub fn match_track(
    source: &SourceTrack,
    candidates: &[Candidate],
) -> (Option<Candidate>, Classification) {
    if candidates.is_empty() {
        return (None, Classification::NotFound);
    }

    let mut best: Option<Candidate> = None;
    let mut best_score = 0.0f64;
    for candidate in candidates {
        let candidate_score = score(source, candidate);
        if candidate_score > best_score {
            best_score = candidate_score;
            let mut chosen = candidate.clone();
            chosen.score = Some(candidate_score);
            best = Some(chosen);
        }
    }

    if best_score > MATCHED_THRESHOLD {
        (best, Classification::Matched)
    } else if best_score >= UNCERTAIN_THRESHOLD {
        (best, Classification::Uncertain)
    } else {
        (None, Classification::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn track(name: &str, artists: &[&str], duration_ms: Option<u64>) -> SourceTrack {
        SourceTrack {
            name: name.to_string(),
            artists: artists.iter().map(|a| a.to_string()).collect(),
            album: None,
            duration_ms,
            isrc: None,
            source_id: None,
        }
    }

    fn candidate(title: &str, artists: &[&str], duration_secs: Option<u64>) -> Candidate {
        Candidate {
            target_id: format!("id-{}", title),
            title: title.to_string(),
            artists: artists.iter().map(|a| a.to_string()).collect(),
            album: None,
            duration_secs,
            isrc: None,
            score: None,
        }
    }

    #[rstest]
    #[case("Song (feat. Someone)", "song")]
    #[case("Track [Live at Wembley]", "track")]
    #[case("Tune - Remastered 2011", "tune")]
    #[case("Hello", "hello")]
    #[case("  Spaced   Out  ", "spaced out")]
    #[case("AC/DC's Song!", "ac dc s song")]
    #[case("Re-Mix: A & B", "re-mix: a & b")]
    #[case("", "")]
    fn test_normalize_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input), expected);
    }

    #[rstest]
    #[case("Song (feat. Someone)")]
    #[case("Tune - Remastered 2011")]
    #[case("Völlig losgelöst [Radio Edit]")]
    #[case("plain title")]
    #[case("")]
    fn test_normalize_idempotent(#[case] input: &str) {
        let once = normalize(input);
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn test_sequence_ratio_basics() {
        assert_eq!(sequence_ratio("hello", "hello"), 1.0);
        assert_eq!(sequence_ratio("", ""), 1.0);
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
        // 2 * 5 / (5 + 10)
        let ratio = sequence_ratio("hello", "hello live");
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9, "got {}", ratio);
    }

    #[test]
    fn test_sequence_ratio_recursive_blocks() {
        // "abxcd" vs "abcd": blocks "ab" and "cd" -> 2*4/(5+4)
        let ratio = sequence_ratio("abxcd", "abcd");
        assert!((ratio - 8.0 / 9.0).abs() < 1e-9, "got {}", ratio);
    }

    #[test]
    fn test_isrc_shortcut_wins_over_text() {
        // Scenario: totally different text, same recording.
        let mut source = track("Song", &["A"], Some(180_000));
        source.isrc = Some("US12345".to_string());
        let mut cand = candidate("anything", &["B"], Some(120));
        cand.isrc = Some("US12345".to_string());

        assert_eq!(score(&source, &cand), 1.0);
        let (best, classification) = match_track(&source, &[cand]);
        assert_eq!(classification, Classification::Matched);
        assert_eq!(best.unwrap().score, Some(1.0));
    }

    #[test]
    fn test_empty_isrc_does_not_shortcut() {
        let mut source = track("One", &["A"], None);
        source.isrc = Some(String::new());
        let mut cand = candidate("Two", &["B"], None);
        cand.isrc = Some(String::new());
        assert!(score(&source, &cand) < 1.0);
    }

    #[test]
    fn test_exact_match_classifies_matched() {
        let source = track("Hello", &["Adele"], Some(300_000));
        let candidates = vec![
            candidate("Hello", &["Adele"], Some(300)),
            candidate("Rolling in the Deep", &["Adele"], Some(280)),
        ];
        let (best, classification) = match_track(&source, &candidates);
        let best = best.unwrap();
        assert_eq!(best.title, "Hello");
        assert!(best.score.unwrap() >= 0.99);
        assert_eq!(classification, Classification::Matched);
    }

    #[test]
    fn test_live_variant_is_rejected() {
        let source = track("Hello", &["Adele"], Some(300_000));
        let candidates = vec![candidate("Hello Live", &["Adele"], Some(320))];

        let live_score = score(&source, &candidates[0]);
        // title 2/3, artist 1.0, duration 0.0 (20 s apart)
        assert!((live_score - (2.0 / 3.0 * 0.50 + 0.35)).abs() < 1e-9);

        let (best, classification) = match_track(&source, &candidates);
        assert!(best.is_none());
        assert_eq!(classification, Classification::NotFound);
    }

    #[test]
    fn test_missing_metadata_scores_without_panic() {
        let source = track("", &[], None);
        let cand = candidate("", &[], None);
        let value = score(&source, &cand);
        assert!(value >= 0.0);
        // empty titles are identical, artists contribute nothing
        assert!((value - (0.50 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn test_score_bounds() {
        let pairs = [
            (track("Hello", &["Adele"], Some(295_000)), candidate("Hello", &["Adele"], Some(295))),
            (track("A", &[], None), candidate("B", &["X", "Y"], Some(1))),
            (track("", &[""], Some(1)), candidate("", &[""], None)),
            (
                track("Very Long Title Indeed", &["Someone"], Some(100_000)),
                candidate("Short", &["Else"], Some(500)),
            ),
        ];
        for (source, cand) in pairs {
            let value = score(&source, &cand);
            assert!((0.0..=1.0).contains(&value), "score {} out of range", value);
        }
    }

    #[test]
    fn test_duration_tiers() {
        assert_eq!(duration_score(300_000, 300_000), 1.0);
        assert_eq!(duration_score(300_000, 304_999), 1.0);
        assert_eq!(duration_score(300_000, 305_000), 1.0);
        assert_eq!(duration_score(300_000, 305_001), 0.5);
        assert_eq!(duration_score(300_000, 315_000), 0.5);
        assert_eq!(duration_score(300_000, 315_001), 0.0);
        assert_eq!(duration_score(0, 315_000), 1.0);
        assert_eq!(duration_score(315_000, 0), 1.0);
    }

    #[test]
    fn test_empty_candidates_is_not_found() {
        let source = track("Hello", &["Adele"], None);
        let (best, classification) = match_track(&source, &[]);
        assert!(best.is_none());
        assert_eq!(classification, Classification::NotFound);
    }

    #[test]
    fn test_ties_keep_first_candidate() {
        let source = track("Hello", &["Adele"], Some(300_000));
        let first = candidate("Hello", &["Adele"], Some(300));
        let mut second = candidate("Hello", &["Adele"], Some(300));
        second.target_id = "id-Hello-duplicate".to_string();

        let (best, _) = match_track(&source, &[first, second]);
        assert_eq!(best.unwrap().target_id, "id-Hello");
    }

    #[test]
    fn test_classification_agrees_with_best_score() {
        let source = track("Hello", &["Adele"], Some(300_000));
        let lists = vec![
            vec![candidate("Hello", &["Adele"], Some(300))],
            vec![candidate("Hello Live", &["Adele"], Some(320))],
            // title and artist agree, duration 20 s off -> 0.85, uncertain
            vec![candidate("Hello", &["Adele"], Some(320))],
            vec![],
        ];
        for candidates in lists {
            let (best, classification) = match_track(&source, &candidates);
            match classification {
                Classification::Matched => {
                    assert!(best.unwrap().score.unwrap() > MATCHED_THRESHOLD)
                }
                Classification::Uncertain => {
                    let s = best.unwrap().score.unwrap();
                    assert!((UNCERTAIN_THRESHOLD..=MATCHED_THRESHOLD).contains(&s));
                }
                Classification::NotFound => assert!(best.is_none()),
                Classification::Skipped => unreachable!("matcher never skips"),
            }
        }
    }

    #[test]
    fn test_score_candidates_annotates_all() {
        let source = track("Hello", &["Adele"], Some(300_000));
        let mut candidates = vec![
            candidate("Hello", &["Adele"], Some(300)),
            candidate("Someone Like You", &["Adele"], Some(285)),
        ];
        score_candidates(&source, &mut candidates);
        assert!(candidates.iter().all(|c| c.score.is_some()));
        assert!(candidates[0].score.unwrap() > candidates[1].score.unwrap());
    }
}
