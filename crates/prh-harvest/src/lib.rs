//! Harvest orchestration: discovery runner, deduplicator, attachment
//! fetcher, and the three-stage reconciliation pipeline.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use prh_core::{
    normalize, Paper, PaperReviewMapping, RawNote, Review, ReviewStructure,
    DEFAULT_REVIEWER_ROLE, DEFAULT_REVIEW_ROUND, OVERALL_SCORE_KEYS, STRUCTURED_FIELD_THRESHOLD,
};
use prh_source::{EntityKind, NoteSource, QueryScope, StrategySet, StrategyTable};
use prh_store::{AttachmentStore, Store, StoreError, StoreTx};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prh-harvest";

/// Content key the platform uses for the submission binary.
pub const ATTACHMENT_FIELD: &str = "pdf";

/// How review and decision discovery is scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewScope {
    /// One venue-wide query per strategy; the original's default mode.
    #[default]
    PlatformWide,
    /// One `forum=paper_id` query per strategy per stored paper.
    PerPaper,
}

impl ReviewScope {
    fn parse(raw: &str) -> Self {
        match raw {
            "per_paper" | "per-paper" => Self::PerPaper,
            _ => Self::PlatformWide,
        }
    }
}

/// Run settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub venue_id: String,
    /// Explicit alternate venue spelling; derived from `venue_id` when unset.
    pub alt_venue_id: Option<String>,
    pub year: i64,
    pub license: String,
    pub database_path: PathBuf,
    pub attachments_dir: PathBuf,
    /// Optional YAML file overriding the builtin strategy table.
    pub strategy_registry: Option<PathBuf>,
    pub review_scope: ReviewScope,
    /// Intermediate commit interval, in records.
    pub commit_every: usize,
    pub structure_threshold: usize,
    pub review_round: i64,
    pub reviewer_role: String,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let venue_id = std::env::var("PRH_VENUE_ID")
            .unwrap_or_else(|_| "EMNLP.cc/2023/Conference".to_string());
        let year = std::env::var("PRH_YEAR")
            .ok()
            .and_then(|v| v.parse().ok())
            .or_else(|| year_from_venue(&venue_id))
            .unwrap_or_else(|| i64::from(Utc::now().year()));
        Self {
            alt_venue_id: std::env::var("PRH_ALT_VENUE_ID")
                .ok()
                .filter(|v| !v.is_empty()),
            year,
            license: std::env::var("PRH_LICENSE").unwrap_or_else(|_| "CC-BY".to_string()),
            database_path: std::env::var("PRH_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/harvest.db")),
            attachments_dir: std::env::var("PRH_ATTACHMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/pdfs")),
            strategy_registry: std::env::var("PRH_STRATEGY_REGISTRY")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            review_scope: std::env::var("PRH_REVIEW_SCOPE")
                .map(|v| ReviewScope::parse(&v))
                .unwrap_or_default(),
            commit_every: std::env::var("PRH_COMMIT_EVERY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(50),
            structure_threshold: std::env::var("PRH_STRUCTURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(STRUCTURED_FIELD_THRESHOLD),
            review_round: std::env::var("PRH_REVIEW_ROUND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REVIEW_ROUND),
            reviewer_role: std::env::var("PRH_REVIEWER_ROLE")
                .unwrap_or_else(|_| DEFAULT_REVIEWER_ROLE.to_string()),
            venue_id,
        }
    }

    /// The strategy table this run discovers through: the YAML registry when
    /// configured, otherwise the builtin table.
    pub fn strategy_table(&self) -> Result<StrategyTable> {
        match &self.strategy_registry {
            Some(path) => StrategyTable::from_yaml_file(path),
            None => Ok(StrategyTable::builtin()),
        }
    }

    fn scope(&self) -> QueryScope {
        let mut scope = QueryScope::for_venue(&self.venue_id);
        if let Some(alt) = &self.alt_venue_id {
            scope.alternate_venue_id = Some(alt.clone());
        }
        scope
    }
}

/// First four-digit path segment of a venue id, e.g. `EMNLP.cc/2023/Conference`.
fn year_from_venue(venue_id: &str) -> Option<i64> {
    venue_id
        .split('/')
        .filter_map(|segment| segment.parse::<i64>().ok())
        .find(|year| (1900..2100).contains(year))
}

/// Collapse candidates sharing a natural key to one representative per key.
/// The last occurrence of a key wins (later strategies supply richer data);
/// output order is the order keys were first seen.
pub fn dedupe_by<T, K, F>(records: Vec<T>, key_fn: F) -> Vec<T>
where
    K: Eq + Hash + Clone,
    F: Fn(&T) -> K,
{
    let mut order: Vec<K> = Vec::new();
    let mut by_key: HashMap<K, T> = HashMap::new();
    for record in records {
        let key = key_fn(&record);
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, record);
    }
    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Run one strategy set against the source. Accumulating strategies merge
/// every non-empty result; the fallback chain is consulted only when the
/// accumulating strategies produced nothing, and stops at its first hit.
/// Individual strategy failures are logged and skipped, never surfaced.
pub async fn discover(
    source: &dyn NoteSource,
    kind: EntityKind,
    set: &StrategySet,
    scope: &QueryScope,
) -> Vec<RawNote> {
    let mut merged = Vec::new();

    for descriptor in &set.accumulate {
        let Some(query) = descriptor.to_query(scope) else {
            debug!(kind = kind.as_str(), strategy = %descriptor.label(), "strategy not resolvable in scope");
            continue;
        };
        match source.query_notes(&query).await {
            Ok(notes) if notes.is_empty() => {
                debug!(kind = kind.as_str(), strategy = %descriptor.label(), "strategy returned nothing");
            }
            Ok(notes) => {
                debug!(kind = kind.as_str(), strategy = %descriptor.label(), count = notes.len(), "strategy contributed records");
                merged.extend(notes);
            }
            Err(err) => {
                warn!(kind = kind.as_str(), strategy = %descriptor.label(), error = %err, "strategy query failed, continuing");
            }
        }
    }

    if merged.is_empty() {
        for descriptor in &set.fallback {
            let Some(query) = descriptor.to_query(scope) else {
                continue;
            };
            match source.query_notes(&query).await {
                Ok(notes) if notes.is_empty() => {}
                Ok(notes) => {
                    debug!(kind = kind.as_str(), strategy = %descriptor.label(), count = notes.len(), "fallback strategy hit");
                    return notes;
                }
                Err(err) => {
                    warn!(kind = kind.as_str(), strategy = %descriptor.label(), error = %err, "fallback query failed, continuing");
                }
            }
        }
    }

    merged
}

/// Retrieves a paper's binary attachment into the content area, returning
/// the stored path or `None`. Never fails: missing presence flags skip the
/// network call entirely, an attachment already on disk is reused, and any
/// transport or filesystem error degrades to `None` with a warning.
pub struct AttachmentFetcher<'a> {
    source: &'a dyn NoteSource,
    store: &'a AttachmentStore,
}

impl<'a> AttachmentFetcher<'a> {
    pub fn new(source: &'a dyn NoteSource, store: &'a AttachmentStore) -> Self {
        Self { source, store }
    }

    pub async fn fetch(&self, note: &RawNote) -> Option<String> {
        if !normalize::has_field(&note.content, ATTACHMENT_FIELD) {
            return None;
        }
        let Some(number) = note.number else {
            warn!(note_id = %note.id, "attachment flagged but note has no display number");
            return None;
        };

        let path = self.store.path_for(number);
        if self.store.contains(number).await {
            debug!(note_id = %note.id, number, "attachment already stored, reusing");
            return Some(path.display().to_string());
        }

        let bytes = match self.source.fetch_attachment(&note.id, ATTACHMENT_FIELD).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(note_id = %note.id, number, error = %err, "attachment fetch failed");
                return None;
            }
        };
        match self.store.store_bytes(number, &bytes).await {
            Ok(stored) => Some(stored.path.display().to_string()),
            Err(err) => {
                warn!(note_id = %note.id, number, error = %err, "attachment write failed");
                None
            }
        }
    }
}

/// Per-stage record accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StageCounts {
    /// Unique candidates after dedup.
    pub found: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What one pipeline invocation accomplished.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub venue_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub papers: StageCounts,
    pub reviews: StageCounts,
    pub decisions: StageCounts,
}

/// The reconciliation pipeline: papers, then reviews with their mappings,
/// then decisions, each stage completing before the next begins. Per-record
/// failures roll back to a savepoint and never abort the stage; only
/// store-level transaction breakage is fatal.
pub struct HarvestPipeline {
    config: HarvestConfig,
    strategies: StrategyTable,
    source: Arc<dyn NoteSource>,
    store: Store,
    attachments: AttachmentStore,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig, source: Arc<dyn NoteSource>, store: Store) -> Result<Self> {
        let strategies = config
            .strategy_table()
            .context("loading discovery strategy table")?;
        let attachments = AttachmentStore::new(config.attachments_dir.clone());
        Ok(Self {
            config,
            strategies,
            source,
            store,
            attachments,
        })
    }

    pub async fn run(&self) -> Result<HarvestSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, venue = %self.config.venue_id, "harvest starting");

        let papers = self.run_paper_stage().await?;
        let reviews = self.run_review_stage().await?;
        let decisions = self.run_decision_stage().await?;

        let summary = HarvestSummary {
            run_id,
            venue_id: self.config.venue_id.clone(),
            started_at,
            finished_at: Utc::now(),
            papers,
            reviews,
            decisions,
        };
        self.report(&summary);
        Ok(summary)
    }

    fn report(&self, summary: &HarvestSummary) {
        for (stage, counts) in [
            ("papers", summary.papers),
            ("reviews", summary.reviews),
            ("decisions", summary.decisions),
        ] {
            if counts.found == 0 {
                warn!(
                    stage,
                    venue = %self.config.venue_id,
                    "no records discovered; the venue id or strategy table is likely misconfigured"
                );
            } else if counts.failed > 0 {
                warn!(
                    stage,
                    found = counts.found,
                    ingested = counts.ingested,
                    failed = counts.failed,
                    "stage completed with per-record failures"
                );
            }
        }
        info!(
            run_id = %summary.run_id,
            papers = summary.papers.ingested,
            reviews = summary.reviews.ingested,
            decisions = summary.decisions.ingested,
            "harvest finished"
        );
    }

    /// Commit the batch and open a fresh transaction every `commit_every`
    /// records, so one run never holds an unbounded transaction. The commit
    /// must finish before the new `begin`: the pool holds a single
    /// connection, and an open transaction keeps it checked out.
    async fn rotate_tx(&self, tx: StoreTx, since_commit: &mut usize) -> Result<StoreTx, StoreError> {
        if *since_commit < self.config.commit_every {
            return Ok(tx);
        }
        tx.commit().await?;
        *since_commit = 0;
        self.store.begin().await
    }

    async fn run_paper_stage(&self) -> Result<StageCounts> {
        let scope = self.config.scope();
        let notes = discover(
            self.source.as_ref(),
            EntityKind::Papers,
            &self.strategies.papers,
            &scope,
        )
        .await;
        let unique = dedupe_by(notes, |note: &RawNote| note.id.clone());

        let mut counts = StageCounts {
            found: unique.len(),
            ..StageCounts::default()
        };
        let fetcher = AttachmentFetcher::new(self.source.as_ref(), &self.attachments);

        let mut tx = self.store.begin().await.context("beginning paper stage")?;
        let mut since_commit = 0usize;

        for note in &unique {
            if tx.paper_exists(&note.id).await? {
                debug!(paper_id = %note.id, "paper already stored, skipping");
                counts.skipped += 1;
                continue;
            }

            let submission_text = fetcher.fetch(note).await;
            let paper = Paper {
                paper_id: note.id.clone(),
                title: normalize::string_field_or(&note.content, "title", "Unknown"),
                abstract_text: normalize::string_field(&note.content, "abstract"),
                authors: normalize::joined_list_field_or(&note.content, "authors", "Unknown"),
                venue: self.config.venue_id.clone(),
                year: self.config.year,
                submission_text,
                acceptance_status: None,
                license: normalize::string_field_or(&note.content, "license", &self.config.license),
            };

            tx.begin_record().await?;
            match tx.upsert_paper(&paper).await {
                Ok(()) => {
                    tx.commit_record().await?;
                    counts.ingested += 1;
                    since_commit += 1;
                }
                Err(err) => {
                    warn!(paper_id = %note.id, error = %err, "paper upsert failed, rolling back record");
                    tx.rollback_record().await?;
                    counts.failed += 1;
                }
            }
            tx = self.rotate_tx(tx, &mut since_commit).await?;
        }

        tx.commit().await.context("committing paper stage")?;
        info!(
            found = counts.found,
            ingested = counts.ingested,
            skipped = counts.skipped,
            failed = counts.failed,
            "paper stage done"
        );
        Ok(counts)
    }

    async fn discover_reviews(&self) -> Result<Vec<RawNote>> {
        match self.config.review_scope {
            ReviewScope::PlatformWide => Ok(discover(
                self.source.as_ref(),
                EntityKind::Reviews,
                &self.strategies.reviews,
                &self.config.scope(),
            )
            .await),
            ReviewScope::PerPaper => {
                let mut notes = Vec::new();
                for paper_id in self.store.paper_ids().await? {
                    let scope = self.config.scope().with_forum(paper_id);
                    notes.extend(
                        discover(
                            self.source.as_ref(),
                            EntityKind::Reviews,
                            &self.strategies.reviews,
                            &scope,
                        )
                        .await,
                    );
                }
                Ok(notes)
            }
        }
    }

    async fn run_review_stage(&self) -> Result<StageCounts> {
        let notes = self.discover_reviews().await?;
        let unique = dedupe_by(notes, |note: &RawNote| note.id.clone());

        let mut counts = StageCounts {
            found: unique.len(),
            ..StageCounts::default()
        };

        let mut tx = self.store.begin().await.context("beginning review stage")?;
        let mut since_commit = 0usize;

        for note in &unique {
            if tx.review_exists(&note.id).await? {
                debug!(review_id = %note.id, "review already stored, skipping");
                counts.skipped += 1;
                continue;
            }
            let Some(paper_id) = note.forum.clone() else {
                warn!(review_id = %note.id, "review carries no forum reference, skipping");
                counts.failed += 1;
                continue;
            };

            let review = Review {
                review_id: note.id.clone(),
                paper_id: paper_id.clone(),
                reviewer_id: note.first_signature().map(str::to_string),
                review_text: normalize::string_field(&note.content, "review"),
                review_date: normalize::date_from_millis(note.created_millis()),
                overall_score: normalize::first_match_field(&note.content, &OVERALL_SCORE_KEYS),
                confidence_score: normalize::string_field(&note.content, "confidence"),
                review_structure: ReviewStructure::classify(
                    note.content.len(),
                    self.config.structure_threshold,
                ),
            };
            let mapping = PaperReviewMapping {
                paper_id,
                review_id: note.id.clone(),
                reviewer_role: self.config.reviewer_role.clone(),
                review_round: self.config.review_round,
            };

            // Review and mapping land together or not at all.
            tx.begin_record().await?;
            let outcome = match tx.upsert_review(&review).await {
                Ok(()) => tx.upsert_mapping(&mapping).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => {
                    tx.commit_record().await?;
                    counts.ingested += 1;
                    since_commit += 1;
                }
                Err(err) if err.is_referential_violation() => {
                    warn!(review_id = %note.id, paper_id = %review.paper_id, "review targets an unknown paper, skipping");
                    tx.rollback_record().await?;
                    counts.failed += 1;
                }
                Err(err) => {
                    warn!(review_id = %note.id, error = %err, "review upsert failed, rolling back record");
                    tx.rollback_record().await?;
                    counts.failed += 1;
                }
            }
            tx = self.rotate_tx(tx, &mut since_commit).await?;
        }

        tx.commit().await.context("committing review stage")?;
        info!(
            found = counts.found,
            ingested = counts.ingested,
            skipped = counts.skipped,
            failed = counts.failed,
            "review stage done"
        );
        Ok(counts)
    }

    async fn run_decision_stage(&self) -> Result<StageCounts> {
        let scope = self.config.scope();
        let notes = discover(
            self.source.as_ref(),
            EntityKind::Decisions,
            &self.strategies.decisions,
            &scope,
        )
        .await;
        let unique = dedupe_by(notes, |note: &RawNote| note.id.clone());

        let mut counts = StageCounts {
            found: unique.len(),
            ..StageCounts::default()
        };

        let mut tx = self
            .store
            .begin()
            .await
            .context("beginning decision stage")?;
        let mut since_commit = 0usize;

        for note in &unique {
            let Some(paper_id) = note.forum.clone() else {
                warn!(decision_id = %note.id, "decision carries no forum reference, skipping");
                counts.failed += 1;
                continue;
            };
            let Some(mut paper) = tx.get_paper(&paper_id).await? else {
                warn!(decision_id = %note.id, %paper_id, "decision targets an unknown paper, skipping");
                counts.skipped += 1;
                continue;
            };
            let decision = normalize::string_field(&note.content, "decision");
            if decision.is_empty() {
                warn!(decision_id = %note.id, %paper_id, "decision note has no decision value, skipping");
                counts.skipped += 1;
                continue;
            }

            paper.acceptance_status = Some(decision);
            tx.begin_record().await?;
            match tx.upsert_paper(&paper).await {
                Ok(()) => {
                    tx.commit_record().await?;
                    counts.ingested += 1;
                    since_commit += 1;
                }
                Err(err) => {
                    warn!(decision_id = %note.id, error = %err, "decision update failed, rolling back record");
                    tx.rollback_record().await?;
                    counts.failed += 1;
                }
            }
            tx = self.rotate_tx(tx, &mut since_commit).await?;
        }

        tx.commit().await.context("committing decision stage")?;
        info!(
            found = counts.found,
            ingested = counts.ingested,
            skipped = counts.skipped,
            failed = counts.failed,
            "decision stage done"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prh_source::{NoteQuery, StaticNoteSource};
    use prh_store::Table;
    use serde_json::{json, Map, Value};
    use tempfile::tempdir;

    fn content(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(fields) => fields,
            other => panic!("test content must be an object, got {other}"),
        }
    }

    fn mk_note(id: &str, fields: Value) -> RawNote {
        RawNote {
            id: id.to_string(),
            forum: None,
            number: None,
            invitation: None,
            signatures: Vec::new(),
            content: content(fields),
            cdate: None,
            tcdate: None,
        }
    }

    fn mk_paper_note(id: &str, number: i64, title: &str) -> RawNote {
        let mut note = mk_note(
            id,
            json!({
                "title": {"value": title},
                "abstract": {"value": "We study things."},
                "authors": {"value": ["Ada Lovelace", "Alan Turing"]},
            }),
        );
        note.forum = Some(id.to_string());
        note.number = Some(number);
        note
    }

    fn mk_review_note(id: &str, forum: &str) -> RawNote {
        let mut note = mk_note(
            id,
            json!({
                "review": {"value": "Sound method, weak evaluation."},
                "recommendation": {"value": "4: accept"},
                "confidence": {"value": "3"},
            }),
        );
        note.forum = Some(forum.to_string());
        note.signatures = vec![format!("Reviewer_{id}")];
        note.tcdate = Some(1_684_281_600_000);
        note
    }

    fn mk_decision_note(id: &str, forum: &str, verdict: &str) -> RawNote {
        let mut note = mk_note(id, json!({"decision": {"value": verdict}}));
        note.forum = Some(forum.to_string());
        note
    }

    fn test_config(dir: &std::path::Path) -> HarvestConfig {
        HarvestConfig {
            venue_id: "TESTVENUE/2023/Conference".to_string(),
            alt_venue_id: None,
            year: 2023,
            license: "CC-BY".to_string(),
            database_path: dir.join("harvest.db"),
            attachments_dir: dir.join("pdfs"),
            strategy_registry: None,
            review_scope: ReviewScope::PlatformWide,
            commit_every: 50,
            structure_threshold: STRUCTURED_FIELD_THRESHOLD,
            review_round: DEFAULT_REVIEW_ROUND,
            reviewer_role: DEFAULT_REVIEWER_ROLE.to_string(),
        }
    }

    fn venue_invitation(suffix: &str) -> NoteQuery {
        NoteQuery::for_invitation(format!("TESTVENUE/2023/Conference/-/{suffix}"))
    }

    async fn pipeline_with(
        dir: &std::path::Path,
        source: Arc<StaticNoteSource>,
    ) -> (HarvestPipeline, Store) {
        let store = Store::open_in_memory().await.expect("open store");
        let pipeline = HarvestPipeline::new(test_config(dir), source, store.clone())
            .expect("build pipeline");
        (pipeline, store)
    }

    #[test]
    fn dedupe_keeps_the_last_record_per_key_in_first_seen_order() {
        let records = vec![("k1", 1), ("k2", 2), ("k1", 3)];
        let unique = dedupe_by(records, |(key, _)| *key);
        assert_eq!(unique, vec![("k1", 3), ("k2", 2)]);
    }

    #[test]
    fn year_parses_out_of_the_venue_path() {
        assert_eq!(year_from_venue("EMNLP.cc/2023/Conference"), Some(2023));
        assert_eq!(year_from_venue("Workshop/NoYear"), None);
    }

    #[tokio::test]
    async fn discovery_accumulates_across_strategies_and_survives_failures() {
        let source = StaticNoteSource::new()
            .with_failure(&venue_invitation("Submission"))
            .with_notes(
                &venue_invitation("Blind_Submission"),
                vec![mk_paper_note("p1", 1, "First")],
            )
            .with_notes(
                &venue_invitation("ARR_Commitment"),
                vec![mk_paper_note("p2", 2, "Second")],
            );
        let table = StrategyTable::builtin();
        let scope = QueryScope::for_venue("TESTVENUE/2023/Conference");

        let notes = discover(&source, EntityKind::Papers, &table.papers, &scope).await;
        let ids: Vec<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["p1", "p2"]);
    }

    #[tokio::test]
    async fn fallback_runs_only_when_every_invitation_strategy_is_empty() {
        let venueid_query = NoteQuery::for_content("venueid", "TESTVENUE/2023/Conference");
        let source = StaticNoteSource::new()
            .with_notes(&venueid_query, vec![mk_paper_note("p9", 9, "Fallback Hit")]);
        let table = StrategyTable::builtin();
        let scope = QueryScope::for_venue("TESTVENUE/2023/Conference");

        let notes = discover(&source, EntityKind::Papers, &table.papers, &scope).await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, "p9");

        // With an invitation hit, the fallback chain must stay untouched.
        let source = StaticNoteSource::new()
            .with_notes(
                &venue_invitation("Submission"),
                vec![mk_paper_note("p1", 1, "Direct Hit")],
            )
            .with_notes(&venueid_query, vec![mk_paper_note("p9", 9, "Fallback Hit")]);
        let notes = discover(&source, EntityKind::Papers, &table.papers, &scope).await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, "p1");
        assert!(!source
            .recorded_queries()
            .iter()
            .any(|q| q.contains("venueid")));
    }

    #[tokio::test]
    async fn full_run_reconciles_papers_reviews_and_decisions() {
        let dir = tempdir().expect("tempdir");
        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(
                    &venue_invitation("Submission"),
                    vec![mk_paper_note("p1", 1, "First"), mk_paper_note("p2", 2, "Second")],
                )
                .with_notes(
                    &venue_invitation("Official_Review"),
                    vec![mk_review_note("r1", "p1"), mk_review_note("r2", "p2")],
                )
                .with_notes(
                    &venue_invitation("Decision"),
                    vec![mk_decision_note("d1", "p1", "Accept")],
                ),
        );
        let (pipeline, store) = pipeline_with(dir.path(), source).await;

        let summary = pipeline.run().await.expect("run");
        assert_eq!(summary.papers.ingested, 2);
        assert_eq!(summary.reviews.ingested, 2);
        assert_eq!(summary.decisions.ingested, 1);

        let accepted = store
            .get_paper("p1")
            .await
            .expect("get")
            .expect("p1 present");
        assert_eq!(accepted.acceptance_status.as_deref(), Some("Accept"));
        assert_eq!(accepted.authors, "Ada Lovelace, Alan Turing");

        let undecided = store
            .get_paper("p2")
            .await
            .expect("get")
            .expect("p2 present");
        assert_eq!(undecided.acceptance_status, None);

        let review = store
            .get_review("r1")
            .await
            .expect("get")
            .expect("r1 present");
        assert_eq!(review.paper_id, "p1");
        assert_eq!(review.overall_score, "4: accept");
        assert_eq!(review.review_date.to_string(), "2023-05-17");
        assert_eq!(review.review_structure, ReviewStructure::Unstructured);
        assert!(store.mapping_exists("p1", "r1").await.expect("mapping"));
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(
                    &venue_invitation("Submission"),
                    vec![mk_paper_note("p1", 1, "First")],
                )
                .with_notes(
                    &venue_invitation("Official_Review"),
                    vec![mk_review_note("r1", "p1")],
                )
                .with_notes(
                    &venue_invitation("Decision"),
                    vec![mk_decision_note("d1", "p1", "Accept")],
                ),
        );
        let (pipeline, store) = pipeline_with(dir.path(), source).await;

        let first = pipeline.run().await.expect("first run");
        assert_eq!(first.papers.ingested, 1);
        assert_eq!(first.reviews.ingested, 1);

        let second = pipeline.run().await.expect("second run");
        assert_eq!(second.papers.skipped, 1);
        assert_eq!(second.papers.ingested, 0);
        assert_eq!(second.reviews.skipped, 1);
        assert_eq!(second.reviews.ingested, 0);
        // Decisions always re-apply onto the existing row.
        assert_eq!(second.decisions.ingested, 1);

        assert_eq!(store.count(Table::Papers).await.expect("count"), 1);
        assert_eq!(store.count(Table::Reviews).await.expect("count"), 1);
        assert_eq!(
            store.count(Table::PaperReviewMapping).await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn existing_papers_keep_their_fields_but_still_take_decisions() {
        let dir = tempdir().expect("tempdir");
        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(
                    &venue_invitation("Submission"),
                    vec![mk_paper_note("p1", 1, "Rediscovered Title")],
                )
                .with_notes(
                    &venue_invitation("Decision"),
                    vec![mk_decision_note("d1", "p1", "Reject")],
                ),
        );
        let (pipeline, store) = pipeline_with(dir.path(), source).await;

        let mut seeded = Paper {
            paper_id: "p1".to_string(),
            title: "Original Title".to_string(),
            abstract_text: "Original abstract.".to_string(),
            authors: "Grace Hopper".to_string(),
            venue: "TESTVENUE/2023/Conference".to_string(),
            year: 2023,
            submission_text: None,
            acceptance_status: None,
            license: "CC-BY".to_string(),
        };
        let mut tx = store.begin().await.expect("begin");
        tx.upsert_paper(&seeded).await.expect("seed");
        tx.commit().await.expect("commit");

        let summary = pipeline.run().await.expect("run");
        assert_eq!(summary.papers.skipped, 1);
        assert_eq!(summary.decisions.ingested, 1);

        seeded.acceptance_status = Some("Reject".to_string());
        let stored = store
            .get_paper("p1")
            .await
            .expect("get")
            .expect("p1 present");
        assert_eq!(stored, seeded);
    }

    #[tokio::test]
    async fn orphan_reviews_and_unknown_decisions_do_not_poison_the_run() {
        let dir = tempdir().expect("tempdir");
        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(
                    &venue_invitation("Submission"),
                    vec![mk_paper_note("p1", 1, "First")],
                )
                .with_notes(
                    &venue_invitation("Official_Review"),
                    vec![mk_review_note("r-ghost", "ghost"), mk_review_note("r1", "p1")],
                )
                .with_notes(
                    &venue_invitation("Decision"),
                    vec![
                        mk_decision_note("d-ghost", "ghost", "Accept"),
                        mk_decision_note("d1", "p1", "Accept"),
                    ],
                ),
        );
        let (pipeline, store) = pipeline_with(dir.path(), source).await;

        let summary = pipeline.run().await.expect("run");
        assert_eq!(summary.reviews.found, 2);
        assert_eq!(summary.reviews.ingested, 1);
        assert_eq!(summary.reviews.failed, 1);
        assert_eq!(summary.decisions.ingested, 1);
        assert_eq!(summary.decisions.skipped, 1);

        assert_eq!(store.count(Table::Reviews).await.expect("count"), 1);
        assert!(store
            .get_review("r-ghost")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn attachments_fetch_only_when_flagged_and_never_twice() {
        let dir = tempdir().expect("tempdir");
        let attachments = AttachmentStore::new(dir.path().join("pdfs"));

        let mut flagged = mk_paper_note("p1", 1, "With Pdf");
        flagged
            .content
            .insert("pdf".to_string(), json!({"value": "/pdf/p1.pdf"}));
        let bare = mk_paper_note("p2", 2, "Without Pdf");

        let source = StaticNoteSource::new().with_attachment("p1", "pdf", b"%PDF-1.5".to_vec());
        let fetcher = AttachmentFetcher::new(&source, &attachments);

        assert_eq!(fetcher.fetch(&bare).await, None);
        assert_eq!(source.attachment_request_count(), 0);

        let stored = fetcher.fetch(&flagged).await.expect("stored path");
        assert!(stored.ends_with("1.pdf"));
        assert_eq!(source.attachment_request_count(), 1);

        // Already on disk: reused without another network call.
        let reused = fetcher.fetch(&flagged).await.expect("reused path");
        assert_eq!(reused, stored);
        assert_eq!(source.attachment_request_count(), 1);
    }

    #[tokio::test]
    async fn fetch_failures_degrade_to_absent() {
        let dir = tempdir().expect("tempdir");
        let attachments = AttachmentStore::new(dir.path().join("pdfs"));

        let mut flagged = mk_paper_note("p1", 1, "With Pdf");
        flagged
            .content
            .insert("pdf".to_string(), json!({"value": "/pdf/p1.pdf"}));

        // No canned attachment registered, so the fetch call errors.
        let source = StaticNoteSource::new();
        let fetcher = AttachmentFetcher::new(&source, &attachments);
        assert_eq!(fetcher.fetch(&flagged).await, None);
        assert_eq!(source.attachment_request_count(), 1);
    }

    #[tokio::test]
    async fn papers_record_their_attachment_reference() {
        let dir = tempdir().expect("tempdir");
        let mut flagged = mk_paper_note("p1", 1, "With Pdf");
        flagged
            .content
            .insert("pdf".to_string(), json!({"value": "/pdf/p1.pdf"}));

        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(&venue_invitation("Submission"), vec![flagged])
                .with_attachment("p1", "pdf", b"%PDF-1.5 body".to_vec()),
        );
        let (pipeline, store) = pipeline_with(dir.path(), source).await;

        pipeline.run().await.expect("run");
        let paper = store
            .get_paper("p1")
            .await
            .expect("get")
            .expect("p1 present");
        let reference = paper.submission_text.expect("reference recorded");
        assert!(reference.ends_with("1.pdf"));
        assert!(std::path::Path::new(&reference).exists());
    }

    #[tokio::test]
    async fn per_paper_scope_queries_each_stored_forum() {
        let dir = tempdir().expect("tempdir");
        let review_query = venue_invitation("Official_Review").with_forum("p1");
        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(
                    &venue_invitation("Submission"),
                    vec![mk_paper_note("p1", 1, "Only Paper")],
                )
                .with_notes(&review_query, vec![mk_review_note("r1", "p1")]),
        );
        let store = Store::open_in_memory().await.expect("open store");
        let mut config = test_config(dir.path());
        config.review_scope = ReviewScope::PerPaper;
        let pipeline =
            HarvestPipeline::new(config, source.clone(), store.clone()).expect("build pipeline");

        let summary = pipeline.run().await.expect("run");
        assert_eq!(summary.reviews.ingested, 1);
        assert!(source
            .recorded_queries()
            .iter()
            .any(|q| q.contains("Official_Review") && q.ends_with("forum=p1")));
    }

    #[tokio::test]
    async fn intermediate_commits_do_not_change_the_outcome() {
        let dir = tempdir().expect("tempdir");
        let papers: Vec<RawNote> = (1..=7)
            .map(|n| mk_paper_note(&format!("p{n}"), n, &format!("Paper {n}")))
            .collect();
        let reviews: Vec<RawNote> = (1..=7)
            .map(|n| mk_review_note(&format!("r{n}"), &format!("p{n}")))
            .collect();
        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(&venue_invitation("Submission"), papers)
                .with_notes(&venue_invitation("Official_Review"), reviews),
        );
        let store = Store::open_in_memory().await.expect("open store");
        let mut config = test_config(dir.path());
        // Several rotations per stage; the single pooled connection must be
        // released by each batch commit before the next batch begins.
        config.commit_every = 2;
        let pipeline = HarvestPipeline::new(config, source, store.clone()).expect("build pipeline");

        let summary = pipeline.run().await.expect("run");
        assert_eq!(summary.papers.ingested, 7);
        assert_eq!(summary.reviews.ingested, 7);
        assert_eq!(store.count(Table::Papers).await.expect("count"), 7);
        assert_eq!(store.count(Table::Reviews).await.expect("count"), 7);
    }

    #[tokio::test]
    async fn store_open_failure_aborts_before_any_source_query() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").expect("write blocker");

        let source = Arc::new(StaticNoteSource::new().with_notes(
            &venue_invitation("Submission"),
            vec![mk_paper_note("p1", 1, "Never Seen")],
        ));

        // The store opens before the pipeline exists; when that fails, the
        // run aborts without a single discovery query.
        let result = Store::open(blocker.join("harvest.db")).await;
        assert!(result.is_err());
        assert!(source.recorded_queries().is_empty());
        assert_eq!(source.attachment_request_count(), 0);
    }

    #[tokio::test]
    async fn decisions_with_empty_values_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let source = Arc::new(
            StaticNoteSource::new()
                .with_notes(
                    &venue_invitation("Submission"),
                    vec![mk_paper_note("p1", 1, "First")],
                )
                .with_notes(
                    &venue_invitation("Decision"),
                    vec![mk_decision_note("d1", "p1", "")],
                ),
        );
        let (pipeline, store) = pipeline_with(dir.path(), source).await;

        let summary = pipeline.run().await.expect("run");
        assert_eq!(summary.decisions.skipped, 1);
        assert_eq!(summary.decisions.ingested, 0);
        let paper = store
            .get_paper("p1")
            .await
            .expect("get")
            .expect("p1 present");
        assert_eq!(paper.acceptance_status, None);
    }
}
