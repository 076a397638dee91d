//! Checkpointed crawl orchestration and dataset consolidation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tl_adapters::SquadSource;
use tl_core::{column_index, csv_escape, split_csv_line, CheckpointState, PlayerRecord, PARTITION_HEADER};
use tl_storage::{CheckpointStore, ObjectStore, PartitionWriter, StoreError};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tl-pipeline";

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Partitions land here; disjoint from the archive and processed keys so
    /// a listing never picks up already-consumed data.
    pub raw_prefix: String,
    pub archive_prefix: String,
    pub combined_key: String,
    pub checkpoint_key: String,
    /// Season whose June 30 end date separates "stayed" from "moved".
    pub reference_season: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            raw_prefix: "crawl/raw/".to_string(),
            archive_prefix: "crawl/archive/".to_string(),
            combined_key: "crawl/processed/combined.csv".to_string(),
            checkpoint_key: "crawl/progress.json".to_string(),
            reference_season: "2023/24".to_string(),
        }
    }
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            raw_prefix: std::env::var("TL_RAW_PREFIX").unwrap_or(defaults.raw_prefix),
            archive_prefix: std::env::var("TL_ARCHIVE_PREFIX").unwrap_or(defaults.archive_prefix),
            combined_key: std::env::var("TL_COMBINED_KEY").unwrap_or(defaults.combined_key),
            checkpoint_key: std::env::var("TL_CHECKPOINT_KEY").unwrap_or(defaults.checkpoint_key),
            reference_season: std::env::var("TL_REFERENCE_SEASON")
                .unwrap_or(defaults.reference_season),
        }
    }
}

/// League rank lookup for partition rows. Loaded from `rankings.yaml`; an
/// absent file means every team ranks 0.
#[derive(Debug, Clone, Default)]
pub struct TeamRankTable {
    ranks: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct RankingsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rankings: Vec<RankingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RankingEntry {
    team: String,
    rank: u32,
}

impl TeamRankTable {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rankings.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let parsed: RankingsFile = serde_yaml::from_str(
            &std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            ranks: parsed
                .rankings
                .into_iter()
                .map(|entry| (entry.team, entry.rank))
                .collect(),
        })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            ranks: entries.into_iter().collect(),
        }
    }

    pub fn rank_of(&self, team: &str) -> u32 {
        self.ranks.get(team).copied().unwrap_or(0)
    }
}

/// Terminal state of one bounded crawl run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every enumerated team is already behind the checkpoint.
    AllDone,
    TeamCompleted {
        team_index: usize,
        team_name: String,
        players_appended: usize,
    },
    /// The named player failed; the checkpoint points back at it so the next
    /// run re-attempts exactly this unit of work.
    Failed {
        team_index: usize,
        player_index: usize,
        reason: String,
    },
}

/// Nested-counter state machine over teams and squad members. One run
/// processes at most one team fully, or fails partway through one; progress
/// is durable after every player.
pub struct CrawlOrchestrator {
    source: Arc<dyn SquadSource>,
    checkpoint: CheckpointStore,
    writer: PartitionWriter,
    ranks: TeamRankTable,
    config: CrawlConfig,
}

impl CrawlOrchestrator {
    pub fn new(
        source: Arc<dyn SquadSource>,
        store: Arc<dyn ObjectStore>,
        ranks: TeamRankTable,
        config: CrawlConfig,
    ) -> Self {
        let checkpoint = CheckpointStore::new(store.clone(), config.checkpoint_key.clone());
        let writer = PartitionWriter::new(store);
        Self {
            source,
            checkpoint,
            writer,
            ranks,
            config,
        }
    }

    /// Sets the crawl back to `{0,0}`.
    pub async fn reset(&self) -> Result<()> {
        self.checkpoint.reset().await
    }

    pub fn partition_key(&self, team_index: usize, team_name: &str) -> String {
        format!(
            "{}team_{team_index:04}_{team_name}.csv",
            self.config.raw_prefix
        )
    }

    /// One bounded run, resumed from the stored checkpoint. The row append
    /// always lands before the checkpoint advance; a kill between the two
    /// re-attempts the player and duplicates at most one row, never loses one.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        self.run_inner()
            .instrument(info_span!("crawl_run", %run_id))
            .await
    }

    async fn run_inner(&self) -> Result<RunOutcome> {
        let state = self.checkpoint.load().await?;
        let teams = self.source.fetch_teams().await.context("enumerating teams")?;
        if state.team_index >= teams.len() {
            info!(team_index = state.team_index, teams = teams.len(), "crawl complete");
            return Ok(RunOutcome::AllDone);
        }

        let team = &teams[state.team_index];
        let players = self
            .source
            .fetch_players(&team.squad_url)
            .await
            .with_context(|| format!("enumerating squad of {}", team.name))?;

        let partition_key = self.partition_key(state.team_index, &team.name);
        let team_rank = self.ranks.rank_of(&team.name);

        let mut appended = 0usize;
        for (idx, profile_url) in players.iter().enumerate() {
            if idx < state.player_index {
                continue;
            }

            match self
                .ingest_player(&partition_key, profile_url, team_rank)
                .await
            {
                Ok(rows) => {
                    info!(
                        team = team.name.as_str(),
                        player_index = idx,
                        rows,
                        "player stored"
                    );
                    appended += 1;
                    self.checkpoint
                        .save(CheckpointState::new(state.team_index, idx + 1))
                        .await?;
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(
                        team = team.name.as_str(),
                        player_index = idx,
                        error = reason.as_str(),
                        "player failed; run stops here"
                    );
                    self.checkpoint
                        .save(CheckpointState::new(state.team_index, idx))
                        .await?;
                    return Ok(RunOutcome::Failed {
                        team_index: state.team_index,
                        player_index: idx,
                        reason,
                    });
                }
            }
        }

        self.checkpoint
            .save(CheckpointState::new(state.team_index + 1, 0))
            .await?;
        Ok(RunOutcome::TeamCompleted {
            team_index: state.team_index,
            team_name: team.name.clone(),
            players_appended: appended,
        })
    }

    async fn ingest_player(
        &self,
        partition_key: &str,
        profile_url: &str,
        team_rank: u32,
    ) -> Result<usize> {
        let profile = self.source.fetch_player(profile_url).await?;
        let record =
            PlayerRecord::from_profile(&profile, team_rank, &self.config.reference_season);
        self.writer
            .append_row(partition_key, &record.to_csv_row(), PARTITION_HEADER)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidateSummary {
    pub partitions_processed: usize,
    pub rows_merged: usize,
}

/// Folds raw partitions into the combined training dataset, then archives
/// the consumed partitions.
pub struct Consolidator {
    store: Arc<dyn ObjectStore>,
    config: CrawlConfig,
}

impl Consolidator {
    pub fn new(store: Arc<dyn ObjectStore>, config: CrawlConfig) -> Self {
        Self { store, config }
    }

    /// Reads every raw partition, strips the identity column, unions with
    /// the prior combined dataset (prior rows first, partitions in listing
    /// order) and overwrites the combined key in one put. Archiving runs
    /// only after that write: a crash in between re-merges those partitions
    /// on the next run instead of losing them.
    pub async fn run_once(&self) -> Result<ConsolidateSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner()
            .instrument(info_span!("consolidate_run", %run_id))
            .await
    }

    async fn run_inner(&self) -> Result<ConsolidateSummary> {
        let keys: Vec<String> = self
            .store
            .list(&self.config.raw_prefix)
            .await
            .context("listing raw partitions")?
            .into_iter()
            .filter(|key| key.to_ascii_lowercase().ends_with(".csv"))
            .collect();

        let mut new_rows: Vec<String> = Vec::new();
        let mut processed: Vec<String> = Vec::new();
        for key in &keys {
            let bytes = self
                .store
                .get(key)
                .await
                .with_context(|| format!("reading partition {key}"))?;
            let text = String::from_utf8(bytes)
                .with_context(|| format!("partition {key} is not utf-8"))?;
            let rows = strip_identity_column(&text);
            info!(key = key.as_str(), rows = rows.len(), "partition reduced");
            new_rows.extend(rows);
            processed.push(key.clone());
        }

        if processed.is_empty() {
            info!("nothing to consolidate");
            return Ok(ConsolidateSummary {
                partitions_processed: 0,
                rows_merged: 0,
            });
        }

        let mut combined: Vec<String> = match self.store.get(&self.config.combined_key).await {
            Ok(bytes) => String::from_utf8(bytes)
                .with_context(|| format!("combined dataset {} is not utf-8", self.config.combined_key))?
                .lines()
                .map(str::to_string)
                .collect(),
            Err(StoreError::NotFound { .. }) => Vec::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading combined dataset {}", self.config.combined_key))
            }
        };

        let rows_merged = new_rows.len();
        combined.extend(new_rows);

        let mut body = combined.join("\n");
        body.push('\n');
        self.store
            .put(&self.config.combined_key, body.as_bytes())
            .await
            .with_context(|| format!("writing combined dataset {}", self.config.combined_key))?;

        for key in &processed {
            let file_name = key.rsplit('/').next().unwrap_or(key);
            let dst = format!("{}{}", self.config.archive_prefix, file_name);
            self.store
                .copy(key, &dst)
                .await
                .with_context(|| format!("archiving partition {key}"))?;
            self.store
                .delete(key)
                .await
                .with_context(|| format!("removing consumed partition {key}"))?;
            info!(from = key.as_str(), to = dst.as_str(), "partition archived");
        }

        Ok(ConsolidateSummary {
            partitions_processed: processed.len(),
            rows_merged,
        })
    }
}

/// Header + rows → headerless rows with the `name` column removed.
fn strip_identity_column(partition_text: &str) -> Vec<String> {
    let mut lines = partition_text.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let name_idx = column_index(header, "name");

    let mut out = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = split_csv_line(line);
        if let Some(idx) = name_idx {
            if idx < fields.len() {
                fields.remove(idx);
            }
        }
        out.push(
            fields
                .iter()
                .map(|field| csv_escape(field))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    out
}
