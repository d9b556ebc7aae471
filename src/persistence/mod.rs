//! Persistence Module
//!
//! Durable record of the decision engine:
//! - `positions/positions_YYYY-MM-DD.csv`: append-only journal, one row per state change
//! - `stats/stats_YYYY-MM-DD.csv`: periodic `TradingStats` snapshots
//! - `engine_state.json`: checkpoint of the position index, risk state and stats
//!
//! Restart = checkpoint + journal rows recorded after it.

pub mod stats;

pub use stats::{StatsTracker, TradingStats};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::ledger::Position;
use crate::risk::DailyRiskState;
use crate::types::{Direction, ExitReason, PositionStatus};

const CHECKPOINT_FILE: &str = "engine_state.json";
const POSITIONS_DIR: &str = "positions";
const STATS_DIR: &str = "stats";
/// Closed positions retained in the checkpoint index
const MAX_CHECKPOINT_CLOSED: usize = 1000;

/// Position journal row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub recorded_at: DateTime<Utc>,
    pub position_id: String,
    pub symbol: String,
    pub market_id: String,
    pub direction: Direction,
    pub size_usd: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub status: PositionStatus,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub fee_usd: f64,
}

impl PositionRecord {
    pub fn new(position: &Position, recorded_at: DateTime<Utc>) -> Self {
        Self {
            recorded_at,
            position_id: position.position_id.clone(),
            symbol: position.symbol.clone(),
            market_id: position.market_id.clone(),
            direction: position.direction,
            size_usd: position.size_usd,
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            status: position.status,
            exit_price: position.exit_price,
            exit_time: position.exit_time,
            realized_pnl: position.realized_pnl,
            exit_reason: position.exit_reason,
            fee_usd: position.fee_usd,
        }
    }
}

impl From<PositionRecord> for Position {
    fn from(r: PositionRecord) -> Self {
        Position {
            position_id: r.position_id,
            symbol: r.symbol,
            market_id: r.market_id,
            direction: r.direction,
            size_usd: r.size_usd,
            entry_price: r.entry_price,
            entry_time: r.entry_time,
            status: r.status,
            exit_price: r.exit_price,
            exit_time: r.exit_time,
            realized_pnl: r.realized_pnl,
            exit_reason: r.exit_reason,
            fee_usd: r.fee_usd,
        }
    }
}

/// On-disk checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saved_at: DateTime<Utc>,
    pub positions: Vec<Position>,
    pub risk: DailyRiskState,
    pub stats: StatsTracker,
}

/// What `upsert` did with a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Identical replay, or an update to an already CLOSED position
    Unchanged,
}

/// State recovered at startup
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub open_positions: Vec<Position>,
    /// Closes journaled after the checkpoint; not yet in `risk`/`stats`
    pub closed_since_checkpoint: Vec<Position>,
    pub risk: Option<DailyRiskState>,
    pub stats: Option<StatsTracker>,
}

/// CSV writer that rolls to a new file when the UTC date changes
struct DatedWriter {
    dir: PathBuf,
    prefix: &'static str,
    date: Option<NaiveDate>,
    writer: Option<csv::Writer<fs::File>>,
}

impl DatedWriter {
    fn new(dir: PathBuf, prefix: &'static str) -> Self {
        Self {
            dir,
            prefix,
            date: None,
            writer: None,
        }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", self.prefix, date.format("%Y-%m-%d")))
    }

    fn write<T: Serialize>(&mut self, record: &T, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        if self.date != Some(today) || self.writer.is_none() {
            fs::create_dir_all(&self.dir).context("Failed to create CSV directory")?;
            self.writer = Some(create_writer(&self.path_for(today))?);
            self.date = Some(today);
        }

        let result = match self.writer.as_mut() {
            Some(writer) => writer
                .serialize(record)
                .context("Failed to write CSV record")
                .and_then(|_| writer.flush().context("Failed to flush CSV writer")),
            None => Ok(()),
        };
        if result.is_err() {
            // Reopen on the next attempt
            self.writer = None;
        }
        result
    }
}

/// Append-mode CSV writer; header only when the file is new or empty
fn create_writer(path: &Path) -> Result<csv::Writer<fs::File>> {
    let file_has_data = path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open CSV file")?;

    Ok(WriterBuilder::new()
        .has_headers(!file_has_data)
        .from_writer(file))
}

/// Run `op` up to `attempts` times
fn with_retries<F>(attempts: u32, mut op: F) -> std::result::Result<(), String>
where
    F: FnMut() -> Result<()>,
{
    let attempts = attempts.max(1);
    let mut last_err = String::new();
    for attempt in 1..=attempts {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(attempt, error = %e, "Persistence write attempt failed");
                last_err = format!("{:#}", e);
            }
        }
    }
    Err(last_err)
}

/// Durable, idempotent store for positions, risk state and stats.
///
/// Without a data directory, or after a write exhausts its retries, the store
/// keeps working from its in-memory index only.
pub struct PersistenceStore {
    data_dir: Option<PathBuf>,
    write_retries: u32,
    degraded: bool,
    index: HashMap<String, Position>,
    journal: Option<DatedWriter>,
    stats_writer: Option<DatedWriter>,
}

impl PersistenceStore {
    pub fn new(data_dir: impl Into<PathBuf>, write_retries: u32) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(data_dir.join(POSITIONS_DIR))?;
        fs::create_dir_all(data_dir.join(STATS_DIR))?;

        info!(dir = %data_dir.display(), "Persistence initialized");

        Ok(Self {
            journal: Some(DatedWriter::new(data_dir.join(POSITIONS_DIR), "positions")),
            stats_writer: Some(DatedWriter::new(data_dir.join(STATS_DIR), "stats")),
            data_dir: Some(data_dir),
            write_retries,
            degraded: false,
            index: HashMap::new(),
        })
    }

    /// Store without disk backing
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            write_retries: 0,
            degraded: false,
            index: HashMap::new(),
            journal: None,
            stats_writer: None,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.data_dir.is_some() && !self.degraded
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn indexed(&self, position_id: &str) -> Option<&Position> {
        self.index.get(position_id)
    }

    fn degrade(&mut self, what: &str, reason: String) -> EngineError {
        self.degraded = true;
        warn!(
            what,
            attempts = self.write_retries,
            error = %reason,
            "⚠️ Persistence degraded to in-memory only"
        );
        EngineError::PersistenceWriteFailure {
            attempts: self.write_retries.max(1),
            reason,
        }
    }

    /// Record the current state of a position. Idempotent on position_id.
    pub fn upsert(
        &mut self,
        position: &Position,
        now: DateTime<Utc>,
    ) -> EngineResult<UpsertOutcome> {
        let outcome = match self.index.get(&position.position_id) {
            Some(existing) if existing == position => return Ok(UpsertOutcome::Unchanged),
            Some(existing) if !existing.is_open() => {
                debug!(id = %position.position_id, "Ignoring update to closed position");
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };

        self.index
            .insert(position.position_id.clone(), position.clone());

        if self.degraded {
            return Ok(outcome);
        }
        let Some(journal) = self.journal.as_mut() else {
            return Ok(outcome);
        };

        let record = PositionRecord::new(position, now);
        if let Err(reason) = with_retries(self.write_retries, || journal.write(&record, now)) {
            return Err(self.degrade("position journal", reason));
        }
        Ok(outcome)
    }

    /// Append a stats row for external reporting
    pub fn snapshot(&mut self, stats: &TradingStats) -> EngineResult<()> {
        if self.degraded {
            return Ok(());
        }
        let Some(writer) = self.stats_writer.as_mut() else {
            return Ok(());
        };
        let now = stats.timestamp;
        if let Err(reason) = with_retries(self.write_retries, || writer.write(stats, now)) {
            return Err(self.degrade("stats snapshot", reason));
        }
        Ok(())
    }

    /// Persist the position index with risk state and stats
    pub fn checkpoint(
        &mut self,
        risk: &DailyRiskState,
        stats: &StatsTracker,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.trim_index();

        if self.degraded {
            return Ok(());
        }
        let Some(dir) = self.data_dir.clone() else {
            return Ok(());
        };

        let mut positions: Vec<Position> = self.index.values().cloned().collect();
        positions.sort_by(|a, b| a.entry_time.cmp(&b.entry_time));
        let checkpoint = Checkpoint {
            saved_at: now,
            positions,
            risk: risk.clone(),
            stats: stats.clone(),
        };

        let result = with_retries(self.write_retries, || write_checkpoint(&dir, &checkpoint));
        if let Err(reason) = result {
            return Err(self.degrade("checkpoint", reason));
        }
        debug!(positions = checkpoint.positions.len(), "Checkpoint saved");
        Ok(())
    }

    /// Drop the oldest closed positions beyond the retention cap
    fn trim_index(&mut self) {
        let mut closed: Vec<(DateTime<Utc>, String)> = self
            .index
            .values()
            .filter(|p| !p.is_open())
            .map(|p| (p.exit_time.unwrap_or(p.entry_time), p.position_id.clone()))
            .collect();
        if closed.len() <= MAX_CHECKPOINT_CLOSED {
            return;
        }
        closed.sort();
        let excess = closed.len() - MAX_CHECKPOINT_CLOSED;
        for (_, id) in closed.into_iter().take(excess) {
            self.index.remove(&id);
        }
    }

    /// Rebuild state from the last checkpoint plus newer journal rows
    pub fn load(&mut self) -> Result<RecoveredState> {
        let Some(dir) = self.data_dir.clone() else {
            return Ok(RecoveredState::default());
        };

        let checkpoint = read_checkpoint(&dir)?;
        let saved_at = checkpoint.as_ref().map(|c| c.saved_at);

        self.index.clear();
        if let Some(cp) = &checkpoint {
            for position in &cp.positions {
                self.index
                    .insert(position.position_id.clone(), position.clone());
            }
        }

        let mut closed_since_checkpoint = Vec::new();
        let mut replayed = 0usize;
        for record in read_journal(&dir.join(POSITIONS_DIR), saved_at)? {
            if saved_at.map_or(false, |s| record.recorded_at <= s) {
                continue;
            }
            let position = Position::from(record);
            match self.index.get(&position.position_id) {
                Some(existing) if !existing.is_open() || *existing == position => continue,
                _ => {}
            }
            if !position.is_open() {
                closed_since_checkpoint.push(position.clone());
            }
            self.index
                .insert(position.position_id.clone(), position);
            replayed += 1;
        }

        let mut open_positions: Vec<Position> =
            self.index.values().filter(|p| p.is_open()).cloned().collect();
        open_positions.sort_by(|a, b| a.entry_time.cmp(&b.entry_time));

        info!(
            checkpoint = saved_at.is_some(),
            replayed,
            open = open_positions.len(),
            closed_since_checkpoint = closed_since_checkpoint.len(),
            "Loaded persisted state"
        );

        Ok(RecoveredState {
            open_positions,
            closed_since_checkpoint,
            risk: checkpoint.as_ref().map(|c| c.risk.clone()),
            stats: checkpoint.map(|c| c.stats),
        })
    }

    pub fn load_open_positions(&mut self) -> Result<Vec<Position>> {
        Ok(self.load()?.open_positions)
    }
}

fn write_checkpoint(dir: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let path = dir.join(CHECKPOINT_FILE);
    let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
    let json = serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
    fs::write(&tmp, json).context("Failed to write checkpoint")?;
    fs::rename(&tmp, &path).context("Failed to move checkpoint into place")?;
    Ok(())
}

fn read_checkpoint(dir: &Path) -> Result<Option<Checkpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).context("Failed to read checkpoint")?;
    let checkpoint: Checkpoint =
        serde_json::from_str(&content).context("Failed to parse checkpoint")?;
    info!(path = %path.display(), saved_at = %checkpoint.saved_at, "Checkpoint found");
    Ok(Some(checkpoint))
}

/// Journal rows from files dated on or after `since`, in file then row order
fn read_journal(dir: &Path, since: Option<DateTime<Utc>>) -> Result<Vec<PositionRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<(NaiveDate, PathBuf)> = fs::read_dir(dir)
        .context("Failed to list journal directory")?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| {
            let stem = path.file_stem()?.to_str()?;
            let date = stem.strip_prefix("positions_")?;
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
            Some((date, path))
        })
        .filter(|(date, _)| since.map_or(true, |s| *date >= s.date_naive()))
        .collect();
    files.sort();

    let mut records = Vec::new();
    for (_, path) in files {
        let file = fs::File::open(&path).context("Failed to open journal file")?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        for row in reader.deserialize::<PositionRecord>() {
            match row {
                Ok(record) => records.push(record),
                // A torn final row from a crash mid-write
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable journal row"
                ),
            }
        }
    }
    Ok(records)
}
