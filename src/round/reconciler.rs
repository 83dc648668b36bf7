use crate::round::types::{RoundEvent, RoundId, RoundPatch, RoundPhase, RoundRecord};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_STALE_AFTER_MS: i64 = 15_000;
const MAX_QUEUED_EVENTS: usize = 4_096;
const MAX_RETIRED_ROUNDS: usize = 64;

pub type PublishedRound = Option<Arc<RoundRecord>>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unsynced,
    AwaitingSnapshot,
    Live,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    StalePhase {
        event: RoundPhase,
        current: RoundPhase,
    },
    RetiredRound,
    /// A created round that sequences before the tracked one.
    OlderRound,
    /// A created event for the round already tracked, carrying no later phase.
    AlreadyTracked,
    /// The tracked round is settled or cancelled and its phase is final.
    Terminal {
        event: RoundPhase,
        current: RoundPhase,
    },
    UnknownRound,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        round_id: RoundId,
        phase: RoundPhase,
        retired: Option<RoundId>,
    },
    Queued {
        depth: usize,
    },
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub applied: bool,
    pub retired: Option<RoundId>,
    pub replayed: Vec<ApplyOutcome>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStats {
    pub snapshots: u64,
    pub applied: u64,
    pub queued: u64,
    pub replayed: u64,
    pub stale_dropped: u64,
    pub unknown_dropped: u64,
    pub overflow_dropped: u64,
    pub ignored_closed: u64,
}

/// Canonical round state for one topic.
///
/// Snapshots replace the record outright. Incremental events only land when
/// they name the tracked round and do not move its phase backwards. While a
/// snapshot is outstanding every event is queued and replayed in arrival
/// order once the snapshot is in.
pub struct RoundReconciler {
    topic: String,
    sync: SyncState,
    record: Option<Arc<RoundRecord>>,
    queue: VecDeque<RoundEvent>,
    retired: VecDeque<RoundId>,
    last_applied_ms: Option<i64>,
    snapshot_failed: bool,
    stale_after_ms: i64,
    stats: ReconcileStats,
    publisher: watch::Sender<PublishedRound>,
}

impl RoundReconciler {
    pub fn new(topic: impl Into<String>, stale_after_ms: i64) -> Self {
        let (publisher, _) = watch::channel(None);
        Self {
            topic: topic.into(),
            sync: SyncState::Unsynced,
            record: None,
            queue: VecDeque::new(),
            retired: VecDeque::new(),
            last_applied_ms: None,
            snapshot_failed: false,
            stale_after_ms,
            stats: ReconcileStats::default(),
            publisher,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishedRound> {
        self.publisher.subscribe()
    }

    pub fn record(&self) -> Option<&RoundRecord> {
        self.record.as_deref()
    }

    pub fn published(&self) -> PublishedRound {
        self.record.clone()
    }

    pub fn current_round_id(&self) -> Option<&RoundId> {
        self.record.as_ref().map(|record| &record.round_id)
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Called on every (re)subscribe. Events are held back until the next
    /// snapshot lands.
    pub fn begin_resync(&mut self) {
        if self.sync != SyncState::AwaitingSnapshot {
            self.queue.clear();
        }
        self.sync = SyncState::AwaitingSnapshot;
        debug!(topic = %self.topic, "awaiting round snapshot");
    }

    pub fn apply_snapshot(&mut self, record: Option<RoundRecord>, now_ms: i64) -> SnapshotOutcome {
        if self.sync == SyncState::Closed {
            self.stats.ignored_closed = self.stats.ignored_closed.saturating_add(1);
            return SnapshotOutcome {
                applied: false,
                retired: None,
                replayed: Vec::new(),
            };
        }

        self.stats.snapshots = self.stats.snapshots.saturating_add(1);
        let retired = match record {
            Some(record) => {
                self.retired.retain(|round_id| *round_id != record.round_id);
                self.install(record)
            }
            None => self.record.take().map(|previous| {
                let previous_id = previous.round_id.clone();
                self.push_retired(previous_id.clone(), None);
                previous_id
            }),
        };
        self.sync = SyncState::Live;
        self.snapshot_failed = false;
        self.last_applied_ms = Some(now_ms);
        self.publish();

        let mut replayed = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop_front() {
            self.stats.replayed = self.stats.replayed.saturating_add(1);
            replayed.push(self.apply_live(event, now_ms));
        }

        info!(
            topic = %self.topic,
            round_id = ?self.current_round_id().map(RoundId::as_str),
            replayed = replayed.len(),
            "round snapshot applied"
        );

        SnapshotOutcome {
            applied: true,
            retired,
            replayed,
        }
    }

    pub fn apply_event(&mut self, event: RoundEvent, now_ms: i64) -> ApplyOutcome {
        match self.sync {
            SyncState::Closed => {
                self.stats.ignored_closed = self.stats.ignored_closed.saturating_add(1);
                ApplyOutcome::Dropped(DropReason::Closed)
            }
            SyncState::Unsynced | SyncState::AwaitingSnapshot => {
                if self.queue.len() >= MAX_QUEUED_EVENTS {
                    self.queue.pop_front();
                    self.stats.overflow_dropped = self.stats.overflow_dropped.saturating_add(1);
                    warn!(topic = %self.topic, "round event queue full, dropping oldest");
                }
                self.queue.push_back(event);
                self.stats.queued = self.stats.queued.saturating_add(1);
                ApplyOutcome::Queued {
                    depth: self.queue.len(),
                }
            }
            SyncState::Live => self.apply_live(event, now_ms),
        }
    }

    pub fn record_snapshot_failure(&mut self) {
        self.snapshot_failed = true;
    }

    pub fn is_stale(&self, now_ms: i64) -> bool {
        match self.sync {
            SyncState::Live => {
                self.snapshot_failed
                    || self
                        .last_applied_ms
                        .map(|applied_ms| now_ms.saturating_sub(applied_ms) > self.stale_after_ms)
                        .unwrap_or(true)
            }
            SyncState::Unsynced | SyncState::AwaitingSnapshot | SyncState::Closed => true,
        }
    }

    /// Unsubscribe: nothing further is applied until the next resync.
    pub fn close(&mut self) {
        self.sync = SyncState::Closed;
        self.queue.clear();
        debug!(topic = %self.topic, "round reconciler closed");
    }

    fn apply_live(&mut self, event: RoundEvent, now_ms: i64) -> ApplyOutcome {
        let outcome = match event {
            RoundEvent::Created(record) => self.apply_created(record),
            RoundEvent::Updated {
                round_id,
                phase,
                patch,
            } => match self.check_update(&round_id, phase) {
                Err(reason) => ApplyOutcome::Dropped(reason),
                Ok(()) => {
                    if let Some(current) = self.record.as_mut() {
                        Arc::make_mut(current).apply_patch(phase, &patch);
                    }
                    ApplyOutcome::Applied {
                        round_id,
                        phase,
                        retired: None,
                    }
                }
            },
        };

        match &outcome {
            ApplyOutcome::Applied { .. } => {
                self.stats.applied = self.stats.applied.saturating_add(1);
                self.last_applied_ms = Some(now_ms);
                self.publish();
            }
            ApplyOutcome::Dropped(DropReason::UnknownRound) => {
                self.stats.unknown_dropped = self.stats.unknown_dropped.saturating_add(1);
                debug!(topic = %self.topic, "dropped event for unknown round");
            }
            ApplyOutcome::Dropped(reason) => {
                self.stats.stale_dropped = self.stats.stale_dropped.saturating_add(1);
                debug!(topic = %self.topic, ?reason, "dropped stale round event");
            }
            ApplyOutcome::Queued { .. } => (),
        }
        outcome
    }

    fn apply_created(&mut self, record: RoundRecord) -> ApplyOutcome {
        if self.retired.contains(&record.round_id) {
            return ApplyOutcome::Dropped(DropReason::RetiredRound);
        }

        if let Some(current) = self.record.as_mut() {
            if current.round_id == record.round_id {
                // Creation state is never newer than what is tracked; only a
                // later phase and its deadlines carry over.
                if current.phase.is_terminal() || !current.phase.is_before(record.phase) {
                    return ApplyOutcome::Dropped(DropReason::AlreadyTracked);
                }
                let patch = RoundPatch {
                    deadlines: record.deadlines,
                    ..RoundPatch::default()
                };
                Arc::make_mut(current).apply_patch(record.phase, &patch);
                return ApplyOutcome::Applied {
                    round_id: record.round_id,
                    phase: record.phase,
                    retired: None,
                };
            }

            let ordering = (record.sequence_ms(), current.sequence_ms());
            if let (Some(incoming), Some(tracked)) = ordering {
                if incoming < tracked {
                    let older_id = record.round_id;
                    let current_id = Some(current.round_id.clone());
                    self.push_retired(older_id, current_id.as_ref());
                    return ApplyOutcome::Dropped(DropReason::OlderRound);
                }
            }
        }

        let round_id = record.round_id.clone();
        let phase = record.phase;
        let retired = self.install(record);
        ApplyOutcome::Applied {
            round_id,
            phase,
            retired,
        }
    }

    fn check_update(&self, round_id: &RoundId, phase: RoundPhase) -> Result<(), DropReason> {
        let Some(current) = self.record.as_ref() else {
            return Err(self.classify_foreign(round_id));
        };
        if current.round_id != *round_id {
            return Err(self.classify_foreign(round_id));
        }
        if phase.is_before(current.phase) {
            return Err(DropReason::StalePhase {
                event: phase,
                current: current.phase,
            });
        }
        if current.phase.is_terminal() && phase != current.phase {
            return Err(DropReason::Terminal {
                event: phase,
                current: current.phase,
            });
        }
        Ok(())
    }

    fn classify_foreign(&self, round_id: &RoundId) -> DropReason {
        if self.retired.contains(round_id) {
            DropReason::RetiredRound
        } else {
            DropReason::UnknownRound
        }
    }

    /// Replaces the canonical record, returning the id it retired, if any.
    fn install(&mut self, record: RoundRecord) -> Option<RoundId> {
        let previous = self.record.replace(Arc::new(record));
        let new_round_id = self.current_round_id().cloned();
        let retired = previous
            .map(|previous| previous.round_id.clone())
            .filter(|previous_id| Some(previous_id) != new_round_id.as_ref());

        if let Some(retired_id) = &retired {
            self.push_retired(retired_id.clone(), new_round_id.as_ref());
        }
        retired
    }

    fn push_retired(&mut self, retired_id: RoundId, current: Option<&RoundId>) {
        info!(
            topic = %self.topic,
            retired = %retired_id,
            round_id = ?current.map(RoundId::as_str),
            "round retired"
        );
        if self.retired.contains(&retired_id) {
            return;
        }
        self.retired.push_back(retired_id);
        while self.retired.len() > MAX_RETIRED_ROUNDS {
            self.retired.pop_front();
        }
    }

    fn publish(&self) {
        self.publisher.send_replace(self.record.clone());
    }
}
