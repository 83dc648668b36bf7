use crate::error::AppError;
use crate::round::types::{GameMode, RoundId, RoundPhase, RoundRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info, warn};

pub const MIN_BET_LAMPORTS: u64 = 10_000_000;
pub const MAX_BET_LAMPORTS: u64 = 100_000_000_000;
pub const DEFAULT_REJECTION_DISPLAY_MS: i64 = 4_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Bet,
    Join,
    Leave,
    ReadyResponse,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetSide {
    Up,
    Down,
    Creator,
    Opponent,
}

impl BetSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Creator => "creator",
            Self::Opponent => "opponent",
        }
    }

    fn allowed_in(self, mode: GameMode) -> bool {
        match mode {
            GameMode::Prediction => matches!(self, Self::Up | Self::Down),
            GameMode::Battle | GameMode::Versus => matches!(self, Self::Creator | Self::Opponent),
            GameMode::Tournament => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ActionPayload {
    Bet {
        side: BetSide,
        #[serde(rename = "amountLamports")]
        amount_lamports: u64,
    },
    Join,
    Leave,
    ReadyResponse {
        ready: bool,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Bet { .. } => ActionKind::Bet,
            Self::Join => ActionKind::Join,
            Self::Leave => ActionKind::Leave,
            Self::ReadyResponse { .. } => ActionKind::ReadyResponse,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ActionStatus {
    Idle,
    Submitting,
    Confirmed,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub round_id: RoundId,
    pub payload: ActionPayload,
    pub status: ActionStatus,
    pub correlation_id: u64,
    pub submitted_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
    pub frozen_multiplier_bps: Option<u32>,
}

/// Body of an action submission. The correlation id comes back on the
/// matching channel ack or error.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub correlation_id: u64,
    pub round_id: RoundId,
    pub wallet: String,
    pub action: ActionPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionReceiptWire {
    pub correlation_id: u64,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub frozen_multiplier_bps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReceipt {
    Accepted {
        correlation_id: u64,
        frozen_multiplier_bps: Option<u32>,
    },
    Rejected {
        correlation_id: u64,
        reason: String,
    },
}

impl From<ActionReceiptWire> for ActionReceipt {
    fn from(value: ActionReceiptWire) -> Self {
        if value.accepted {
            Self::Accepted {
                correlation_id: value.correlation_id,
                frozen_multiplier_bps: value.frozen_multiplier_bps,
            }
        } else {
            Self::Rejected {
                correlation_id: value.correlation_id,
                reason: value
                    .reason
                    .unwrap_or_else(|| "action rejected".to_string()),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    Duplicate,
    Unknown,
}

/// Local pre-checks for a bet. The backend remains the authority.
pub fn validate_bet(
    record: Option<&RoundRecord>,
    side: BetSide,
    amount_lamports: u64,
    now_ms: Option<i64>,
) -> Result<(), AppError> {
    if !(MIN_BET_LAMPORTS..=MAX_BET_LAMPORTS).contains(&amount_lamports) {
        return Err(AppError::InvalidArgument(format!(
            "bet must be between {MIN_BET_LAMPORTS} and {MAX_BET_LAMPORTS} lamports"
        )));
    }

    let record = record.ok_or_else(|| {
        AppError::InvalidArgument("no active round to bet on".to_string())
    })?;
    if !side.allowed_in(record.mode) {
        return Err(AppError::InvalidArgument(format!(
            "side '{}' is not available in {} rounds",
            side.as_str(),
            record.mode.as_str()
        )));
    }
    if record.phase != RoundPhase::Betting {
        return Err(AppError::InvalidArgument(format!(
            "round {} is not taking bets ({})",
            record.round_id,
            record.phase.as_str()
        )));
    }

    let now_ms = now_ms.ok_or_else(|| {
        AppError::InvalidArgument("clock unavailable, betting closed".to_string())
    })?;
    if let Some(lock_ms) = record.deadline_for(RoundPhase::Betting) {
        if now_ms >= lock_ms {
            return Err(AppError::InvalidArgument(format!(
                "betting closed for round {}",
                record.round_id
            )));
        }
    }
    Ok(())
}

/// Single-flight action tracking for one wallet, one slot per round.
pub struct ActionManager {
    wallet: String,
    rejection_display_ms: i64,
    next_correlation_id: u64,
    pending: HashMap<RoundId, PendingAction>,
}

impl ActionManager {
    pub fn new(wallet: impl Into<String>, rejection_display_ms: i64) -> Self {
        Self {
            wallet: wallet.into(),
            rejection_display_ms,
            next_correlation_id: 1,
            pending: HashMap::new(),
        }
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    /// Marks the round's slot as submitting, or fails if a submission is
    /// already in flight. No network work happens here.
    pub fn begin(
        &mut self,
        round_id: &RoundId,
        payload: ActionPayload,
        now_ms: i64,
    ) -> Result<ActionRequest, AppError> {
        if let Some(existing) = self.pending.get(round_id) {
            if existing.status == ActionStatus::Submitting {
                return Err(AppError::ActionConflict {
                    round_id: round_id.to_string(),
                });
            }
        }

        let correlation_id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1).max(1);
        self.pending.insert(
            round_id.clone(),
            PendingAction {
                round_id: round_id.clone(),
                payload: payload.clone(),
                status: ActionStatus::Submitting,
                correlation_id,
                submitted_at_ms: now_ms,
                resolved_at_ms: None,
                frozen_multiplier_bps: None,
            },
        );
        debug!(round_id = %round_id, correlation_id, kind = ?payload.kind(), "action submitting");

        Ok(ActionRequest {
            correlation_id,
            round_id: round_id.clone(),
            wallet: self.wallet.clone(),
            action: payload,
        })
    }

    pub fn confirm(
        &mut self,
        correlation_id: u64,
        frozen_multiplier_bps: Option<u32>,
        now_ms: i64,
    ) -> ResolveOutcome {
        let Some(action) = self.find_mut(correlation_id) else {
            debug!(correlation_id, "ignoring confirmation for unknown action");
            return ResolveOutcome::Unknown;
        };

        if frozen_multiplier_bps.is_some() {
            action.frozen_multiplier_bps = frozen_multiplier_bps;
        }
        match action.status {
            ActionStatus::Submitting => {
                action.status = ActionStatus::Confirmed;
                action.resolved_at_ms = Some(now_ms);
                info!(round_id = %action.round_id, correlation_id, "action confirmed");
                ResolveOutcome::Resolved
            }
            _ => ResolveOutcome::Duplicate,
        }
    }

    pub fn reject(
        &mut self,
        correlation_id: u64,
        reason: impl Into<String>,
        now_ms: i64,
    ) -> ResolveOutcome {
        let Some(action) = self.find_mut(correlation_id) else {
            debug!(correlation_id, "ignoring rejection for unknown action");
            return ResolveOutcome::Unknown;
        };

        match action.status {
            ActionStatus::Submitting => {
                let reason = reason.into();
                warn!(round_id = %action.round_id, correlation_id, %reason, "action rejected");
                action.status = ActionStatus::Rejected { reason };
                action.resolved_at_ms = Some(now_ms);
                ResolveOutcome::Resolved
            }
            _ => ResolveOutcome::Duplicate,
        }
    }

    pub fn resolve(&mut self, receipt: ActionReceipt, now_ms: i64) -> ResolveOutcome {
        match receipt {
            ActionReceipt::Accepted {
                correlation_id,
                frozen_multiplier_bps,
            } => self.confirm(correlation_id, frozen_multiplier_bps, now_ms),
            ActionReceipt::Rejected {
                correlation_id,
                reason,
            } => self.reject(correlation_id, reason, now_ms),
        }
    }

    /// Returns a resolved action to idle once the user has seen it.
    pub fn acknowledge(&mut self, round_id: &RoundId) -> Result<(), AppError> {
        match self.pending.get(round_id).map(|action| &action.status) {
            None | Some(ActionStatus::Idle) => Err(AppError::ActionNotFound(round_id.to_string())),
            Some(ActionStatus::Submitting) => Err(AppError::ActionConflict {
                round_id: round_id.to_string(),
            }),
            Some(ActionStatus::Confirmed) | Some(ActionStatus::Rejected { .. }) => {
                self.pending.remove(round_id);
                Ok(())
            }
        }
    }

    /// Clears rejections that have been on display long enough.
    pub fn expire_rejections(&mut self, now_ms: i64) -> usize {
        let display_ms = self.rejection_display_ms;
        let before = self.pending.len();
        self.pending.retain(|_, action| match (&action.status, action.resolved_at_ms) {
            (ActionStatus::Rejected { .. }, Some(resolved_ms)) => {
                now_ms.saturating_sub(resolved_ms) < display_ms
            }
            _ => true,
        });
        before - self.pending.len()
    }

    /// The round moved on; any in-flight submission is forgotten and its late
    /// response will be ignored.
    pub fn retire_round(&mut self, round_id: &RoundId) {
        if let Some(action) = self.pending.remove(round_id) {
            if action.status == ActionStatus::Submitting {
                info!(
                    round_id = %round_id,
                    correlation_id = action.correlation_id,
                    "round retired during submission"
                );
            }
        }
    }

    pub fn reset_all(&mut self) {
        self.pending.clear();
    }

    pub fn status(&self, round_id: &RoundId) -> ActionStatus {
        self.pending
            .get(round_id)
            .map(|action| action.status.clone())
            .unwrap_or(ActionStatus::Idle)
    }

    pub fn pending(&self, round_id: &RoundId) -> Option<&PendingAction> {
        self.pending.get(round_id)
    }

    pub fn snapshot(&self) -> Vec<PendingAction> {
        let mut actions: Vec<PendingAction> = self.pending.values().cloned().collect();
        actions.sort_by(|left, right| left.round_id.cmp(&right.round_id));
        actions
    }

    fn find_mut(&mut self, correlation_id: u64) -> Option<&mut PendingAction> {
        self.pending
            .values_mut()
            .find(|action| action.correlation_id == correlation_id)
    }
}

/// Runs one submission through `send`. The lock is only held to transition
/// state, never across the transport call. A transport failure is recorded as
/// a rejection; there is no automatic retry.
pub async fn submit_action<F, Fut>(
    manager: &Mutex<ActionManager>,
    round_id: &RoundId,
    payload: ActionPayload,
    now_ms: impl Fn() -> i64,
    send: F,
) -> Result<ActionStatus, AppError>
where
    F: FnOnce(ActionRequest) -> Fut,
    Fut: Future<Output = Result<ActionReceipt, AppError>>,
{
    let request = manager.lock().begin(round_id, payload, now_ms())?;
    let correlation_id = request.correlation_id;

    let result = send(request).await;

    let mut manager = manager.lock();
    let outcome = match result {
        Ok(receipt) => manager.resolve(receipt, now_ms()),
        Err(error) => manager.reject(correlation_id, error.to_string(), now_ms()),
    };
    if outcome == ResolveOutcome::Unknown {
        return Ok(ActionStatus::Idle);
    }
    Ok(manager.status(round_id))
}
