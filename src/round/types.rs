use crate::error::AppError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::{
    ACTION_ACK_EVENT, ACTION_ERROR_EVENT, PRICE_SAMPLE_EVENT, ROUND_CREATED_EVENT,
    ROUND_UPDATED_EVENT,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(String);

impl RoundId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoundId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Prediction,
    Battle,
    Versus,
    Tournament,
}

impl GameMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prediction => "prediction",
            Self::Battle => "battle",
            Self::Versus => "versus",
            Self::Tournament => "tournament",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prediction" => Ok(Self::Prediction),
            "battle" => Ok(Self::Battle),
            "versus" => Ok(Self::Versus),
            "tournament" => Ok(Self::Tournament),
            other => Err(AppError::InvalidArgument(format!(
                "unknown game mode '{other}'"
            ))),
        }
    }
}

/// Round lifecycle shared by every game mode.
///
/// Declaration order is the observation order; `Settled` and `Cancelled` share
/// the terminal rank and a record in either never changes phase again. Each
/// mode only walks a sub-chain of this list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    #[serde(alias = "registration_open", alias = "waiting")]
    Registering,
    #[serde(alias = "ready_check")]
    Starting,
    #[serde(alias = "open", alias = "predicting")]
    Betting,
    #[serde(alias = "active")]
    InProgress,
    Locked,
    #[serde(alias = "cooldown", alias = "pending_dispute", alias = "disputed")]
    Resolving,
    #[serde(alias = "completed")]
    Settled,
    Cancelled,
}

impl RoundPhase {
    pub fn rank(self) -> u8 {
        match self {
            Self::Registering => 0,
            Self::Starting => 1,
            Self::Betting => 2,
            Self::InProgress => 3,
            Self::Locked => 4,
            Self::Resolving => 5,
            Self::Settled | Self::Cancelled => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Cancelled)
    }

    pub fn is_before(self, other: RoundPhase) -> bool {
        self.rank() < other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registering => "registering",
            Self::Starting => "starting",
            Self::Betting => "betting",
            Self::InProgress => "in_progress",
            Self::Locked => "locked",
            Self::Resolving => "resolving",
            Self::Settled => "settled",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "registering" | "registration_open" | "waiting" => Ok(Self::Registering),
            "starting" | "ready_check" => Ok(Self::Starting),
            "betting" | "open" | "predicting" => Ok(Self::Betting),
            "in_progress" | "active" => Ok(Self::InProgress),
            "locked" => Ok(Self::Locked),
            "resolving" | "cooldown" | "pending_dispute" | "disputed" => Ok(Self::Resolving),
            "settled" | "completed" => Ok(Self::Settled),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::InvalidArgument(format!(
                "unknown round phase '{other}'"
            ))),
        }
    }
}

/// Stream of rounds for one game mode, optionally narrowed to an instance
/// (a battle id, a tournament id, an asset pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundTopic {
    pub mode: GameMode,
    pub instance: Option<String>,
}

impl RoundTopic {
    pub fn new(mode: GameMode, instance: Option<String>) -> Self {
        Self { mode, instance }
    }

    pub fn key(&self) -> String {
        match &self.instance {
            Some(instance) => format!("{}:{instance}", self.mode.as_str()),
            None => self.mode.as_str().to_string(),
        }
    }
}

impl fmt::Display for RoundTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Joined,
    Ready,
    NotReady,
    Eliminated,
    Left,
}

impl ParticipantStatus {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "joined" => Ok(Self::Joined),
            "ready" => Ok(Self::Ready),
            "not_ready" => Ok(Self::NotReady),
            "eliminated" => Ok(Self::Eliminated),
            "left" => Ok(Self::Left),
            other => Err(AppError::InvalidArgument(format!(
                "unknown participant status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub wallet: String,
    pub status: ParticipantStatus,
    pub joined_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantUpdate {
    pub wallet: String,
    pub status: ParticipantStatus,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "winner", content = "wallet")]
pub enum RoundOutcome {
    Up,
    Down,
    Draw,
    Creator,
    Opponent,
    Player(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceAnchors {
    pub start_price: Option<f64>,
    pub end_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub mode: GameMode,
    pub phase: RoundPhase,
    pub deadlines: BTreeMap<RoundPhase, i64>,
    pub participants: Vec<Participant>,
    pub pools: BTreeMap<String, u64>,
    pub price_anchors: PriceAnchors,
    pub result: Option<RoundOutcome>,
    pub created_at_ms: Option<i64>,
}

impl RoundRecord {
    pub fn new(round_id: RoundId, mode: GameMode, phase: RoundPhase) -> Self {
        Self {
            round_id,
            mode,
            phase,
            deadlines: BTreeMap::new(),
            participants: Vec::new(),
            pools: BTreeMap::new(),
            price_anchors: PriceAnchors::default(),
            result: None,
            created_at_ms: None,
        }
    }

    /// Position of this round in the topic's sequence: the creation time when
    /// the backend sends one, otherwise the earliest deadline.
    pub fn sequence_ms(&self) -> Option<i64> {
        self.created_at_ms
            .or_else(|| self.deadlines.values().min().copied())
    }

    pub fn deadline_for(&self, phase: RoundPhase) -> Option<i64> {
        self.deadlines.get(&phase).copied()
    }

    pub fn current_deadline(&self) -> Option<i64> {
        self.deadline_for(self.phase)
    }

    pub fn participant(&self, wallet: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.wallet == wallet)
    }

    pub fn total_pool(&self) -> u64 {
        self.pools
            .values()
            .fold(0_u64, |total, amount| total.saturating_add(*amount))
    }

    /// Inserts, updates or removes a participant while keeping join order.
    pub fn upsert_participant(&mut self, update: &ParticipantUpdate) {
        let existing = self
            .participants
            .iter()
            .position(|participant| participant.wallet == update.wallet);

        match (existing, update.status) {
            (Some(index), ParticipantStatus::Left) => {
                self.participants.remove(index);
            }
            (None, ParticipantStatus::Left) => (),
            (Some(index), status) => {
                self.participants[index].status = status;
            }
            (None, status) => {
                let insert_at = self
                    .participants
                    .iter()
                    .position(|participant| participant.joined_at_ms > update.at_ms)
                    .unwrap_or(self.participants.len());
                self.participants.insert(
                    insert_at,
                    Participant {
                        wallet: update.wallet.clone(),
                        status,
                        joined_at_ms: update.at_ms,
                    },
                );
            }
        }
    }

    pub fn apply_patch(&mut self, phase: RoundPhase, patch: &RoundPatch) {
        self.phase = phase;
        for (deadline_phase, deadline_ms) in &patch.deadlines {
            self.deadlines.insert(*deadline_phase, *deadline_ms);
        }
        for update in &patch.participants {
            self.upsert_participant(update);
        }
        for (side, amount) in &patch.pools {
            self.pools.insert(side.clone(), *amount);
        }
        if let Some(start_price) = patch.start_price {
            self.price_anchors.start_price = Some(start_price);
        }
        if let Some(end_price) = patch.end_price {
            self.price_anchors.end_price = Some(end_price);
        }
        if let Some(result) = &patch.result {
            self.result = Some(result.clone());
        }
        if !self.phase.is_terminal() {
            self.result = None;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundPatch {
    pub deadlines: BTreeMap<RoundPhase, i64>,
    pub participants: Vec<ParticipantUpdate>,
    pub pools: BTreeMap<String, u64>,
    pub start_price: Option<f64>,
    pub end_price: Option<f64>,
    pub result: Option<RoundOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    Created(RoundRecord),
    Updated {
        round_id: RoundId,
        phase: RoundPhase,
        patch: RoundPatch,
    },
}

impl RoundEvent {
    pub fn round_id(&self) -> &RoundId {
        match self {
            Self::Created(record) => &record.round_id,
            Self::Updated { round_id, .. } => round_id,
        }
    }

    pub fn phase(&self) -> RoundPhase {
        match self {
            Self::Created(record) => record.phase,
            Self::Updated { phase, .. } => *phase,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Round {
        topic: String,
        event: RoundEvent,
    },
    ActionAck {
        topic: String,
        round_id: RoundId,
        correlation_id: u64,
        frozen_multiplier_bps: Option<u32>,
    },
    ActionError {
        topic: String,
        round_id: RoundId,
        correlation_id: u64,
        reason: String,
    },
    PriceSample {
        topic: String,
        price: f64,
        t: i64,
    },
}

impl ChannelEvent {
    pub fn topic(&self) -> &str {
        match self {
            Self::Round { topic, .. }
            | Self::ActionAck { topic, .. }
            | Self::ActionError { topic, .. }
            | Self::PriceSample { topic, .. } => topic,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoundSnapshot {
    pub server_time_ms: i64,
    pub record: Option<RoundRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantWire {
    pub wallet: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub joined_at_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundOutcomeWire {
    pub winner: String,
    #[serde(default)]
    pub wallet: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecordWire {
    pub round_id: String,
    pub mode: String,
    pub phase: String,
    #[serde(default)]
    pub deadlines: HashMap<String, i64>,
    #[serde(default)]
    pub participants: Vec<ParticipantWire>,
    #[serde(default)]
    pub pools: HashMap<String, u64>,
    #[serde(default)]
    pub start_price: Option<f64>,
    #[serde(default)]
    pub end_price: Option<f64>,
    #[serde(default)]
    pub result: Option<RoundOutcomeWire>,
    #[serde(default)]
    pub created_at_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundPatchWire {
    #[serde(default)]
    pub deadlines: HashMap<String, i64>,
    #[serde(default)]
    pub participants: Vec<ParticipantWire>,
    #[serde(default)]
    pub pools: HashMap<String, u64>,
    #[serde(default)]
    pub start_price: Option<f64>,
    #[serde(default)]
    pub end_price: Option<f64>,
    #[serde(default)]
    pub result: Option<RoundOutcomeWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEventWire {
    #[serde(rename = "type")]
    pub event_type: String,
    pub topic: String,
    #[serde(default)]
    pub round_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub round: Option<RoundRecordWire>,
    #[serde(default)]
    pub patch: Option<RoundPatchWire>,
    #[serde(default)]
    pub correlation_id: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub frozen_multiplier_bps: Option<u32>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub t: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshotWire {
    pub server_time_ms: i64,
    #[serde(default)]
    pub round: Option<RoundRecordWire>,
}

fn parse_deadlines(raw: HashMap<String, i64>) -> Result<BTreeMap<RoundPhase, i64>, AppError> {
    let mut deadlines = BTreeMap::new();
    for (phase, deadline_ms) in raw {
        if deadline_ms < 0 {
            return Err(AppError::InvalidArgument(format!(
                "deadline for '{phase}' must be non-negative"
            )));
        }
        deadlines.insert(RoundPhase::parse_str(&phase)?, deadline_ms);
    }
    Ok(deadlines)
}

fn parse_price(value: Option<f64>, field: &str) -> Result<Option<f64>, AppError> {
    match value {
        Some(price) if !price.is_finite() || price < 0.0 => Err(AppError::InvalidArgument(
            format!("{field} must be finite and non-negative"),
        )),
        other => Ok(other),
    }
}

impl TryFrom<ParticipantWire> for ParticipantUpdate {
    type Error = AppError;

    fn try_from(value: ParticipantWire) -> Result<Self, Self::Error> {
        if value.wallet.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "participant wallet must be non-empty".to_string(),
            ));
        }
        let status = match value.status {
            Some(raw) => ParticipantStatus::parse_str(&raw)?,
            None => ParticipantStatus::Joined,
        };
        Ok(Self {
            wallet: value.wallet,
            status,
            at_ms: value.joined_at_ms.unwrap_or_default(),
        })
    }
}

impl TryFrom<RoundOutcomeWire> for RoundOutcome {
    type Error = AppError;

    fn try_from(value: RoundOutcomeWire) -> Result<Self, Self::Error> {
        match value.winner.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "draw" => Ok(Self::Draw),
            "creator" => Ok(Self::Creator),
            "opponent" => Ok(Self::Opponent),
            "player" => value.wallet.map(Self::Player).ok_or_else(|| {
                AppError::InvalidArgument("player outcome requires a wallet".to_string())
            }),
            other => Err(AppError::InvalidArgument(format!(
                "unknown round outcome '{other}'"
            ))),
        }
    }
}

impl TryFrom<RoundRecordWire> for RoundRecord {
    type Error = AppError;

    fn try_from(value: RoundRecordWire) -> Result<Self, Self::Error> {
        if value.round_id.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "roundId must be non-empty".to_string(),
            ));
        }

        let mut record = RoundRecord::new(
            RoundId::new(value.round_id),
            GameMode::parse_str(&value.mode)?,
            RoundPhase::parse_str(&value.phase)?,
        );
        record.deadlines = parse_deadlines(value.deadlines)?;
        for participant in value.participants {
            record.upsert_participant(&participant.try_into()?);
        }
        record.pools = value.pools.into_iter().collect();
        record.price_anchors = PriceAnchors {
            start_price: parse_price(value.start_price, "startPrice")?,
            end_price: parse_price(value.end_price, "endPrice")?,
        };
        if record.phase.is_terminal() {
            record.result = value.result.map(RoundOutcome::try_from).transpose()?;
        }
        record.created_at_ms = value.created_at_ms;
        Ok(record)
    }
}

impl TryFrom<RoundPatchWire> for RoundPatch {
    type Error = AppError;

    fn try_from(value: RoundPatchWire) -> Result<Self, Self::Error> {
        let mut participants = Vec::with_capacity(value.participants.len());
        for participant in value.participants {
            participants.push(participant.try_into()?);
        }
        Ok(Self {
            deadlines: parse_deadlines(value.deadlines)?,
            participants,
            pools: value.pools.into_iter().collect(),
            start_price: parse_price(value.start_price, "startPrice")?,
            end_price: parse_price(value.end_price, "endPrice")?,
            result: value.result.map(RoundOutcome::try_from).transpose()?,
        })
    }
}

fn require_round_id(value: Option<String>, event_type: &str) -> Result<RoundId, AppError> {
    value
        .filter(|round_id| !round_id.trim().is_empty())
        .map(RoundId::new)
        .ok_or_else(|| AppError::InvalidArgument(format!("{event_type} requires roundId")))
}

fn require_correlation_id(value: Option<u64>, event_type: &str) -> Result<u64, AppError> {
    value.ok_or_else(|| AppError::InvalidArgument(format!("{event_type} requires correlationId")))
}

impl TryFrom<ChannelEventWire> for ChannelEvent {
    type Error = AppError;

    fn try_from(value: ChannelEventWire) -> Result<Self, Self::Error> {
        let topic = value.topic;
        match value.event_type.as_str() {
            ROUND_CREATED_EVENT => {
                let round = value.round.ok_or_else(|| {
                    AppError::InvalidArgument("round_created requires a round".to_string())
                })?;
                Ok(Self::Round {
                    topic,
                    event: RoundEvent::Created(round.try_into()?),
                })
            }
            ROUND_UPDATED_EVENT => {
                let round_id = require_round_id(value.round_id, ROUND_UPDATED_EVENT)?;
                let phase = value.phase.ok_or_else(|| {
                    AppError::InvalidArgument("round_updated requires a phase".to_string())
                })?;
                Ok(Self::Round {
                    topic,
                    event: RoundEvent::Updated {
                        round_id,
                        phase: RoundPhase::parse_str(&phase)?,
                        patch: value.patch.unwrap_or_default().try_into()?,
                    },
                })
            }
            ACTION_ACK_EVENT => Ok(Self::ActionAck {
                topic,
                round_id: require_round_id(value.round_id, ACTION_ACK_EVENT)?,
                correlation_id: require_correlation_id(value.correlation_id, ACTION_ACK_EVENT)?,
                frozen_multiplier_bps: value.frozen_multiplier_bps,
            }),
            ACTION_ERROR_EVENT => Ok(Self::ActionError {
                topic,
                round_id: require_round_id(value.round_id, ACTION_ERROR_EVENT)?,
                correlation_id: require_correlation_id(value.correlation_id, ACTION_ERROR_EVENT)?,
                reason: value
                    .reason
                    .unwrap_or_else(|| "action rejected".to_string()),
            }),
            PRICE_SAMPLE_EVENT => {
                let price = value.price.ok_or_else(|| {
                    AppError::InvalidArgument("price_sample requires a price".to_string())
                })?;
                if !price.is_finite() {
                    return Err(AppError::InvalidArgument(
                        "price_sample price must be finite".to_string(),
                    ));
                }
                Ok(Self::PriceSample {
                    topic,
                    price,
                    t: value.t.unwrap_or_default(),
                })
            }
            other => Err(AppError::InvalidArgument(format!(
                "unexpected channel event type '{other}'"
            ))),
        }
    }
}

impl TryFrom<RoundSnapshotWire> for RoundSnapshot {
    type Error = AppError;

    fn try_from(value: RoundSnapshotWire) -> Result<Self, Self::Error> {
        Ok(Self {
            server_time_ms: value.server_time_ms,
            record: value.round.map(RoundRecord::try_from).transpose()?,
        })
    }
}

pub fn parse_channel_event(payload: &mut [u8]) -> Result<ChannelEvent, AppError> {
    let wire: ChannelEventWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}
