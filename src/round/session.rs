use crate::error::AppError;
use crate::round::actions::{
    validate_bet, ActionManager, ActionPayload, ActionStatus, PendingAction,
};
use crate::round::animator::{ease_out_cubic, AnimatedValue, PriceAnimator, Tween};
use crate::round::clock::Clock;
use crate::round::config::RoundStreamConfig;
use crate::round::odds::{estimate_payout_multiplier, OddsEstimate};
use crate::round::ready_check::{ReadyCheck, ReadyCheckSnapshot};
use crate::round::reconciler::{
    ApplyOutcome, DropReason, PublishedRound, ReconcileStats, RoundReconciler, SnapshotOutcome,
};
use crate::round::timer::{PhaseTimer, TimerState};
use crate::round::types::{ChannelEvent, RoundId, RoundPhase, RoundRecord, RoundTopic};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// What the stream driver should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDirective {
    Continue,
    Resync { reason: String },
}

/// Read-only receivers for the view layer.
#[derive(Clone)]
pub struct RoundViewHandles {
    pub record: watch::Receiver<PublishedRound>,
    pub timer: watch::Receiver<TimerState>,
    pub price: watch::Receiver<AnimatedValue>,
    pub actions: watch::Receiver<Vec<PendingAction>>,
    pub ready_check: watch::Receiver<Option<ReadyCheckSnapshot>>,
}

/// Everything tracked for one subscribed topic. Built on subscribe, torn down
/// with `close`.
pub struct RoundSession {
    topic: RoundTopic,
    topic_key: String,
    wallet: Option<String>,
    clock: Arc<dyn Clock>,
    reconciler: RoundReconciler,
    actions: Arc<Mutex<ActionManager>>,
    ready_check: Option<ReadyCheck>,
    timer: PhaseTimer,
    animator: PriceAnimator,
    timer_tx: watch::Sender<TimerState>,
    price_tx: watch::Sender<AnimatedValue>,
    actions_tx: watch::Sender<Vec<PendingAction>>,
    ready_tx: watch::Sender<Option<ReadyCheckSnapshot>>,
}

impl RoundSession {
    pub fn new(config: &RoundStreamConfig, clock: Arc<dyn Clock>) -> Self {
        let topic_key = config.topic.key();
        let tween = Tween::new(config.animation_duration_ms as i64, ease_out_cubic);
        let (timer_tx, _) = watch::channel(TimerState::default());
        let (price_tx, _) = watch::channel(AnimatedValue::default());
        let (actions_tx, _) = watch::channel(Vec::new());
        let (ready_tx, _) = watch::channel(None);

        Self {
            topic: config.topic.clone(),
            reconciler: RoundReconciler::new(topic_key.clone(), config.stale_after_ms as i64),
            topic_key,
            wallet: config.wallet.clone(),
            actions: Arc::new(Mutex::new(ActionManager::new(
                config.wallet.clone().unwrap_or_default(),
                config.rejection_display_ms as i64,
            ))),
            ready_check: None,
            timer: PhaseTimer::new(Arc::clone(&clock)),
            animator: PriceAnimator::new(tween, config.reduced_motion),
            clock,
            timer_tx,
            price_tx,
            actions_tx,
            ready_tx,
        }
    }

    pub fn topic(&self) -> &RoundTopic {
        &self.topic
    }

    pub fn view(&self) -> RoundViewHandles {
        RoundViewHandles {
            record: self.reconciler.subscribe(),
            timer: self.timer_tx.subscribe(),
            price: self.price_tx.subscribe(),
            actions: self.actions_tx.subscribe(),
            ready_check: self.ready_tx.subscribe(),
        }
    }

    pub fn actions(&self) -> Arc<Mutex<ActionManager>> {
        Arc::clone(&self.actions)
    }

    pub fn record(&self) -> Option<&RoundRecord> {
        self.reconciler.record()
    }

    pub fn current_round_id(&self) -> Option<&RoundId> {
        self.reconciler.current_round_id()
    }

    pub fn stats(&self) -> ReconcileStats {
        self.reconciler.stats()
    }

    pub fn is_stale(&self) -> bool {
        self.reconciler.is_stale(self.now_ms())
    }

    pub fn begin_resync(&mut self) {
        self.reconciler.begin_resync();
    }

    pub fn record_snapshot_failure(&mut self) {
        self.reconciler.record_snapshot_failure();
    }

    pub fn apply_snapshot(&mut self, record: Option<RoundRecord>) -> SnapshotOutcome {
        let now_ms = self.now_ms();
        let outcome = self.reconciler.apply_snapshot(record, now_ms);
        if !outcome.applied {
            return outcome;
        }

        if let Some(retired) = &outcome.retired {
            self.on_round_retired(retired);
        }
        for replayed in &outcome.replayed {
            if let ApplyOutcome::Applied {
                retired: Some(retired),
                ..
            } = replayed
            {
                self.on_round_retired(retired);
            }
        }
        self.after_record_change();
        outcome
    }

    pub fn handle_event(&mut self, event: ChannelEvent) -> SessionDirective {
        if event.topic() != self.topic_key {
            debug!(
                topic = %self.topic_key,
                event_topic = event.topic(),
                "ignoring event for other topic"
            );
            return SessionDirective::Continue;
        }

        match event {
            ChannelEvent::Round { event, .. } => {
                let now_ms = self.now_ms();
                match self.reconciler.apply_event(event, now_ms) {
                    ApplyOutcome::Applied { retired, .. } => {
                        if let Some(retired) = retired {
                            self.on_round_retired(&retired);
                        }
                        self.after_record_change();
                        SessionDirective::Continue
                    }
                    ApplyOutcome::Dropped(DropReason::UnknownRound) => SessionDirective::Resync {
                        reason: "event for unknown round".to_string(),
                    },
                    ApplyOutcome::Queued { .. } | ApplyOutcome::Dropped(_) => {
                        SessionDirective::Continue
                    }
                }
            }
            ChannelEvent::ActionAck {
                correlation_id,
                frozen_multiplier_bps,
                ..
            } => {
                let now_ms = self.now_ms();
                self.actions
                    .lock()
                    .confirm(correlation_id, frozen_multiplier_bps, now_ms);
                self.publish_actions();
                SessionDirective::Continue
            }
            ChannelEvent::ActionError {
                correlation_id,
                reason,
                ..
            } => {
                let now_ms = self.now_ms();
                self.actions.lock().reject(correlation_id, reason, now_ms);
                self.publish_actions();
                SessionDirective::Continue
            }
            ChannelEvent::PriceSample { price, .. } => {
                let now_ms = self.now_ms();
                self.animator.observe(price, now_ms);
                self.publish_price(self.animator.value());
                SessionDirective::Continue
            }
        }
    }

    /// Timer cadence tick: countdowns, ready-check expiry, rejection display.
    pub fn tick_timer(&mut self) -> TimerState {
        let state = self.timer.tick();
        self.timer_tx.send_replace(state);

        if let Some(check) = self.ready_check.as_mut() {
            check.tick();
        }
        self.publish_ready_check();

        let expired = self.actions.lock().expire_rejections(self.now_ms());
        if expired > 0 {
            self.publish_actions();
        }
        state
    }

    /// Animation frame tick.
    pub fn frame(&mut self) -> AnimatedValue {
        let value = self.animator.frame(self.now_ms());
        self.publish_price(value);
        value
    }

    pub fn set_reduced_motion(&mut self, reduced_motion: bool) {
        self.animator.set_reduced_motion(reduced_motion);
        self.publish_price(self.animator.value());
    }

    /// Checks an action locally and returns the round it targets.
    pub fn prepare_action(&self, payload: &ActionPayload) -> Result<RoundId, AppError> {
        if self.wallet.is_none() {
            return Err(AppError::InvalidArgument(
                "a wallet is required to submit actions".to_string(),
            ));
        }
        let record = self.reconciler.record().ok_or_else(|| {
            AppError::InvalidArgument(format!("no active round on {}", self.topic_key))
        })?;

        match payload {
            ActionPayload::Bet {
                side,
                amount_lamports,
            } => validate_bet(Some(record), *side, *amount_lamports, self.clock.now_ms())?,
            ActionPayload::Join | ActionPayload::Leave => {
                if record.phase != RoundPhase::Registering {
                    return Err(AppError::InvalidArgument(format!(
                        "round {} is not open for registration",
                        record.round_id
                    )));
                }
            }
            ActionPayload::ReadyResponse { .. } => {
                return Err(AppError::InvalidArgument(
                    "ready responses go through the ready check".to_string(),
                ));
            }
        }
        Ok(record.round_id.clone())
    }

    pub fn respond_ready(&mut self, ready: bool) -> Result<(RoundId, ActionPayload), AppError> {
        let now_ms = self.clock.now_ms();
        let check = self
            .ready_check
            .as_mut()
            .ok_or_else(|| AppError::ReadyCheckClosed("no ready check is open".to_string()))?;
        let payload = check.respond(ready, now_ms)?;
        let round_id = check.round_id().clone();
        self.publish_ready_check();
        Ok((round_id, payload))
    }

    /// Commits the in-flight ready response when it was delivered, otherwise
    /// frees the check for another attempt.
    pub fn settle_ready_response(&mut self, round_id: &RoundId, delivered: bool) {
        if let Some(check) = self
            .ready_check
            .as_mut()
            .filter(|check| check.round_id() == round_id)
        {
            if delivered {
                check.commit();
            } else {
                check.release();
            }
        }
        self.publish_ready_check();
    }

    /// The backend's frozen multiplier once a bet is confirmed, otherwise a
    /// pool-ratio estimate.
    pub fn odds(&self, side: &str, amount: u64) -> Option<OddsEstimate> {
        let record = self.reconciler.record()?;
        let frozen = self
            .actions
            .lock()
            .pending(&record.round_id)
            .filter(|action| action.status == ActionStatus::Confirmed)
            .and_then(|action| action.frozen_multiplier_bps);
        if let Some(multiplier_bps) = frozen {
            return Some(OddsEstimate::frozen(multiplier_bps));
        }
        estimate_payout_multiplier(record, side, amount, self.now_ms())
    }

    pub fn publish_actions(&self) {
        let snapshot = self.actions.lock().snapshot();
        self.actions_tx.send_replace(snapshot);
    }

    /// Unsubscribe teardown.
    pub fn close(&mut self) {
        self.reconciler.close();
        self.actions.lock().reset_all();
        if let Some(check) = self.ready_check.as_mut() {
            check.invalidate();
        }
        self.animator.reset();
        self.publish_actions();
        self.publish_ready_check();
        info!(topic = %self.topic_key, "round session closed");
    }

    fn on_round_retired(&mut self, round_id: &RoundId) {
        self.actions.lock().retire_round(round_id);
        if self
            .ready_check
            .as_ref()
            .map(|check| check.round_id() == round_id)
            .unwrap_or(false)
        {
            if let Some(check) = self.ready_check.as_mut() {
                check.invalidate();
            }
            self.ready_check = None;
        }
        self.publish_actions();
    }

    fn after_record_change(&mut self) {
        let record = self.reconciler.record();
        let state = self.timer.sync(record);
        self.timer_tx.send_replace(state);

        if let Some(check) = self.ready_check.as_mut() {
            check.follow(record);
        }

        let has_check_for_round = match (&self.ready_check, record) {
            (Some(check), Some(record)) => *check.round_id() == record.round_id,
            _ => false,
        };
        if !has_check_for_round {
            if let (Some(record), Some(wallet)) = (record, self.wallet.as_deref()) {
                if let Some(check) = ReadyCheck::open(record, wallet, Arc::clone(&self.clock)) {
                    self.ready_check = Some(check);
                }
            }
        }
        self.publish_ready_check();
    }

    fn publish_ready_check(&self) {
        let now_ms = self.clock.now_ms();
        let snapshot = self
            .ready_check
            .as_ref()
            .map(|check| check.snapshot(now_ms));
        self.ready_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn publish_price(&self, value: AnimatedValue) {
        self.price_tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::actions::{BetSide, MIN_BET_LAMPORTS};
    use crate::round::clock::ManualClock;
    use crate::round::config::StartRoundStreamArgs;
    use crate::round::odds::OddsSource;
    use crate::round::ready_check::ReadyStatus;
    use crate::round::types::{
        parse_channel_event, GameMode, ParticipantStatus, ParticipantUpdate, RoundEvent, RoundPatch,
    };

    fn config(mode: GameMode, wallet: Option<&str>) -> RoundStreamConfig {
        StartRoundStreamArgs {
            mode: Some(mode),
            wallet: wallet.map(str::to_string),
            ..StartRoundStreamArgs::default()
        }
        .normalize_with_env(|_| None)
        .expect("test config should be valid")
    }

    fn session(mode: GameMode, wallet: Option<&str>, clock: &ManualClock) -> RoundSession {
        let mut session = RoundSession::new(&config(mode, wallet), Arc::new(clock.clone()));
        session.begin_resync();
        session
    }

    fn round_event(topic: &str, event: RoundEvent) -> ChannelEvent {
        ChannelEvent::Round {
            topic: topic.to_string(),
            event,
        }
    }

    fn prediction_round(round_id: &str, lock_ms: i64, end_ms: i64) -> RoundRecord {
        let mut record = RoundRecord::new(round_id.into(), GameMode::Prediction, RoundPhase::Betting);
        record.deadlines.insert(RoundPhase::Betting, lock_ms);
        record.deadlines.insert(RoundPhase::Locked, end_ms);
        record.pools.insert("up".to_string(), 50);
        record.pools.insert("down".to_string(), 100);
        record
    }

    #[test]
    fn betting_countdown_reaches_zero_then_locked_event_is_accepted() {
        let clock = ManualClock::new(1_000);
        let mut session = session(GameMode::Prediction, None, &clock);
        let view = session.view();
        session.apply_snapshot(Some(prediction_round("1", 6_000, 11_000)));
        assert_eq!(view.timer.borrow().remaining_ms, 5_000);

        clock.set(6_000);
        assert_eq!(session.tick_timer().remaining_ms, 0);

        let mut payload =
            br#"{"type":"round_updated","topic":"prediction","roundId":"1","phase":"locked","patch":{"startPrice":101.5}}"#
                .to_vec();
        let event = parse_channel_event(&mut payload).expect("event should parse");
        assert_eq!(session.handle_event(event), SessionDirective::Continue);

        let timer = *view.timer.borrow();
        assert_eq!(timer.phase, Some(RoundPhase::Locked));
        assert_eq!(timer.remaining_ms, 5_000);
        assert_eq!(
            view.record
                .borrow()
                .as_ref()
                .and_then(|record| record.price_anchors.start_price),
            Some(101.5)
        );
    }

    #[test]
    fn new_round_during_submission_returns_action_to_idle() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Prediction, Some("alice"), &clock);
        session.apply_snapshot(Some(prediction_round("1", 25_000, 30_000)));

        let payload = ActionPayload::Bet {
            side: BetSide::Up,
            amount_lamports: MIN_BET_LAMPORTS,
        };
        let round_id = session.prepare_action(&payload).expect("bet should validate");
        let request = session
            .actions()
            .lock()
            .begin(&round_id, payload, 0)
            .expect("begin should succeed");

        session.handle_event(round_event(
            "prediction",
            RoundEvent::Created(prediction_round("2", 55_000, 60_000)),
        ));
        assert_eq!(session.actions().lock().status(&round_id), ActionStatus::Idle);

        session.handle_event(ChannelEvent::ActionAck {
            topic: "prediction".to_string(),
            round_id: round_id.clone(),
            correlation_id: request.correlation_id,
            frozen_multiplier_bps: Some(19_000),
        });
        assert_eq!(session.actions().lock().status(&round_id), ActionStatus::Idle);
        assert!(session.view().actions.borrow().is_empty());
    }

    #[test]
    fn unknown_round_requests_resync() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Prediction, None, &clock);
        session.apply_snapshot(Some(prediction_round("1", 25_000, 30_000)));

        let directive = session.handle_event(round_event(
            "prediction",
            RoundEvent::Updated {
                round_id: "77".into(),
                phase: RoundPhase::Locked,
                patch: RoundPatch::default(),
            },
        ));
        assert!(matches!(directive, SessionDirective::Resync { .. }));
    }

    #[test]
    fn empty_snapshot_retires_round_and_its_pending_action() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Prediction, Some("alice"), &clock);
        session.apply_snapshot(Some(prediction_round("1", 25_000, 30_000)));
        session
            .actions()
            .lock()
            .begin(&"1".into(), ActionPayload::Join, 0)
            .expect("begin should succeed");

        session.begin_resync();
        let outcome = session.apply_snapshot(None);

        assert_eq!(outcome.retired, Some("1".into()));
        assert!(session.record().is_none());
        assert!(session.view().record.borrow().is_none());
        assert_eq!(session.actions().lock().status(&"1".into()), ActionStatus::Idle);
        assert_eq!(session.view().timer.borrow().remaining_ms, 0);
    }

    #[test]
    fn ignores_events_for_other_topics() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Prediction, None, &clock);
        session.apply_snapshot(Some(prediction_round("1", 25_000, 30_000)));

        session.handle_event(round_event(
            "battle:9",
            RoundEvent::Created(prediction_round("2", 25_000, 30_000)),
        ));
        assert_eq!(session.current_round_id().map(RoundId::as_str), Some("1"));
    }

    #[test]
    fn ready_check_opens_expires_and_closes_on_cancel() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Tournament, Some("alice"), &clock);
        let view = session.view();

        let mut record = RoundRecord::new("t-1".into(), GameMode::Tournament, RoundPhase::Registering);
        record.upsert_participant(&ParticipantUpdate {
            wallet: "alice".to_string(),
            status: ParticipantStatus::Joined,
            at_ms: 0,
        });
        session.apply_snapshot(Some(record));
        assert!(view.ready_check.borrow().is_none());

        let mut starting = RoundPatch::default();
        starting.deadlines.insert(RoundPhase::Starting, 30_000);
        session.handle_event(round_event(
            "tournament",
            RoundEvent::Updated {
                round_id: "t-1".into(),
                phase: RoundPhase::Starting,
                patch: starting,
            },
        ));
        let opened = view.ready_check.borrow().clone().expect("ready check should open");
        assert_eq!(opened.local_status, ReadyStatus::Pending);
        assert_eq!(opened.remaining_ms, 30_000);

        clock.set(30_000);
        session.tick_timer();
        let expired = view.ready_check.borrow().clone().expect("ready check should remain");
        assert_eq!(expired.local_status, ReadyStatus::NotReady);
        assert_eq!(expired.remaining_ms, 0);
        assert!(matches!(
            session.respond_ready(true),
            Err(AppError::ReadyCheckClosed(_))
        ));

        session.handle_event(round_event(
            "tournament",
            RoundEvent::Updated {
                round_id: "t-1".into(),
                phase: RoundPhase::Cancelled,
                patch: RoundPatch::default(),
            },
        ));
        let closed = view.ready_check.borrow().clone().expect("closed check stays visible");
        assert!(!closed.open);
    }

    #[test]
    fn ready_response_before_expiry_is_returned_for_transmission() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Tournament, Some("alice"), &clock);
        let mut record = RoundRecord::new("t-2".into(), GameMode::Tournament, RoundPhase::Starting);
        record.deadlines.insert(RoundPhase::Starting, 10_000);
        record.upsert_participant(&ParticipantUpdate {
            wallet: "alice".to_string(),
            status: ParticipantStatus::Joined,
            at_ms: 0,
        });
        session.apply_snapshot(Some(record));

        clock.set(9_999);
        let (round_id, payload) = session.respond_ready(true).expect("response should be accepted");
        assert_eq!(round_id.as_str(), "t-2");
        assert_eq!(payload, ActionPayload::ReadyResponse { ready: true });
        assert!(session.respond_ready(false).is_err());

        session.settle_ready_response(&round_id, false);
        let released = session.view().ready_check.borrow().clone().expect("check should be open");
        assert!(!released.responded);
        assert_eq!(released.local_status, ReadyStatus::Pending);

        session.respond_ready(true).expect("retry should be accepted");
        session.settle_ready_response(&round_id, true);
        let delivered = session.view().ready_check.borrow().clone().expect("check should be open");
        assert!(delivered.responded);
        assert_eq!(delivered.local_status, ReadyStatus::Ready);
        assert!(matches!(
            session.respond_ready(false),
            Err(AppError::ReadyCheckClosed(_))
        ));
    }

    #[test]
    fn price_samples_drive_animated_value() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Prediction, None, &clock);
        let view = session.view();

        for (price, t) in [(100.0, 0), (110.0, 0)] {
            session.handle_event(ChannelEvent::PriceSample {
                topic: "prediction".to_string(),
                price,
                t,
            });
        }
        assert_eq!(view.price.borrow().displayed, 100.0);

        clock.set(75);
        let midway = session.frame().displayed;
        assert!(midway > 100.0 && midway < 110.0);

        clock.set(150);
        assert_eq!(session.frame().displayed, 110.0);
        assert_eq!(view.price.borrow().displayed, 110.0);
    }

    #[test]
    fn frozen_multiplier_replaces_estimate_after_ack() {
        let clock = ManualClock::new(25_000);
        let mut session = session(GameMode::Prediction, Some("alice"), &clock);
        session.apply_snapshot(Some(prediction_round("1", 25_001, 30_000)));

        let estimate = session.odds("up", 50).expect("estimate should exist");
        assert_eq!(estimate.source, OddsSource::Estimate);

        let payload = ActionPayload::Bet {
            side: BetSide::Up,
            amount_lamports: MIN_BET_LAMPORTS,
        };
        let request = session
            .actions()
            .lock()
            .begin(&"1".into(), payload, 25_000)
            .expect("begin should succeed");
        session.handle_event(ChannelEvent::ActionAck {
            topic: "prediction".to_string(),
            round_id: "1".into(),
            correlation_id: request.correlation_id,
            frozen_multiplier_bps: Some(18_200),
        });

        let frozen = session.odds("up", 50).expect("frozen odds should exist");
        assert_eq!(frozen.source, OddsSource::Frozen);
        assert_eq!(frozen.multiplier_bps, 18_200);
    }

    #[test]
    fn prepare_action_requires_wallet_and_open_phase() {
        let clock = ManualClock::new(0);
        let mut watcher = session(GameMode::Prediction, None, &clock);
        watcher.apply_snapshot(Some(prediction_round("1", 25_000, 30_000)));
        assert!(watcher.prepare_action(&ActionPayload::Join).is_err());

        let mut player = session(GameMode::Prediction, Some("alice"), &clock);
        player.apply_snapshot(Some(prediction_round("1", 25_000, 30_000)));
        assert!(player.prepare_action(&ActionPayload::Join).is_err());
        assert!(player
            .prepare_action(&ActionPayload::ReadyResponse { ready: true })
            .is_err());
    }

    #[test]
    fn close_resets_actions_and_stops_applying() {
        let clock = ManualClock::new(0);
        let mut session = session(GameMode::Prediction, Some("alice"), &clock);
        session.apply_snapshot(Some(prediction_round("1", 25_000, 30_000)));
        session
            .actions()
            .lock()
            .begin(&"1".into(), ActionPayload::Join, 0)
            .expect("begin should succeed");

        session.close();
        assert!(session.actions().lock().snapshot().is_empty());
        session.handle_event(round_event(
            "prediction",
            RoundEvent::Created(prediction_round("2", 55_000, 60_000)),
        ));
        assert_eq!(session.current_round_id().map(RoundId::as_str), Some("1"));
        assert!(session.is_stale());
    }
}
