use crate::commands::round_stream::stream_runtime;
use crate::error::AppError;
use crate::round::actions::{submit_action, ActionPayload, ActionStatus, BetSide};
use crate::round::backend::post_action;
use crate::round::clock::Clock;
use crate::round::odds::OddsEstimate;
use crate::round::pipeline::RoundStreamRuntime;
use crate::round::types::RoundId;
use crate::state::AppState;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRoundActionArgs {
    pub topic: String,
    pub action: ActionPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRoundActionArgs {
    pub topic: String,
    pub round_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondReadyCheckArgs {
    pub topic: String,
    pub ready: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundOddsArgs {
    pub topic: String,
    pub side: BetSide,
    pub amount_lamports: u64,
}

pub async fn submit_round_action(
    state: &AppState,
    args: SubmitRoundActionArgs,
) -> Result<ActionStatus, AppError> {
    let runtime = stream_runtime(state, &args.topic).await?;
    let round_id = runtime.session.lock().prepare_action(&args.action)?;
    send_action(&runtime, round_id, args.action).await
}

pub async fn acknowledge_round_action(
    state: &AppState,
    args: AcknowledgeRoundActionArgs,
) -> Result<ActionStatus, AppError> {
    let runtime = stream_runtime(state, &args.topic).await?;
    let round_id = RoundId::new(args.round_id);
    let session = runtime.session.lock();
    let actions = session.actions();
    let status = {
        let mut manager = actions.lock();
        manager.acknowledge(&round_id)?;
        manager.status(&round_id)
    };
    session.publish_actions();
    Ok(status)
}

pub async fn respond_ready_check(
    state: &AppState,
    args: RespondReadyCheckArgs,
) -> Result<ActionStatus, AppError> {
    let runtime = stream_runtime(state, &args.topic).await?;
    let (round_id, payload) = runtime.session.lock().respond_ready(args.ready)?;
    let submission = send_action(&runtime, round_id.clone(), payload).await;
    let delivered = matches!(
        submission,
        Ok(ActionStatus::Confirmed | ActionStatus::Submitting)
    );
    runtime
        .session
        .lock()
        .settle_ready_response(&round_id, delivered);
    submission
}

pub async fn round_odds(
    state: &AppState,
    args: RoundOddsArgs,
) -> Result<Option<OddsEstimate>, AppError> {
    let runtime = stream_runtime(state, &args.topic).await?;
    let odds = runtime
        .session
        .lock()
        .odds(args.side.as_str(), args.amount_lamports);
    Ok(odds)
}

async fn send_action(
    runtime: &RoundStreamRuntime,
    round_id: RoundId,
    payload: ActionPayload,
) -> Result<ActionStatus, AppError> {
    let actions = runtime.session.lock().actions();
    let kind = payload.kind();
    let clock = runtime.clock.clone();
    let client = runtime.http_client.clone();
    let api_base_url = runtime.config.api_base_url.clone();
    let mode = runtime.config.topic.mode;

    let submission = submit_action(
        &actions,
        &round_id,
        payload,
        move || clock.now_ms().unwrap_or_default(),
        |request| async move {
            runtime.session.lock().publish_actions();
            post_action(&client, &api_base_url, mode, &request).await
        },
    )
    .await;
    runtime.session.lock().publish_actions();

    match &submission {
        Ok(status) => debug!(round_id = %round_id, ?kind, ?status, "round action settled"),
        Err(error) => warn!(round_id = %round_id, ?kind, error = %error, "round action refused"),
    }
    submission
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::round_stream::round_view;
    use crate::round::clock::now_unix_ms;
    use crate::round::config::StartRoundStreamArgs;
    use crate::round::status::RoundStreamStatusSnapshot;
    use crate::round::ready_check::ReadyStatus;
    use crate::round::types::{
        GameMode, ParticipantStatus, ParticipantUpdate, RoundPhase, RoundRecord,
    };
    use crate::state::RoundStreamHandle;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    async fn state_with_round(wallet: Option<&str>, record: Option<RoundRecord>) -> AppState {
        state_with(GameMode::Prediction, wallet, record).await
    }

    async fn state_with(
        mode: GameMode,
        wallet: Option<&str>,
        record: Option<RoundRecord>,
    ) -> AppState {
        let config = StartRoundStreamArgs {
            mode: Some(mode),
            wallet: wallet.map(str::to_string),
            api_base_url: Some("http://127.0.0.1:9".to_string()),
            ws_url: Some("ws://127.0.0.1:9/ws".to_string()),
            ..StartRoundStreamArgs::default()
        }
        .normalize_with_env(|_| None)
        .expect("test config should be valid");
        let topic = config.topic.key();

        let state = AppState::default();
        let runtime = RoundStreamRuntime::new(config, state.http_client.clone());
        {
            let mut session = runtime.session.lock();
            session.begin_resync();
            session.apply_snapshot(record);
        }

        let handle = RoundStreamHandle {
            runtime,
            status: Arc::new(RwLock::new(RoundStreamStatusSnapshot::stopped(
                topic.clone(),
                None,
            ))),
            cancellation_token: CancellationToken::new(),
            join_handle: tokio::spawn(async {}),
        };
        state.round_streams.lock().await.insert(topic, handle);
        state
    }

    fn betting_round() -> RoundRecord {
        let now_ms = now_unix_ms();
        let mut record =
            RoundRecord::new(RoundId::new("42"), GameMode::Prediction, RoundPhase::Betting);
        record.deadlines.insert(RoundPhase::Betting, now_ms + 60_000);
        record.deadlines.insert(RoundPhase::Locked, now_ms + 65_000);
        record.pools.insert("up".to_string(), 1_000_000_000);
        record.pools.insert("down".to_string(), 3_000_000_000);
        record
    }

    fn up_bet() -> ActionPayload {
        ActionPayload::Bet {
            side: BetSide::Up,
            amount_lamports: 100_000_000,
        }
    }

    #[tokio::test]
    async fn unknown_topic_is_not_found() {
        let state = AppState::default();
        let result = submit_round_action(
            &state,
            SubmitRoundActionArgs {
                topic: "prediction".to_string(),
                action: up_bet(),
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::StreamNotFound(_))));
    }

    #[tokio::test]
    async fn submission_without_wallet_is_refused_locally() {
        let state = state_with_round(None, Some(betting_round())).await;
        let result = submit_round_action(
            &state,
            SubmitRoundActionArgs {
                topic: "prediction".to_string(),
                action: up_bet(),
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_rejection_then_acknowledges() {
        let state = state_with_round(Some("alice"), Some(betting_round())).await;
        let status = submit_round_action(
            &state,
            SubmitRoundActionArgs {
                topic: "prediction".to_string(),
                action: up_bet(),
            },
        )
        .await
        .expect("submission should settle");
        assert!(matches!(status, ActionStatus::Rejected { .. }));

        let view = round_view(&state, "prediction")
            .await
            .expect("view should exist");
        assert_eq!(view.actions.borrow().len(), 1);

        let status = acknowledge_round_action(
            &state,
            AcknowledgeRoundActionArgs {
                topic: "prediction".to_string(),
                round_id: "42".to_string(),
            },
        )
        .await
        .expect("acknowledge should succeed");
        assert_eq!(status, ActionStatus::Idle);
    }

    #[tokio::test]
    async fn ready_response_requires_open_check() {
        let state = state_with_round(Some("alice"), Some(betting_round())).await;
        let result = respond_ready_check(
            &state,
            RespondReadyCheckArgs {
                topic: "prediction".to_string(),
                ready: true,
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::ReadyCheckClosed(_))));
    }

    #[tokio::test]
    async fn undelivered_ready_response_can_be_retried() {
        let mut starting =
            RoundRecord::new(RoundId::new("t"), GameMode::Tournament, RoundPhase::Starting);
        starting
            .deadlines
            .insert(RoundPhase::Starting, now_unix_ms() + 60_000);
        starting.upsert_participant(&ParticipantUpdate {
            wallet: "alice".to_string(),
            status: ParticipantStatus::Joined,
            at_ms: 0,
        });
        let state = state_with(GameMode::Tournament, Some("alice"), Some(starting)).await;
        let args = RespondReadyCheckArgs {
            topic: "tournament".to_string(),
            ready: true,
        };

        let status = respond_ready_check(&state, args.clone())
            .await
            .expect("response should settle");
        assert!(matches!(status, ActionStatus::Rejected { .. }));

        let view = round_view(&state, "tournament")
            .await
            .expect("view should exist");
        let check = view
            .ready_check
            .borrow()
            .clone()
            .expect("ready check should be open");
        assert!(check.open);
        assert!(!check.responded);
        assert!(!check.sending);
        assert_eq!(check.local_status, ReadyStatus::Pending);

        let retry = respond_ready_check(&state, args).await;
        assert!(matches!(retry, Ok(ActionStatus::Rejected { .. })));
    }

    #[tokio::test]
    async fn odds_follow_the_live_pools() {
        let state = state_with_round(None, Some(betting_round())).await;
        let odds = round_odds(
            &state,
            RoundOddsArgs {
                topic: "prediction".to_string(),
                side: BetSide::Up,
                amount_lamports: 100_000_000,
            },
        )
        .await
        .expect("odds should resolve")
        .expect("betting round should have odds");
        assert!(odds.multiplier_bps > 10_000);

        let empty = state_with_round(None, None).await;
        let none = round_odds(
            &empty,
            RoundOddsArgs {
                topic: "prediction".to_string(),
                side: BetSide::Down,
                amount_lamports: 100_000_000,
            },
        )
        .await
        .expect("odds lookup should succeed");
        assert!(none.is_none());
    }
}
