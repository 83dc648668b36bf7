use crate::error::AppError;
use crate::round::backend::{
    channel_op_message, connect_round_channel, fetch_round_snapshot, ChannelOp, RoundWsStream,
};
use crate::round::clock::{now_unix_ms, Clock, ClockOffsetEstimator, SystemClock};
use crate::round::config::RoundStreamConfig;
use crate::round::session::{RoundSession, SessionDirective};
use crate::round::status::{RoundConnectionState, RoundStreamStatusSnapshot, StatusPublishThrottle};
use crate::round::types::parse_channel_event;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_HEARTBEAT_MS: u64 = 1_000;

/// Shared pieces of one running stream. Commands keep a clone to read views
/// and submit actions while the driver task owns the connection.
#[derive(Clone)]
pub struct RoundStreamRuntime {
    pub config: RoundStreamConfig,
    pub session: Arc<Mutex<RoundSession>>,
    pub clock: Arc<SystemClock>,
    pub clock_estimator: Arc<Mutex<ClockOffsetEstimator>>,
    pub http_client: Client,
}

impl RoundStreamRuntime {
    pub fn new(config: RoundStreamConfig, http_client: Client) -> Self {
        let clock = Arc::new(SystemClock::new());
        let session_clock: Arc<dyn Clock> = clock.clone();
        let session = RoundSession::new(&config, session_clock);
        Self {
            config,
            session: Arc::new(Mutex::new(session)),
            clock,
            clock_estimator: Arc::new(Mutex::new(ClockOffsetEstimator::default())),
            http_client,
        }
    }
}

enum StreamDirective {
    Continue,
    Resync,
    ImmediateReconnect,
}

struct StreamRuntimeContext<'a> {
    runtime: &'a RoundStreamRuntime,
    status_store: &'a Arc<RwLock<RoundStreamStatusSnapshot>>,
    status_throttle: &'a Arc<Mutex<StatusPublishThrottle>>,
}

pub async fn run_round_stream(
    runtime: RoundStreamRuntime,
    status_store: Arc<RwLock<RoundStreamStatusSnapshot>>,
    cancel_token: CancellationToken,
) {
    let status_throttle = Arc::new(Mutex::new(StatusPublishThrottle::default()));
    let topic = runtime.config.topic.clone();

    let timer_cancel = cancel_token.clone();
    let timer_session = Arc::clone(&runtime.session);
    let timer_tick_ms = runtime.config.timer_cadence.tick_ms();
    let timer_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(timer_tick_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    timer_session.lock().tick_timer();
                }
            }
        }
    });

    let frame_cancel = cancel_token.clone();
    let frame_session = Arc::clone(&runtime.session);
    let frame_interval_ms = runtime.config.frame_interval_ms;
    let frame_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(frame_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = frame_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    frame_session.lock().frame();
                }
            }
        }
    });

    let heartbeat_cancel = cancel_token.clone();
    let heartbeat_runtime = runtime.clone();
    let heartbeat_status_store = Arc::clone(&status_store);
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (current_state, current_reason) = {
                        let readable = heartbeat_status_store.read().await;
                        (readable.state, readable.reason.clone())
                    };
                    publish_status(
                        &heartbeat_status_store,
                        &heartbeat_runtime,
                        current_state,
                        current_reason,
                    )
                    .await;
                }
            }
        }
    });

    let stream_context = StreamRuntimeContext {
        runtime: &runtime,
        status_store: &status_store,
        status_throttle: &status_throttle,
    };
    let mut reconnect_attempt = 0_u32;
    while !cancel_token.is_cancelled() {
        let state = if reconnect_attempt == 0 {
            RoundConnectionState::Connecting
        } else {
            RoundConnectionState::Reconnecting
        };
        let reason = if reconnect_attempt == 0 {
            Some("opening round channel".to_string())
        } else {
            Some(format!("reconnect attempt {reconnect_attempt}"))
        };
        publish_status(&status_store, &runtime, state, reason).await;

        match open_subscription(&runtime).await {
            Ok(mut websocket_stream) => {
                reconnect_attempt = 0;
                info!(topic = %topic, "round channel subscribed");

                let connection_token = cancel_token.child_token();
                let mut resync_handle = Some(spawn_snapshot_resync(
                    &runtime,
                    &status_store,
                    &status_throttle,
                    &connection_token,
                ));

                let mut immediate_reconnect = false;
                loop {
                    let frame = tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        next_message = websocket_stream.next() => next_message,
                    };

                    let Some(frame_result) = frame else {
                        break;
                    };

                    match frame_result {
                        Ok(message) => match handle_message(message, &stream_context).await {
                            StreamDirective::Continue => {}
                            StreamDirective::Resync => {
                                let running = resync_handle
                                    .as_ref()
                                    .map(|handle| !handle.is_finished())
                                    .unwrap_or(false);
                                if !running {
                                    runtime.session.lock().begin_resync();
                                    resync_handle = Some(spawn_snapshot_resync(
                                        &runtime,
                                        &status_store,
                                        &status_throttle,
                                        &connection_token,
                                    ));
                                }
                            }
                            StreamDirective::ImmediateReconnect => {
                                immediate_reconnect = true;
                                break;
                            }
                        },
                        Err(error) => {
                            publish_status_throttled(
                                &stream_context,
                                RoundConnectionState::Reconnecting,
                                Some(format!("websocket frame error: {error}")),
                            )
                            .await;
                            break;
                        }
                    }
                }

                connection_token.cancel();
                if let Some(handle) = resync_handle.take() {
                    let _ = handle.await;
                }

                if cancel_token.is_cancelled() {
                    unsubscribe(&mut websocket_stream, &runtime).await;
                    break;
                }

                if immediate_reconnect {
                    reconnect_attempt = 0;
                    continue;
                }
            }
            Err(error) => {
                publish_status_throttled(
                    &stream_context,
                    RoundConnectionState::Reconnecting,
                    Some(format!("round channel connect error: {error}")),
                )
                .await;
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    cancel_token.cancel();
    let _ = timer_handle.await;
    let _ = frame_handle.await;
    let _ = heartbeat_handle.await;
    runtime.session.lock().close();

    publish_status(
        &status_store,
        &runtime,
        RoundConnectionState::Stopped,
        Some("stream stopped".to_string()),
    )
    .await;
    info!(topic = %topic, "round stream stopped");
}

async fn open_subscription(runtime: &RoundStreamRuntime) -> Result<RoundWsStream, AppError> {
    let mut websocket_stream = connect_round_channel(&runtime.config.ws_url).await?;
    let subscribe = channel_op_message(ChannelOp::Subscribe, &runtime.config.topic)?;
    websocket_stream.send(Message::Text(subscribe)).await?;
    runtime.session.lock().begin_resync();
    Ok(websocket_stream)
}

async fn unsubscribe(websocket_stream: &mut RoundWsStream, runtime: &RoundStreamRuntime) {
    let message = match channel_op_message(ChannelOp::Unsubscribe, &runtime.config.topic) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "failed to encode unsubscribe");
            return;
        }
    };
    if let Err(error) = websocket_stream.send(Message::Text(message)).await {
        debug!(%error, "unsubscribe not delivered");
    }
    let _ = websocket_stream.close(None).await;
}

async fn handle_message(message: Message, context: &StreamRuntimeContext<'_>) -> StreamDirective {
    let event = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            match parse_channel_event(owned_payload.as_mut_slice()) {
                Ok(parsed) => parsed,
                Err(error) => {
                    publish_status_throttled(
                        context,
                        RoundConnectionState::Error,
                        Some(format!("failed to decode round event: {error}")),
                    )
                    .await;
                    return StreamDirective::Continue;
                }
            }
        }
        Message::Binary(mut binary_payload) => {
            match parse_channel_event(binary_payload.as_mut_slice()) {
                Ok(parsed) => parsed,
                Err(error) => {
                    publish_status_throttled(
                        context,
                        RoundConnectionState::Error,
                        Some(format!("failed to decode binary round event: {error}")),
                    )
                    .await;
                    return StreamDirective::Continue;
                }
            }
        }
        Message::Close(_) => return StreamDirective::ImmediateReconnect,
        _ => return StreamDirective::Continue,
    };

    let directive = context.runtime.session.lock().handle_event(event);
    match directive {
        SessionDirective::Continue => StreamDirective::Continue,
        SessionDirective::Resync { reason } => {
            publish_status(
                context.status_store,
                context.runtime,
                RoundConnectionState::Desynced,
                Some(reason),
            )
            .await;
            StreamDirective::Resync
        }
    }
}

fn spawn_snapshot_resync(
    runtime: &RoundStreamRuntime,
    status_store: &Arc<RwLock<RoundStreamStatusSnapshot>>,
    status_throttle: &Arc<Mutex<StatusPublishThrottle>>,
    cancel_token: &CancellationToken,
) -> JoinHandle<()> {
    let runtime = runtime.clone();
    let status_store = Arc::clone(status_store);
    let status_throttle = Arc::clone(status_throttle);
    let cancel_token = cancel_token.clone();

    tokio::spawn(async move {
        let context = StreamRuntimeContext {
            runtime: &runtime,
            status_store: &status_store,
            status_throttle: &status_throttle,
        };
        resync_with_snapshot(&context, &cancel_token).await;
    })
}

/// Fetches a snapshot until one lands. Events keep queuing in the reconciler
/// meanwhile and the last known record is served as stale.
async fn resync_with_snapshot(
    context: &StreamRuntimeContext<'_>,
    cancel_token: &CancellationToken,
) {
    let runtime = context.runtime;
    let mut attempt = 0_u32;
    while !cancel_token.is_cancelled() {
        let fetched = tokio::select! {
            _ = cancel_token.cancelled() => return,
            fetched = fetch_round_snapshot(
                &runtime.http_client,
                &runtime.config.api_base_url,
                &runtime.config.topic,
            ) => fetched,
        };

        match fetched {
            Ok(timed) => {
                let offset_ms = runtime.clock_estimator.lock().update(timed.sample);
                runtime.clock.set_offset_ms(offset_ms);
                let outcome = runtime.session.lock().apply_snapshot(timed.snapshot.record);
                debug!(
                    topic = %runtime.config.topic,
                    offset_ms,
                    rtt_ms = timed.sample.rtt_ms,
                    replayed = outcome.replayed.len(),
                    "snapshot resync completed"
                );

                publish_status(
                    context.status_store,
                    runtime,
                    RoundConnectionState::Live,
                    Some("snapshot applied".to_string()),
                )
                .await;
                return;
            }
            Err(error) => {
                attempt = attempt.saturating_add(1);
                runtime.session.lock().record_snapshot_failure();
                warn!(topic = %runtime.config.topic, attempt, %error, "snapshot fetch failed");
                publish_status_throttled(
                    context,
                    RoundConnectionState::Reconnecting,
                    Some(format!("snapshot resync failed: {error}")),
                )
                .await;

                let delay = reconnect_delay(attempt);
                tokio::select! {
                    _ = cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn publish_status(
    status_store: &Arc<RwLock<RoundStreamStatusSnapshot>>,
    runtime: &RoundStreamRuntime,
    state: RoundConnectionState,
    reason: Option<String>,
) {
    let snapshot = {
        let session = runtime.session.lock();
        RoundStreamStatusSnapshot {
            state,
            topic: runtime.config.topic.key(),
            round_id: session.current_round_id().map(|round_id| round_id.to_string()),
            phase: session.record().map(|record| record.phase),
            stale: session.is_stale(),
            stats: session.stats(),
            clock_offset_ms: runtime.clock_estimator.lock().value_ms(),
            reason,
        }
    };

    let mut writable = status_store.write().await;
    *writable = snapshot;
}

async fn publish_status_throttled(
    context: &StreamRuntimeContext<'_>,
    state: RoundConnectionState,
    reason: Option<String>,
) {
    let allowed = context
        .status_throttle
        .lock()
        .allow(state, &reason, Instant::now());
    if !allowed {
        return;
    }

    publish_status(context.status_store, context.runtime, state, reason).await;
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::config::StartRoundStreamArgs;
    use crate::round::types::{GameMode, RoundPhase, RoundRecord};

    fn runtime() -> RoundStreamRuntime {
        let config = StartRoundStreamArgs::default()
            .normalize_with_env(|_| None)
            .expect("defaults should be valid");
        RoundStreamRuntime::new(config, Client::new())
    }

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let first = reconnect_delay(1);
        assert!(first >= Duration::from_millis(400) && first < Duration::from_millis(650));

        let capped = reconnect_delay(30);
        assert_eq!(capped, Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn status_reflects_session_round_and_staleness() {
        let runtime = runtime();
        let status_store = Arc::new(RwLock::new(RoundStreamStatusSnapshot::stopped(
            "prediction".to_string(),
            None,
        )));

        publish_status(&status_store, &runtime, RoundConnectionState::Connecting, None).await;
        {
            let readable = status_store.read().await;
            assert_eq!(readable.state, RoundConnectionState::Connecting);
            assert!(readable.stale);
            assert!(readable.round_id.is_none());
        }

        {
            let mut session = runtime.session.lock();
            session.begin_resync();
            session.apply_snapshot(Some(RoundRecord::new(
                "5".into(),
                GameMode::Prediction,
                RoundPhase::Betting,
            )));
        }
        publish_status(&status_store, &runtime, RoundConnectionState::Live, None).await;

        let readable = status_store.read().await;
        assert_eq!(readable.state, RoundConnectionState::Live);
        assert_eq!(readable.round_id.as_deref(), Some("5"));
        assert_eq!(readable.phase, Some(RoundPhase::Betting));
        assert!(!readable.stale);
        assert_eq!(readable.stats.snapshots, 1);
    }

    #[tokio::test]
    async fn unknown_round_event_maps_to_resync() {
        let runtime = runtime();
        let status_store = Arc::new(RwLock::new(RoundStreamStatusSnapshot::stopped(
            "prediction".to_string(),
            None,
        )));
        let status_throttle = Arc::new(Mutex::new(StatusPublishThrottle::default()));
        let context = StreamRuntimeContext {
            runtime: &runtime,
            status_store: &status_store,
            status_throttle: &status_throttle,
        };
        {
            let mut session = runtime.session.lock();
            session.begin_resync();
            session.apply_snapshot(None);
        }

        let message = Message::Text(
            r#"{"type":"round_updated","topic":"prediction","roundId":"9","phase":"locked"}"#
                .to_string(),
        );
        assert!(matches!(
            handle_message(message, &context).await,
            StreamDirective::Resync
        ));
        assert_eq!(
            status_store.read().await.state,
            RoundConnectionState::Desynced
        );

        let garbage = Message::Text("not json".to_string());
        assert!(matches!(
            handle_message(garbage, &context).await,
            StreamDirective::Continue
        ));
        assert_eq!(status_store.read().await.state, RoundConnectionState::Error);

        assert!(matches!(
            handle_message(Message::Close(None), &context).await,
            StreamDirective::ImmediateReconnect
        ));
    }
}
