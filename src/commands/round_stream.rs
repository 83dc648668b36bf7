use crate::error::AppError;
use crate::round::config::{RoundStreamSession, RoundStreamStopResult, StartRoundStreamArgs};
use crate::round::pipeline::{run_round_stream, RoundStreamRuntime};
use crate::round::session::RoundViewHandles;
use crate::round::status::{RoundConnectionState, RoundStreamStatusSnapshot};
use crate::state::{AppState, RoundStreamHandle};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn start_round_stream(
    state: &AppState,
    args: Option<StartRoundStreamArgs>,
) -> Result<RoundStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let topic = config.topic.key();

    let existing_handle = {
        let mut streams = state.round_streams.lock().await;
        streams.remove(&topic)
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let runtime = RoundStreamRuntime::new(config.clone(), state.http_client.clone());
    let status = Arc::new(RwLock::new(RoundStreamStatusSnapshot {
        state: RoundConnectionState::Connecting,
        ..RoundStreamStatusSnapshot::stopped(topic.clone(), Some("stream starting".to_string()))
    }));
    let cancellation_token = CancellationToken::new();

    let task_runtime = runtime.clone();
    let task_status = Arc::clone(&status);
    let task_token = cancellation_token.clone();
    let join_handle = tokio::spawn(async move {
        run_round_stream(task_runtime, task_status, task_token).await;
    });

    {
        let mut streams = state.round_streams.lock().await;
        streams.insert(
            topic.clone(),
            RoundStreamHandle {
                runtime,
                status,
                cancellation_token,
                join_handle,
            },
        );
    }
    info!(topic = %topic, "round stream started");

    Ok(RoundStreamSession::from_config(&config))
}

pub async fn stop_round_stream(
    state: &AppState,
    topic: &str,
) -> Result<RoundStreamStopResult, AppError> {
    let existing_handle = {
        let mut streams = state.round_streams.lock().await;
        streams.remove(topic)
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    Ok(RoundStreamStopResult { stopped })
}

pub async fn round_stream_status(
    state: &AppState,
    topic: &str,
) -> Result<RoundStreamStatusSnapshot, AppError> {
    let status = {
        let streams = state.round_streams.lock().await;
        streams
            .get(topic)
            .map(|handle| Arc::clone(&handle.status))
            .ok_or_else(|| AppError::StreamNotFound(topic.to_string()))?
    };
    let snapshot = status.read().await.clone();
    Ok(snapshot)
}

pub async fn round_view(state: &AppState, topic: &str) -> Result<RoundViewHandles, AppError> {
    let runtime = stream_runtime(state, topic).await?;
    let view = runtime.session.lock().view();
    Ok(view)
}

pub(crate) async fn stream_runtime(
    state: &AppState,
    topic: &str,
) -> Result<RoundStreamRuntime, AppError> {
    let streams = state.round_streams.lock().await;
    streams
        .get(topic)
        .map(|handle| handle.runtime.clone())
        .ok_or_else(|| AppError::StreamNotFound(topic.to_string()))
}
