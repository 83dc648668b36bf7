use crate::error::AppError;
use crate::round::actions::{ActionReceipt, ActionReceiptWire, ActionRequest};
use crate::round::clock::{now_unix_ms, ClockOffsetSample};
use crate::round::types::{GameMode, RoundSnapshot, RoundSnapshotWire, RoundTopic};
use reqwest::Client;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type RoundWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOp {
    Subscribe,
    Unsubscribe,
}

impl ChannelOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Serialize)]
struct ChannelOpWire<'a> {
    op: &'static str,
    topic: &'a str,
}

#[derive(Debug, Clone)]
pub struct TimedSnapshot {
    pub snapshot: RoundSnapshot,
    pub sample: ClockOffsetSample,
}

fn snapshot_endpoint(api_base_url: &str, topic: &RoundTopic) -> String {
    let mut endpoint = format!(
        "{api_base_url}/api/v1/rounds/{}/snapshot",
        topic.mode.as_str()
    );
    if let Some(instance) = &topic.instance {
        endpoint.push_str(&format!("?instance={instance}"));
    }
    endpoint
}

fn actions_endpoint(api_base_url: &str, mode: GameMode) -> String {
    format!("{api_base_url}/api/v1/rounds/{}/actions", mode.as_str())
}

pub fn channel_op_message(op: ChannelOp, topic: &RoundTopic) -> Result<String, AppError> {
    let key = topic.key();
    let wire = ChannelOpWire {
        op: op.as_str(),
        topic: &key,
    };
    Ok(simd_json::serde::to_string(&wire)?)
}

pub async fn connect_round_channel(ws_url: &str) -> Result<RoundWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(ws_url, Some(ws_config), true).await?;
    Ok(stream)
}

/// Fetches the authoritative snapshot and the request window used to sample
/// the server clock offset.
pub async fn fetch_round_snapshot(
    client: &Client,
    api_base_url: &str,
    topic: &RoundTopic,
) -> Result<TimedSnapshot, AppError> {
    let endpoint = snapshot_endpoint(api_base_url, topic);
    let request_started_ms = now_unix_ms();
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<RoundSnapshotWire>().await?;
    let request_finished_ms = now_unix_ms();

    let sample = ClockOffsetSample::from_round_trip(
        request_started_ms,
        payload.server_time_ms,
        request_finished_ms,
    );
    Ok(TimedSnapshot {
        snapshot: payload.try_into()?,
        sample,
    })
}

pub async fn post_action(
    client: &Client,
    api_base_url: &str,
    mode: GameMode,
    request: &ActionRequest,
) -> Result<ActionReceipt, AppError> {
    let endpoint = actions_endpoint(api_base_url, mode);
    let response = client
        .post(endpoint)
        .json(request)
        .send()
        .await?
        .error_for_status()?;
    let payload = response.json::<ActionReceiptWire>().await?;
    if payload.correlation_id != request.correlation_id {
        return Err(AppError::InvalidArgument(format!(
            "action receipt correlation mismatch (sent {}, got {})",
            request.correlation_id, payload.correlation_id
        )));
    }
    Ok(payload.into())
}
