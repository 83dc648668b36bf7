use crate::error::AppError;
use crate::round::actions::DEFAULT_REJECTION_DISPLAY_MS;
use crate::round::animator::DEFAULT_ANIMATION_DURATION_MS;
use crate::round::reconciler::DEFAULT_STALE_AFTER_MS;
use crate::round::timer::TimerCadence;
use crate::round::types::{GameMode, RoundTopic};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODE: GameMode = GameMode::Prediction;
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws";
pub const API_BASE_URL_ENV: &str = "ROUND_API_BASE_URL";
pub const WS_URL_ENV: &str = "ROUND_WS_URL";
pub const DEFAULT_TIMER_CADENCE: TimerCadence = TimerCadence::Smooth;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
pub const DEFAULT_REDUCED_MOTION: bool = false;
pub const MIN_FRAME_INTERVAL_MS: u64 = 8;
pub const MAX_FRAME_INTERVAL_MS: u64 = 1_000;
pub const MAX_ANIMATION_DURATION_MS: u64 = 2_000;
pub const MIN_STALE_AFTER_MS: u64 = 1_000;
pub const MAX_STALE_AFTER_MS: u64 = 300_000;
pub const MIN_REJECTION_DISPLAY_MS: u64 = 500;
pub const MAX_REJECTION_DISPLAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartRoundStreamArgs {
    pub mode: Option<GameMode>,
    pub instance: Option<String>,
    pub wallet: Option<String>,
    pub api_base_url: Option<String>,
    pub ws_url: Option<String>,
    pub timer_cadence: Option<TimerCadence>,
    pub frame_interval_ms: Option<u64>,
    pub animation_duration_ms: Option<u64>,
    pub reduced_motion: Option<bool>,
    pub stale_after_ms: Option<u64>,
    pub rejection_display_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RoundStreamConfig {
    pub topic: RoundTopic,
    pub wallet: Option<String>,
    pub api_base_url: String,
    pub ws_url: String,
    pub timer_cadence: TimerCadence,
    pub frame_interval_ms: u64,
    pub animation_duration_ms: u64,
    pub reduced_motion: bool,
    pub stale_after_ms: u64,
    pub rejection_display_ms: u64,
}

impl StartRoundStreamArgs {
    pub fn normalize(self) -> Result<RoundStreamConfig, AppError> {
        self.normalize_with_env(|key| std::env::var(key).ok())
    }

    pub fn normalize_with_env(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<RoundStreamConfig, AppError> {
        let mode = self.mode.unwrap_or(DEFAULT_MODE);
        let instance = match self.instance.map(|value| value.trim().to_string()) {
            Some(value) if value.is_empty() => None,
            Some(value) => {
                if !value
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
                {
                    return Err(AppError::InvalidArgument(
                        "instance must be alphanumeric ASCII with - _ or .".to_string(),
                    ));
                }
                Some(value)
            }
            None => None,
        };

        let wallet = match self.wallet.map(|value| value.trim().to_string()) {
            Some(value) if value.is_empty() => {
                return Err(AppError::InvalidArgument(
                    "wallet must be non-empty when provided".to_string(),
                ));
            }
            other => other,
        };

        let api_base_url = normalize_url(
            self.api_base_url.or_else(|| env(API_BASE_URL_ENV)),
            DEFAULT_API_BASE_URL,
            &["http://", "https://"],
            "apiBaseUrl",
        )?;
        let ws_url = normalize_url(
            self.ws_url.or_else(|| env(WS_URL_ENV)),
            DEFAULT_WS_URL,
            &["ws://", "wss://"],
            "wsUrl",
        )?;

        let timer_cadence = self.timer_cadence.unwrap_or(DEFAULT_TIMER_CADENCE);
        let frame_interval_ms = self.frame_interval_ms.unwrap_or(DEFAULT_FRAME_INTERVAL_MS);
        if !(MIN_FRAME_INTERVAL_MS..=MAX_FRAME_INTERVAL_MS).contains(&frame_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "frameIntervalMs must be between {MIN_FRAME_INTERVAL_MS} and {MAX_FRAME_INTERVAL_MS}"
            )));
        }

        let animation_duration_ms = self
            .animation_duration_ms
            .unwrap_or(DEFAULT_ANIMATION_DURATION_MS.unsigned_abs());
        if animation_duration_ms > MAX_ANIMATION_DURATION_MS {
            return Err(AppError::InvalidArgument(format!(
                "animationDurationMs must be at most {MAX_ANIMATION_DURATION_MS}"
            )));
        }

        let reduced_motion = self.reduced_motion.unwrap_or(DEFAULT_REDUCED_MOTION);
        let stale_after_ms = self
            .stale_after_ms
            .unwrap_or(DEFAULT_STALE_AFTER_MS.unsigned_abs());
        if !(MIN_STALE_AFTER_MS..=MAX_STALE_AFTER_MS).contains(&stale_after_ms) {
            return Err(AppError::InvalidArgument(format!(
                "staleAfterMs must be between {MIN_STALE_AFTER_MS} and {MAX_STALE_AFTER_MS}"
            )));
        }

        let rejection_display_ms = self
            .rejection_display_ms
            .unwrap_or(DEFAULT_REJECTION_DISPLAY_MS.unsigned_abs());
        if !(MIN_REJECTION_DISPLAY_MS..=MAX_REJECTION_DISPLAY_MS).contains(&rejection_display_ms) {
            return Err(AppError::InvalidArgument(format!(
                "rejectionDisplayMs must be between {MIN_REJECTION_DISPLAY_MS} and {MAX_REJECTION_DISPLAY_MS}"
            )));
        }

        Ok(RoundStreamConfig {
            topic: RoundTopic::new(mode, instance),
            wallet,
            api_base_url,
            ws_url,
            timer_cadence,
            frame_interval_ms,
            animation_duration_ms,
            reduced_motion,
            stale_after_ms,
            rejection_display_ms,
        })
    }
}

fn normalize_url(
    value: Option<String>,
    default: &str,
    schemes: &[&str],
    field: &str,
) -> Result<String, AppError> {
    let url = value
        .unwrap_or_else(|| default.to_string())
        .trim()
        .trim_end_matches('/')
        .to_string();
    if !schemes.iter().any(|scheme| url.starts_with(scheme)) || url.len() <= 8 {
        return Err(AppError::InvalidArgument(format!(
            "{field} must start with one of {}",
            schemes.join(", ")
        )));
    }
    Ok(url)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStreamSession {
    pub running: bool,
    pub topic: String,
    pub mode: GameMode,
    pub instance: Option<String>,
    pub wallet: Option<String>,
    pub timer_cadence: TimerCadence,
    pub frame_interval_ms: u64,
    pub animation_duration_ms: u64,
    pub reduced_motion: bool,
    pub stale_after_ms: u64,
}

impl RoundStreamSession {
    pub fn from_config(config: &RoundStreamConfig) -> Self {
        Self {
            running: true,
            topic: config.topic.key(),
            mode: config.topic.mode,
            instance: config.topic.instance.clone(),
            wallet: config.wallet.clone(),
            timer_cadence: config.timer_cadence,
            frame_interval_ms: config.frame_interval_ms,
            animation_duration_ms: config.animation_duration_ms,
            reduced_motion: config.reduced_motion,
            stale_after_ms: config.stale_after_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStreamStopResult {
    pub stopped: bool,
}
