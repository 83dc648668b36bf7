use clap::Parser;
use round_client_lib::commands::round_stream::{
    round_stream_status, round_view, start_round_stream, stop_round_stream,
};
use round_client_lib::error::AppError;
use round_client_lib::round::config::StartRoundStreamArgs;
use round_client_lib::round::timer::TimerCadence;
use round_client_lib::round::types::GameMode;
use round_client_lib::state::AppState;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Follows one round topic and logs its reconciled state")]
struct Args {
    #[arg(short, long, value_enum, default_value_t = GameMode::Prediction)]
    mode: GameMode,

    /// Instance id for per-match topics.
    #[arg(short, long)]
    instance: Option<String>,

    /// Wallet used to open ready checks and look up the local participant.
    #[arg(short, long)]
    wallet: Option<String>,

    #[arg(long)]
    api_base_url: Option<String>,

    #[arg(long)]
    ws_url: Option<String>,

    /// Countdown tick: smooth (100 ms) or digits (1 s).
    #[arg(long, value_enum, default_value_t = TimerCadence::Digits)]
    cadence: TimerCadence,

    #[arg(long)]
    reduced_motion: bool,

    /// Seconds between status lines.
    #[arg(long, default_value = "5")]
    status_every_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,round_client_lib=info".into()),
        )
        .init();

    let args = Args::parse();
    let stream_args = StartRoundStreamArgs {
        mode: Some(args.mode),
        instance: args.instance,
        wallet: args.wallet,
        api_base_url: args.api_base_url,
        ws_url: args.ws_url,
        timer_cadence: Some(args.cadence),
        reduced_motion: Some(args.reduced_motion),
        ..StartRoundStreamArgs::default()
    };

    let state = AppState::default();
    let session = start_round_stream(&state, Some(stream_args)).await?;
    let topic = session.topic.clone();
    info!(topic = %topic, cadence = ?session.timer_cadence, "watching round topic");

    let mut view = round_view(&state, &topic).await?;
    let mut status_interval =
        tokio::time::interval(Duration::from_secs(args.status_every_secs.max(1)));
    let mut last_phase = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            changed = view.record.changed() => {
                if changed.is_err() {
                    warn!("round view closed");
                    break;
                }
                let record = view.record.borrow_and_update().clone();
                match record.as_deref() {
                    Some(record) => {
                        let phase = Some(record.phase);
                        if phase != last_phase {
                            info!(
                                round_id = %record.round_id,
                                phase = record.phase.as_str(),
                                participants = record.participants.len(),
                                pool = record.total_pool(),
                                "round phase"
                            );
                            last_phase = phase;
                        }
                    }
                    None => {
                        if last_phase.take().is_some() {
                            info!("no active round");
                        }
                    }
                }
            }
            changed = view.timer.changed() => {
                if changed.is_err() {
                    break;
                }
                let timer = *view.timer.borrow_and_update();
                debug!(phase = ?timer.phase, remaining_ms = timer.remaining_ms, "timer");
            }
            changed = view.ready_check.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(check) = view.ready_check.borrow_and_update().clone() {
                    info!(
                        round_id = %check.round_id,
                        remaining_ms = check.remaining_ms,
                        status = ?check.local_status,
                        open = check.open,
                        "ready check"
                    );
                }
            }
            _ = status_interval.tick() => {
                let price = *view.price.borrow();
                match round_stream_status(&state, &topic).await {
                    Ok(status) => info!(
                        state = ?status.state,
                        stale = status.stale,
                        applied = status.stats.applied,
                        stale_dropped = status.stats.stale_dropped,
                        clock_offset_ms = ?status.clock_offset_ms,
                        price = price.displayed,
                        reason = ?status.reason,
                        "stream status"
                    ),
                    Err(error) => warn!(error = %error, "status unavailable"),
                }
            }
        }
    }

    stop_round_stream(&state, &topic).await?;
    info!(topic = %topic, "stopped");
    Ok(())
}
