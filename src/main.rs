// =============================================================================
// binance-sync — Runner
// =============================================================================
//
// Subscribes to the configured charts, logs every closed candle and, when API
// credentials are present, mirrors the account's private event stream.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use binance_sync::{
    ChartCallbacks, ChartOptions, SessionCallbacks, SessionOptions, StreamDispatcher, SyncConfig,
    UserDataEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("binance-sync starting up");

    let config_path =
        std::env::var("BINANCE_SYNC_CONFIG").unwrap_or_else(|_| "sync_config.json".to_string());
    let mut config = SyncConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        SyncConfig::default()
    });
    config.apply_env();

    let mut symbols: Vec<String> = std::env::var("BINANCE_SYNC_SYMBOLS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    }
    let interval = std::env::var("BINANCE_SYNC_INTERVAL").unwrap_or_else(|_| "1m".to_string());
    info!(symbols = ?symbols, interval = %interval, "Configured charts");

    // ── 2. Dispatcher ────────────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let has_credentials = !api_key.is_empty() && !api_secret.is_empty();

    let dispatcher = Arc::new(StreamDispatcher::connect_live(config, &api_key, &api_secret)?);

    // ── 3. Charts ────────────────────────────────────────────────────────
    for symbol in &symbols {
        let callbacks = ChartCallbacks::new()
            .on_update(|snap| {
                if let Some(current) = snap.current.as_ref().filter(|c| c.is_closed) {
                    info!(
                        symbol = %snap.symbol,
                        interval = %snap.interval,
                        opened = ?current.open_time_utc(),
                        close = current.close,
                        volume = current.volume,
                        history = snap.candles.len(),
                        "candle closed"
                    );
                }
            })
            .on_error(|e| warn!(error = %e, "chart stream error"))
            .on_close(|| warn!("chart stream closed"));

        match dispatcher
            .subscribe_chart(symbol, &interval, ChartOptions::default(), callbacks)
            .await
        {
            Ok(sub) => info!(
                key = %sub.key,
                candles = sub.chart.candles.len(),
                price = ?sub.chart.current_price,
                "chart subscribed"
            ),
            Err(e) => error!(symbol = %symbol, error = %e, "chart subscription failed"),
        }
    }

    // ── 4. User data session ─────────────────────────────────────────────
    if has_credentials {
        let callbacks = SessionCallbacks::new()
            .on_open(|handle| info!(session = %handle, "user data session open"))
            .on_data(|event| match event {
                UserDataEvent::OrderUpdate(o) => info!(
                    symbol = %o.order.symbol,
                    side = %o.order.side,
                    status = %o.order.order_status,
                    "order update"
                ),
                UserDataEvent::MarginCall(m) => {
                    warn!(positions = m.positions.len(), "margin call")
                }
                other => info!(event = other.event_type(), "user data event"),
            })
            .on_error(|e| warn!(error = %e, "user data session error"))
            .on_reconnected(|handle| info!(session = %handle, "user data session renewed"))
            .on_close(|handle| warn!(session = %handle, "user data session closed"));

        match dispatcher
            .open_user_session(SessionOptions::with_callbacks(callbacks))
            .await
        {
            Ok(handle) => match dispatcher.request_positions(&handle).await {
                Ok(positions) => {
                    for p in positions.iter().filter(|p| p.is_open()) {
                        info!(
                            symbol = %p.symbol,
                            amount = p.position_amt,
                            entry = p.entry_price,
                            "open position"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "position snapshot unavailable"),
            },
            Err(e) => error!(error = %e, "failed to open user data session"),
        }
    } else {
        info!("No API credentials — user data session disabled");
    }

    info!("All streams running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    dispatcher.shutdown().await;

    info!("binance-sync shut down complete.");
    Ok(())
}
