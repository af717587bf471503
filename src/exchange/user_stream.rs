// =============================================================================
// User-data stream — order events from the exchange onto a channel
// =============================================================================
//
// Connects the Binance futures user-data WebSocket via a listen key, decodes
// ORDER_TRADE_UPDATE events into [`OrderUpdate`] values, and publishes them on
// an mpsc channel consumed by the event loop. The listen key is refreshed
// every 30 minutes; connection loss triggers a reconnect after 5 seconds.
// =============================================================================

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::exchange::binance::BinanceFuturesClient;
use crate::exchange::{OrderUpdate, OrderUpdateStatus};

/// Seconds between listen-key keep-alive calls.
const KEEPALIVE_INTERVAL_SECS: u64 = 30 * 60;

/// Delay before reconnecting after a stream error.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Run the user-data stream until `shutdown` flips to true.
///
/// Spawned once at startup:
///
///   tokio::spawn(run_user_stream(client, tx, shutdown_rx));
pub async fn run_user_stream(
    client: Arc<BinanceFuturesClient>,
    tx: mpsc::Sender<OrderUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("user-data stream task started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match stream_session(&client, &tx, &mut shutdown).await {
            Ok(()) => break, // clean shutdown
            Err(e) => {
                error!(error = %e, "user-data stream error — reconnecting in {RECONNECT_DELAY_SECS}s");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!("user-data stream task stopped");
}

/// One connect-consume cycle. Returns Ok on shutdown, Err on stream failure.
async fn stream_session(
    client: &BinanceFuturesClient,
    tx: &mpsc::Sender<OrderUpdate>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listen_key = client.create_listen_key().await?;
    let url = client.stream_url(&listen_key);

    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    info!("user-data stream connected");

    let (_, mut read) = ws_stream.split();
    let mut keepalive = interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    keepalive.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = client.keepalive_listen_key().await {
                    warn!(error = %e, "listen-key keep-alive failed");
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        if let Some(update) = parse_order_update(&text) {
                            debug!(
                                symbol = %update.symbol,
                                order_id = update.order_id,
                                status = ?update.status,
                                "order update received"
                            );
                            if tx.send(update).await.is_err() {
                                // Consumer gone; shut the stream down.
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(_)) => {} // ping/pong/binary frames
                    Some(Err(e)) => anyhow::bail!("websocket read error: {e}"),
                    None => anyhow::bail!("websocket closed by server"),
                }
            }
        }
    }
}

/// Decode an ORDER_TRADE_UPDATE frame. Returns None for other event types
/// and for malformed frames.
fn parse_order_update(text: &str) -> Option<OrderUpdate> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;

    if value["e"].as_str()? != "ORDER_TRADE_UPDATE" {
        return None;
    }

    let order = &value["o"];
    let status = OrderUpdateStatus::parse(order["X"].as_str()?)?;

    Some(OrderUpdate {
        symbol: order["s"].as_str()?.to_string(),
        order_id: order["i"].as_u64()?,
        status,
        quantity_filled: str_f64(&order["z"]),
        average_price: str_f64(&order["ap"]),
    })
}

fn str_f64(val: &serde_json::Value) -> f64 {
    match val {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}
