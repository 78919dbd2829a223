use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

/// Connects to the gateway's WS surface, subscribes to a list of
/// instruments, and reports message throughput periodically. A manual
/// load/smoke test, not an automated suite.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Monitors gateway WebSocket throughput", long_about = None)]
struct Args {
    /// Gateway WS URL, e.g. ws://127.0.0.1:8080/ws
    #[clap(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// API key to connect with.
    #[clap(short, long)]
    api_key: String,

    /// Comma-separated EXCHANGE-TOKEN pairs to subscribe to.
    #[clap(short, long, default_value = "NSE_EQ-738561,NSE_EQ-408065,NSE_EQ-895937")]
    instruments: String,

    /// Subscription mode: ltp, ohlcv, or full.
    #[clap(short, long, default_value = "ltp")]
    mode: String,

    /// Reporting interval in seconds.
    #[clap(short, long, default_value_t = 15)]
    report_interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServerMessage {
    MarketData { token: u32 },
    Error { code: String, message: String },
    #[serde(other)]
    Other,
}

struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    token_timestamps: HashMap<u32, VecDeque<chrono::DateTime<Utc>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let instruments: Vec<String> = args.instruments.split(',').map(str::trim).map(String::from).collect();

    let stats = Arc::new(Mutex::new(Stats {
        global_timestamps: VecDeque::new(),
        token_timestamps: HashMap::new(),
    }));

    let stats_reporter = Arc::clone(&stats);
    let report_interval = args.report_interval_seconds;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval)).await;
            let now = Utc::now();
            let window_start = now - Duration::seconds(report_interval as i64);

            let mut data = stats_reporter.lock().unwrap();
            while data.global_timestamps.front().is_some_and(|&t| t < window_start) {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            let mut rates: Vec<(u32, usize)> = Vec::new();
            for (token, dq) in data.token_timestamps.iter_mut() {
                while dq.front().is_some_and(|&t| t < window_start) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((*token, dq.len()));
                }
            }
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates.iter().map(|(t, r)| format!("{t}: {r} msgs")).collect::<Vec<_>>().join(", ");
            println!("\n----- {report_interval}s summary -----");
            println!("Global: {global_rate} msgs");
            println!("Per token: {}", if report.is_empty() { "no data" } else { &report });
            println!("-------------------------------\n");
        }
    });

    let connect_url = format!("{}?api_key={}", args.url, args.api_key);
    println!("connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(connect_url).await.expect("failed to connect");
    let (mut write, mut read) = ws_stream.split();

    let sub_msg = json!({
        "event": "subscribe",
        "instruments": instruments,
        "mode": args.mode,
    })
    .to_string();
    write.send(Message::Text(sub_msg.into())).await.expect("failed to send subscribe");
    println!("subscribed to {} instruments in {} mode. Ctrl+C to stop.", instruments.len(), args.mode);

    while let Some(Ok(msg)) = read.next().await {
        if let Message::Text(text) = msg {
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::MarketData { token }) => {
                    let now = Utc::now();
                    let mut data = stats.lock().unwrap();
                    data.global_timestamps.push_back(now);
                    data.token_timestamps.entry(token).or_default().push_back(now);
                }
                Ok(ServerMessage::Error { code, message }) => {
                    println!("server error: {code}: {message}");
                }
                Ok(ServerMessage::Other) => {}
                Err(e) => println!("failed to parse message: {e} ({text})"),
            }
        }
    }

    Ok(())
}
