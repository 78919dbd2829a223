use clap::Parser;
use serde_json::Value;
use std::time::Duration;

/// Exercises the client REST surface (`/health`, `/quote`, `/ltp`, `/ohlc`)
/// against a running gateway instance. Meant to be pointed at a real
/// deployment, not run as part of an automated suite.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Smoke-tests the gateway's REST surface", long_about = None)]
struct Args {
    /// Base URL of the running gateway, e.g. http://127.0.0.1:8080
    #[clap(short, long, default_value = "http://127.0.0.1:8080")]
    base_url: String,

    /// API key to present on the quote/ltp/ohlc calls.
    #[clap(short, long)]
    api_key: String,

    /// Comma-separated EXCHANGE-TOKEN pairs, e.g. NSE_EQ-738561,NSE_EQ-408065
    #[clap(short, long, default_value = "NSE_EQ-738561")]
    instruments: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;

    println!("GET /health");
    let health: Value = client.get(format!("{}/health", args.base_url)).send().await?.json().await?;
    println!("{health}");

    println!("GET /quote?instruments={}", args.instruments);
    let quote = client
        .get(format!("{}/quote", args.base_url))
        .query(&[("instruments", args.instruments.as_str())])
        .header("x-api-key", &args.api_key)
        .send()
        .await?;
    println!("status {}: {}", quote.status(), quote.text().await?);

    println!("GET /ltp?instruments={}", args.instruments);
    let ltp = client
        .get(format!("{}/ltp", args.base_url))
        .query(&[("instruments", args.instruments.as_str())])
        .header("x-api-key", &args.api_key)
        .send()
        .await?;
    println!("status {}: {}", ltp.status(), ltp.text().await?);

    println!("GET /ohlc?instruments={}", args.instruments);
    let ohlc = client
        .get(format!("{}/ohlc", args.base_url))
        .query(&[("instruments", args.instruments.as_str())])
        .header("x-api-key", &args.api_key)
        .send()
        .await?;
    println!("status {}: {}", ohlc.status(), ohlc.text().await?);

    println!("GET /quote with no api key (expect 401 auth_missing)");
    let unauthed = client
        .get(format!("{}/quote", args.base_url))
        .query(&[("instruments", args.instruments.as_str())])
        .send()
        .await?;
    println!("status {}: {}", unauthed.status(), unauthed.text().await?);

    Ok(())
}
