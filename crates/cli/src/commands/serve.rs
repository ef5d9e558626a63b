//! `tandem serve` — Start the WebSocket gateway.

use super::CmdResult;

pub async fn run(port_override: Option<u16>) -> CmdResult {
    let mut config = super::load_config()?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("🤝 Tandem Gateway");
    println!(
        "   WebSocket: ws://{}:{}/ws?token=<token>",
        config.gateway.host, config.gateway.port
    );
    println!("   Database:  {}", config.database_path().display());
    if !config.has_api_key() {
        println!("   ⚠️  No API key set; replies will fail until one is configured");
    }

    tandem_gateway::start(config).await?;

    Ok(())
}
