//! `tandem status` — Show system status.

use tandem_config::AppConfig;

use super::CmdResult;

pub async fn run() -> CmdResult {
    let config = super::load_config()?;

    println!("🤝 Tandem Status");
    println!("================");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Database:     {}", config.database_path().display());
    println!("  Provider:     {}", config.default_provider);
    println!("  Model:        {}", config.default_model);
    println!("  Temperature:  {}", config.default_temperature);
    println!("  API key:      {}", if config.has_api_key() { "set" } else { "missing" });
    println!("  Gateway:      {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "  Context:      top {} relevant, {} per category, {} recent sessions, {} token budget",
        config.context.relevance_top_k,
        config.context.bucket_size,
        config.context.recent_sessions,
        config.context.token_budget
    );
    println!(
        "  Limits:       task {} / message {} / memory {} chars",
        config.limits.max_task_chars, config.limits.max_message_chars, config.limits.max_memory_chars
    );

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file — run `tandem onboard` first");
    }
    if !config.database_path().exists() {
        println!("  ⚠️  No database yet — run `tandem onboard` first");
    }

    Ok(())
}
