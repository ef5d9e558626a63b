//! `tandem onboard` — First-time setup.

use tandem_config::AppConfig;

use super::CmdResult;

pub async fn run() -> CmdResult {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("🤝 Tandem — First-Time Setup");
    println!("============================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if !config_path.exists() {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created config file: {}", config_path.display());
    } else {
        println!("  Config file exists: {}", config_path.display());
    }

    let config = super::load_config()?;
    super::open_store(&config).await?;
    println!("✅ Database ready: {}", config.database_path().display());

    println!("\nNext steps:");
    if !config.has_api_key() {
        println!("  1. Set an API key: export TANDEM_API_KEY=...");
    } else {
        println!("  1. API key found for provider '{}'", config.default_provider);
    }
    println!("  2. Create yourself: tandem user create --name <name> --email <email>");
    println!("  3. Start a session: tandem session start <owner-id> --task \"...\"");
    println!("  4. Run the gateway:  tandem serve");

    Ok(())
}
