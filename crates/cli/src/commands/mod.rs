pub mod memory;
pub mod onboard;
pub mod serve;
pub mod session;
pub mod status;
pub mod user;

use std::sync::Arc;

use tandem_config::AppConfig;
use tandem_store::SqliteStore;

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

pub async fn open_store(config: &AppConfig) -> Result<Arc<SqliteStore>, Box<dyn std::error::Error>> {
    let path = config.database_path();
    let store = SqliteStore::open_file(&path)
        .await
        .map_err(|e| format!("Failed to open database {}: {e}", path.display()))?;
    Ok(Arc::new(store))
}
