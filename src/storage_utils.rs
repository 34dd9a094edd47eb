use crate::bars::Session;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

// CONFIGURATION STRUCTS
// `config.json` in the storage directory deserializes straight into these.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub tickers: Vec<String>,
    pub interval: String,     // e.g., "5m"
    pub period: String,       // e.g., "60d", ignored when start/end are given
    pub batch_size: usize,    // tickers fetched concurrently per batch
    pub batch_pause_ms: u64,  // pause between batches
    pub data_dir: PathBuf,    // where `<TICKER>_5min.csv` files land
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            // Empty so a first run asks for symbols on stdin.
            tickers: Vec::new(),
            interval: "5m".to_string(),
            period: "60d".to_string(),
            batch_size: 4,
            batch_pause_ms: 1_000,
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub bars: usize,
    pub include_short_days: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            bars: 6,
            include_short_days: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StrategyConfig {
    /// (period, smoothing) for the four stochastic %K lines, fastest first.
    pub stochastics: [(usize, usize); 4],
    pub ema_fast: usize,
    /// Trend reference reported next to the backtest results.
    pub ema_slow: usize,
    pub pivot_window: usize,
    pub embedded_bars: usize,
    pub long_stop_pct: f64,
    pub short_stop_pct: f64,
    pub commission: f64,
    pub cash: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            stochastics: [(9, 1), (14, 1), (44, 1), (60, 10)],
            ema_fast: 20,
            ema_slow: 200,
            pivot_window: 15,
            embedded_bars: 3,
            long_stop_pct: 0.3,
            short_stop_pct: 0.3,
            commission: 0.00001,
            cash: 10_000.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    // Nested structs organize the config logically
    pub download: DownloadConfig,
    pub analysis: AnalysisConfig,
    pub session: Session,
    pub strategy: StrategyConfig,
}

// STORAGE MANAGER

pub struct AsyncStorageManager {
    // Absolute path to the storage directory (e.g., ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// **Constructor: new_relative**
    /// Resolves the storage path relative to the running executable.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;

        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);

        Self::at(base_dir).await
    }

    /// Uses `base_dir` as-is, creating it on the spot so later saves never
    /// have to check for it.
    pub async fn at<P: Into<PathBuf>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    /// **Generic Save Function**
    /// Serializes to pretty JSON through a `.tmp` file and an atomic rename,
    /// so a crash mid-write leaves the previous file intact.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let file_name = format!("{}.json", filename);
        let final_path = self.base_dir.join(&file_name);
        let tmp_path = self.base_dir.join(format!("{}.tmp", file_name));

        let json_bytes = serde_json::to_vec_pretty(data)?;

        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(tmp_path, &final_path).await?;

        debug!(path = %final_path.display(), "saved");
        Ok(())
    }

    /// **Generic Load Function**
    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        let path = self.base_dir.join(format!("{}.json", filename));

        // Raw bytes: serde_json validates UTF-8 while parsing anyway.
        let content = fs::read(path).await?;

        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }

    /// Loads the app config, writing the defaults out first if none exists yet.
    pub async fn load_config(&self) -> anyhow::Result<AppConfig> {
        let path = self.base_dir.join("config.json");
        if !path.exists() {
            let config = AppConfig::default();
            self.save("config", &config).await?;
            info!(path = %path.display(), "wrote default config");
            return Ok(config);
        }
        self.load("config").await
    }
}
