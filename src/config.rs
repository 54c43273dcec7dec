//! Config module for tubedrop

use std::{path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct ConversionConfig {
    /// Path to the yt-dlp executable. Searched for when unset.
    #[clap(long, env = "TUBEDROP_YTDLP_PATH")]
    pub ytdlp_path: Option<PathBuf>,

    /// Scratch directory for conversions. Files only live here until they are downloaded.
    #[clap(long, env = "TUBEDROP_WORK_DIR", default_value_t = get_default_work_dir())]
    pub work_dir: String,
}

impl ConversionConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().into()
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SessionConfig {
    /// Seconds a converted file waits for its download before it is deleted
    #[clap(long, env = "TUBEDROP_SESSION_TTL_SECS", default_value = "600")]
    pub session_ttl_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Safely determine the default scratch directory
fn get_default_work_dir() -> String {
    dirs::cache_dir()
        .map(|cache| cache.join("tubedrop"))
        .and_then(|path| path.to_str().map(String::from))
        .unwrap_or_else(|| "/tmp/tubedrop".to_string())
}

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct Config {
    #[clap(long, env = "TUBEDROP_HOST", default_value = "0.0.0.0:3000")]
    pub host: String,

    #[clap(flatten)]
    pub conversion: ConversionConfig,

    #[clap(flatten)]
    pub session: SessionConfig,
}

pub fn config() -> Config {
    Config::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["tubedrop"]).unwrap();
        assert_eq!(config.session.ttl(), Duration::from_secs(600));
        assert!(config.conversion.work_dir().ends_with("tubedrop"));
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "tubedrop",
            "--host",
            "127.0.0.1:8080",
            "--ytdlp-path",
            "/opt/yt-dlp",
            "--work-dir",
            "/srv/tubedrop",
            "--session-ttl-secs",
            "30",
        ])
        .unwrap();

        assert_eq!(config.host, "127.0.0.1:8080");
        assert_eq!(config.conversion.ytdlp_path, Some(PathBuf::from("/opt/yt-dlp")));
        assert_eq!(config.conversion.work_dir(), PathBuf::from("/srv/tubedrop"));
        assert_eq!(config.session.ttl(), Duration::from_secs(30));
    }
}
