use serde::Deserialize;
use std::path::{Path, PathBuf};
use tally_store::BackendKind;

/// Cascade file looked up in `model_dir` when no explicit path is set.
pub const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

/// CLI configuration.
///
/// Resolved in layers: built-in defaults, then the TOML file named by
/// `TALLY_CONFIG` (or `$XDG_CONFIG_HOME/tally/config.toml`), then `TALLY_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may pick another.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory holding the cascade file.
    pub model_dir: PathBuf,
    /// Explicit cascade path, overriding `model_dir`.
    pub cascade_path: Option<PathBuf>,
    /// SQLite database for enrollment samples (and attendance with the sqlite backend).
    pub db_path: PathBuf,
    pub attendance_backend: BackendKind,
    /// Directory for `Attendance_DD-MM-YYYY.csv` files.
    pub attendance_dir: PathBuf,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// How often the enrollment progress is polled.
    pub poll_interval_ms: u64,
    /// Delay between frames when replaying a directory.
    pub replay_interval_ms: u64,
    /// Give up on an enrollment session after this many seconds; 0 waits forever.
    pub enroll_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = xdg_dir("XDG_DATA_HOME", ".local/share").join("tally");
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_dir: data_dir.join("models"),
            cascade_path: None,
            db_path: data_dir.join("tally.db"),
            attendance_backend: BackendKind::Sqlite,
            attendance_dir: data_dir.join("attendance"),
            warmup_frames: 4,
            poll_interval_ms: 200,
            replay_interval_ms: 1000,
            enroll_timeout_secs: 0,
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("TALLY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| xdg_dir("XDG_CONFIG_HOME", ".config").join("tally/config.toml"));

        let file = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                Some(text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("reading {}", path.display())))
            }
        };

        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layer `file` (TOML text) and `env` over the defaults.
    pub fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config: Config = match file {
            Some(text) => toml::from_str(text)?,
            None => Config::default(),
        };

        if let Some(v) = env("TALLY_CAMERA_DEVICE") {
            config.camera_device = v;
        }
        if let Some(v) = env("TALLY_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("TALLY_CASCADE_PATH") {
            config.cascade_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TALLY_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("TALLY_ATTENDANCE_BACKEND") {
            config.attendance_backend = v.parse()?;
        }
        if let Some(v) = env("TALLY_ATTENDANCE_DIR") {
            config.attendance_dir = PathBuf::from(v);
        }
        env_parse(&env, "TALLY_FRAME_WIDTH", &mut config.frame_width);
        env_parse(&env, "TALLY_FRAME_HEIGHT", &mut config.frame_height);
        env_parse(&env, "TALLY_WARMUP_FRAMES", &mut config.warmup_frames);
        env_parse(&env, "TALLY_POLL_INTERVAL_MS", &mut config.poll_interval_ms);
        env_parse(&env, "TALLY_REPLAY_INTERVAL_MS", &mut config.replay_interval_ms);
        env_parse(&env, "TALLY_ENROLL_TIMEOUT_SECS", &mut config.enroll_timeout_secs);

        Ok(config)
    }

    /// Path to the Haar cascade file.
    pub fn cascade_path(&self) -> PathBuf {
        self.cascade_path
            .clone()
            .unwrap_or_else(|| self.model_dir.join(CASCADE_FILE))
    }
}

/// Overwrite `slot` when `key` is set and parses; otherwise keep it.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Path::new(&home).join(fallback)
    })
}
