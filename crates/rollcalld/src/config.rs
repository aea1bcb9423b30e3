use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration: optional TOML file, overridden by `ROLLCALL_*`
/// environment variables, falling back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the registration audit CSV.
    pub audit_path: PathBuf,
    /// Distance tolerance for a positive match.
    pub tolerance: f32,
    /// Period of the camera tick while the camera is running.
    pub tick_interval_ms: u64,
    /// Number of frames discarded after opening the camera (AE stabilization).
    pub warmup_frames: usize,
    /// External face encoder program followed by its arguments.
    pub encoder_command: Vec<String>,
    /// Upper bound on one encoder run; the child is killed past it.
    pub encoder_timeout_ms: u64,
    /// If set, the latest annotated frame is written here as a JPEG.
    pub preview_path: Option<PathBuf>,
    /// Font for the student id drawn under each face.
    pub label_font: Option<PathBuf>,
}

const DEFAULT_LABEL_FONT: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

/// On-disk configuration file; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    db_path: Option<PathBuf>,
    audit_path: Option<PathBuf>,
    tolerance: Option<f32>,
    tick_interval_ms: Option<u64>,
    warmup_frames: Option<usize>,
    encoder_command: Option<Vec<String>>,
    encoder_timeout_ms: Option<u64>,
    preview_path: Option<PathBuf>,
    label_font: Option<PathBuf>,
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            db_path: env("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("student_attendance.db")),
            audit_path: env("ROLLCALL_AUDIT_PATH")
                .map(PathBuf::from)
                .or(file.audit_path)
                .unwrap_or_else(|| data_dir.join("students.csv")),
            tolerance: parsed(&env, "ROLLCALL_TOLERANCE")
                .or(file.tolerance)
                .unwrap_or(rollcall_core::matcher::DEFAULT_TOLERANCE),
            tick_interval_ms: parsed(&env, "ROLLCALL_TICK_INTERVAL_MS")
                .or(file.tick_interval_ms)
                .unwrap_or(10),
            warmup_frames: parsed(&env, "ROLLCALL_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(4),
            encoder_command: env("ROLLCALL_ENCODER_CMD")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .or(file.encoder_command)
                .filter(|cmd: &Vec<String>| !cmd.is_empty())
                .unwrap_or_else(|| vec!["rollcall-encode".to_string()]),
            encoder_timeout_ms: parsed(&env, "ROLLCALL_ENCODER_TIMEOUT_MS")
                .or(file.encoder_timeout_ms)
                .unwrap_or(5000),
            preview_path: env("ROLLCALL_PREVIEW_PATH")
                .map(PathBuf::from)
                .or(file.preview_path),
            label_font: env("ROLLCALL_LABEL_FONT")
                .map(PathBuf::from)
                .or(file.label_font)
                .or_else(|| Some(PathBuf::from(DEFAULT_LABEL_FONT))),
        }
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}

fn read_file(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::resolve(FileConfig::default(), env_of(&[("HOME", "/home/op")]));
        assert_eq!(cfg.camera_device, "/dev/video0");
        assert_eq!(
            cfg.db_path,
            PathBuf::from("/home/op/.local/share/rollcall/student_attendance.db")
        );
        assert_eq!(cfg.audit_path, PathBuf::from("/home/op/.local/share/rollcall/students.csv"));
        assert!((cfg.tolerance - 0.6).abs() < 1e-6);
        assert_eq!(cfg.tick_interval_ms, 10);
        assert_eq!(cfg.encoder_command, vec!["rollcall-encode"]);
        assert_eq!(cfg.preview_path, None);
        assert_eq!(cfg.encoder_timeout_ms, 5000);
        assert_eq!(cfg.label_font, Some(PathBuf::from(DEFAULT_LABEL_FONT)));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            camera_device = "/dev/video4"
            tolerance = 0.5
            encoder_command = ["python3", "encode.py"]
            "#,
        )
        .unwrap();
        let cfg = Config::resolve(
            file,
            env_of(&[
                ("XDG_DATA_HOME", "/data"),
                ("ROLLCALL_TOLERANCE", "0.45"),
                ("ROLLCALL_TICK_INTERVAL_MS", "50"),
                ("ROLLCALL_ENCODER_TIMEOUT_MS", "750"),
                ("ROLLCALL_LABEL_FONT", "/fonts/Mono.ttf"),
            ]),
        );
        assert_eq!(cfg.encoder_timeout_ms, 750);
        assert_eq!(cfg.label_font, Some(PathBuf::from("/fonts/Mono.ttf")));
        assert_eq!(cfg.camera_device, "/dev/video4");
        assert!((cfg.tolerance - 0.45).abs() < 1e-6);
        assert_eq!(cfg.tick_interval_ms, 50);
        assert_eq!(cfg.encoder_command, vec!["python3", "encode.py"]);
        assert_eq!(cfg.db_path, PathBuf::from("/data/rollcall/student_attendance.db"));
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let cfg = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_TOLERANCE", "loose"), ("ROLLCALL_ENCODER_CMD", "  ")]),
        );
        assert!((cfg.tolerance - 0.6).abs() < 1e-6);
        assert_eq!(cfg.encoder_command, vec!["rollcall-encode"]);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "camera = \"/dev/video1\"\n").unwrap();
        assert!(read_file(&path).is_err());
    }
}
