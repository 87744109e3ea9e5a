use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use harmoniq_plugin_db::{DeadMansPedal, SnapshotFile};

/// First argument that switches an executable into scan worker mode.
pub const WORKER_MODE_ID: &str = "hqpscan-worker";

pub const DATA_DIR_ENV: &str = "HARMONIQ_PLUGIN_DATA_DIR";
pub const EXECUTABLE_ENV: &str = "HARMONIQ_PLUGIN_SCANNER_EXE";

pub const PLUGINS_FILE_NAME: &str = "plugins.json";
pub const SNAPSHOT_FILE_NAME: &str = "Temp/ScannerPluginList.json";
pub const DEAD_PLUGINS_FILE_NAME: &str = "DeadAudioPlugins.txt";

pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_HANG_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_CONSECUTIVE_RELAUNCHES: u32 = 3;
pub const DEFAULT_MAX_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Directory holding the registry, the worker snapshot and the pedal.
    pub data_dir: PathBuf,
    /// Executable launched in worker mode; normally the running binary.
    pub executable: PathBuf,
    /// How long a freshly launched worker may take to say hello.
    pub launch_timeout: Duration,
    /// Silence from a live worker after which it is killed and treated as
    /// crashed.
    pub hang_timeout: Duration,
    /// No relaunch is attempted once a session has been running this long.
    pub session_timeout: Duration,
    /// Crash relaunches tolerated in a row without the worker moving on to
    /// a different file.
    pub max_consecutive_relaunches: u32,
    /// Searched in addition to each format's default locations.
    pub search_paths: BTreeMap<String, Vec<PathBuf>>,
    pub max_depth: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|dir| dir.join("HarmoniqStudio")))
            .unwrap_or_else(|| std::env::temp_dir().join("HarmoniqStudio"));
        let executable = std::env::var_os(EXECUTABLE_ENV)
            .map(PathBuf::from)
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("harmoniq-plugin-scanner"));
        Self {
            data_dir,
            executable,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            hang_timeout: DEFAULT_HANG_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            max_consecutive_relaunches: DEFAULT_MAX_CONSECUTIVE_RELAUNCHES,
            search_paths: BTreeMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl ScannerConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn plugins_file(&self) -> PathBuf {
        self.data_dir.join(PLUGINS_FILE_NAME)
    }

    pub fn snapshot(&self) -> SnapshotFile {
        SnapshotFile::new(self.data_dir.join(SNAPSHOT_FILE_NAME))
    }

    pub fn pedal(&self) -> DeadMansPedal {
        DeadMansPedal::new(self.data_dir.join(DEAD_PLUGINS_FILE_NAME))
    }

    pub fn add_search_path(&mut self, format: impl Into<String>, path: impl Into<PathBuf>) {
        self.search_paths
            .entry(format.into())
            .or_default()
            .push(path.into());
    }

    pub fn search_paths_for(&self, format: &str) -> Vec<PathBuf> {
        self.search_paths.get(format).cloned().unwrap_or_default()
    }

    /// Arguments passed to [`ScannerConfig::executable`] to start a worker
    /// sharing this configuration.
    pub fn worker_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            WORKER_MODE_ID.into(),
            "--data-dir".into(),
            self.data_dir.clone().into_os_string(),
            "--max-depth".into(),
            self.max_depth.to_string().into(),
        ];
        for (format, paths) in &self.search_paths {
            for path in paths {
                let mut spec = OsString::from(format);
                spec.push("=");
                spec.push(path);
                args.push("--search-path".into());
                args.push(spec);
            }
        }
        args
    }
}

/// Command line of an executable started in worker mode.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "harmoniq-plugin-scanner-worker")]
pub struct WorkerArgs {
    /// Directory shared with the supervising process
    #[arg(long, value_name = "DIR")]
    pub data_dir: PathBuf,

    /// Extra search path for one format, as FORMAT=PATH
    #[arg(long = "search-path", value_name = "FORMAT=PATH", value_parser = parse_search_path)]
    pub search_paths: Vec<(String, PathBuf)>,

    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    pub max_depth: usize,
}

impl WorkerArgs {
    /// Returns `None` unless the first argument after the program name is
    /// [`WORKER_MODE_ID`].
    pub fn from_args<I, T>(args: I) -> Option<Result<Self, clap::Error>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut args = args.into_iter().map(Into::into);
        let program = args.next()?;
        if args.next()? != WORKER_MODE_ID {
            return None;
        }
        Some(Self::try_parse_from(std::iter::once(program).chain(args)))
    }

    pub fn into_config(self) -> ScannerConfig {
        let mut config = ScannerConfig::with_data_dir(self.data_dir);
        config.max_depth = self.max_depth;
        for (format, path) in self.search_paths {
            config.add_search_path(format, path);
        }
        config
    }
}

pub fn parse_search_path(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((format, path)) if !format.trim().is_empty() && !path.is_empty() => {
            Ok((format.trim().to_owned(), PathBuf::from(path)))
        }
        _ => Err(format!("expected FORMAT=PATH, got {value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn worker_args_roundtrip_through_command_line() {
        let mut config = ScannerConfig::with_data_dir("/tmp/hq-data");
        config.max_depth = 2;
        config.add_search_path("CLAP", "/opt/clap");
        config.add_search_path("VST3", "/opt/vst3=odd");

        let argv = std::iter::once(OsString::from("harmoniq")).chain(config.worker_args());
        let args = WorkerArgs::from_args(argv).unwrap().unwrap();
        assert_eq!(args.data_dir, PathBuf::from("/tmp/hq-data"));
        assert_eq!(args.max_depth, 2);

        let restored = args.into_config();
        assert_eq!(restored.search_paths, config.search_paths);
        assert_eq!(restored.snapshot().path(), config.snapshot().path());
    }

    #[test]
    fn normal_invocations_are_not_worker_mode() {
        assert!(WorkerArgs::from_args(["harmoniq"]).is_none());
        assert!(WorkerArgs::from_args(["harmoniq", "--format", "CLAP"]).is_none());
        assert!(WorkerArgs::from_args([
            "harmoniq",
            WORKER_MODE_ID,
            "--search-path",
            "nonsense"
        ])
        .unwrap()
        .is_err());
    }

    #[test]
    fn file_layout_lives_under_data_dir() {
        let config = ScannerConfig::with_data_dir("/data");
        assert_eq!(config.plugins_file(), PathBuf::from("/data/plugins.json"));
        assert_eq!(
            config.snapshot().path(),
            PathBuf::from("/data/Temp/ScannerPluginList.json").as_path()
        );
        assert_eq!(
            config.pedal().path(),
            PathBuf::from("/data/DeadAudioPlugins.txt").as_path()
        );
    }
}
