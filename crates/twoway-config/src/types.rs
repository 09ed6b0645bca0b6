use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default first request tag handed out by the harness. Engine-internal
/// requests use tags below this value.
pub const DEFAULT_TAG_SEED: u64 = 1 << 30;

/// Human-readable duration (e.g., "400ms", "5m", "600s").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn from_millis(ms: u64) -> Self {
        HumanDuration(Duration::from_millis(ms))
    }

    pub fn from_secs(secs: u64) -> Self {
        HumanDuration(Duration::from_secs(secs))
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();

        let (num_str, unit) = if let Some(n) = s.strip_suffix("ms") {
            (n, "ms")
        } else if let Some(n) = s.strip_suffix('s') {
            (n, "s")
        } else if let Some(n) = s.strip_suffix('m') {
            (n, "m")
        } else if let Some(n) = s.strip_suffix('h') {
            (n, "h")
        } else if let Some(n) = s.strip_suffix('d') {
            (n, "d")
        } else {
            return Err(format!("Invalid duration format: {}", s));
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;

        let duration = match unit {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            _ => Duration::from_secs(num * 86400),
        };

        Ok(HumanDuration(duration))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        let secs = self.0.as_secs();

        if millis % 1000 != 0 || secs == 0 {
            write!(f, "{}ms", millis)
        } else if secs % 60 != 0 {
            write!(f, "{}s", secs)
        } else if secs % 3600 != 0 {
            write!(f, "{}m", secs / 60)
        } else if secs % 86400 != 0 {
            write!(f, "{}h", secs / 3600)
        } else {
            write!(f, "{}d", secs / 86400)
        }
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        HumanDuration::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Credentials of the test account shared by every agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Bounds on every blocking wait the harness performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on a single cross-thread command.
    #[serde(default = "default_command_timeout")]
    pub command: HumanDuration,
    /// How often the quiescence waiter polls each agent.
    #[serde(default = "default_quiescence_poll")]
    pub quiescence_poll: HumanDuration,
    /// Hard ceiling after which the quiescence waiter gives up.
    #[serde(default = "default_quiescence_ceiling")]
    pub quiescence_ceiling: HumanDuration,
}

fn default_command_timeout() -> HumanDuration {
    HumanDuration::from_secs(600)
}

fn default_quiescence_poll() -> HumanDuration {
    HumanDuration::from_millis(400)
}

fn default_quiescence_ceiling() -> HumanDuration {
    HumanDuration::from_secs(300)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            command: default_command_timeout(),
            quiescence_poll: default_quiescence_poll(),
            quiescence_ceiling: default_quiescence_ceiling(),
        }
    }
}

/// Tuning for the in-process reference engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Local rescan cadence of each sync.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: HumanDuration,
    /// Sync actions applied per worker iteration.
    #[serde(default = "default_actions_per_exec")]
    pub actions_per_exec: usize,
    /// Worker sleep when the engine has no deadline of its own.
    #[serde(default = "default_idle_wait")]
    pub idle_wait: HumanDuration,
}

fn default_scan_interval() -> HumanDuration {
    HumanDuration::from_millis(50)
}

fn default_actions_per_exec() -> usize {
    32
}

fn default_idle_wait() -> HumanDuration {
    HumanDuration::from_millis(100)
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            scan_interval: default_scan_interval(),
            actions_per_exec: default_actions_per_exec(),
            idle_wait: default_idle_wait(),
        }
    }
}

/// Root harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Directory under which every agent gets its own folder.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default)]
    pub account: AccountConfig,
    /// Name of the folder created under the cloud root for each test.
    #[serde(default = "default_remote_base_folder")]
    pub remote_base_folder: String,
    /// Reserved folder where the engine moves items removed by sync.
    #[serde(default = "default_debris_folder")]
    pub debris_folder: String,
    #[serde(default = "default_tag_seed")]
    pub tag_seed: u64,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_remote_base_folder() -> String {
    "twoway_test_base".to_string()
}

fn default_debris_folder() -> String {
    ".debris".to_string()
}

fn default_tag_seed() -> u64 {
    DEFAULT_TAG_SEED
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            base_dir: None,
            account: AccountConfig::default(),
            remote_base_folder: default_remote_base_folder(),
            debris_folder: default_debris_folder(),
            tag_seed: default_tag_seed(),
            timeouts: TimeoutConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}
