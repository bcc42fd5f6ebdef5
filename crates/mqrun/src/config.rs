use std::{path::PathBuf, time::Duration};

use mqrun_process::ProbeBudget;

use crate::launch::LaunchTemplate;
use crate::supervisor_support::{executable_dir, non_empty, parse_u32, parse_u64};

pub const DEFAULT_VERSION: &str = "1.4.2";
pub const DEFAULT_PORT: u16 = 9324;
const DEFAULT_RETRY_COUNT: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
const CACHE_DIR_NAME: &str = ".cache";

pub fn default_source_url(version: &str) -> String {
    format!(
        "https://s3-eu-west-1.amazonaws.com/softwaremill-public/elasticmq-server-{version}.jar"
    )
}

/// Certificate policy for the artifact download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    #[default]
    Verify,
    /// Accept any certificate. Only for mirrors with broken chains.
    NoVerify,
}

impl TlsPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "verify" | "strict" => Some(Self::Verify),
            "noverify" | "no-verify" | "insecure" => Some(Self::NoVerify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub source_url: String,
    pub listen_port: u16,
    /// Working directory of the launched server.
    pub install_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub pid_file_path: PathBuf,
    pub start_budget: ProbeBudget,
    pub stop_budget: ProbeBudget,
    pub status_budget: ProbeBudget,
    pub tls: TlsPolicy,
    pub launch: LaunchTemplate,
}

impl SupervisorConfig {
    /// Defaults rooted at `install_dir`.
    pub fn new(install_dir: PathBuf) -> Self {
        let cache_dir = install_dir.join(CACHE_DIR_NAME);
        let budget = ProbeBudget::new(
            DEFAULT_RETRY_COUNT,
            Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        );
        Self {
            source_url: default_source_url(DEFAULT_VERSION),
            listen_port: DEFAULT_PORT,
            pid_file_path: pid_file_path(&cache_dir, DEFAULT_PORT),
            install_dir,
            cache_dir,
            start_budget: budget,
            stop_budget: budget,
            status_budget: ProbeBudget::single(),
            tls: TlsPolicy::default(),
            launch: LaunchTemplate::java("java"),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply `MQRUN_*` overrides read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let install_dir = non_empty(lookup("MQRUN_HOME").as_deref())
            .map(PathBuf::from)
            .unwrap_or_else(executable_dir);
        let mut cfg = Self::new(install_dir);

        let version = non_empty(lookup("MQRUN_VERSION").as_deref())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        cfg.source_url = non_empty(lookup("MQRUN_SOURCE_URL").as_deref())
            .unwrap_or_else(|| default_source_url(&version));

        if let Some(raw) = lookup("MQRUN_PORT") {
            match raw.trim().parse::<u16>() {
                Ok(port) if port != 0 => cfg.listen_port = port,
                _ => tracing::warn!(value = %raw, "ignoring invalid MQRUN_PORT"),
            }
        }
        cfg.pid_file_path = pid_file_path(&cfg.cache_dir, cfg.listen_port);

        let count = parse_u32(lookup("MQRUN_RETRY_COUNT").as_deref())
            .map(|v| v.clamp(1, 600))
            .unwrap_or(DEFAULT_RETRY_COUNT);
        let delay_ms = parse_u64(lookup("MQRUN_RETRY_DELAY_MS").as_deref())
            .map(|v| v.min(10 * 60 * 1000))
            .unwrap_or(DEFAULT_RETRY_DELAY_MS);
        let budget = ProbeBudget::new(count, Duration::from_millis(delay_ms));
        cfg.start_budget = budget;
        cfg.stop_budget = budget;

        if let Some(raw) = lookup("MQRUN_TLS") {
            match TlsPolicy::parse(&raw) {
                Some(policy) => cfg.tls = policy,
                None => tracing::warn!(value = %raw, "ignoring invalid MQRUN_TLS"),
            }
        }

        if let Some(java) = non_empty(lookup("MQRUN_JAVA").as_deref()) {
            cfg.launch = LaunchTemplate::java(java);
        }

        cfg
    }

    pub fn server_log_path(&self) -> PathBuf {
        self.cache_dir
            .join(format!("server-{}.log", self.listen_port))
    }
}

pub fn pid_file_path(cache_dir: &std::path::Path, port: u16) -> PathBuf {
    cache_dir.join(format!("pid-{port}"))
}
