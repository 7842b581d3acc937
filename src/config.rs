use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use hyper::Uri;
use serde::Deserialize;

use crate::{
    merge::DuplicateKeyPolicy,
    recorder::RecorderOptions,
    redaction::{DEFAULT_REDACTION_PLACEHOLDER, RedactTransform},
};

pub const PROJECT_CONFIG_FILENAME: &str = "stubrecorder.toml";
const HOME_CONFIG_DIR: &str = ".stubrecorder";
const HOME_CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Base URI requests are re-targeted to. Without it the proxy forwards absolute-form
    /// request targets as-is.
    #[serde(default)]
    pub upstream: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecorderConfig {
    pub stubs_file: PathBuf,
    #[serde(default)]
    pub include_headers: bool,
    #[serde(default)]
    pub duplicate_keys: DuplicateKeyPolicy,
    #[serde(default)]
    pub redact: Option<RedactConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RedactConfig {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body_keys: Vec<String>,
    #[serde(default = "default_redaction_placeholder")]
    pub placeholder: String,
}

fn default_redaction_placeholder() -> String {
    DEFAULT_REDACTION_PLACEHOLDER.to_owned()
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Loads `override_path` if given, otherwise the first of `./stubrecorder.toml` and
    /// `$HOME/.stubrecorder/config.toml` that exists.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            return Self::from_path(path);
        }

        let candidates = discovery_candidates();
        for candidate in &candidates {
            if candidate.is_file() {
                return Self::from_path(candidate);
            }
        }

        let searched = candidates
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        bail!("no config file found (searched: {searched}); pass `--config`")
    }

    /// Relative `stubs_file` paths are resolved against the config file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;

        if config.recorder.stubs_file.is_relative() {
            if let Some(dir) = path.parent() {
                config.recorder.stubs_file = dir.join(&config.recorder.stubs_file);
            }
        }
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        let config: Self = toml.parse()?;
        config.proxy.upstream_uri()?;
        Ok(config)
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn apply_stubs_file_override(&mut self, stubs_file: Option<PathBuf>) {
        if let Some(stubs_file) = stubs_file {
            self.recorder.stubs_file = stubs_file;
        }
    }

    pub fn recorder_options(&self) -> RecorderOptions {
        let options = RecorderOptions::default()
            .include_headers(self.recorder.include_headers)
            .duplicate_keys(self.recorder.duplicate_keys);
        match self.recorder.redact.as_ref() {
            Some(redact) => options.with_transform(RedactTransform::new(
                &redact.headers,
                &redact.body_keys,
                redact.placeholder.clone(),
            )),
            None => options,
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

impl ProxyConfig {
    pub fn upstream_uri(&self) -> anyhow::Result<Option<Uri>> {
        let Some(raw) = self.upstream.as_deref() else {
            return Ok(None);
        };
        let uri: Uri = raw
            .parse()
            .with_context(|| format!("parse proxy.upstream `{raw}`"))?;
        if !matches!(uri.scheme_str(), Some("http" | "https")) {
            bail!("proxy.upstream `{raw}` must use http or https");
        }
        if uri.authority().is_none() {
            bail!("proxy.upstream `{raw}` must include a host");
        }
        Ok(Some(uri))
    }
}

fn discovery_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(PROJECT_CONFIG_FILENAME)];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(
            PathBuf::from(home)
                .join(HOME_CONFIG_DIR)
                .join(HOME_CONFIG_FILENAME),
        );
    }
    candidates
}
