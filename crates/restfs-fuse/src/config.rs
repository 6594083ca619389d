use crate::adapter::StaticHeaderAdapter;
use crate::attr::AttrDefaults;
use crate::engine::EngineConfig;
use crate::error::{RestFsError, Result};
use crate::mount::{parse_mount_options, MountOptions};
use crate::retry::RetryPolicy;
use crate::translate::{validate_host, Scheme, Translator, Verb};
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

/// Settings for one mount, from a file and then from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestFsConfig {
    pub host: String,
    pub protocol: Scheme,
    /// Comma-separated FUSE options, e.g. `allow_other,ro`.
    pub mount_options: String,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub metadata_verb: Verb,
    pub write_verb: Verb,
    pub rename_fallback: bool,
    pub attr_ttl_ms: u64,
    pub write_buffer_bytes: usize,
    pub file_mode: u16,
    pub dir_mode: u16,
    /// Owner reported for every entry; the mounting user when unset.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
    pub user_agent: String,
}

impl Default for RestFsConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            host: String::new(),
            protocol: Scheme::Https,
            mount_options: String::new(),
            concurrency: 16,
            retry: RetryPolicy::default(),
            connect_timeout_ms: transport.connect_timeout_ms,
            request_timeout_ms: transport.request_timeout_ms,
            metadata_verb: Verb::Head,
            write_verb: Verb::Put,
            rename_fallback: true,
            attr_ttl_ms: 1000,
            write_buffer_bytes: 4 * 1024 * 1024,
            file_mode: 0o644,
            dir_mode: 0o755,
            uid: None,
            gid: None,
            headers: BTreeMap::new(),
            user_agent: transport.user_agent,
        }
    }
}

impl RestFsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: RestFsConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: RestFsConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_host(&self.host)?;
        let invalid = |msg: &str| {
            Err(RestFsError::InvalidArgument {
                msg: msg.to_string(),
            })
        };
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.write_buffer_bytes == 0 {
            return invalid("write_buffer_bytes must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be at least 1.0");
        }
        self.mount_options()?;
        self.translator()?;
        self.header_adapter()?;
        Ok(())
    }

    pub fn mount_options(&self) -> Result<MountOptions> {
        Ok(parse_mount_options(&self.mount_options)?)
    }

    pub fn translator(&self) -> Result<Translator> {
        Translator::new(self.protocol, &self.host)?
            .with_metadata_verb(self.metadata_verb)?
            .with_write_verb(self.write_verb)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            concurrency: self.concurrency,
            retry: self.retry.clone(),
            write_buffer_bytes: self.write_buffer_bytes,
            rename_fallback: self.rename_fallback,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            user_agent: self.user_agent.clone(),
        }
    }

    /// Ownership defaults to whoever owns the mount directory.
    pub fn attr_defaults(&self, mountpoint: &Path) -> AttrDefaults {
        let (uid, gid) = std::fs::metadata(mountpoint)
            .map(|meta| (meta.uid(), meta.gid()))
            .unwrap_or((0, 0));
        AttrDefaults {
            uid: self.uid.unwrap_or(uid),
            gid: self.gid.unwrap_or(gid),
            file_mode: self.file_mode,
            dir_mode: self.dir_mode,
        }
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }

    /// Adapter carrying the configured headers.
    pub fn header_adapter(&self) -> Result<StaticHeaderAdapter> {
        Ok(StaticHeaderAdapter::new(&self.headers)?)
    }
}
