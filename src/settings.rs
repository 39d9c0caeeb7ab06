use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Verbosity of log records forwarded to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Error
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(LogLevel::None),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(Error::type_error(format!("invalid logLevel \"{s}\""))),
        }
    }
}

/// Tag-scoped log gating. A record tagged with one of these is emitted only
/// when its tag is active.
pub const LOG_TAGS: &[&str] = &[
    "info", "ice", "dtls", "rtp", "srtp", "rtcp", "rtx", "bwe", "score", "simulcast", "svc",
    "sctp", "message",
];

/// Worker settings. `log_level` and `log_tags` may be updated at runtime via
/// `worker.updateSettings`; the rest is fixed for the worker's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub log_level: LogLevel,
    pub log_tags: HashSet<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
    /// Additional delay in ms applied when coalescing key frame requests for
    /// the same SSRC. 0 keeps only in-flight deduplication.
    pub key_frame_request_delay: u32,
    /// EWMA alpha applied to available-bitrate samples before allocation.
    pub available_bitrate_smoothing_factor: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            log_level: LogLevel::default(),
            log_tags: HashSet::new(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
            key_frame_request_delay: 0,
            available_bitrate_smoothing_factor: 0.85,
        }
    }
}

impl WorkerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.rtc_min_port > self.rtc_max_port {
            return Err(Error::type_error("rtcMinPort is greater than rtcMaxPort"));
        }
        for tag in &self.log_tags {
            if !LOG_TAGS.contains(&tag.as_str()) {
                return Err(Error::type_error(format!("invalid logTag \"{tag}\"")));
            }
        }
        if !(0.0..=1.0).contains(&self.available_bitrate_smoothing_factor) {
            return Err(Error::type_error(
                "availableBitrateSmoothingFactor out of [0, 1]",
            ));
        }
        Ok(())
    }

    /// Parse `--key=value` command line arguments the way the control plane
    /// spawns the worker binary.
    pub fn from_args<I, S>(args: I) -> Result<WorkerSettings>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut settings = WorkerSettings::default();

        for arg in args {
            let arg = arg.as_ref();
            let Some(kv) = arg.strip_prefix("--") else {
                return Err(Error::type_error(format!("unknown argument \"{arg}\"")));
            };
            let (key, value) = kv
                .split_once('=')
                .ok_or_else(|| Error::type_error(format!("missing value in \"{arg}\"")))?;

            match key {
                "logLevel" => settings.log_level = value.parse()?,
                "logTag" => {
                    settings.log_tags.insert(value.to_string());
                }
                "rtcMinPort" => {
                    settings.rtc_min_port = value
                        .parse()
                        .map_err(|_| Error::type_error("invalid rtcMinPort"))?;
                }
                "rtcMaxPort" => {
                    settings.rtc_max_port = value
                        .parse()
                        .map_err(|_| Error::type_error("invalid rtcMaxPort"))?;
                }
                "dtlsCertificateFile" => {
                    settings.dtls_certificate_file = Some(value.to_string());
                }
                "dtlsPrivateKeyFile" => {
                    settings.dtls_private_key_file = Some(value.to_string());
                }
                "keyFrameRequestDelay" => {
                    settings.key_frame_request_delay = value
                        .parse()
                        .map_err(|_| Error::type_error("invalid keyFrameRequestDelay"))?;
                }
                _ => return Err(Error::type_error(format!("unknown argument \"{arg}\""))),
            }
        }

        settings.validate()?;

        Ok(settings)
    }
}

/// The runtime-updatable subset of [`WorkerSettings`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateableSettings {
    pub log_level: Option<LogLevel>,
    pub log_tags: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_args_parses_ports_and_tags() {
        let settings = WorkerSettings::from_args([
            "--logLevel=warn",
            "--logTag=ice",
            "--logTag=rtp",
            "--rtcMinPort=40000",
            "--rtcMaxPort=49999",
        ])
        .unwrap();

        assert_eq!(settings.log_level, LogLevel::Warn);
        assert!(settings.log_tags.contains("ice"));
        assert!(settings.log_tags.contains("rtp"));
        assert_eq!(settings.rtc_min_port, 40000);
        assert_eq!(settings.rtc_max_port, 49999);
    }

    #[test]
    fn invalid_log_level_rejected() {
        assert!(WorkerSettings::from_args(["--logLevel=chicken"]).is_err());
    }

    #[test]
    fn inverted_port_range_rejected() {
        assert!(WorkerSettings::from_args(["--rtcMinPort=1000", "--rtcMaxPort=999"]).is_err());
    }
}
