// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

use std::{fs, path::PathBuf, str::FromStr};

use serde::Deserialize;
use structopt::StructOpt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Pcap,
    AfPacket,
    Offline,
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pcap" => Ok(SourceType::Pcap),
            "af_packet" => Ok(SourceType::AfPacket),
            "offline" => Ok(SourceType::Offline),
            other => Err(format!(
                "`{}` is not a capture type; expected pcap, af_packet or offline",
                other,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserName {
    Mongodb,
    Mysql,
}

impl FromStr for ParserName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mongodb" => Ok(ParserName::Mongodb),
            "mysql" => Ok(ParserName::Mysql),
            other => Err(format!(
                "`{}` is not a supported parser; expected mongodb or mysql",
                other,
            )),
        }
    }
}

#[derive(Debug, Clone, StructOpt)]
pub struct CaptureOptions {
    /// Capture mode: pcap, af_packet or offline
    #[structopt(long = "capture-type", default_value = "pcap")]
    pub source_type: SourceType,
    /// Network interface to listen on
    #[structopt(long = "capture-device", default_value = "any")]
    pub device: String,
    /// Bytes captured per packet
    #[structopt(long = "capture-snaplen", default_value = "65535")]
    pub snaplen: i32,
    /// Kernel capture buffer size in MiB (af_packet mode)
    #[structopt(long = "capture-bufsize-mb", default_value = "30")]
    pub bufsize_mb: i32,
    /// Seconds before a sequence hole is skipped over
    #[structopt(long = "capture-flush-timeout-sec", default_value = "5")]
    pub flush_timeout_sec: u64,
    /// Trace file to read in offline mode
    #[structopt(long = "capture-pcap-file")]
    pub pcap_file: Option<PathBuf>,
}

/// Command line and config file options.
///
/// Values from a TOML file given with `--config` override the flags.
/// Unrecognized file keys are rejected.
#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "tcpagent", about = "Passive per-query telemetry for database traffic.")]
pub struct AppConfig {
    /// Config file in TOML format
    #[structopt(short = "c", long = "config")]
    pub config_file: Option<PathBuf>,
    /// Which protocol to parse
    #[structopt(short = "p", long = "parser", default_value = "mongodb")]
    pub parser: ParserName,
    /// Only send 1 / rate events
    #[structopt(short = "r", long = "samplerate", default_value = "1")]
    pub samplerate: u64,
    /// Seconds between summary statistics log lines
    #[structopt(long = "status-interval-sec", default_value = "60")]
    pub status_interval_sec: u64,
    /// Events buffered towards the sink before dropping
    #[structopt(long = "publish-buffer", default_value = "1024")]
    pub publish_buffer: usize,
    /// Print verbose debug logs
    #[structopt(long)]
    pub debug: bool,
    #[structopt(flatten)]
    pub capture: CaptureOptions,
    /// MongoDB server port
    #[structopt(long = "mongodb-port", default_value = "27017")]
    pub mongodb_port: u16,
    /// MySQL server port
    #[structopt(long = "mysql-port", default_value = "3306")]
    pub mysql_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    parser: Option<ParserName>,
    samplerate: Option<u64>,
    status_interval_sec: Option<u64>,
    publish_buffer: Option<usize>,
    capture: Option<CaptureSection>,
    mongodb: Option<MongoDbSection>,
    mysql: Option<MySqlSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureSection {
    #[serde(rename = "type")]
    source_type: Option<SourceType>,
    device: Option<String>,
    snaplen: Option<i32>,
    bufsize_mb: Option<i32>,
    flush_timeout_sec: Option<u64>,
    pcap_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MongoDbSection {
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MySqlSection {
    port: Option<u16>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = AppConfig::from_args();
        if let Some(path) = &config.config_file {
            let text = fs::read_to_string(path)?;
            let file = toml::from_str::<ConfigFile>(&text)?;
            file.apply(&mut config);
        }
        if config.capture.source_type == SourceType::Offline && config.capture.pcap_file.is_none() {
            anyhow::bail!("offline capture requires capture.pcap_file");
        }
        Ok(config)
    }
}

impl ConfigFile {
    fn apply(self, config: &mut AppConfig) {
        let ConfigFile {
            parser,
            samplerate,
            status_interval_sec,
            publish_buffer,
            capture,
            mongodb,
            mysql,
        } = self;
        if let Some(parser) = parser {
            config.parser = parser;
        }
        if let Some(samplerate) = samplerate {
            config.samplerate = samplerate;
        }
        if let Some(interval) = status_interval_sec {
            config.status_interval_sec = interval;
        }
        if let Some(buffer) = publish_buffer {
            config.publish_buffer = buffer;
        }
        if let Some(section) = capture {
            if let Some(source_type) = section.source_type {
                config.capture.source_type = source_type;
            }
            if let Some(device) = section.device {
                config.capture.device = device;
            }
            if let Some(snaplen) = section.snaplen {
                config.capture.snaplen = snaplen;
            }
            if let Some(bufsize_mb) = section.bufsize_mb {
                config.capture.bufsize_mb = bufsize_mb;
            }
            if let Some(timeout) = section.flush_timeout_sec {
                config.capture.flush_timeout_sec = timeout;
            }
            if let Some(pcap_file) = section.pcap_file {
                config.capture.pcap_file = Some(pcap_file);
            }
        }
        if let Some(section) = mongodb {
            if let Some(port) = section.port {
                config.mongodb_port = port;
            }
        }
        if let Some(section) = mysql {
            if let Some(port) = section.port {
                config.mysql_port = port;
            }
        }
    }
}
