use crate::application;
use crate::error::YakNsError;
use crate::transport::{TcpTransport, Transport, UdpTransport};

use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration files are looked for here when no explicit path is given.
const CONFIG_LOCATIONS: [&str; 2] = ["~/.config/yakns.json", "./yakns.json"];

/// Which transport the server binds.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub enum ServerTransport {
    #[default]
    #[serde(rename = "UDPv4")]
    UdpV4,
    #[serde(rename = "UDPv6")]
    UdpV6,
    #[serde(rename = "TCPv4")]
    TcpV4,
}

impl Display for ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}",
            match self {
                ServerTransport::UdpV4 => "UDPv4",
                ServerTransport::UdpV6 => "UDPv6",
                ServerTransport::TcpV4 => "TCPv4",
            }
        ))
    }
}

impl FromStr for ServerTransport {
    type Err = YakNsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "UDPv4" => Ok(ServerTransport::UdpV4),
            "UDPv6" => Ok(ServerTransport::UdpV6),
            "TCPv4" => Ok(ServerTransport::TcpV4),
            _ => Err(YakNsError::Config(format!(
                "unknown server_transport {value:?}, expected UDPv4, UDPv6 or TCPv4"
            ))),
        }
    }
}

/// The main config blob for yakns, write this as a JSON file and load it and
/// it'll make things go. Every field falls back to a sensible default, so an
/// empty (or absent) file is fine too.
#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Which transport to bind, default is UDPv4
    pub server_transport: ServerTransport,
    /// DNS listener address, default is localhost
    pub server_address: String,
    /// Listen for DNS queries on this port, default is 5300
    pub server_port: u16,
    /// Verbosity on the console sink, default is "info"
    pub console_log_level: String,
    /// Verbosity on the file sink, default is "info"
    pub file_log_level: String,
    /// Log file path; no file sink when unset
    pub log_file: Option<PathBuf>,
    /// Uncaught-error budget before forced shutdown
    pub max_errors: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server_transport: ServerTransport::default(),
            server_address: "localhost".to_string(),
            server_port: 5300,
            console_log_level: "info".to_string(),
            file_log_level: "info".to_string(),
            log_file: None,
            max_errors: application::MAX_ERRORS,
        }
    }
}

impl Settings {
    /// Loads the configuration from a given file or from some default
    /// locations, with `YAKNS_`-prefixed environment variables layered on
    /// top. Missing files mean defaults, a file that exists but will not
    /// parse is an error.
    pub fn try_from(config_path: Option<&str>) -> Result<Settings, YakNsError> {
        let file_locations: Vec<String> = match config_path {
            Some(value) => vec![value.to_string()],
            None => CONFIG_LOCATIONS.iter().map(|x| x.to_string()).collect(),
        };

        // clean up the file paths and filter them by the ones that exist
        let found_files: Vec<String> = file_locations
            .iter()
            .filter_map(|f| {
                let path = shellexpand::tilde(&f).into_owned();
                match std::path::Path::new(&path).exists() {
                    false => None,
                    true => Some(path),
                }
            })
            .collect();

        let mut builder = Config::builder();
        for filepath in found_files {
            builder = builder.add_source(File::new(&filepath, config::FileFormat::Json));
        }
        builder =
            builder.add_source(config::Environment::with_prefix("yakns").try_parsing(true));

        let settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Build the configured transport.
    pub fn build_transport(&self) -> Box<dyn Transport> {
        match self.server_transport {
            ServerTransport::UdpV4 => {
                Box::new(UdpTransport::v4(&self.server_address, self.server_port))
            }
            ServerTransport::UdpV6 => {
                Box::new(UdpTransport::v6(&self.server_address, self.server_port))
            }
            ServerTransport::TcpV4 => {
                Box::new(TcpTransport::new(&self.server_address, self.server_port))
            }
        }
    }
}
