//! The JSON run configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ipcfuzz::{observers::HandlerSpec, Error};

fn default_true() -> bool {
    true
}

fn default_max_msg_size() -> usize {
    // gRPC's customary receive ceiling.
    4 * 1024 * 1024
}

/// Everything a run needs, parsed from the `--cfg` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Absolute path of the target binary
    pub path_to_executable: PathBuf,
    #[serde(default)]
    pub executable_args: Vec<String>,
    /// Directory for progress and crash records
    pub output_path: PathBuf,
    /// External memory-dump tool (Sysinternals-style)
    #[serde(default)]
    pub dump_executable_path: Option<PathBuf>,
    #[serde(default)]
    pub perform_memory_dump: bool,
    /// RPC path → instrumentation target bindings
    #[serde(default)]
    pub handlers: Vec<HandlerSpec>,
    pub host: String,
    pub port: u16,
    /// Reserved for future use
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub perform_dry_run: bool,
    #[serde(default = "default_true")]
    pub single_field_mutation: bool,
    #[serde(default = "default_true")]
    pub dependency_unaware_sending: bool,
    #[serde(default = "default_true")]
    pub use_instrumentation: bool,
    pub proto_files_path: PathBuf,
    #[serde(default)]
    pub proto_files_include_path: Vec<PathBuf>,
    pub pcap_file_path: PathBuf,
    /// Absolute size ceiling for mutated payloads
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,
}

impl Configuration {
    /// Reads and parses the configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"{
        "pathToExecutable": "C:\\svc\\target.exe",
        "executableArgs": ["--port", "50051"],
        "outputPath": "C:\\fuzz\\out",
        "dumpExecutablePath": "C:\\tools\\procdump.exe",
        "performMemoryDump": true,
        "handlers": [
            {"method": "/pkg.Svc/Hello", "module": "target.exe", "handler": "HandleHello"}
        ],
        "host": "127.0.0.1",
        "port": 50051,
        "ssl": false,
        "performDryRun": true,
        "singleFieldMutation": true,
        "dependencyUnawareSending": false,
        "useInstrumentation": true,
        "protoFilesPath": "C:\\svc\\protos",
        "protoFilesIncludePath": ["C:\\svc\\protos\\Includes"],
        "pcapFilePath": "C:\\captures\\session.pcap",
        "maxMsgSize": 131072
    }"#;

    #[test]
    fn full_configuration_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = Configuration::load(file.path()).unwrap();
        assert_eq!(config.port, 50051);
        assert_eq!(config.handlers.len(), 1);
        assert_eq!(config.handlers[0].handler, "HandleHello");
        assert!(!config.dependency_unaware_sending);
        assert_eq!(config.max_msg_size, 131072);
    }

    #[test]
    fn optional_keys_have_defaults() {
        let minimal = r#"{
            "pathToExecutable": "/opt/svc/target",
            "outputPath": "/tmp/out",
            "host": "127.0.0.1",
            "port": 50051,
            "protoFilesPath": "/opt/svc/protos",
            "pcapFilePath": "/opt/svc/session.pcap"
        }"#;
        let config: Configuration = serde_json::from_str(minimal).unwrap();
        assert!(config.single_field_mutation);
        assert!(config.dependency_unaware_sending);
        assert!(config.use_instrumentation);
        assert!(!config.perform_dry_run);
        assert!(!config.ssl);
        assert!(config.handlers.is_empty());
        assert_eq!(config.max_msg_size, 4 * 1024 * 1024);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            Configuration::load(Path::new("/definitely/not/here.json")),
            Err(Error::File(_))
        ));
    }
}
