use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use serde::Deserialize;

/*
Machine description. Parsed from YAML, e.g.:

  cpu: R4400
  byte_order: big
  ncpus: 1
  memory_mib: 64
  initial_pc: 0xffffffffbfc00000
  dyntrans:
    enabled: true
    pool_records: 1048576
  log: info
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DyntransConfig {
    pub enabled: bool,
    /// Capacity of the translated-code pool, in operation records.
    pub pool_records: usize,
}

impl Default for DyntransConfig {
    fn default() -> Self {
        DyntransConfig {
            enabled: true,
            pool_records: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub cpu: String,
    pub byte_order: ByteOrder,
    pub ncpus: usize,
    pub memory_mib: u64,
    pub initial_pc: u64,
    pub dyntrans: DyntransConfig,
    pub log: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            cpu: String::from("R4000"),
            byte_order: ByteOrder::Big,
            ncpus: 1,
            memory_mib: 64,
            initial_pc: 0xffff_ffff_bfc0_0000,
            dyntrans: DyntransConfig::default(),
            log: String::from("info"),
        }
    }
}

impl MachineConfig {
    pub fn from_yaml(text: &str) -> Result<Self, SetupError> {
        serde_yaml::from_str(text).map_err(|e| SetupError::BadConfig(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, SetupError> {
        let text = fs::read_to_string(path).map_err(SetupError::Io)?;
        Self::from_yaml(&text)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mib * 1024 * 1024
    }
}

/// Integrator misuse, fatal at setup time.
#[derive(Debug)]
pub enum SetupError {
    UnknownCpuType(String),
    OverlappingDevice { name: String, existing: String },
    MisalignedDevice { name: String, base: u64 },
    BadConfig(String),
    BadLogFilter(String),
    Io(io::Error),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::UnknownCpuType(name) => write!(f, "unknown cpu type \"{}\"", name),
            SetupError::OverlappingDevice { name, existing } => {
                write!(f, "device \"{}\" overlaps already registered \"{}\"", name, existing)
            }
            SetupError::MisalignedDevice { name, base } => {
                write!(f, "device \"{}\" base {:#x} is not page aligned", name, base)
            }
            SetupError::BadConfig(msg) => write!(f, "bad machine description: {}", msg),
            SetupError::BadLogFilter(msg) => write!(f, "bad log filter {}", msg),
            SetupError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for SetupError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_description() {
        let cfg = MachineConfig::from_yaml("cpu: R3000\nbyte_order: little\nmemory_mib: 16\n")
            .unwrap();
        assert_eq!(cfg.cpu, "R3000");
        assert_eq!(cfg.byte_order, ByteOrder::Little);
        assert_eq!(cfg.memory_bytes(), 16 * 1024 * 1024);
        assert!(cfg.dyntrans.enabled);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = MachineConfig::from_yaml("cpu: R10000\n").unwrap();
        assert_eq!(cfg.ncpus, 1);
        assert_eq!(cfg.byte_order, ByteOrder::Big);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(MachineConfig::from_yaml("cpu: [oops\n").is_err());
    }
}
