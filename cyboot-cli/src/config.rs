//! Configuration file support for cyboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CYBOOT_*)
//! 3. Local config file (./cyboot.toml)
//! 4. Global config file (~/.config/cyboot/config.toml)
//!
//! USB-UART bridges the user chose to remember are kept apart from the main
//! settings, in `./cyboot_ports.toml` or `<config dir>/ports.toml`.

use {
    clap::ValueEnum,
    directories::ProjectDirs,
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "cyboot.toml";

/// Local remembered-ports file name.
const LOCAL_PORTS: &str = "cyboot_ports.toml";

/// Link used to reach the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    /// UART bootloader behind a serial port.
    #[default]
    Serial,
    /// USB HID bootloader.
    Hid,
}

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// HID bootloader identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HidConfig {
    /// USB Vendor ID of the bootloader.
    pub vid: Option<u16>,
    /// USB Product ID of the bootloader.
    pub pid: Option<u16>,
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred transport.
    pub transport: Option<TransportChoice>,
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Serial baud rate.
    pub baud: Option<u32>,
    /// Largest frame the bootloader accepts.
    pub max_transfer_size: Option<usize>,
    /// HID settings.
    #[serde(default)]
    pub hid: HidConfig,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Program images even when they do not match the detected board.
    #[serde(default)]
    pub force: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Contents of a remembered-ports file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PortsFile {
    #[serde(default)]
    usb_device: Vec<UsbDevice>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
            .usb_device
            .extend(Self::load_remembered_ports());
        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        read_toml(path)
    }

    fn load_remembered_ports() -> Vec<UsbDevice> {
        let mut devices = Vec::new();
        for path in Self::ports_paths() {
            if let Some(ports) = read_toml::<PortsFile>(&path) {
                debug!("Loaded remembered ports from {}", path.display());
                devices.extend(ports.usb_device);
            }
        }
        devices
    }

    fn ports_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = Self::global_config_dir() {
            paths.push(dir.join("ports.toml"));
        }
        paths.push(PathBuf::from(LOCAL_PORTS));
        paths
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "cyboot").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn
            .transport
            .is_some()
        {
            self.connection
                .transport = conn.transport;
        }
        if conn
            .serial
            .is_some()
        {
            self.connection
                .serial = conn.serial;
        }
        if conn
            .baud
            .is_some()
        {
            self.connection
                .baud = conn.baud;
        }
        if conn
            .max_transfer_size
            .is_some()
        {
            self.connection
                .max_transfer_size = conn.max_transfer_size;
        }
        if conn
            .hid
            .vid
            .is_some()
        {
            self.connection
                .hid
                .vid = conn.hid.vid;
        }
        if conn
            .hid
            .pid
            .is_some()
        {
            self.connection
                .hid
                .pid = conn.hid.pid;
        }

        if other
            .flash
            .force
        {
            self.flash
                .force = true;
        }
        self.usb_device
            .extend(other.usb_device);
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        if self
            .usb_device
            .contains(&device)
        {
            return Ok(());
        }

        // Stay next to a local config when there is one
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        let mut ports = read_toml::<PortsFile>(&path).unwrap_or_default();
        if !ports
            .usb_device
            .contains(&device)
        {
            ports
                .usb_device
                .push(device.clone());
        }
        fs::write(&path, toml::to_string_pretty(&ports)?)?;
        info!("Saved USB device {vid:04X}:{pid:04X} to {}", path.display());

        self.usb_device
            .push(device);
        Ok(())
    }
}

/// Read and parse a TOML file, warning on failure.
fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", path.display(), e);
                None
            },
        },
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            None
        },
    }
}
