use clap::{ArgAction, Parser, Subcommand};
use quest_downgrade::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "quest-downgrade")]
#[command(about = "Downgrade an installed Quest app over ADB", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Authenticate with the headset (accept the prompt on-device)
    quest-downgrade init

    # Show the installed version and any matching downgrade
    quest-downgrade check

    # Build the downgraded APK and install it
    quest-downgrade patch --install

    # Use a headset in `adb tcpip` mode
    quest-downgrade --tcp 192.168.1.20:5555 check")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.config/quest-downgrade/config.toml)
    #[arg(long, global = true, env = "QUEST_DOWNGRADE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device serial when several are attached
    #[arg(short, long, global = true, env = "ANDROID_SERIAL")]
    pub serial: Option<String>,

    /// Connect to adbd at host:port instead of USB
    #[arg(long, global = true, value_name = "HOST:PORT")]
    pub tcp: Option<String>,

    /// Package id of the app to inspect
    #[arg(long, global = true)]
    pub app_id: Option<String>,

    /// Version manifest URL
    #[arg(long, global = true, value_name = "URL", conflicts_with = "manifest_file")]
    pub manifest_url: Option<String>,

    /// Version manifest read from a local file
    #[arg(long, global = true, value_name = "PATH")]
    pub manifest_file: Option<PathBuf>,

    /// Directory for patched APKs
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// xdelta3 executable
    #[arg(long, global = true, env = "XDELTA3")]
    pub xdelta: Option<PathBuf>,

    /// Seconds to wait for the on-device authorization prompt
    #[arg(long, global = true)]
    pub auth_timeout: Option<u64>,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only show errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List attached ADB devices
    Devices,

    /// Connect and authenticate, reporting how far it got
    Init,

    /// Run a command on the device
    Shell {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Copy a file from the device
    Pull { remote: String, local: PathBuf },

    /// Copy a file to the device
    Push { local: PathBuf, remote: String },

    /// List a remote directory
    Ls { remote: String },

    /// Show the installed version and compatible downgrades
    Check,

    /// Build the downgraded APK
    Patch {
        /// Install the result on the device afterwards
        #[arg(long)]
        install: bool,
    },
}

impl Cli {
    /// Command-line values win over the config file
    pub fn apply(&self, config: &mut Config) {
        if let Some(serial) = &self.serial {
            config.serial = Some(serial.clone());
        }
        if let Some(tcp) = &self.tcp {
            config.tcp_address = Some(tcp.clone());
        }
        if let Some(app_id) = &self.app_id {
            config.app_id = app_id.clone();
        }
        if let Some(url) = &self.manifest_url {
            config.manifest_url = url.clone();
            config.manifest_path = None;
        }
        if let Some(path) = &self.manifest_file {
            config.manifest_path = Some(path.clone());
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(xdelta) = &self.xdelta {
            config.xdelta_program = xdelta.clone();
        }
        if let Some(secs) = self.auth_timeout {
            config.auth_timeout_secs = secs;
        }
    }

    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
