use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
pub struct GetOptions {
    /// Object type: data, key, lock, snapshot, index or config
    pub file_type: String,

    /// Object id, ignored for config
    #[arg(default_value = "")]
    pub id: String,

    /// Write the object to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<String>,

    /// Print a hex dump
    #[arg(long)]
    pub hex: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create storage group, container and repository directories
    Init,
    /// List objects of one type
    Ls {
        file_type: String,
    },
    /// Print object size
    Stat {
        file_type: String,
        #[arg(default_value = "")]
        id: String,
    },
    /// Save a local file as an object
    Put {
        file_type: String,
        id: String,
        file: String,
    },
    /// Load an object
    Get(GetOptions),
    /// Remove an object
    Rm {
        file_type: String,
        id: String,
    },
    /// Copy a local file to a raw device path
    Push {
        local: String,
        device_path: String,
    },
    /// Copy a raw device path to a local file
    Pull {
        device_path: String,
        local: String,
    },
    /// List storage groups of a filesystem device
    Groups,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Main command
    #[command(subcommand)]
    pub command: Commands,

    /// Backend configuration file
    #[arg(short, long, value_name = "PATH", default_value = "./qstore.toml")]
    pub config: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn config_path() {
        let cli = Cli::try_parse_from(["qsutil", "init"]).unwrap();
        assert_eq!(cli.config, "./qstore.toml");
        assert!(matches!(cli.command, Commands::Init));

        let cli = Cli::try_parse_from(["qsutil", "-c", "/etc/qs.toml", "ls", "data"]).unwrap();
        assert_eq!(cli.config, "/etc/qs.toml");
    }
}
