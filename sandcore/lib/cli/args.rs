use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, Subcommand};

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// sandcore - Ephemeral compute sandboxes with fallback containers and preview proxying
#[derive(Debug, Parser)]
#[command(name = "sandcore", author, about, version, styles=styles::styles())]
pub struct SandcoreArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<SandcoreSubcommand>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum SandcoreSubcommand {
    /// Run the sandbox HTTP service
    #[command(name = "serve")]
    Serve {
        /// Address to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for daily-rotated log files
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Operate fallback container workspaces directly
    #[command(name = "fallback")]
    Fallback {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// The action to perform
        #[command(subcommand)]
        action: FallbackAction,
    },

    /// Serve a directory over HTTP
    #[command(name = "static-serve", hide = true)]
    StaticServe {
        /// Port to listen on
        #[arg(long)]
        port: u16,

        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: IpAddr,

        /// Directory to serve
        #[arg(long)]
        root: PathBuf,
    },
}

/// Workspace operations of the fallback container layer
#[derive(Debug, Subcommand)]
pub enum FallbackAction {
    /// Create the workspace of a sandbox
    Create {
        /// The sandbox id
        sandbox_id: String,
    },

    /// Mark a workspace as running
    Start {
        /// The sandbox id
        sandbox_id: String,
    },

    /// Mark a workspace as stopped
    Stop {
        /// The sandbox id
        sandbox_id: String,
    },

    /// Stop and start a workspace
    Restart {
        /// The sandbox id
        sandbox_id: String,
    },

    /// Delete a workspace
    Remove {
        /// The sandbox id
        sandbox_id: String,
    },

    /// Show the status of a workspace
    Status {
        /// The sandbox id
        sandbox_id: String,
    },

    /// Archive a workspace into a snapshot
    Snapshot {
        /// The sandbox id
        sandbox_id: String,

        /// The snapshot id
        #[arg(long)]
        snapshot_id: Option<String>,
    },

    /// Replace a workspace with a snapshot
    Restore {
        /// The sandbox id
        sandbox_id: String,

        /// The snapshot id
        snapshot_id: String,
    },

    /// List the snapshots of a sandbox
    Snapshots {
        /// The sandbox id
        sandbox_id: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let args = SandcoreArgs::parse_from(["sandcore", "serve", "--port", "9000", "-v"]);
        assert!(args.verbose);
        match args.subcommand {
            Some(SandcoreSubcommand::Serve { port, host, .. }) => {
                assert_eq!(port, Some(9000));
                assert!(host.is_none());
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn test_parse_fallback_snapshot() {
        let args = SandcoreArgs::parse_from([
            "sandcore",
            "fallback",
            "snapshot",
            "sb1",
            "--snapshot-id",
            "before-upgrade",
        ]);
        match args.subcommand {
            Some(SandcoreSubcommand::Fallback {
                action:
                    FallbackAction::Snapshot {
                        sandbox_id,
                        snapshot_id,
                    },
                ..
            }) => {
                assert_eq!(sandbox_id, "sb1");
                assert_eq!(snapshot_id.as_deref(), Some("before-upgrade"));
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }

    #[test]
    fn test_parse_static_serve() {
        let args = SandcoreArgs::parse_from([
            "sandcore",
            "static-serve",
            "--port",
            "33000",
            "--root",
            "/tmp/ws",
        ]);
        match args.subcommand {
            Some(SandcoreSubcommand::StaticServe { port, bind, root }) => {
                assert_eq!(port, 33000);
                assert_eq!(bind.to_string(), "127.0.0.1");
                assert_eq!(root, PathBuf::from("/tmp/ws"));
            }
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }
}
