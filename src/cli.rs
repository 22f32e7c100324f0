use clap::{Parser, Subcommand, ValueEnum};

/// ERPlink — credential & token broker for upstream ERP instances
#[derive(Parser)]
#[command(name = "erplink", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind; overrides ERPLINK_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage registered instances and their tokens
    Instance {
        #[command(subcommand)]
        command: InstanceCommands,
    },

    /// Execute a one-shot record operation through the broker
    Call {
        /// Operation to run upstream
        action: CallAction,
        /// Target model (e.g. res.partner)
        model: String,
        /// Bearer token identifying the instance
        #[arg(long)]
        token: String,
        /// Search conditions as a JSON list
        #[arg(long, default_value = "[]")]
        domain: String,
        /// Fields to return as a JSON list
        #[arg(long, default_value = "[]")]
        fields: String,
        /// Values for create/update as a JSON object
        #[arg(long, default_value = "{}")]
        values: String,
        /// Record ID for update/delete
        #[arg(long)]
        id: Option<i64>,
    },
}

#[derive(Subcommand)]
pub enum InstanceCommands {
    /// Register an instance and issue its first token
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        database: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        secret: String,
        /// Token lifetime: 'once', 'forever', or e.g. '30d'
        #[arg(long, default_value = "forever")]
        policy: String,
    },
    /// List registered instances (no secrets)
    List,
    /// Issue a replacement token for an instance
    Renew {
        /// Instance name (or current token)
        name: String,
        /// Token lifetime: 'once', 'forever', or e.g. '30d'
        #[arg(long)]
        policy: String,
    },
    /// Revoke a token
    Revoke {
        #[arg(long)]
        token: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CallAction {
    Search,
    Create,
    Update,
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_without_port_flag_defers_to_config() {
        let cli = Cli::try_parse_from(["erplink", "serve"]).unwrap();
        match cli.command {
            Some(Commands::Serve { port }) => assert!(port.is_none()),
            _ => panic!("expected serve subcommand"),
        }
    }

    #[test]
    fn serve_port_flag_overrides() {
        let cli = Cli::try_parse_from(["erplink", "serve", "--port", "9001"]).unwrap();
        match cli.command {
            Some(Commands::Serve { port }) => assert_eq!(port, Some(9001)),
            _ => panic!("expected serve subcommand"),
        }
    }
}
