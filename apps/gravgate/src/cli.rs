use clap::Parser;

/// Optional overrides layered on top of [`gravgate_common::Config::from_env`];
/// everything here also has an environment-variable equivalent, so the CLI
/// is a convenience rather than the source of truth.
#[derive(Parser, Debug)]
#[command(name = "gravgate", about = "Reverse gateway multiplexing OAuth-authenticated Antigravity credentials behind a unified chat API.")]
pub struct Cli {
    #[arg(long)]
    pub data_dir: Option<String>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
}

impl Cli {
    pub fn apply_overrides(&self, config: &mut gravgate_common::Config) {
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}
