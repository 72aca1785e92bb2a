use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
#[command(
    version,
    about = "A low-interaction honeypot that answers on many ports and logs every attempt",
    long_about = "A low-interaction honeypot daemon. It binds plausible-looking FTP, SSH, \
HTTP, database and infrastructure services, refuses every authentication attempt, and \
reports whatever credentials and commands attackers submit to the configured log sinks. \
No attacker input is ever executed and no login can succeed."
)]
pub struct App {
    /// Path to the configuration file. Without it ./decoyd.toml, the user
    /// config directory and /etc/decoyd/decoyd.toml are tried in that order
    #[arg(short = 'c', long = "config", env = "DECOYD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Check the configuration and exit without binding any ports
    #[arg(long = "validate", default_value_t = false)]
    pub validate: bool,
}
