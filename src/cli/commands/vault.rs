use anyhow::Result;
use clap::{Arg, ArgGroup, ArgMatches, Command};

pub const ARG_VAULT_URL: &str = "vault-url";
pub const ARG_VAULT_ROLE_ID: &str = "vault-role-id";
pub const ARG_VAULT_SECRET_ID: &str = "vault-secret-id";
pub const ARG_VAULT_WRAPPED_TOKEN: &str = "vault-wrapped-token";
pub const ARG_VAULT_KV_MOUNT: &str = "vault-kv-mount";
pub const ARG_VAULT_KV_PATH: &str = "vault-kv-path";
pub const ARG_CONFIG_POLL_SECONDS: &str = "config-poll-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VAULT_URL)
                .long(ARG_VAULT_URL)
                .help("Vault AppRole login URL, e.g. https://vault.tld:8200/v1/auth/approle/login")
                .env("WARDEN_VAULT_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_VAULT_ROLE_ID)
                .long(ARG_VAULT_ROLE_ID)
                .help("Vault role id")
                .env("WARDEN_VAULT_ROLE_ID")
                .required(true),
        )
        .arg(
            Arg::new(ARG_VAULT_SECRET_ID)
                .long(ARG_VAULT_SECRET_ID)
                .help("Vault secret id")
                .env("WARDEN_VAULT_SECRET_ID"),
        )
        .arg(
            Arg::new(ARG_VAULT_WRAPPED_TOKEN)
                .long(ARG_VAULT_WRAPPED_TOKEN)
                .help("Vault wrapped token holding the secret id")
                .env("WARDEN_VAULT_WRAPPED_TOKEN"),
        )
        .group(
            ArgGroup::new("vault-auth")
                .args([ARG_VAULT_SECRET_ID, ARG_VAULT_WRAPPED_TOKEN])
                .required(true)
                .multiple(false),
        )
        .arg(
            Arg::new(ARG_VAULT_KV_MOUNT)
                .long(ARG_VAULT_KV_MOUNT)
                .help("Vault KV-v2 mount holding the settings document")
                .env("WARDEN_VAULT_KV_MOUNT")
                .default_value("secret"),
        )
        .arg(
            Arg::new(ARG_VAULT_KV_PATH)
                .long(ARG_VAULT_KV_PATH)
                .help("Vault KV-v2 path of the settings document")
                .env("WARDEN_VAULT_KV_PATH")
                .default_value("warden/values"),
        )
        .arg(
            Arg::new(ARG_CONFIG_POLL_SECONDS)
                .long(ARG_CONFIG_POLL_SECONDS)
                .help("How often to check Vault for a new settings version")
                .env("WARDEN_CONFIG_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub url: String,
    pub role_id: String,
    pub secret_id: Option<String>,
    pub wrapped_token: Option<String>,
    pub kv_mount: String,
    pub kv_path: String,
    pub config_poll_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let url = matches
            .get_one::<String>(ARG_VAULT_URL)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_VAULT_URL}"))?;
        let role_id = matches
            .get_one::<String>(ARG_VAULT_ROLE_ID)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_VAULT_ROLE_ID}"))?;

        Ok(Self {
            url,
            role_id,
            secret_id: matches.get_one::<String>(ARG_VAULT_SECRET_ID).cloned(),
            wrapped_token: matches.get_one::<String>(ARG_VAULT_WRAPPED_TOKEN).cloned(),
            kv_mount: matches
                .get_one::<String>(ARG_VAULT_KV_MOUNT)
                .cloned()
                .unwrap_or_else(|| "secret".to_string()),
            kv_path: matches
                .get_one::<String>(ARG_VAULT_KV_PATH)
                .cloned()
                .unwrap_or_else(|| "warden/values".to_string()),
            config_poll_seconds: matches
                .get_one::<u64>(ARG_CONFIG_POLL_SECONDS)
                .copied()
                .unwrap_or(5),
        })
    }
}
