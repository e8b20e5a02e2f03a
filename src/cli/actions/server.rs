use crate::{
    api::{self, ServerOptions},
    auth::AuthConfig,
    cli::{globals::GlobalArgs, telemetry},
    vault,
};
use anyhow::{Context, Result, anyhow};
use secrecy::SecretString;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub vault_url: String,
    pub vault_role_id: String,
    pub vault_secret_id: Option<String>,
    pub vault_wrapped_token: Option<String>,
    pub vault_kv_mount: String,
    pub vault_kv_path: String,
    pub config_poll_seconds: u64,
    pub namespace: String,
    pub key: SecretString,
    pub refresh_code_ttl_seconds: u64,
    pub cookie_secure: bool,
    pub trust_forwarded_for: bool,
    pub audit_buffer: usize,
}

/// Execute the server action.
/// # Errors
/// Returns an error if Vault login fails, the settings cannot be loaded, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    Url::parse(&args.dsn).context("Invalid database connection string")?;

    let mut globals = GlobalArgs::new(args.vault_url);

    // If vault wrapped token try to unwrap, otherwise use secret-id.
    let secret_id = if let Some(wrapped) = &args.vault_wrapped_token {
        vault::unwrap(&globals.vault_url, wrapped).await?
    } else {
        args.vault_secret_id
            .clone()
            .ok_or_else(|| anyhow!("Vault secret-id is required"))?
    };
    let (token, lease) =
        vault::approle_login(&globals.vault_url, &secret_id, &args.vault_role_id).await?;
    globals.set_token(SecretString::from(token));

    debug!("Vault login succeeded, lease {lease} seconds: {:?}", globals);

    let auth = AuthConfig::new(args.namespace)
        .with_refresh_code_ttl(Duration::from_secs(args.refresh_code_ttl_seconds))
        .with_cookie_secure(args.cookie_secure)
        .with_trust_forwarded_for(args.trust_forwarded_for);

    let options = ServerOptions {
        auth,
        signing_key: args.key,
        kv_mount: args.vault_kv_mount,
        kv_path: args.vault_kv_path,
        config_poll: Duration::from_secs(args.config_poll_seconds),
        audit_buffer: args.audit_buffer,
    };

    let result = api::new(args.port, args.dsn, &globals, options).await;

    telemetry::shutdown_tracer();

    result
}
