//! Turn validated CLI matches into the server action.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{auth, vault};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let vault_opts = vault::Options::parse(matches)?;
    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        vault_url: vault_opts.url,
        vault_role_id: vault_opts.role_id,
        vault_secret_id: vault_opts.secret_id,
        vault_wrapped_token: vault_opts.wrapped_token,
        vault_kv_mount: vault_opts.kv_mount,
        vault_kv_path: vault_opts.kv_path,
        config_poll_seconds: vault_opts.config_poll_seconds,
        namespace: auth_opts.namespace,
        key: auth_opts.key,
        refresh_code_ttl_seconds: auth_opts.refresh_code_ttl_seconds,
        cookie_secure: auth_opts.cookie_secure,
        trust_forwarded_for: auth_opts.trust_forwarded_for,
        audit_buffer: auth_opts.audit_buffer,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_server_action() {
        temp_env::with_vars(
            [
                ("WARDEN_DSN", Some("postgres://warden@localhost:5432/warden")),
                ("WARDEN_NAMESPACE", Some("  lab ")),
                ("WARDEN_KEY", Some("signing-key")),
                (
                    "WARDEN_VAULT_URL",
                    Some("http://127.0.0.1:8200/v1/auth/approle/login"),
                ),
                ("WARDEN_VAULT_ROLE_ID", Some("role-id")),
                ("WARDEN_VAULT_SECRET_ID", Some("secret-id")),
                ("WARDEN_VAULT_WRAPPED_TOKEN", None),
                ("WARDEN_REFRESH_CODE_TTL_SECONDS", Some("30")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["warden"]);
                let action = handler(&matches);
                assert!(action.is_ok());
                if let Ok(Action::Server(args)) = action {
                    assert_eq!(args.port, 8080);
                    assert_eq!(args.namespace, "lab");
                    assert_eq!(args.refresh_code_ttl_seconds, 30);
                    assert_eq!(args.vault_secret_id.as_deref(), Some("secret-id"));
                    assert!(args.vault_wrapped_token.is_none());
                    // The signing key never shows up in debug output.
                    assert!(!format!("{args:?}").contains("signing-key"));
                }
            },
        );
    }

    #[test]
    fn blank_namespace_is_rejected() {
        temp_env::with_vars(
            [
                ("WARDEN_DSN", Some("postgres://warden@localhost:5432/warden")),
                ("WARDEN_NAMESPACE", Some("   ")),
                ("WARDEN_KEY", Some("signing-key")),
                (
                    "WARDEN_VAULT_URL",
                    Some("http://127.0.0.1:8200/v1/auth/approle/login"),
                ),
                ("WARDEN_VAULT_ROLE_ID", Some("role-id")),
                ("WARDEN_VAULT_SECRET_ID", Some("secret-id")),
                ("WARDEN_VAULT_WRAPPED_TOKEN", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["warden"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(
                        err.to_string()
                            .contains("missing required argument: --namespace")
                    );
                }
            },
        );
    }
}
