use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_NAMESPACE: &str = "namespace";
pub const ARG_KEY: &str = "key";
pub const ARG_REFRESH_CODE_TTL_SECONDS: &str = "refresh-code-ttl-seconds";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";
pub const ARG_TRUST_FORWARDED_FOR: &str = "trust-forwarded-for";
pub const ARG_AUDIT_BUFFER: &str = "audit-buffer";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_NAMESPACE)
                .short('n')
                .long(ARG_NAMESPACE)
                .help("Prefix for counter and session keys; also the token issuer")
                .env("WARDEN_NAMESPACE")
                .required(true),
        )
        .arg(
            Arg::new(ARG_KEY)
                .short('k')
                .long(ARG_KEY)
                .help("Token signing key")
                .env("WARDEN_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_REFRESH_CODE_TTL_SECONDS)
                .long(ARG_REFRESH_CODE_TTL_SECONDS)
                .help("Lifetime of a refresh code in seconds")
                .env("WARDEN_REFRESH_CODE_TTL_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark the session cookie Secure (serve over HTTPS)")
                .env("WARDEN_COOKIE_SECURE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_TRUST_FORWARDED_FOR)
                .long(ARG_TRUST_FORWARDED_FOR)
                .help("Take the client address from X-Forwarded-For / X-Real-IP (only behind a trusted proxy)")
                .env("WARDEN_TRUST_FORWARDED_FOR")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_AUDIT_BUFFER)
                .long(ARG_AUDIT_BUFFER)
                .help("Audit events buffered before new ones are dropped")
                .env("WARDEN_AUDIT_BUFFER")
                .default_value("1024")
                .value_parser(clap::value_parser!(usize)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub namespace: String,
    pub key: SecretString,
    pub refresh_code_ttl_seconds: u64,
    pub cookie_secure: bool,
    pub trust_forwarded_for: bool,
    pub audit_buffer: usize,
}

impl Options {
    /// # Errors
    /// Returns an error if the namespace or key is missing or blank.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let namespace = matches
            .get_one::<String>(ARG_NAMESPACE)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_NAMESPACE}"))?;
        let key = matches
            .get_one::<String>(ARG_KEY)
            .filter(|value| !value.is_empty())
            .map(|value| SecretString::from(value.clone()))
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_KEY}"))?;

        Ok(Self {
            namespace,
            key,
            refresh_code_ttl_seconds: matches
                .get_one::<u64>(ARG_REFRESH_CODE_TTL_SECONDS)
                .copied()
                .unwrap_or(60),
            cookie_secure: matches.get_flag(ARG_COOKIE_SECURE),
            trust_forwarded_for: matches.get_flag(ARG_TRUST_FORWARDED_FOR),
            audit_buffer: matches
                .get_one::<usize>(ARG_AUDIT_BUFFER)
                .copied()
                .unwrap_or(1024),
        })
    }
}
