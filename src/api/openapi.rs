use super::handlers::{auth, health};
use utoipa::OpenApi;
use utoipa::openapi::{
    Components, Contact, InfoBuilder, License, OpenApiBuilder,
    security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

// Every routed handler is listed here so the `openapi` binary and the router agree.
#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::login,
        auth::verify,
        auth::user,
        auth::code,
        auth::refresh_token,
        auth::logout,
        auth::change_password,
        auth::change_expired_password,
        auth::list_sessions,
        auth::revoke_session,
        auth::clear_sessions,
    ),
    tags(
        (name = "health", description = "Liveness and build information"),
        (name = "auth", description = "Sessions, refresh codes and password changes"),
        (name = "sessions", description = "Listing and revoking active sessions")
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = cargo_openapi();
    doc.merge(ApiDoc::openapi());

    // Token from `/login`, sent as a bearer header or the `access_token` cookie.
    doc.components
        .get_or_insert_with(Components::new)
        .add_security_scheme(
            "session",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );

    doc
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, rest)) => (
            optional_str(name),
            optional_str(rest.trim_end_matches('>')),
        ),
        None => (optional_str(author), None),
    }
}
