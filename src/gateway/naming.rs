//! Public naming of aggregated capabilities.
//!
//! Tools and prompts are exposed as `{server}_{name}`, resources as
//! `assern://{server}/{uri}`, with `-` in server and tool names replaced by
//! `_`. Parsing splits on the *first* separator, so a server whose sanitized
//! name contains `_` does not round-trip: `parse_prefixed_name("my_srv_x")`
//! yields `("my", "srv_x")`. Inputs such as `"_tool"` or `"server_"` parse
//! to an empty half rather than being rejected.

/// Scheme prefix of public resource URIs.
pub const RESOURCE_SCHEME: &str = "assern://";

/// Separator between server and local name.
pub const SEPARATOR: char = '_';

/// Replace `-` with `_`.
pub fn sanitize(name: &str) -> String {
    name.replace('-', "_")
}

/// Public name of a tool or prompt.
pub fn prefix_name(server: &str, local: &str) -> String {
    format!("{}{SEPARATOR}{}", sanitize(server), sanitize(local))
}

/// Split a public tool or prompt name into `(server, local)`.
pub fn parse_prefixed_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(SEPARATOR)
}

/// Public URI of a resource. The backend URI is kept verbatim.
pub fn prefix_resource_uri(server: &str, uri: &str) -> String {
    format!("{RESOURCE_SCHEME}{}/{uri}", sanitize(server))
}

/// Split a public resource URI into `(server, backend_uri)`.
pub fn parse_resource_uri(uri: &str) -> Option<(&str, &str)> {
    uri.strip_prefix(RESOURCE_SCHEME)?.split_once('/')
}
