//! Access rights and REST endpoint matching.

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use trustgate_types::PartyId;

/// Grants one client access to a service, optionally narrowed to a REST
/// method and path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRight {
    /// The client that is granted access.
    pub client: PartyId,
    /// HTTP method, `None` or `*` for any.
    pub method: Option<String>,
    /// Path pattern, `None` for any. `*` matches one segment and a trailing
    /// `**` matches the rest of the path.
    pub path: Option<String>,
}

impl AccessRight {
    /// A right covering every method and path.
    pub fn any(client: PartyId) -> Self {
        Self {
            client,
            method: None,
            path: None,
        }
    }

    /// A right covering one endpoint.
    pub fn endpoint(client: PartyId, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client,
            method: Some(method.into()),
            path: Some(path.into()),
        }
    }

    /// Whether this right admits `client` calling `method` on `path`.
    ///
    /// Envelope requests pass `None` for both; only rights without an
    /// endpoint restriction (or with wildcard ones) admit them.
    pub fn permits(&self, client: &PartyId, method: Option<&str>, path: Option<&str>) -> bool {
        if &self.client != client {
            return false;
        }
        let method_ok = match (self.method.as_deref(), method) {
            (None | Some("*"), _) => true,
            (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
        };
        let path_ok = match (self.path.as_deref(), path) {
            (None | Some("**") | Some("/**"), _) => true,
            (Some(pattern), Some(actual)) => path_matches(pattern, actual),
            (Some(_), None) => false,
        };
        method_ok && path_ok
    }
}

/// Matches a normalized request path against an endpoint pattern. Paths
/// that still carry `.` or `..` segments match nothing.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return false;
    }
    let mut pattern_segments = pattern.trim_start_matches('/').split('/');
    let mut path_segments = path.trim_start_matches('/').split('/');

    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (Some("**"), _) => return true,
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A request path with dot segments resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath {
    /// Percent-decoded form, matched against access rights.
    pub decoded: String,
    /// Form that goes on the wire, original escapes kept.
    pub encoded: String,
}

/// Resolves `.` and `..` segments of a service path, recognizing them in
/// escaped form too.
///
/// Returns `None` when the path climbs above its root, is not valid UTF-8
/// once decoded, or hides a dot segment behind an escaped slash.
pub fn normalize_path(raw: &str) -> Option<NormalizedPath> {
    let raw = raw.split(['?', '#']).next().unwrap_or_default();
    let mut segments: Vec<(&str, String)> = Vec::new();
    let mut trailing_slash = false;
    for segment in raw.strip_prefix('/').unwrap_or(raw).split('/') {
        let decoded = percent_decode_str(segment).decode_utf8().ok()?.into_owned();
        trailing_slash = false;
        match decoded.as_str() {
            "." => trailing_slash = true,
            ".." => {
                segments.pop()?;
                trailing_slash = true;
            }
            _ if decoded.split(['/', '\\']).any(|part| part == "." || part == "..") => return None,
            _ => segments.push((segment, decoded)),
        }
    }
    if segments.last().is_some_and(|(segment, _)| segment.is_empty()) {
        segments.pop();
        trailing_slash = true;
    }

    let join = |parts: Vec<&str>| {
        let mut path = format!("/{}", parts.join("/"));
        if trailing_slash && !parts.is_empty() {
            path.push('/');
        }
        path
    };
    Some(NormalizedPath {
        decoded: join(segments.iter().map(|(_, decoded)| decoded.as_str()).collect()),
        encoded: join(segments.iter().map(|(segment, _)| *segment).collect()),
    })
}

/// Serialized form of an access right inside a configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessRightEntry {
    /// Client identifier in `INSTANCE/CLASS/CODE[/SUBSYSTEM]` form.
    pub client: String,
    /// Optional HTTP method.
    #[serde(default)]
    pub method: Option<String>,
    /// Optional path pattern.
    #[serde(default)]
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PartyId {
        PartyId::subsystem("EE", "GOV", "2", "app")
    }

    #[test]
    fn any_right_admits_everything_for_its_client() {
        let right = AccessRight::any(client());
        assert!(right.permits(&client(), None, None));
        assert!(right.permits(&client(), Some("DELETE"), Some("/x/y")));
        assert!(!right.permits(&PartyId::member("EE", "GOV", "2"), None, None));
    }

    #[test]
    fn endpoint_right_matches_method_and_path() {
        let right = AccessRight::endpoint(client(), "GET", "/people/*");
        assert!(right.permits(&client(), Some("get"), Some("/people/42")));
        assert!(!right.permits(&client(), Some("POST"), Some("/people/42")));
        assert!(!right.permits(&client(), Some("GET"), Some("/people/42/address")));
        assert!(!right.permits(&client(), None, None));
    }

    #[test]
    fn double_star_matches_any_suffix() {
        assert!(path_matches("/people/**", "/people/42/address"));
        assert!(path_matches("/people/**", "/people"));
        assert!(!path_matches("/people/**", "/animals/1"));
        assert!(path_matches("/exact", "/exact?q=1"));
        assert!(!path_matches("/exact", "/exact/more"));
    }

    #[test]
    fn dot_segments_never_match() {
        assert!(!path_matches("/people/**", "/people/../admin/secrets"));
        assert!(!path_matches("/people/*/*", "/people/./7"));
        assert!(!path_matches("/**", "/.."));
    }

    #[test]
    fn single_star_does_not_cross_segments() {
        assert!(path_matches("/people/*", "/people/7"));
        assert!(!path_matches("/people/*", "/people/7/address"));
        assert!(path_matches("/people/*/address", "/people/7/address"));
    }

    #[test]
    fn normalization_resolves_traversal_before_matching() {
        let path = normalize_path("/people/../admin/secrets").unwrap();
        assert_eq!(path.decoded, "/admin/secrets");
        assert_eq!(path.encoded, "/admin/secrets");
        let right = AccessRight::endpoint(client(), "GET", "/people/**");
        assert!(!right.permits(&client(), Some("GET"), Some(&path.decoded)));

        let path = normalize_path("/people/7/./address/../phone").unwrap();
        assert_eq!(path.decoded, "/people/7/phone");
        assert!(right.permits(&client(), Some("GET"), Some(&path.decoded)));
    }

    #[test]
    fn escaped_dot_segments_are_resolved() {
        let path = normalize_path("/people/%2e%2E/admin").unwrap();
        assert_eq!(path.decoded, "/admin");
        assert_eq!(normalize_path("/people/%2e/7").unwrap().decoded, "/people/7");
    }

    #[test]
    fn paths_escaping_the_root_are_rejected() {
        assert_eq!(normalize_path("/.."), None);
        assert_eq!(normalize_path("/people/../../admin"), None);
        assert_eq!(normalize_path("/people/%2F..%2Fadmin"), None);
        assert_eq!(normalize_path("/people/%ff"), None);
    }

    #[test]
    fn escapes_survive_in_the_encoded_form() {
        let path = normalize_path("/people/7%20x?full=1").unwrap();
        assert_eq!(path.decoded, "/people/7 x");
        assert_eq!(path.encoded, "/people/7%20x");
        assert!(path_matches("/people/*", &path.decoded));
    }

    #[test]
    fn trailing_slash_is_kept() {
        assert_eq!(normalize_path("/people/").unwrap().decoded, "/people/");
        assert_eq!(normalize_path("/people/7/..").unwrap().decoded, "/people/");
        assert_eq!(normalize_path("/").unwrap().decoded, "/");
        assert_eq!(normalize_path("").unwrap().decoded, "/");
        assert!(path_matches("/people/**", "/people/"));
        assert!(!path_matches("/people", "/people/"));
    }
}
