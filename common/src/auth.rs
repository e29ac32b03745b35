use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const WWW_AUTHENTICATE: &str = "Basic realm=\"Hello\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Missing,
    Rejected,
}

impl AuthOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticated => "AUTHENTICATED",
            Self::Missing => "MISSING",
            Self::Rejected => "REJECTED",
        }
    }
}

/// `Basic base64(username:password)`
pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

pub fn verify(header: Option<&str>, username: &str, password: &str) -> AuthOutcome {
    match header {
        None => AuthOutcome::Missing,
        Some(value) if value.trim().is_empty() => AuthOutcome::Missing,
        Some(value) if value.trim() == basic_auth_header(username, password) => {
            AuthOutcome::Authenticated
        }
        Some(_) => AuthOutcome::Rejected,
    }
}

/// Body sent back on a successful check.
pub fn authenticated_body(username: &str) -> String {
    serde_json::json!({ "authenticated": true, "user": username }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_matches_rfc_example() {
        assert_eq!(
            basic_auth_header("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn verify_outcomes() {
        let good = basic_auth_header("ESP32", "ESP32Webserver");

        assert_eq!(verify(Some(&good), "ESP32", "ESP32Webserver"), AuthOutcome::Authenticated);
        assert_eq!(verify(None, "ESP32", "ESP32Webserver"), AuthOutcome::Missing);
        assert_eq!(verify(Some(""), "ESP32", "ESP32Webserver"), AuthOutcome::Missing);
        assert_eq!(
            verify(Some("Basic d3Jvbmc6d3Jvbmc="), "ESP32", "ESP32Webserver"),
            AuthOutcome::Rejected
        );
    }

    #[test]
    fn body_names_the_user() {
        let body: serde_json::Value = serde_json::from_str(&authenticated_body("ESP32")).unwrap();
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["user"], "ESP32");
    }
}
