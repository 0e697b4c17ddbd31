use axum::http::{HeaderMap, HeaderName};

use crate::response::AppError;

const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
const PERMISSIONS_HEADER: HeaderName = HeaderName::from_static("x-user-permissions");

/// Permissions granted by the upstream gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Review,
    SpeakingAttempt,
    WeakWords,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Review => "REVIEW",
            Capability::SpeakingAttempt => "SPEAKING_ATTEMPT",
            Capability::WeakWords => "WEAK_WORDS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub permissions: Vec<String>,
}

impl AuthUser {
    pub fn has(&self, capability: Capability) -> bool {
        self.permissions
            .iter()
            .any(|p| p.eq_ignore_ascii_case(capability.as_str()))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Resolves the caller from gateway headers and checks one capability.
pub fn authenticate(headers: &HeaderMap, capability: Capability) -> Result<AuthUser, AppError> {
    let Some(id) = header_str(headers, &USER_ID_HEADER) else {
        return Err(AppError::unauthorized("missing user identity"));
    };

    let permissions = header_str(headers, &PERMISSIONS_HEADER)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let user = AuthUser {
        id: id.to_string(),
        permissions,
    };
    if !user.has(capability) {
        tracing::debug!(user_id = %user.id, capability = capability.as_str(), "capability missing");
        return Err(AppError::forbidden(format!(
            "missing permission {}",
            capability.as_str()
        )));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    fn headers(user: Option<&str>, perms: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(user) = user {
            headers.insert(USER_ID_HEADER, HeaderValue::from_str(user).unwrap());
        }
        if let Some(perms) = perms {
            headers.insert(PERMISSIONS_HEADER, HeaderValue::from_str(perms).unwrap());
        }
        headers
    }

    #[test]
    fn test_missing_user_is_unauthorized() {
        let err = authenticate(&headers(None, Some("REVIEW")), Capability::Review).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let err = authenticate(&headers(Some("  "), Some("REVIEW")), Capability::Review).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_missing_capability_is_forbidden() {
        let err = authenticate(&headers(Some("u1"), Some("REVIEW")), Capability::WeakWords).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "FORBIDDEN");

        let err = authenticate(&headers(Some("u1"), None), Capability::Review).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_permission_list_is_trimmed() {
        let user = authenticate(
            &headers(Some("u1"), Some("REVIEW, speaking_attempt ,WEAK_WORDS")),
            Capability::SpeakingAttempt,
        )
        .unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.permissions.len(), 3);
        assert!(user.has(Capability::WeakWords));
    }
}
