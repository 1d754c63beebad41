//! Role-based authorization

use std::collections::BTreeSet;

use hyper::Method;

use super::Role;

/// Decides whether a role set may use an HTTP method
pub trait Authorizer: Send + Sync {
    fn authorize(&self, roles: &BTreeSet<Role>, method: &Method) -> bool;
}

/// Reader: GET/HEAD, Writer: PUT/POST, Healthcheck: TRACE
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleAuthorizer;

impl RoleAuthorizer {
    /// Role a method requires; `None` for methods no role grants
    pub fn required_role(method: &Method) -> Option<Role> {
        match *method {
            Method::GET | Method::HEAD => Some(Role::Reader),
            Method::PUT | Method::POST => Some(Role::Writer),
            Method::TRACE => Some(Role::Healthcheck),
            _ => None,
        }
    }
}

impl Authorizer for RoleAuthorizer {
    fn authorize(&self, roles: &BTreeSet<Role>, method: &Method) -> bool {
        Self::required_role(method).is_some_and(|role| roles.contains(&role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(roles: &[Role]) -> BTreeSet<Role> {
        roles.iter().copied().collect()
    }

    #[test]
    fn test_reader() {
        let reader = roles(&[Role::Reader]);
        assert!(RoleAuthorizer.authorize(&reader, &Method::GET));
        assert!(RoleAuthorizer.authorize(&reader, &Method::HEAD));
        assert!(!RoleAuthorizer.authorize(&reader, &Method::PUT));
        assert!(!RoleAuthorizer.authorize(&reader, &Method::TRACE));
    }

    #[test]
    fn test_writer_and_healthcheck() {
        let writer = roles(&[Role::Writer]);
        assert!(RoleAuthorizer.authorize(&writer, &Method::PUT));
        assert!(RoleAuthorizer.authorize(&writer, &Method::POST));
        assert!(!RoleAuthorizer.authorize(&writer, &Method::GET));

        let health = roles(&[Role::Healthcheck]);
        assert!(RoleAuthorizer.authorize(&health, &Method::TRACE));
    }

    #[test]
    fn test_unmapped_methods_never_authorized() {
        assert!(!RoleAuthorizer.authorize(&Role::all(), &Method::DELETE));
        assert!(!RoleAuthorizer.authorize(&Role::all(), &Method::OPTIONS));
    }
}
