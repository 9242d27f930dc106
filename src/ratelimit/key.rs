//! Resource key identity.

/// A key that uniquely identifies rate limit state.
///
/// The key is the pair of the resource (service) name and the operation
/// invoked on it. Distinct keys never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// The service or resource being called
    pub service: String,
    /// The operation invoked on the service
    pub operation: String,
}

impl ResourceKey {
    /// Create a new key from a service and operation name.
    pub fn new(service: &str, operation: &str) -> Self {
        Self {
            service: service.to_string(),
            operation: operation.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service, self.operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_creation() {
        let key = ResourceKey::new("s3", "GetObject");

        assert_eq!(key.service, "s3");
        assert_eq!(key.operation, "GetObject");
        assert_eq!(key.to_string(), "s3.GetObject");
    }

    #[test]
    fn test_resource_key_equality() {
        assert_eq!(ResourceKey::new("s3", "GetObject"), ResourceKey::new("s3", "GetObject"));
        assert_ne!(ResourceKey::new("s3", "GetObject"), ResourceKey::new("s3", "PutObject"));
        assert_ne!(ResourceKey::new("s3", "Query"), ResourceKey::new("dynamodb", "Query"));
    }
}
