/// Client configuration
///
/// Tunables for the persistence engine; everything has a sensible default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Extra attempts `with_transaction` makes after an error the store
    /// classifies as transient (write conflicts). Non-transient errors are
    /// never retried.
    pub max_transaction_retries: u32,

    /// Run schema validation before every save. Disabling this skips the
    /// pre-persistence hook entirely; cast-on-mutation still applies.
    pub validate_on_save: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_transaction_retries: 3,
            validate_on_save: true,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transient-error retry bound for `with_transaction`.
    pub fn max_transaction_retries(mut self, retries: u32) -> Self {
        self.max_transaction_retries = retries;
        self
    }

    /// Toggle pre-save validation.
    pub fn validate_on_save(mut self, validate: bool) -> Self {
        self.validate_on_save = validate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new();
        assert_eq!(config.max_transaction_retries, 3);
        assert!(config.validate_on_save);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new()
            .max_transaction_retries(0)
            .validate_on_save(false);
        assert_eq!(config.max_transaction_retries, 0);
        assert!(!config.validate_on_save);
    }
}
