use crate::{ProviderError, Result};

/// Connection lifecycle shared by every provider implementation.
#[derive(Debug, Default)]
pub(crate) enum Lifecycle {
    #[default]
    Uninitialized,
    Ready {
        namespace: String,
    },
    Closed,
}

impl Lifecycle {
    pub(crate) fn open(&mut self, namespace: &str) -> Result<()> {
        if matches!(self, Lifecycle::Closed) {
            return Err(ProviderError::AlreadyClosed);
        }
        *self = Lifecycle::Ready {
            namespace: namespace.to_string(),
        };
        Ok(())
    }

    /// Returns the namespace, or the error matching the current state.
    pub(crate) fn namespace(&self, provider: &'static str) -> Result<&str> {
        match self {
            Lifecycle::Ready { namespace } => Ok(namespace),
            Lifecycle::Uninitialized => Err(ProviderError::NotInitialized { provider }),
            Lifecycle::Closed => Err(ProviderError::AlreadyClosed),
        }
    }
}
