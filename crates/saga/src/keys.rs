//! Storage key naming.

use common::InstanceId;

use crate::error::SagaError;

/// Value written to an instance's status key once it must roll back.
pub const STATUS_FAILED: &str = "fail";

/// Joins the parts of a storage key. Saga and action names may not contain
/// it, so keys of different actions never collide.
pub const KEY_SEPARATOR: char = ':';

/// Keys one action's coordinator reads and writes.
///
/// All keys share the namespace `<saga>:<action>`, so a coordinator only
/// ever writes under its own action name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    namespace: String,
    sequence: String,
}

impl StorageKeys {
    pub fn new(saga: &str, action: &str) -> Self {
        let namespace = format!("{saga}{KEY_SEPARATOR}{action}");
        Self {
            sequence: format!("{namespace}{KEY_SEPARATOR}seq"),
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Counter handing out instance ids.
    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    /// The perform result kept for compensation.
    pub fn result(&self, instance: InstanceId) -> String {
        self.instance_key(instance, "result")
    }

    /// Absent, or [`STATUS_FAILED`].
    pub fn status(&self, instance: InstanceId) -> String {
        self.instance_key(instance, "status")
    }

    /// Count of dependency Succeeded/Failed events seen for the instance.
    pub fn arrivals(&self, instance: InstanceId) -> String {
        self.instance_key(instance, "deps")
    }

    fn instance_key(&self, instance: InstanceId, suffix: &str) -> String {
        format!(
            "{}{KEY_SEPARATOR}{instance}{KEY_SEPARATOR}{suffix}",
            self.namespace
        )
    }
}

/// Checks that `name` can be used as a key component.
pub(crate) fn validate_name(what: &str, name: &str) -> Result<(), SagaError> {
    if name.is_empty() {
        return Err(SagaError::InvalidDescriptor(format!(
            "{what} name must not be empty"
        )));
    }
    if name.contains(KEY_SEPARATOR) {
        return Err(SagaError::InvalidDescriptor(format!(
            "{what} name '{name}' must not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_saga_and_action() {
        let keys = StorageKeys::new("checkout", "payment");
        let id = InstanceId::new(3);

        assert_eq!(keys.namespace(), "checkout:payment");
        assert_eq!(keys.sequence(), "checkout:payment:seq");
        assert_eq!(keys.result(id), "checkout:payment:3:result");
        assert_eq!(keys.status(id), "checkout:payment:3:status");
        assert_eq!(keys.arrivals(id), "checkout:payment:3:deps");
    }

    #[test]
    fn instances_get_distinct_keys() {
        let keys = StorageKeys::new("s", "a");
        assert_ne!(
            keys.result(InstanceId::new(1)),
            keys.result(InstanceId::new(2))
        );
    }

    #[test]
    fn suffix_like_action_names_do_not_collide() {
        let a = StorageKeys::new("s", "a");
        let a_1 = StorageKeys::new("s", "a_1");
        let a_1_status = StorageKeys::new("s", "a_1_status");
        let id = InstanceId::new(1);

        let owned_by_a = [a.sequence().to_string(), a.result(id), a.status(id), a.arrivals(id)];
        for other in [&a_1, &a_1_status] {
            for key in [
                other.sequence().to_string(),
                other.result(id),
                other.status(id),
                other.arrivals(id),
            ] {
                assert!(!owned_by_a.contains(&key), "{key}");
            }
        }
    }

    #[test]
    fn names_with_separator_are_rejected() {
        assert!(validate_name("action", "a:1").is_err());
        assert!(validate_name("action", "").is_err());
        assert!(validate_name("saga", "checkout_v2").is_ok());
    }
}
