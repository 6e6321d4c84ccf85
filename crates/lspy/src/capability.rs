//! Capability registry (C10): merges static capabilities declared at `initialize` with dynamic
//! `client/registerCapability` / `client/unregisterCapability` operations.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::LspError;

/// A dynamic capability binding identified by `id`, as carried by `client/registerCapability`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Registration {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// Holds the static capability set (an opaque JSON blob the host interprets, e.g.
/// `ServerCapabilities`) plus the live dynamic registrations, and answers "is method X currently
/// supported?" (§4.10).
pub struct CapabilityRegistry {
    static_capabilities: RwLock<Value>,
    dynamic: RwLock<HashMap<String, Registration>>,
    strict_dynamic_registration: bool,
}

impl CapabilityRegistry {
    pub fn new(static_capabilities: Value, strict_dynamic_registration: bool) -> Self {
        CapabilityRegistry {
            static_capabilities: RwLock::new(static_capabilities),
            dynamic: RwLock::new(HashMap::new()),
            strict_dynamic_registration,
        }
    }

    pub async fn static_capabilities(&self) -> Value {
        self.static_capabilities.read().await.clone()
    }

    /// Replaces the static capability set. Intended to be called once, before the peer starts
    /// listening/connecting, matching §4.10's "set once, before listen".
    pub async fn set_static_capabilities(&self, capabilities: Value) {
        *self.static_capabilities.write().await = capabilities;
    }

    /// Registers a dynamic capability. Rejects a duplicate id, and — when
    /// `strictDynamicRegistration` is on — rejects a method the peer's static capabilities never
    /// declared (§3 invariants, §4.10, §8 scenario 6).
    pub async fn upsert(&self, registration: Registration) -> Result<(), LspError> {
        if registration.method.is_empty() {
            return Err(LspError::Protocol("registration method must not be empty".into()));
        }

        if self.strict_dynamic_registration
            && !self.static_declares(&registration.method).await
        {
            return Err(LspError::UndeclaredDynamicRegistration { method: registration.method.clone() });
        }

        let mut guard = self.dynamic.write().await;
        if guard.contains_key(&registration.id) {
            return Err(LspError::DuplicateRegistrationId(registration.id));
        }
        guard.insert(registration.id.clone(), registration);
        Ok(())
    }

    /// Removes a dynamic registration by id. Unknown ids bubble up as
    /// [`LspError::UnknownRegistrationId`] per §4.10, wrapping the full batch semantics used by
    /// `client/unregisterCapability` (a request can ask to remove several ids at once).
    pub async fn remove(&self, id: &str) -> Result<Registration, LspError> {
        self.dynamic
            .write()
            .await
            .remove(id)
            .ok_or_else(|| LspError::UnknownRegistrationId(vec![id.to_string()]))
    }

    /// Batch form used by `client/unregisterCapability`'s `unregisterations` array: removes every
    /// id that exists, and returns the subset that did not, for the caller to report as `-32602`
    /// with `{unknownRegistrationIds}` data.
    pub async fn remove_many(&self, ids: &[String]) -> Vec<String> {
        let mut guard = self.dynamic.write().await;
        let mut unknown = Vec::new();
        for id in ids {
            if guard.remove(id).is_none() {
                unknown.push(id.clone());
            }
        }
        unknown
    }

    /// True if a static capability entry declares `method`, OR a dynamic registration for it
    /// exists.
    pub async fn supports(&self, method: &str) -> bool {
        self.static_declares(method).await || self.dynamic_declares(method).await
    }

    async fn static_declares(&self, method: &str) -> bool {
        let caps = self.static_capabilities.read().await;
        capability_declares_method(&caps, method)
    }

    async fn dynamic_declares(&self, method: &str) -> bool {
        self.dynamic.read().await.values().any(|r| r.method == method)
    }

    pub async fn registrations(&self) -> Vec<Registration> {
        self.dynamic.read().await.values().cloned().collect()
    }
}

/// Interprets an opaque capabilities JSON blob for a given method name. The wire shape of LSP
/// capabilities is host-defined (outside this runtime's scope — §1), so this just checks whether
/// a truthy value is present at `capabilities.<method-as-dotted-path>` as a reasonable default
/// convention; hosts with a richer shape are expected to consult `static_capabilities()` directly
/// rather than relying on this heuristic for anything but the test/demo capability surface.
fn capability_declares_method(capabilities: &Value, method: &str) -> bool {
    let mut cursor = capabilities;
    for segment in method.split(['/', '.']) {
        match cursor.get(segment) {
            Some(next) => cursor = next,
            None => return false,
        }
    }
    !matches!(cursor, Value::Null) && cursor != &Value::Bool(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_remove_round_trip() {
        let registry = CapabilityRegistry::new(Value::Null, false);
        registry
            .upsert(Registration { id: "r1".into(), method: "textDocument/formatting".into(), options: None })
            .await
            .unwrap();
        assert!(registry.supports("textDocument/formatting").await);
        registry.remove("r1").await.unwrap();
        assert!(!registry.supports("textDocument/formatting").await);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = CapabilityRegistry::new(Value::Null, false);
        registry
            .upsert(Registration { id: "r1".into(), method: "a".into(), options: None })
            .await
            .unwrap();
        let err = registry
            .upsert(Registration { id: "r1".into(), method: "b".into(), options: None })
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::DuplicateRegistrationId(_)));
    }

    #[tokio::test]
    async fn unknown_remove_reports_id() {
        let registry = CapabilityRegistry::new(Value::Null, false);
        let err = registry.remove("missing").await.unwrap_err();
        match err {
            LspError::UnknownRegistrationId(ids) => assert_eq!(ids, vec!["missing".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn strict_mode_rejects_undeclared_method() {
        let registry = CapabilityRegistry::new(serde_json::json!({}), true);
        let err = registry
            .upsert(Registration { id: "r1".into(), method: "textDocument/formatting".into(), options: None })
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::UndeclaredDynamicRegistration { .. }));
    }

    #[tokio::test]
    async fn strict_mode_allows_declared_method() {
        let caps = serde_json::json!({"textDocument": {"formatting": {"dynamicRegistration": true}}});
        let registry = CapabilityRegistry::new(caps, true);
        registry
            .upsert(Registration { id: "r1".into(), method: "textDocument/formatting".into(), options: None })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn supports_checks_static_first() {
        let caps = serde_json::json!({"hoverProvider": true});
        let registry = CapabilityRegistry::new(caps, false);
        assert!(registry.supports("hoverProvider").await);
    }

    #[tokio::test]
    async fn remove_many_reports_unknown_subset() {
        let registry = CapabilityRegistry::new(Value::Null, false);
        registry.upsert(Registration { id: "known".into(), method: "a".into(), options: None }).await.unwrap();
        let unknown = registry.remove_many(&["known".to_string(), "missing".to_string()]).await;
        assert_eq!(unknown, vec!["missing".to_string()]);
    }
}
