//! Boundary between the singleton server and the embedding application.

use std::collections::BTreeMap;

use solo_core::{ActivationRequest, PROP_CONFIG_HASH, PROP_USER};

/// Policy the host application plugs into its singleton server.
///
/// Calls arrive on the server's accept task, one connection at a time.
/// `activate` runs on the blocking pool and the caller is not acknowledged
/// until it returns.
pub trait ActivationGate: Send + Sync + 'static {
    /// Whether this instance should absorb `request`.
    fn can_accept(&self, request: &ActivationRequest) -> bool;

    /// Hand accepted arguments to the application.
    fn activate(&self, request: ActivationRequest);

    /// Called after a rejected caller has been told `si.exit` and this
    /// host's marker is gone. The caller is now polling for that marker to
    /// disappear and will take over as host, so this instance must go away.
    ///
    /// Default: exit the whole process with status 0.
    fn cede(&self) {
        tracing::warn!("activation rejected, exiting so the new launch can take over");
        std::process::exit(0);
    }
}

/// Gate that accepts a request when selected properties equal this
/// instance's own values, and forwards accepted arguments to a callback.
///
/// A required property with value `None` matches only a request that does
/// not carry that property.
pub struct PropertyGate<F> {
    expected: BTreeMap<String, Option<String>>,
    on_activate: F,
}

impl<F> PropertyGate<F>
where
    F: Fn(ActivationRequest) + Send + Sync + 'static,
{
    pub fn new(on_activate: F) -> Self {
        Self {
            expected: BTreeMap::new(),
            on_activate,
        }
    }

    /// Gate on [`PROP_USER`] and [`PROP_CONFIG_HASH`].
    pub fn for_instance(user: Option<&str>, config_hash: Option<&str>, on_activate: F) -> Self {
        Self::new(on_activate)
            .require(PROP_USER, user)
            .require(PROP_CONFIG_HASH, config_hash)
    }

    pub fn require(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.expected.insert(key.into(), value.map(str::to_string));
        self
    }
}

impl<F> ActivationGate for PropertyGate<F>
where
    F: Fn(ActivationRequest) + Send + Sync + 'static,
{
    fn can_accept(&self, request: &ActivationRequest) -> bool {
        for (key, expected) in &self.expected {
            let actual = request.property(key);
            if actual != expected.as_deref() {
                tracing::info!(
                    property = %key,
                    expected = ?expected,
                    actual = ?actual,
                    "activation does not match this instance"
                );
                return false;
            }
        }
        true
    }

    fn activate(&self, request: ActivationRequest) {
        (self.on_activate)(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn request(user: Option<&str>, hash: Option<&str>) -> ActivationRequest {
        let mut request = ActivationRequest::new(vec!["dicom:get -l foo.dcm".into()]);
        if let Some(user) = user {
            request = request.with_property(PROP_USER, user);
        }
        if let Some(hash) = hash {
            request = request.with_property(PROP_CONFIG_HASH, hash);
        }
        request
    }

    #[test]
    fn matching_properties_are_accepted_and_forwarded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let gate = PropertyGate::for_instance(Some("alice"), Some("h1"), move |r| {
            sink.lock().expect("lock").push(r.arguments)
        });

        let req = request(Some("alice"), Some("h1"));
        assert!(gate.can_accept(&req));
        gate.activate(req);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![vec!["dicom:get -l foo.dcm".to_string()]]
        );
    }

    #[test]
    fn differing_or_missing_properties_are_rejected() {
        let gate = PropertyGate::for_instance(Some("alice"), Some("h1"), |_| {});
        assert!(!gate.can_accept(&request(Some("bob"), Some("h1"))));
        assert!(!gate.can_accept(&request(Some("alice"), Some("h2"))));
        assert!(!gate.can_accept(&request(None, Some("h1"))));
    }

    #[test]
    fn absent_expectation_requires_absent_property() {
        let gate = PropertyGate::for_instance(None, None, |_| {});
        assert!(gate.can_accept(&request(None, None)));
        assert!(!gate.can_accept(&request(Some("alice"), None)));
    }

    #[test]
    fn gate_without_requirements_accepts_everything() {
        let gate = PropertyGate::new(|_| {});
        assert!(gate.can_accept(&request(Some("anyone"), Some("anything"))));
    }
}
