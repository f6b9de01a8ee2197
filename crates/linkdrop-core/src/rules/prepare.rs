//! Header Preparer
//!
//! Turns a caller-supplied header rule into an installed rule plus a handle the
//! caller uses to release it once its operation is done.

use super::fingerprint::Fingerprint;
use super::store::{HeaderRule, RuleStore};
use crate::error::LinkdropError;
use linkdrop_types::{HeaderRuleSpec, RuleAction, RuleCondition};
use std::sync::Arc;

/// Handle to a rule installed for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleHandle {
    pub fingerprint: Fingerprint,
    pub id: u32,
}

impl From<HeaderRule> for RuleHandle {
    fn from(rule: HeaderRule) -> Self {
        Self {
            fingerprint: rule.fingerprint,
            id: rule.id,
        }
    }
}

/// Installs caller-supplied header rules through the [`RuleStore`]
#[derive(Clone)]
pub struct HeaderPreparer {
    store: Arc<RuleStore>,
}

impl HeaderPreparer {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub async fn prepare(
        &self,
        spec: &HeaderRuleSpec,
        permanent: bool,
    ) -> Result<RuleHandle, LinkdropError> {
        self.prepare_action(spec.action.clone(), spec.condition.clone(), permanent)
            .await
    }

    /// Decode cookie values, then install the rule
    pub async fn prepare_action(
        &self,
        mut action: RuleAction,
        condition: RuleCondition,
        permanent: bool,
    ) -> Result<RuleHandle, LinkdropError> {
        decode_cookies(&mut action);
        let rule = self.store.install(action, condition, permanent).await?;
        Ok(rule.into())
    }

    pub async fn release(
        &self,
        handle: &RuleHandle,
        force_permanent: bool,
    ) -> Result<(), LinkdropError> {
        self.store.remove(handle.fingerprint, force_permanent).await
    }
}

/// Percent-decode the values of `cookie` request headers in place
///
/// Values that do not decode to UTF-8 are left as they are.
pub fn decode_cookies(action: &mut RuleAction) {
    let Some(headers) = action.request_headers.as_mut() else {
        return;
    };

    for info in headers
        .iter_mut()
        .filter(|info| info.header.eq_ignore_ascii_case("cookie"))
    {
        if let Some(value) = info.value.as_mut() {
            let decoded = urlencoding::decode(value).map(|d| d.into_owned());
            if let Ok(decoded) = decoded {
                *value = decoded;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingRuleEngine;
    use linkdrop_types::ModifyHeaderInfo;
    use tokio::sync::broadcast;

    fn preparer(engine: Arc<RecordingRuleEngine>) -> HeaderPreparer {
        let (event_tx, _) = broadcast::channel(64);
        HeaderPreparer::new(Arc::new(RuleStore::new(engine, event_tx)))
    }

    #[test]
    fn test_decode_cookies_only_touches_cookie_headers() {
        let mut action = RuleAction::modify_request(vec![
            ModifyHeaderInfo::set("Cookie", "sid%3Dabc%3B%20lang%3Den"),
            ModifyHeaderInfo::set("referer", "https%3A%2F%2Fa.example"),
            ModifyHeaderInfo::remove("cookie"),
        ]);

        decode_cookies(&mut action);

        let headers = action.request_headers.unwrap();
        assert_eq!(headers[0].value.as_deref(), Some("sid=abc; lang=en"));
        assert_eq!(headers[1].value.as_deref(), Some("https%3A%2F%2Fa.example"));
        assert_eq!(headers[2].value, None);
    }

    #[test]
    fn test_decode_cookies_keeps_undecodable_value() {
        let mut action = RuleAction::modify_request(vec![ModifyHeaderInfo::set("cookie", "a=%FF")]);
        decode_cookies(&mut action);
        assert_eq!(action.request_headers.unwrap()[0].value.as_deref(), Some("a=%FF"));
    }

    #[tokio::test]
    async fn test_encoded_and_decoded_cookies_share_a_rule() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let preparer = preparer(engine.clone());
        let condition = RuleCondition::url_filter("||video.example");

        let encoded =
            RuleAction::modify_request(vec![ModifyHeaderInfo::set("cookie", "token%3Dx%2By")]);
        let decoded =
            RuleAction::modify_request(vec![ModifyHeaderInfo::set("cookie", "token=x+y")]);

        let first = preparer.prepare_action(encoded, condition.clone(), false).await.unwrap();
        let second = preparer.prepare_action(decoded, condition, false).await.unwrap();

        assert_eq!(first, second);
        let updates = engine.updates();
        assert_eq!(updates.len(), 1);
        let installed = &updates[0].add_rules[0];
        assert_eq!(
            installed.action.request_headers.as_ref().unwrap()[0].value.as_deref(),
            Some("token=x+y")
        );
    }

    #[tokio::test]
    async fn test_release_removes_rule() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let preparer = preparer(engine.clone());
        let spec = HeaderRuleSpec::new(
            RuleAction::modify_request(vec![ModifyHeaderInfo::set("referer", "https://a.example")]),
            RuleCondition::default(),
        );

        let handle = preparer.prepare(&spec, false).await.unwrap();
        preparer.release(&handle, false).await.unwrap();

        assert!(preparer.store().is_empty());
        assert!(engine.installed_ids().is_empty());
    }
}
