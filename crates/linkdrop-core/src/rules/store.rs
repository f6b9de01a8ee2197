//! Rule Store - the registry of installed header rules
//!
//! Maps a rule fingerprint to the session rule id it was installed under. The
//! store is the only writer of session rules, so its contents are exactly the
//! set of rules this process has installed with the host.

use super::fingerprint::{fingerprint, Fingerprint};
use crate::error::LinkdropError;
use crate::host::RuleEngine;
use linkdrop_types::{CoreEvent, RuleAction, RuleCondition, RuleUpdate, SessionRule};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Priority every session rule is installed with
const RULE_PRIORITY: u32 = 1;

/// A header rule as tracked by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRule {
    pub fingerprint: Fingerprint,
    pub id: u32,
    /// Survives ordinary (non-forced) removal
    pub permanent: bool,
}

/// Registry of installed header rules, deduplicated by fingerprint
pub struct RuleStore {
    engine: Arc<dyn RuleEngine>,
    rules: Mutex<HashMap<Fingerprint, HeaderRule>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl RuleStore {
    pub fn new(engine: Arc<dyn RuleEngine>, event_tx: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            engine,
            rules: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Install a rule, or return the already installed rule with the same fingerprint
    pub async fn install(
        &self,
        action: RuleAction,
        condition: RuleCondition,
        permanent: bool,
    ) -> Result<HeaderRule, LinkdropError> {
        let fingerprint = fingerprint(&action, &condition)?;

        let rule = {
            let mut rules = self.rules.lock();
            if let Some(existing) = rules.get(&fingerprint) {
                debug!(id = existing.id, fingerprint, "Header rule already installed");
                return Ok(*existing);
            }

            let rule = HeaderRule {
                fingerprint,
                id: next_free_id(&rules),
                permanent,
            };
            rules.insert(fingerprint, rule);
            rule
        };

        // Replace-by-id so a rule left behind under a recycled id never survives
        let update = RuleUpdate::replace(SessionRule {
            id: rule.id,
            priority: RULE_PRIORITY,
            action,
            condition,
        });

        if let Err(e) = self.engine.update_session_rules(update).await {
            let mut rules = self.rules.lock();
            if rules.get(&fingerprint) == Some(&rule) {
                rules.remove(&fingerprint);
            }
            return Err(e.into());
        }

        debug!(id = rule.id, fingerprint, permanent, "Installed header rule");
        let _ = self.event_tx.send(CoreEvent::RuleInstalled {
            id: rule.id,
            fingerprint,
            permanent,
        });

        Ok(rule)
    }

    /// Remove a rule by fingerprint
    ///
    /// Unknown fingerprints are ignored. Permanent rules are only removed when
    /// `force_permanent` is set.
    pub async fn remove(
        &self,
        fingerprint: Fingerprint,
        force_permanent: bool,
    ) -> Result<(), LinkdropError> {
        let rule = {
            let mut rules = self.rules.lock();
            let Some(rule) = rules.get(&fingerprint).copied() else {
                return Ok(());
            };
            if rule.permanent && !force_permanent {
                debug!(id = rule.id, fingerprint, "Keeping permanent header rule");
                return Ok(());
            }
            rules.remove(&fingerprint);
            rule
        };

        // The entry is gone either way; a failed removal is overwritten when the id is reused
        self.engine
            .update_session_rules(RuleUpdate::remove(vec![rule.id]))
            .await?;

        debug!(id = rule.id, fingerprint, "Removed header rule");
        let _ = self.event_tx.send(CoreEvent::RuleRemoved {
            id: rule.id,
            fingerprint,
        });

        Ok(())
    }

    /// Remove every rule, permanent ones included when `force_permanent` is set
    ///
    /// Every entry is attempted; the first failure is returned.
    pub async fn remove_all(&self, force_permanent: bool) -> Result<(), LinkdropError> {
        let fingerprints: Vec<Fingerprint> = self.rules.lock().keys().copied().collect();

        let mut first_error = None;
        for fingerprint in fingerprints {
            if let Err(e) = self.remove(fingerprint, force_permanent).await {
                warn!(fingerprint, "Failed to remove header rule: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Clear everything a previous incarnation may have left installed
    ///
    /// Removes all known rules (permanent included), then any session rule the
    /// engine still holds under an id this store does not own.
    pub async fn flush_on_start(&self) -> Result<(), LinkdropError> {
        let result = self.remove_all(true).await;

        let owned: HashSet<u32> = self.rules.lock().values().map(|r| r.id).collect();
        let orphans: Vec<u32> = self
            .engine
            .session_rule_ids()
            .await?
            .into_iter()
            .filter(|id| !owned.contains(id))
            .collect();

        if !orphans.is_empty() {
            info!("Removing {} leftover session rules", orphans.len());
            self.engine
                .update_session_rules(RuleUpdate::remove(orphans))
                .await?;
        }

        result
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<HeaderRule> {
        self.rules.lock().get(&fingerprint).copied()
    }

    /// Snapshot of the installed rules, ordered by id
    pub fn rules(&self) -> Vec<HeaderRule> {
        let mut rules: Vec<HeaderRule> = self.rules.lock().values().copied().collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.lock().is_empty()
    }
}

/// Smallest positive id not held by a live rule
fn next_free_id(rules: &HashMap<Fingerprint, HeaderRule>) -> u32 {
    let used: HashSet<u32> = rules.values().map(|r| r.id).collect();
    let mut id = 1;
    while used.contains(&id) {
        id += 1;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use crate::test_support::RecordingRuleEngine;
    use linkdrop_types::ModifyHeaderInfo;
    use tokio_test::{assert_err, assert_ok};

    fn store(engine: Arc<RecordingRuleEngine>) -> RuleStore {
        let (event_tx, _) = broadcast::channel(64);
        RuleStore::new(engine, event_tx)
    }

    fn referer(value: &str) -> RuleAction {
        RuleAction::modify_request(vec![ModifyHeaderInfo::set("referer", value)])
    }

    #[tokio::test]
    async fn test_install_dedups_by_fingerprint() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let store = store(engine.clone());
        let condition = RuleCondition::url_filter("||cdn.example");

        let first = store
            .install(referer("https://a.example"), condition.clone(), false)
            .await
            .unwrap();
        let second = store
            .install(referer("https://a.example"), condition, false)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.updates().len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_install_replaces_by_id() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let store = store(engine.clone());

        let rule = store
            .install(referer("https://a.example"), RuleCondition::default(), false)
            .await
            .unwrap();

        let updates = engine.updates();
        assert_eq!(updates[0].remove_rule_ids, vec![rule.id]);
        assert_eq!(updates[0].add_rules.len(), 1);
        assert_eq!(updates[0].add_rules[0].id, rule.id);
        assert_eq!(updates[0].add_rules[0].priority, 1);
    }

    #[tokio::test]
    async fn test_ids_stay_unique_when_reused() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let store = store(engine.clone());
        let condition = RuleCondition::default();

        let a = store.install(referer("a"), condition.clone(), false).await.unwrap();
        let b = store.install(referer("b"), condition.clone(), false).await.unwrap();
        assert_ne!(a.id, b.id);

        store.remove(a.fingerprint, false).await.unwrap();
        let c = store.install(referer("c"), condition.clone(), false).await.unwrap();
        let d = store.install(referer("d"), condition, false).await.unwrap();

        let ids: HashSet<u32> = store.rules().iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(c.id, a.id);
        assert!(ids.contains(&b.id) && ids.contains(&d.id));
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let store = store(engine.clone());

        assert_ok!(store.remove(12345, true).await);
        assert!(engine.updates().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_rule_survives_plain_remove() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let store = store(engine.clone());

        let rule = store.install(referer("a"), RuleCondition::default(), true).await.unwrap();

        store.remove(rule.fingerprint, false).await.unwrap();
        assert_eq!(store.get(rule.fingerprint), Some(rule));
        assert_eq!(engine.updates().len(), 1);

        store.remove(rule.fingerprint, true).await.unwrap();
        assert!(store.is_empty());
        assert_eq!(engine.updates()[1], RuleUpdate::remove(vec![rule.id]));
    }

    #[tokio::test]
    async fn test_forced_flush_clears_everything() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let store = store(engine.clone());

        store.install(referer("a"), RuleCondition::default(), false).await.unwrap();
        store.install(referer("b"), RuleCondition::default(), true).await.unwrap();
        let installs = engine.updates().len();

        store.remove_all(true).await.unwrap();

        assert!(store.is_empty());
        let removals: Vec<_> = engine.updates().into_iter().skip(installs).collect();
        assert_eq!(removals.len(), 2);
        assert!(removals.iter().all(|u| u.add_rules.is_empty()));
    }

    #[tokio::test]
    async fn test_unforced_remove_all_keeps_permanent() {
        let engine = Arc::new(RecordingRuleEngine::default());
        let store = store(engine.clone());

        store.install(referer("a"), RuleCondition::default(), false).await.unwrap();
        let kept = store.install(referer("b"), RuleCondition::default(), true).await.unwrap();

        store.remove_all(false).await.unwrap();

        assert_eq!(store.rules(), vec![kept]);
    }

    #[tokio::test]
    async fn test_flush_on_start_removes_orphans() {
        let engine = Arc::new(RecordingRuleEngine::with_leftovers(vec![4, 9]));
        let store = store(engine.clone());

        store.flush_on_start().await.unwrap();

        assert_eq!(engine.updates(), vec![RuleUpdate::remove(vec![4, 9])]);
        assert!(engine.installed_ids().is_empty());
    }

    #[tokio::test]
    async fn test_failed_install_is_not_stored() {
        let engine = Arc::new(RecordingRuleEngine::default());
        engine.fail_next(HostError::Rejected("quota".into()));
        let store = store(engine.clone());

        assert_err!(store.install(referer("a"), RuleCondition::default(), false).await);
        assert!(store.is_empty());

        // The fingerprint can be installed again afterwards
        assert_ok!(store.install(referer("a"), RuleCondition::default(), false).await);
        assert_eq!(store.len(), 1);
    }
}
