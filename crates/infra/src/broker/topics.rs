//! Event type → topic routing.

use crate::config::BrokerConfig;

/// Event type prefixes routed to the accounting topic.
const ACCOUNTING_PREFIXES: &[&str] = &["Account", "Journal", "Ledger", "Invoice", "Payment", "Tax"];
/// Event type prefixes routed to the inventory topic.
const INVENTORY_PREFIXES: &[&str] = &["Inventory", "Stock", "Product", "Warehouse", "Item"];
/// Event type prefixes routed to the audit topic.
const AUDIT_PREFIXES: &[&str] = &["Audit", "User", "Role", "Permission"];

/// Static, ordered prefix rules; first match wins, otherwise the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    rules: Vec<(String, String)>,
    default_topic: String,
}

impl TopicRouter {
    pub fn new(default_topic: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_topic: default_topic.into(),
        }
    }

    /// Standard accounting / inventory / audit routing; unmatched types go to
    /// the accounting topic.
    pub fn from_config(config: &BrokerConfig) -> Self {
        let mut router = Self::new(config.accounting_topic.clone());
        for (prefixes, topic) in [
            (ACCOUNTING_PREFIXES, &config.accounting_topic),
            (INVENTORY_PREFIXES, &config.inventory_topic),
            (AUDIT_PREFIXES, &config.audit_topic),
        ] {
            for prefix in prefixes {
                router = router.with_rule(*prefix, topic.clone());
            }
        }
        router
    }

    pub fn with_rule(mut self, prefix: impl Into<String>, topic: impl Into<String>) -> Self {
        self.rules.push((prefix.into(), topic.into()));
        self
    }

    pub fn route(&self, event_type: &str) -> &str {
        self.rules
            .iter()
            .find(|(prefix, _)| event_type.starts_with(prefix.as_str()))
            .map(|(_, topic)| topic.as_str())
            .unwrap_or(&self.default_topic)
    }

    /// Every topic this router can produce, default first, without duplicates.
    pub fn topics(&self) -> Vec<String> {
        let mut topics = vec![self.default_topic.clone()];
        for (_, topic) in &self.rules {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_first_matching_prefix() {
        let router = TopicRouter::default();
        assert_eq!(router.route("LedgerEntryPosted"), "accounting.events.v1");
        assert_eq!(router.route("StockAdjusted"), "inventory.events.v1");
        assert_eq!(router.route("UserLoggedIn"), "audit.events.v1");
        assert_eq!(router.route("SomethingElse"), "accounting.events.v1");
    }

    #[test]
    fn earlier_rules_win() {
        let router = TopicRouter::new("default")
            .with_rule("Stock", "first")
            .with_rule("StockAdjusted", "second");
        assert_eq!(router.route("StockAdjusted"), "first");
        assert_eq!(router.route("Other"), "default");
    }

    #[test]
    fn lists_each_topic_once() {
        assert_eq!(
            TopicRouter::default().topics(),
            vec!["accounting.events.v1", "inventory.events.v1", "audit.events.v1"]
        );
    }
}
