//! Sender gating, evaluated after fetch and before anything is persisted.
//!
//! - Account block rules (`user@host`, `@host` or bare `host`) → message skipped
//! - No-reply senders → persisted, but never saved as a contact

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::Participant;

static NO_REPLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(no-?reply|do-?not-?reply)").expect("valid regex"));

/// Whether an address belongs to an automated no-reply sender.
pub fn is_no_reply(address: &str) -> bool {
    NO_REPLY.is_match(address)
}

/// Whether `address` matches one block pattern.
///
/// `@example.com` and `example.com` match the whole domain (subdomains
/// included for the bare form); `user@example.com` matches exactly.
pub fn matches_sender_rule(pattern: &str, address: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    let address = address.trim().to_lowercase();
    if pattern.is_empty() {
        return false;
    }

    if let Some(domain) = pattern.strip_prefix('@') {
        address
            .rsplit_once('@')
            .is_some_and(|(_, host)| host == domain)
    } else if pattern.contains('@') {
        address == pattern
    } else {
        address.rsplit_once('@').is_some_and(|(_, host)| {
            host == pattern || host.ends_with(&format!(".{pattern}"))
        })
    }
}

/// Block rules loaded for one account.
#[derive(Debug, Clone, Default)]
pub struct SenderRules {
    blocked: Vec<String>,
}

impl SenderRules {
    pub fn new(blocked: Vec<String>) -> Self {
        Self { blocked }
    }

    /// The first block pattern the sender matches, if any.
    pub fn blocking_rule(&self, sender: &Participant) -> Option<&str> {
        let hit = self
            .blocked
            .iter()
            .find(|p| matches_sender_rule(p, &sender.address))
            .map(String::as_str);
        if let Some(rule) = hit {
            debug!(sender = %sender.address, rule = %rule, "Sender matched block rule");
        }
        hit
    }

    /// Whether the sender should be upserted into the owner's contacts.
    pub fn should_save_contact(sender: &Participant) -> bool {
        !sender.address.is_empty() && !is_no_reply(&sender.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── No-reply tests ──────────────────────────────────────────────

    #[test]
    fn detects_no_reply_variants() {
        for addr in [
            "no-reply@github.com",
            "NoReply@bank.com",
            "donotreply@shop.com",
            "do-not-reply@airline.com",
            "alerts-noreply@service.io",
        ] {
            assert!(is_no_reply(addr), "{addr} should be no-reply");
        }
    }

    #[test]
    fn regular_sender_is_not_no_reply() {
        assert!(!is_no_reply("alice@example.com"));
        assert!(!is_no_reply("reply-to-me@example.com"));
    }

    #[test]
    fn no_reply_sender_not_saved_as_contact() {
        assert!(!SenderRules::should_save_contact(&Participant::new(
            None,
            "noreply@x.com"
        )));
        assert!(SenderRules::should_save_contact(&Participant::new(
            Some("Alice"),
            "alice@x.com"
        )));
        assert!(!SenderRules::should_save_contact(&Participant::new(None, "")));
    }

    // ── Block rule tests ────────────────────────────────────────────

    #[test]
    fn exact_address_rule() {
        assert!(matches_sender_rule("spam@bad.com", "SPAM@bad.com"));
        assert!(!matches_sender_rule("spam@bad.com", "other@bad.com"));
    }

    #[test]
    fn at_domain_rule_matches_exact_host_only() {
        assert!(matches_sender_rule("@bad.com", "anyone@bad.com"));
        assert!(!matches_sender_rule("@bad.com", "anyone@mail.bad.com"));
        assert!(!matches_sender_rule("@bad.com", "anyone@notbad.com"));
    }

    #[test]
    fn bare_domain_rule_matches_subdomains() {
        assert!(matches_sender_rule("bad.com", "x@bad.com"));
        assert!(matches_sender_rule("bad.com", "x@mail.bad.com"));
        assert!(!matches_sender_rule("bad.com", "x@notbad.com"));
    }

    #[test]
    fn empty_pattern_never_matches() {
        assert!(!matches_sender_rule("  ", "x@bad.com"));
    }

    #[test]
    fn blocking_rule_reports_matching_pattern() {
        let rules = SenderRules::new(vec!["@spam.io".into(), "boss@corp.com".into()]);
        let sender = Participant::new(None, "boss@corp.com");
        assert_eq!(rules.blocking_rule(&sender), Some("boss@corp.com"));
        assert!(rules
            .blocking_rule(&Participant::new(None, "friend@corp.com"))
            .is_none());
        assert!(SenderRules::default()
            .blocking_rule(&Participant::new(None, "a@spam.io"))
            .is_none());
    }
}
