//! Conversation-identity resolution.
//!
//! Upstream systems are inconsistent about the Brazilian mobile-prefix digit
//! and the country code, so the same customer can show up under several phone
//! spellings. Everything is normalized to one canonical key; replies arriving
//! under a historical variant are migrated to the canonical entry so future
//! lookups are exact matches.

use tracing::{debug, info};

use crate::{
    domain::{Jid, JID_SUFFIX},
    store::{Conversation, ConversationStore},
};

const COUNTRY_CODE: &str = "55";
const MOBILE_PREFIX: char = '9';

/// Canonicalize a raw phone string into a stable digits string:
/// country code + area code + 9-digit subscriber.
///
/// Deterministic and pure. Inputs that do not fit the Brazilian shapes pass
/// through with only the country code ensured; normalization is idempotent on
/// its own output.
pub fn normalize_phone(raw: &str) -> String {
    let mut cleaned: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if let Some(rest) = cleaned.strip_prefix(COUNTRY_CODE) {
        cleaned = rest.to_string();
    }

    // Area code + 8-digit subscriber: insert the mobile prefix.
    if cleaned.len() == 10 {
        cleaned.insert(2, MOBILE_PREFIX);
    }

    // 11 digits whose third digit is not the prefix: insert it anyway. The
    // 12-digit result is treated as already prefixed from here on.
    if cleaned.len() == 11 && cleaned.chars().nth(2) != Some(MOBILE_PREFIX) {
        cleaned.insert(2, MOBILE_PREFIX);
    }

    if cleaned.len() == 11 || !cleaned.starts_with(COUNTRY_CODE) {
        cleaned = format!("{COUNTRY_CODE}{cleaned}");
    }

    cleaned
}

/// Full conversation key for a raw phone string.
pub fn phone_to_jid(raw: &str) -> Jid {
    Jid(format!("{}{JID_SUFFIX}", normalize_phone(raw)))
}

/// Plausible historical spellings of a canonical key, in check order.
/// Excludes the canonical key itself.
pub fn variant_keys(canonical: &Jid) -> Vec<Jid> {
    let digits = canonical.phone();
    let subscriber = digits.strip_prefix(COUNTRY_CODE).unwrap_or(digits);

    let mut out = Vec::new();
    let mut push = |phone: String| {
        let jid = Jid(format!("{phone}{JID_SUFFIX}"));
        if &jid != canonical && !out.contains(&jid) {
            out.push(jid);
        }
    };

    // Without country code.
    push(subscriber.to_string());

    // Without the mobile prefix (with and without country code).
    if subscriber.len() == 11 && subscriber.chars().nth(2) == Some(MOBILE_PREFIX) {
        let (area, rest) = subscriber.split_at(2);
        let without_prefix = format!("{area}{}", &rest[1..]);
        push(without_prefix.clone());
        push(format!("{COUNTRY_CODE}{without_prefix}"));
    }

    out
}

/// Resolve a raw phone to its conversation, migrating variant-keyed entries
/// to the canonical key on the way.
///
/// Returns `None` when neither the canonical key nor any variant matches.
pub async fn find_by_phone(store: &ConversationStore, raw: &str) -> Option<Conversation> {
    let canonical = phone_to_jid(raw);

    if let Some(conv) = store.get(&canonical).await {
        debug!(identity = %canonical, "conversation found under canonical key");
        return Some(conv);
    }

    for variant in variant_keys(&canonical) {
        if store.contains(&variant).await {
            let migrated = store.migrate(&variant, &canonical).await;
            info!(
                from = %variant,
                to = %canonical,
                "conversation migrated from variant key"
            );
            return migrated;
        }
    }

    debug!(identity = %canonical, "no conversation for phone");
    None
}
