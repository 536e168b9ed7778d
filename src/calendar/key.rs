//! Correlation key embedded in calendar entry notes
//!
//! The calendar service has no custom fields, so each entry created for a
//! marked event carries the literal `ItemID:<id>` in its free-text body.

use regex_lite::Regex;

const KEY_PREFIX: &str = "ItemID:";

lazy_static::lazy_static! {
    static ref ITEM_KEY_RE: Option<Regex> = Regex::new(r"ItemID:(\d+)").ok();
}

/// The key text for an item
pub fn item_key(item_id: i64) -> String {
    format!("{}{}", KEY_PREFIX, item_id)
}

/// Append the item key to `notes` on its own line
pub fn embed_item_key(notes: &str, item_id: i64) -> String {
    if notes.is_empty() {
        item_key(item_id)
    } else {
        format!("{}\n{}", notes.trim_end_matches('\n'), item_key(item_id))
    }
}

/// First item key found in `notes`
pub fn extract_item_key(notes: &str) -> Option<i64> {
    let re = ITEM_KEY_RE.as_ref()?;
    re.captures_iter(notes)
        .find_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()))
}

/// Whether `notes` carries the key for exactly `item_id`
///
/// `ItemID:42` does not match item 4 or item 420.
pub fn carries_item_key(notes: &str, item_id: i64) -> bool {
    match ITEM_KEY_RE.as_ref() {
        Some(re) => re
            .captures_iter(notes)
            .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()))
            .any(|id| id == item_id),
        None => false,
    }
}
