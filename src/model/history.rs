use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One outcome recorded against a proxy's bounded history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub time: DateTime<Utc>,
    pub kind: HistoryKind,
    pub reason: Option<String>,
    pub request_ident: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HistoryKind {
    Success,
    Fail,
    Rest,
}

/// Prepend `entry`, truncating to `max` most-recent entries.
pub fn push_bounded(ring: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, max: usize) {
    ring.push_front(entry);
    while ring.len() > max {
        ring.pop_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_bounded_truncates_from_the_back() {
        let mut ring = VecDeque::new();
        for i in 0..5 {
            push_bounded(
                &mut ring,
                HistoryEntry {
                    time: Utc::now(),
                    kind: HistoryKind::Success,
                    reason: Some(i.to_string()),
                    request_ident: None,
                },
                3,
            );
        }
        assert_eq!(ring.len(), 3);
        // most recent (i=4) is at the front
        assert_eq!(ring[0].reason.as_deref(), Some("4"));
    }
}
