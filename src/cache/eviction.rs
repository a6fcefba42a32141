//! Eviction Policy
//!
//! Pure selection functions: given usage views and budgets they decide what
//! goes, in which order. They never touch the store or persistence, so the
//! ordering rules can be tested against synthetic inputs.

use super::budgets::Budgets;
use crate::core::{MessageId, SessionId};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

/// Why an entry left the cache (or lost its messages)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    SessionCount,
    FullSessionCount,
    MessageCount,
    ByteBudget,
    Explicit,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EvictionReason::Expired => "ttl expired",
            EvictionReason::SessionCount => "session count",
            EvictionReason::FullSessionCount => "fully cached count",
            EvictionReason::MessageCount => "message count",
            EvictionReason::ByteBudget => "byte budget",
            EvictionReason::Explicit => "explicit",
        };
        f.write_str(label)
    }
}

/// What the policy needs to know about one resident session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUsage {
    pub session_id: SessionId,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_fully_cached: bool,
    pub message_count: usize,
    /// Metadata plus all materialized messages
    pub size_bytes: u64,
    /// Portion of `size_bytes` freed by demotion
    pub message_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUsage {
    pub message_id: MessageId,
    pub sequence_number: u64,
    pub is_streaming: bool,
    pub size_bytes: u64,
}

/// Actions needed to bring total bytes back under budget
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BytePlan {
    pub evict: Vec<SessionId>,
    pub demote: Vec<SessionId>,
    /// Bytes still over budget after the plan runs
    pub remaining_overage: u64,
}

impl BytePlan {
    pub fn is_empty(&self) -> bool {
        self.evict.is_empty() && self.demote.is_empty()
    }
}

fn lru_order(a: &SessionUsage, b: &SessionUsage) -> Ordering {
    a.last_accessed_at
        .cmp(&b.last_accessed_at)
        .then_with(|| a.session_id.cmp(&b.session_id))
}

fn lru_sorted<'a>(
    sessions: &'a [SessionUsage],
    filter: impl Fn(&SessionUsage) -> bool,
) -> Vec<&'a SessionUsage> {
    let mut selected: Vec<&SessionUsage> = sessions.iter().filter(|s| filter(s)).collect();
    selected.sort_by(|a, b| lru_order(a, b));
    selected
}

/// Sessions whose TTL has passed at `now`
pub fn select_expired(sessions: &[SessionUsage], now: DateTime<Utc>) -> Vec<SessionId> {
    let mut expired: Vec<&SessionUsage> = sessions.iter().filter(|s| s.expires_at <= now).collect();
    expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.session_id.cmp(&b.session_id)));
    expired.into_iter().map(|s| s.session_id.clone()).collect()
}

/// Sessions to remove outright when over the resident session limit.
///
/// Stubs go first, least recently accessed first; fully cached sessions are
/// only chosen once no stubs remain.
pub fn select_sessions_to_evict(sessions: &[SessionUsage], budgets: &Budgets) -> Vec<SessionId> {
    let excess = sessions.len().saturating_sub(budgets.max_sessions);
    if excess == 0 {
        return Vec::new();
    }

    lru_sorted(sessions, |s| !s.is_fully_cached)
        .into_iter()
        .chain(lru_sorted(sessions, |s| s.is_fully_cached))
        .take(excess)
        .map(|s| s.session_id.clone())
        .collect()
}

/// Fully cached sessions to demote to stubs when over the fully cached limit
pub fn select_sessions_to_demote(sessions: &[SessionUsage], budgets: &Budgets) -> Vec<SessionId> {
    let full = lru_sorted(sessions, |s| s.is_fully_cached);
    let excess = full.len().saturating_sub(budgets.max_full_sessions);

    full.into_iter()
        .take(excess)
        .map(|s| s.session_id.clone())
        .collect()
}

/// Messages that may be trimmed, oldest sequence number first.
///
/// Only settled messages qualify, and never the newest one.
fn trimmable(messages: &[MessageUsage]) -> Vec<&MessageUsage> {
    let newest = messages.iter().map(|m| m.sequence_number).max();
    let mut settled: Vec<&MessageUsage> = messages
        .iter()
        .filter(|m| !m.is_streaming && Some(m.sequence_number) != newest)
        .collect();
    settled.sort_by_key(|m| m.sequence_number);
    settled
}

/// Messages to drop from one session so it fits `max_messages_per_session`.
///
/// Streaming messages and the newest message are never selected, so the
/// result may be shorter than the overage.
pub fn select_messages_to_trim(messages: &[MessageUsage], budgets: &Budgets) -> Vec<MessageId> {
    let excess = messages.len().saturating_sub(budgets.max_messages_per_session);
    if excess == 0 {
        return Vec::new();
    }

    trimmable(messages)
        .into_iter()
        .take(excess)
        .map(|m| m.message_id.clone())
        .collect()
}

/// Messages to drop from one session to free at least `overage` bytes,
/// in the same order as `select_messages_to_trim`. Falls short when the
/// protected messages alone are too large.
pub fn select_messages_to_shed(messages: &[MessageUsage], overage: u64) -> Vec<MessageId> {
    let mut freed = 0u64;
    let mut victims = Vec::new();
    for message in trimmable(messages) {
        if freed >= overage {
            break;
        }
        freed += message.size_bytes;
        victims.push(message.message_id.clone());
    }
    victims
}

/// Plan removals and demotions until `total_bytes` fits the byte budget.
///
/// Stubs are removed first (least recently accessed first), then fully
/// cached sessions are demoted in the same order. `exempt` names the session
/// whose write triggered enforcement; it is never chosen.
pub fn plan_byte_budget(
    sessions: &[SessionUsage],
    total_bytes: u64,
    budgets: &Budgets,
    exempt: Option<&SessionId>,
) -> BytePlan {
    let mut plan = BytePlan::default();
    let mut total = total_bytes;
    if total <= budgets.max_total_bytes {
        return plan;
    }

    let not_exempt = |s: &SessionUsage| Some(&s.session_id) != exempt;

    for stub in lru_sorted(sessions, |s| !s.is_fully_cached && not_exempt(s)) {
        if total <= budgets.max_total_bytes {
            break;
        }
        total = total.saturating_sub(stub.size_bytes);
        plan.evict.push(stub.session_id.clone());
    }

    for full in lru_sorted(sessions, |s| s.is_fully_cached && not_exempt(s)) {
        if total <= budgets.max_total_bytes {
            break;
        }
        total = total.saturating_sub(full.message_bytes);
        plan.demote.push(full.session_id.clone());
    }

    plan.remaining_overage = total.saturating_sub(budgets.max_total_bytes);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn usage(id: &str, minutes_ago: i64, full: bool, size: u64) -> SessionUsage {
        let now = Utc::now();
        SessionUsage {
            session_id: id.into(),
            last_accessed_at: now - Duration::minutes(minutes_ago),
            expires_at: now + Duration::days(7),
            is_fully_cached: full,
            message_count: 0,
            size_bytes: size,
            message_bytes: if full { size.saturating_sub(10) } else { 0 },
        }
    }

    fn budgets(max_sessions: usize, max_full: usize) -> Budgets {
        Budgets {
            max_sessions,
            max_full_sessions: max_full,
            ..Budgets::default()
        }
    }

    #[test]
    fn test_evicts_least_recent_stub_first() {
        let sessions = vec![
            usage("full-old", 100, true, 10),
            usage("stub-old", 50, false, 10),
            usage("stub-new", 5, false, 10),
        ];
        let evicted = select_sessions_to_evict(&sessions, &budgets(2, 10));
        assert_eq!(evicted, vec![SessionId::from("stub-old")]);
    }

    #[test]
    fn test_evicts_full_sessions_only_without_stubs() {
        let sessions = vec![
            usage("full-a", 30, true, 10),
            usage("full-b", 20, true, 10),
            usage("stub", 1, false, 10),
        ];
        let evicted = select_sessions_to_evict(&sessions, &budgets(1, 10));
        assert_eq!(evicted, vec![SessionId::from("stub"), SessionId::from("full-a")]);
    }

    #[test]
    fn test_no_eviction_within_budget() {
        let sessions = vec![usage("a", 1, false, 10)];
        assert!(select_sessions_to_evict(&sessions, &budgets(1, 1)).is_empty());
        assert!(select_sessions_to_demote(&sessions, &budgets(1, 0)).is_empty());
    }

    #[test]
    fn test_demotes_least_recent_full_session() {
        let sessions = vec![
            usage("full-a", 30, true, 10),
            usage("full-b", 20, true, 10),
            usage("full-c", 10, true, 10),
        ];
        let demoted = select_sessions_to_demote(&sessions, &budgets(50, 2));
        assert_eq!(demoted, vec![SessionId::from("full-a")]);
    }

    fn messages(count: u64, streaming: impl Fn(u64) -> bool) -> Vec<MessageUsage> {
        (1..=count)
            .map(|seq| MessageUsage {
                message_id: format!("m{}", seq).into(),
                sequence_number: seq,
                is_streaming: streaming(seq),
                size_bytes: 100,
            })
            .collect()
    }

    #[test]
    fn test_trim_skips_newest_and_streaming() {
        let messages = messages(5, |seq| seq == 1);
        let budgets = Budgets {
            max_messages_per_session: 2,
            ..Budgets::default()
        };
        let trimmed = select_messages_to_trim(&messages, &budgets);
        assert_eq!(
            trimmed,
            vec![MessageId::from("m2"), MessageId::from("m3"), MessageId::from("m4")]
        );
    }

    #[test]
    fn test_trim_never_selects_streaming_messages() {
        let messages = messages(4, |seq| seq != 2);
        let budgets = Budgets {
            max_messages_per_session: 1,
            ..Budgets::default()
        };
        // only m2 is settled and not the newest; the rest stay over budget
        assert_eq!(select_messages_to_trim(&messages, &budgets), vec![MessageId::from("m2")]);
    }

    #[test]
    fn test_shed_frees_oldest_settled_bytes() {
        let messages = messages(6, |seq| seq == 2);
        let shed = select_messages_to_shed(&messages, 250);
        assert_eq!(
            shed,
            vec![MessageId::from("m1"), MessageId::from("m3"), MessageId::from("m4")]
        );
        assert!(select_messages_to_shed(&messages, 0).is_empty());

        // everything trimmable goes, m2 (streaming) and m6 (newest) stay
        let all = select_messages_to_shed(&messages, 10_000);
        assert_eq!(all.len(), 4);
        assert!(!all.contains(&MessageId::from("m2")));
        assert!(!all.contains(&MessageId::from("m6")));
    }

    #[test]
    fn test_byte_plan_prefers_stubs_then_demotes() {
        let sessions = vec![
            usage("stub", 10, false, 100),
            usage("full-old", 50, true, 1_000),
            usage("full-new", 5, true, 1_000),
        ];
        let budgets = Budgets {
            max_total_bytes: 1_200,
            ..Budgets::default()
        };
        let plan = plan_byte_budget(&sessions, 2_100, &budgets, Some(&SessionId::from("full-new")));
        assert_eq!(plan.evict, vec![SessionId::from("stub")]);
        assert_eq!(plan.demote, vec![SessionId::from("full-old")]);
        assert_eq!(plan.remaining_overage, 0);
    }

    #[test]
    fn test_byte_plan_reports_residual_overage() {
        let sessions = vec![usage("only", 1, true, 5_000)];
        let budgets = Budgets {
            max_total_bytes: 1_000,
            ..Budgets::default()
        };
        let plan = plan_byte_budget(&sessions, 5_000, &budgets, Some(&SessionId::from("only")));
        assert!(plan.is_empty());
        assert_eq!(plan.remaining_overage, 4_000);
    }

    #[test]
    fn test_select_expired() {
        let now = Utc::now();
        let mut stale = usage("stale", 1, false, 1);
        stale.expires_at = now - Duration::seconds(1);
        let fresh = usage("fresh", 1, false, 1);
        assert_eq!(select_expired(&[stale, fresh], now), vec![SessionId::from("stale")]);
    }
}
