use serde::{Deserialize, Serialize};

/// Resource limits enforced by the cache after every mutating write
#[derive(Debug, Clone, PartialEq)]
pub struct Budgets {
    pub max_sessions: usize,
    pub max_full_sessions: usize,
    pub max_messages_per_session: usize,
    pub max_total_bytes: u64,
    pub ttl: chrono::Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            max_full_sessions: 10,
            max_messages_per_session: 500,
            max_total_bytes: 100 * 1024 * 1024,
            ttl: chrono::Duration::days(7),
        }
    }
}

/// Partial override applied on top of the current budgets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetOverrides {
    pub max_sessions: Option<usize>,
    pub max_full_sessions: Option<usize>,
    pub max_messages_per_session: Option<usize>,
    pub max_total_bytes: Option<u64>,
    pub ttl_secs: Option<i64>,
}

impl BudgetOverrides {
    pub fn is_empty(&self) -> bool {
        self == &BudgetOverrides::default()
    }
}

impl Budgets {
    pub fn apply(&mut self, overrides: &BudgetOverrides) {
        if let Some(max_sessions) = overrides.max_sessions {
            self.max_sessions = max_sessions.max(1);
        }
        if let Some(max_full) = overrides.max_full_sessions {
            self.max_full_sessions = max_full;
        }
        if let Some(max_messages) = overrides.max_messages_per_session {
            self.max_messages_per_session = max_messages.max(1);
        }
        if let Some(max_bytes) = overrides.max_total_bytes {
            self.max_total_bytes = max_bytes;
        }
        if let Some(ttl_secs) = overrides.ttl_secs {
            self.ttl = chrono::Duration::seconds(ttl_secs.max(1));
        }
        // a fully cached session is still a resident session
        self.max_full_sessions = self.max_full_sessions.min(self.max_sessions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_override_keeps_other_limits() {
        let mut budgets = Budgets::default();
        budgets.apply(&BudgetOverrides {
            max_messages_per_session: Some(100),
            ttl_secs: Some(3600),
            ..Default::default()
        });
        assert_eq!(budgets.max_messages_per_session, 100);
        assert_eq!(budgets.ttl, chrono::Duration::hours(1));
        assert_eq!(budgets.max_sessions, 50);
    }

    #[test]
    fn test_full_sessions_clamped_to_sessions() {
        let mut budgets = Budgets::default();
        budgets.apply(&BudgetOverrides {
            max_sessions: Some(4),
            ..Default::default()
        });
        assert_eq!(budgets.max_full_sessions, 4);
    }
}
