use std::collections::HashSet;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{domain::Jid, snapshot::StatsSnapshot};

struct StatsState {
    date: NaiveDate,
    first_messages: HashSet<Jid>,
    total_events: u64,
}

impl StatsState {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            first_messages: HashSet::new(),
            total_events: 0,
        }
    }

    fn roll_if_needed(&mut self, today: NaiveDate) {
        if self.date != today {
            *self = Self::fresh(today);
        }
    }
}

/// Date-keyed counters: identities that received a first message today and
/// total payment events today. Counters reset lazily when the date rolls
/// over.
pub struct DailyStats {
    state: Mutex<StatsState>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DailyCounters {
    pub date: String,
    pub first_messages: usize,
    pub total_events: u64,
}

impl Default for DailyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DailyStats {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StatsState::fresh(Utc::now().date_naive())),
        }
    }

    pub async fn record_first_message(&self, jid: &Jid) {
        let mut st = self.state.lock().await;
        st.roll_if_needed(Utc::now().date_naive());
        st.first_messages.insert(jid.clone());
    }

    pub async fn record_event(&self) {
        let mut st = self.state.lock().await;
        st.roll_if_needed(Utc::now().date_naive());
        st.total_events += 1;
    }

    pub async fn counters(&self) -> DailyCounters {
        let mut st = self.state.lock().await;
        st.roll_if_needed(Utc::now().date_naive());
        DailyCounters {
            date: st.date.to_string(),
            first_messages: st.first_messages.len(),
            total_events: st.total_events,
        }
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let st = self.state.lock().await;
        StatsSnapshot {
            date: st.date.to_string(),
            first_messages: st.first_messages.iter().cloned().collect(),
            total_events: st.total_events,
        }
    }

    /// Adopt a snapshot only if it is from today; a stale one just starts the
    /// day fresh.
    pub async fn restore(&self, snapshot: StatsSnapshot) {
        let today = Utc::now().date_naive();
        let mut st = self.state.lock().await;
        match snapshot.date.parse::<NaiveDate>() {
            Ok(date) if date == today => {
                *st = StatsState {
                    date,
                    first_messages: snapshot.first_messages.into_iter().collect(),
                    total_events: snapshot.total_events,
                };
            }
            _ => *st = StatsState::fresh(today),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_track_distinct_first_messages_and_events() {
        let stats = DailyStats::new();
        let a = Jid("a@s.whatsapp.net".to_string());
        let b = Jid("b@s.whatsapp.net".to_string());

        stats.record_first_message(&a).await;
        stats.record_first_message(&a).await;
        stats.record_first_message(&b).await;
        stats.record_event().await;
        stats.record_event().await;

        let counters = stats.counters().await;
        assert_eq!(counters.first_messages, 2);
        assert_eq!(counters.total_events, 2);
    }

    #[tokio::test]
    async fn stale_snapshot_starts_the_day_fresh() {
        let stats = DailyStats::new();
        let yesterday = Utc::now()
            .date_naive()
            .pred_opt()
            .expect("yesterday exists");

        stats
            .restore(StatsSnapshot {
                date: yesterday.to_string(),
                first_messages: vec![Jid("a@s.whatsapp.net".to_string())],
                total_events: 9,
            })
            .await;

        let counters = stats.counters().await;
        assert_eq!(counters.first_messages, 0);
        assert_eq!(counters.total_events, 0);
        assert_eq!(counters.date, Utc::now().date_naive().to_string());
    }

    #[tokio::test]
    async fn same_day_snapshot_is_adopted() {
        let stats = DailyStats::new();
        let today = Utc::now().date_naive();

        stats
            .restore(StatsSnapshot {
                date: today.to_string(),
                first_messages: vec![Jid("a@s.whatsapp.net".to_string())],
                total_events: 3,
            })
            .await;

        let counters = stats.counters().await;
        assert_eq!(counters.first_messages, 1);
        assert_eq!(counters.total_events, 3);
    }
}
