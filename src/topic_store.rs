//! Lifecycle topic store (§4.H): a bounded, mutex-guarded map of
//! normalized topic name to [`Topic`], with Entering/Growing/Shrinking
//! state transitions, score decay, stale eviction, and an active-set cap.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extractor::ExtractedTopic;
use crate::text::normalize_topic_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicState {
    Entering,
    Growing,
    Shrinking,
}

/// A mutable store entry tracking one trending topic's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub normalized_name: String,
    pub score: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub source: String,
    pub state: TopicState,
    pub batches_since_seen: u32,
}

#[derive(Debug, Clone)]
pub struct TopicStoreConfig {
    pub max_active: usize,
    pub min_score: f64,
    pub stale_after: u32,
    pub decay_factor: f64,
}

impl Default for TopicStoreConfig {
    fn default() -> Self {
        Self {
            max_active: 20,
            min_score: 0.05,
            stale_after: 3,
            decay_factor: 0.5,
        }
    }
}

impl TopicStoreConfig {
    /// Validate construction-time invariants: `decay_factor` must be
    /// strictly inside `(0, 1)` or decay either never shrinks scores
    /// (`1.0`) or kills them instantly (`0.0`), both of which defeat the
    /// lifecycle design.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(format!(
                "decay_factor must be strictly between 0 and 1, got {}",
                self.decay_factor
            ));
        }
        if self.max_active == 0 {
            return Err("max_active must be > 0".to_string());
        }
        Ok(())
    }
}

struct Inner {
    topics: HashMap<String, Topic>,
}

/// Bounded, mutex-guarded active-topic set.
pub struct TopicStore {
    config: TopicStoreConfig,
    state: Mutex<Inner>,
}

impl TopicStore {
    pub fn new(config: TopicStoreConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(Inner {
                topics: HashMap::new(),
            }),
        })
    }

    /// Merge a batch of extracted topics into the store (§4.H step 1–3).
    pub fn merge(&self, extracted: &[ExtractedTopic], source: &str, now: DateTime<Utc>) {
        let mut guard = self.state.lock().unwrap();

        let mut seen_this_cycle = std::collections::HashSet::new();

        for row in extracted {
            let normalized = normalize_topic_name(&row.topic);
            if normalized.is_empty() {
                continue;
            }
            seen_this_cycle.insert(normalized.clone());

            if let Some(existing) = guard.topics.get_mut(&normalized) {
                existing.score = row.score;
                existing.last_seen = now;
                existing.batches_since_seen = 0;
                if matches!(existing.state, TopicState::Entering | TopicState::Shrinking) {
                    existing.state = TopicState::Growing;
                }
            } else {
                guard.topics.insert(
                    normalized.clone(),
                    Topic {
                        name: row.topic.clone(),
                        normalized_name: normalized,
                        score: row.score,
                        first_seen: now,
                        last_seen: now,
                        source: source.to_string(),
                        state: TopicState::Entering,
                        batches_since_seen: 0,
                    },
                );
            }
        }

        let stale_after = self.config.stale_after;
        let decay_factor = self.config.decay_factor;
        let min_score = self.config.min_score;

        let mut to_remove = Vec::new();
        for (key, topic) in guard.topics.iter_mut() {
            if seen_this_cycle.contains(key) {
                continue;
            }
            topic.batches_since_seen += 1;

            if matches!(topic.state, TopicState::Entering | TopicState::Growing)
                && topic.batches_since_seen >= stale_after
            {
                topic.state = TopicState::Shrinking;
            }

            if topic.state == TopicState::Shrinking {
                topic.score *= decay_factor;
            }

            if topic.score < min_score {
                to_remove.push(key.clone());
            }
        }
        for key in to_remove {
            guard.topics.remove(&key);
        }

        // Enforce the active cap: evict the lowest scorer until within bound.
        while guard.topics.len() > self.config.max_active {
            let Some(lowest_key) = guard
                .topics
                .iter()
                .min_by(|a, b| a.1.score.partial_cmp(&b.1.score).unwrap())
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            guard.topics.remove(&lowest_key);
        }
    }

    /// A detached, score-descending snapshot of the active set.
    pub fn get_current_topics(&self) -> Vec<Topic> {
        let guard = self.state.lock().unwrap();
        let mut topics: Vec<Topic> = guard.topics.values().cloned().collect();
        topics.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        topics
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the active set wholesale, e.g. when restoring from a
    /// snapshot file at startup. Normalized names are recomputed, not
    /// trusted from the loaded rows.
    pub fn load_topics(&self, topics: Vec<Topic>) {
        let mut guard = self.state.lock().unwrap();
        guard.topics.clear();
        for mut topic in topics {
            topic.normalized_name = normalize_topic_name(&topic.name);
            guard.topics.insert(topic.normalized_name.clone(), topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn extracted(topic: &str, score: f64) -> ExtractedTopic {
        ExtractedTopic {
            topic: topic.to_string(),
            score,
            count: 1,
        }
    }

    fn store() -> TopicStore {
        TopicStore::new(TopicStoreConfig::default()).unwrap()
    }

    #[test]
    fn rejects_decay_factor_at_boundary() {
        let mut cfg = TopicStoreConfig::default();
        cfg.decay_factor = 1.0;
        assert!(TopicStore::new(cfg).is_err());
        let mut cfg = TopicStoreConfig::default();
        cfg.decay_factor = 0.0;
        assert!(TopicStore::new(cfg).is_err());
    }

    /// S1 — single topic lifecycle through the full Entering → Growing →
    /// Shrinking → gone cycle.
    #[test]
    fn s1_single_topic_lifecycle() {
        let store = store();
        let t0 = Utc::now();

        store.merge(&[extracted("Donauinselfest", 0.9)], "a", t0);
        let topics = store.get_current_topics();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].state, TopicState::Entering);
        assert_eq!(topics[0].score, 0.9);

        let t1 = t0 + Duration::seconds(1);
        store.merge(&[extracted("donauinselfest", 0.8)], "a", t1);
        let topics = store.get_current_topics();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "Donauinselfest");
        assert_eq!(topics[0].state, TopicState::Growing);
        assert_eq!(topics[0].score, 0.8);

        // t=2, t=3: batches_since_seen climbs to 2, still Growing.
        for n in 2..=3 {
            store.merge(&[], "a", t0 + Duration::seconds(n));
        }
        let topics = store.get_current_topics();
        assert_eq!(topics[0].state, TopicState::Growing);
        assert_eq!(topics[0].batches_since_seen, 2);

        // t=4: batches_since_seen reaches stale_after(3) -> Shrinking, decay fires.
        store.merge(&[], "a", t0 + Duration::seconds(4));
        let topics = store.get_current_topics();
        assert_eq!(topics[0].state, TopicState::Shrinking);
        assert!((topics[0].score - 0.4).abs() < 1e-9);

        store.merge(&[], "a", t0 + Duration::seconds(5));
        assert!((store.get_current_topics()[0].score - 0.2).abs() < 1e-9);
        store.merge(&[], "a", t0 + Duration::seconds(6));
        assert!((store.get_current_topics()[0].score - 0.1).abs() < 1e-9);
        store.merge(&[], "a", t0 + Duration::seconds(7));
        assert!((store.get_current_topics()[0].score - 0.05).abs() < 1e-9);
        assert_eq!(store.len(), 1, "0.05 is not < min_score(0.05), strict comparison keeps it");

        store.merge(&[], "a", t0 + Duration::seconds(8));
        assert_eq!(store.len(), 0, "0.025 < 0.05 removes the topic");
    }

    /// S2 — cap eviction: lowest scorer is evicted when the cap is exceeded.
    #[test]
    fn s2_cap_eviction() {
        let mut cfg = TopicStoreConfig::default();
        cfg.max_active = 3;
        let store = TopicStore::new(cfg).unwrap();
        let t0 = Utc::now();

        store.merge(
            &[extracted("A", 0.5), extracted("B", 0.6), extracted("C", 0.7)],
            "a",
            t0,
        );
        assert_eq!(store.len(), 3);

        store.merge(
            &[
                extracted("A", 0.5),
                extracted("B", 0.6),
                extracted("C", 0.7),
                extracted("D", 0.9),
            ],
            "a",
            t0 + Duration::seconds(1),
        );

        let names: std::collections::HashSet<String> =
            store.get_current_topics().into_iter().map(|t| t.name).collect();
        assert_eq!(store.len(), 3);
        assert!(names.contains("B"));
        assert!(names.contains("C"));
        assert!(names.contains("D"));
        assert!(!names.contains("A"));
    }

    #[test]
    fn duplicate_normalized_name_in_one_merge_last_one_wins() {
        let store = store();
        let now = Utc::now();
        store.merge(
            &[extracted("Wien Wahl", 0.3), extracted("wien  wahl", 0.9)],
            "a",
            now,
        );
        let topics = store.get_current_topics();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].score, 0.9);
    }

    #[test]
    fn empty_extraction_on_nonempty_batch_does_not_grow_store() {
        let store = store();
        let now = Utc::now();
        store.merge(&[extracted("X", 0.5)], "a", now);
        let len_before = store.len();
        store.merge(&[], "a", now + Duration::seconds(1));
        assert_eq!(store.len(), len_before);
    }

    #[test]
    fn get_current_topics_is_sorted_descending_by_score() {
        let store = store();
        let now = Utc::now();
        store.merge(&[extracted("low", 0.1), extracted("high", 0.9)], "a", now);
        let topics = store.get_current_topics();
        assert_eq!(topics[0].name, "high");
        assert_eq!(topics[1].name, "low");
    }
}
