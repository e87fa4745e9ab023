//! Selection of the participants shown to the model.

use super::model::LocationMessage;
use crate::ids::EntityKey;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::cmp::Reverse;
use std::collections::HashMap;

/// Keep the `limit` participants who spoke most recently.
///
/// Participants without a message in the window rank last. Ties are broken
/// by a random key when `random_tie_break` is set, so the choice among equals
/// varies between cycles; otherwise by entity key. A set within the limit is
/// returned unchanged.
pub fn rank_participants(
    participants: &[EntityKey],
    messages: &[LocationMessage],
    limit: usize,
    random_tie_break: bool,
) -> Vec<EntityKey> {
    if participants.len() <= limit {
        return participants.to_vec();
    }

    let mut latest: HashMap<&EntityKey, DateTime<Utc>> = HashMap::new();
    for message in messages {
        if let Some(entity) = &message.entity {
            let entry = latest.entry(entity).or_insert(message.created_at);
            if message.created_at > *entry {
                *entry = message.created_at;
            }
        }
    }

    let mut rng = rand::thread_rng();
    let mut ranked: Vec<(Reverse<Option<DateTime<Utc>>>, u64, &EntityKey)> = participants
        .iter()
        .map(|key| {
            let tie = if random_tie_break { rng.gen() } else { 0 };
            (Reverse(latest.get(key).copied()), tie, key)
        })
        .collect();
    ranked.sort();

    ranked
        .into_iter()
        .take(limit)
        .map(|(_, _, key)| *key)
        .collect()
}
