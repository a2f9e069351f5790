/// Named event buckets, and the counter-addressed sequence behind a
/// character's dynamic phase.
use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;

use super::event::{build_events, Event, EventEntry, EventError};

/// Bucket the dynamic phase reads from.
pub const AUTOMATIC: &str = "automatic";

/// Bucket name → ordered events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSequence {
    buckets: BTreeMap<String, Vec<Event>>,
}

impl EventSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &BTreeMap<String, Vec<EventEntry>>) -> Result<Self, EventError> {
        let mut sequence = Self::new();
        for (bucket, events) in entries {
            sequence.insert(bucket, build_events(events)?);
        }
        Ok(sequence)
    }

    /// A sequence with a single bucket.
    pub fn single(bucket: &str, events: Vec<Event>) -> Self {
        let mut sequence = Self::new();
        sequence.insert(bucket, events);
        sequence
    }

    pub fn insert(&mut self, bucket: &str, events: Vec<Event>) {
        self.buckets.insert(bucket.to_string(), events);
    }

    pub fn contains(&self, bucket: &str) -> bool {
        self.buckets.contains_key(bucket)
    }

    /// Events of a declared bucket. Undeclared buckets are logged and yield `None`.
    pub fn get(&self, bucket: &str) -> Option<&[Event]> {
        match self.buckets.get(bucket) {
            Some(events) => Some(events),
            None => {
                warn!("Event bucket '{bucket}' is not declared");
                None
            }
        }
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Appends `other`'s events after this sequence's, bucket by bucket.
    /// The receiver plays the role of the defaults.
    pub fn merge(&mut self, other: &EventSequence) {
        for (bucket, events) in &other.buckets {
            self.buckets
                .entry(bucket.clone())
                .or_default()
                .extend(events.iter().cloned());
        }
    }
}

/// An [`EventSequence`] read one event at a time by a strictly increasing
/// counter, optionally looping and reshuffling on each lap.
///
/// Each behavior machine owns its own copy; shuffling mutates it in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicEventSequence {
    sequence: EventSequence,
    pub looping: bool,
    pub randomize: bool,
    pub max_iterations: Option<u32>,
}

impl DynamicEventSequence {
    pub fn new(
        sequence: EventSequence,
        looping: bool,
        randomize: bool,
        max_iterations: Option<u32>,
    ) -> Self {
        Self {
            sequence,
            looping,
            randomize,
            max_iterations,
        }
    }

    pub fn sequence(&self) -> &EventSequence {
        &self.sequence
    }

    /// The event at `counter` in `bucket`, or `None` once the sequence is
    /// exhausted.
    pub fn get<R: Rng + ?Sized>(&mut self, bucket: &str, counter: u32, rng: &mut R) -> Option<Event> {
        let Some(events) = self.sequence.buckets.get_mut(bucket) else {
            warn!("Event bucket '{bucket}' is not declared");
            return None;
        };
        if events.is_empty() {
            return None;
        }
        if let Some(max) = self.max_iterations {
            if counter >= max {
                return None;
            }
        }
        let len = events.len();
        let index = if self.looping {
            counter as usize % len
        } else {
            counter as usize
        };
        if index == 0 && self.randomize {
            events.shuffle(rng);
        }
        events.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::attributes::Attributes;
    use crate::schema::event::{Lines, SpeakEvent};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn say(text: &str) -> Event {
        Event::Speak(SpeakEvent {
            lines: Lines::One(text.to_string()),
            attributes: Attributes::default(),
        })
    }

    fn text(event: &Event) -> &str {
        match event {
            Event::Speak(SpeakEvent {
                lines: Lines::One(line),
                ..
            }) => line,
            _ => panic!("expected a single-line speak event"),
        }
    }

    #[test]
    fn undeclared_bucket_is_none() {
        let sequence = EventSequence::single("init", vec![say("hi")]);
        assert!(sequence.get("end").is_none());
        assert_eq!(sequence.get("init").unwrap().len(), 1);
    }

    #[test]
    fn merge_puts_defaults_first() {
        let mut defaults = EventSequence::single("calm", vec![say("default")]);
        let mut specific = EventSequence::single("calm", vec![say("specific")]);
        specific.insert("angry", vec![say("grr")]);
        defaults.merge(&specific);

        let calm: Vec<_> = defaults.get("calm").unwrap().iter().map(text).collect();
        assert_eq!(calm, vec!["default", "specific"]);
        assert!(defaults.contains("angry"));
    }

    #[test]
    fn looping_with_max_iterations() {
        let mut dynamic = DynamicEventSequence::new(
            EventSequence::single(AUTOMATIC, vec![say("A"), say("B")]),
            true,
            false,
            Some(3),
        );
        let mut rng = StdRng::seed_from_u64(0);
        let picked: Vec<Option<String>> = (0..4)
            .map(|i| dynamic.get(AUTOMATIC, i, &mut rng).map(|e| text(&e).to_string()))
            .collect();
        assert_eq!(
            picked,
            vec![Some("A".into()), Some("B".into()), Some("A".into()), None]
        );
    }

    #[test]
    fn non_looping_runs_out() {
        let mut dynamic = DynamicEventSequence::new(
            EventSequence::single(AUTOMATIC, vec![say("A"), say("B")]),
            false,
            false,
            None,
        );
        let mut rng = StdRng::seed_from_u64(0);
        assert!(dynamic.get(AUTOMATIC, 1, &mut rng).is_some());
        assert!(dynamic.get(AUTOMATIC, 2, &mut rng).is_none());
    }

    #[test]
    fn zero_max_iterations_yields_nothing() {
        let mut dynamic = DynamicEventSequence::new(
            EventSequence::single(AUTOMATIC, vec![say("A")]),
            true,
            false,
            Some(0),
        );
        let mut rng = StdRng::seed_from_u64(0);
        assert!(dynamic.get(AUTOMATIC, 0, &mut rng).is_none());
    }

    #[test]
    fn undeclared_dynamic_bucket_is_none() {
        let mut dynamic = DynamicEventSequence::new(
            EventSequence::single(AUTOMATIC, vec![say("A")]),
            true,
            false,
            None,
        );
        let mut rng = StdRng::seed_from_u64(0);
        assert!(dynamic.get("end", 0, &mut rng).is_none());
        assert!(dynamic.get(AUTOMATIC, 0, &mut rng).is_some());
    }

    #[test]
    fn empty_bucket_yields_nothing() {
        let mut dynamic =
            DynamicEventSequence::new(EventSequence::single(AUTOMATIC, vec![]), true, true, None);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(dynamic.get(AUTOMATIC, 0, &mut rng).is_none());
    }

    #[test]
    fn randomized_lap_is_a_permutation() {
        let events = vec![say("A"), say("B"), say("C"), say("D")];
        let mut dynamic = DynamicEventSequence::new(
            EventSequence::single(AUTOMATIC, events),
            true,
            true,
            None,
        );
        let mut rng = StdRng::seed_from_u64(11);
        let mut lap: Vec<String> = (0..4)
            .map(|i| text(&dynamic.get(AUTOMATIC, i, &mut rng).unwrap()).to_string())
            .collect();
        lap.sort();
        assert_eq!(lap, vec!["A", "B", "C", "D"]);
    }
}
