use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single routing table entry.
///
/// `target` and `last_activity` are the typed fields every route carries;
/// everything else the caller supplied is round-tripped verbatim through
/// `data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRecord {
    pub target: String,
    #[serde(with = "iso_millis")]
    pub last_activity: DateTime<Utc>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl RouteRecord {
    pub fn new(target: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            target: target.into(),
            last_activity: now,
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Upsert semantics: the replacement's target and timestamp win, and its
    /// metadata keys are merged over the existing ones.
    pub fn absorb(&mut self, replacement: RouteRecord) {
        self.target = replacement.target;
        self.last_activity = replacement.last_activity;
        for (key, value) in replacement.data {
            self.data.insert(key, value);
        }
    }

    pub fn apply(&mut self, update: RouteUpdate) {
        if let Some(target) = update.target {
            self.target = target;
        }
        if let Some(last_activity) = update.last_activity {
            // Activity never moves backwards.
            if last_activity > self.last_activity {
                self.last_activity = last_activity;
            }
        }
        for (key, value) in update.data {
            self.data.insert(key, value);
        }
    }
}

/// Partial update merged into an existing record by [`RouteStore::update`].
///
/// [`RouteStore::update`]: crate::store::RouteStore::update
#[derive(Debug, Clone, Default)]
pub struct RouteUpdate {
    pub target: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub data: Map<String, Value>,
}

impl RouteUpdate {
    pub fn activity(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: Some(now),
            ..Self::default()
        }
    }
}

/// Result of a longest-prefix lookup: the matched prefix and its record.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub prefix: String,
    pub record: RouteRecord,
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-05-01T12:30:45.123Z`.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
