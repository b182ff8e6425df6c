use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Storage key the ranking blob lives under unless a host picks another one.
pub const DEFAULT_NAMESPACE: &str = "us-yt-ratio";

const U64_CEILING: f64 = 18_446_744_073_709_551_616.0;
const SNAP_EPSILON: f64 = 1e-12;
/// Smallest accepted `factor - 1`. Below it, neighbouring bounds fall inside
/// the snapping tolerance and stop being monotonic.
const MIN_GROWTH: f64 = 1e-10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RankingError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("ineligible record: {0}")]
    IneligibleRecord(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Raw counters handed over by the page scraper for one video.
///
/// Counters are optional because the producer may fail to read them; the
/// ranking core decides eligibility, not the scraper.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoObservation {
    pub id: String,
    pub title: String,
    pub view_count: Option<i64>,
    pub likes: Option<i64>,
    pub dislikes: Option<i64>,
}

impl VideoObservation {
    /// Converts the observation into a storable record.
    ///
    /// # Errors
    /// Returns [`RankingError::IneligibleRecord`] when the id is blank or any
    /// counter is missing or negative.
    pub fn into_record(self) -> Result<VideoRecord, RankingError> {
        if self.id.trim().is_empty() {
            return Err(RankingError::IneligibleRecord(
                "id MUST be provided".to_string(),
            ));
        }

        let view_count = require_count("viewCount", self.view_count)?;
        let likes = require_count("likes", self.likes)?;
        let dislikes = require_count("dislikes", self.dislikes)?;

        Ok(VideoRecord::new(
            self.id,
            self.title,
            view_count,
            likes,
            dislikes,
        ))
    }
}

fn require_count(name: &str, value: Option<i64>) -> Result<u64, RankingError> {
    let Some(raw) = value else {
        return Err(RankingError::IneligibleRecord(format!(
            "{name} MUST be present"
        )));
    };

    u64::try_from(raw).map_err(|_| {
        RankingError::IneligibleRecord(format!("{name} MUST be >= 0, got {raw}"))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub title: String,
    pub view_count: u64,
    pub likes: u64,
    pub dislikes: u64,
    pub ratio: f64,
}

impl VideoRecord {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        view_count: u64,
        likes: u64,
        dislikes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            view_count,
            likes,
            dislikes,
            ratio: like_ratio(likes, dislikes),
        }
    }
}

/// Likes per dislike. A video without dislikes scores its raw like count.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn like_ratio(likes: u64, dislikes: u64) -> f64 {
    if dislikes == 0 {
        likes as f64
    } else {
        likes as f64 / dislikes as f64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RankingConfig {
    pub floor: u64,
    pub factor: f64,
    pub max_per_bucket: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self::v1()
    }
}

impl RankingConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            floor: 100,
            factor: 10.0,
            max_per_bucket: 10,
        }
    }

    /// Validates the bucket scale.
    ///
    /// # Errors
    /// Returns [`RankingError::InvalidConfiguration`] when `floor` is zero or
    /// `factor` is not a finite number greater than one.
    pub fn validate(&self) -> Result<(), RankingError> {
        BucketScale::new(self.floor, self.factor).map(|_| ())
    }

    /// Decodes and validates a configuration from JSON. Missing fields fall
    /// back to [`RankingConfig::v1`].
    ///
    /// # Errors
    /// Returns [`RankingError::InvalidConfiguration`] when decoding fails or
    /// the decoded values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, RankingError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RankingError::InvalidConfiguration(format!("invalid ranking config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Geometric view-count scale: bucket `i` spans `[floor*factor^i, floor*factor^(i+1))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketScale {
    floor: u64,
    factor: f64,
}

impl BucketScale {
    /// # Errors
    /// Returns [`RankingError::InvalidConfiguration`] for a zero floor or a
    /// factor that is non-finite or not greater than one.
    pub fn new(floor: u64, factor: f64) -> Result<Self, RankingError> {
        if floor == 0 {
            return Err(RankingError::InvalidConfiguration(
                "floor MUST be > 0".to_string(),
            ));
        }

        if !factor.is_finite() || factor <= 0.0 {
            return Err(RankingError::InvalidConfiguration(
                "factor MUST be a finite number > 0".to_string(),
            ));
        }

        // A non-growing sequence never yields a non-empty half-open range.
        if factor <= 1.0 {
            return Err(RankingError::InvalidConfiguration(
                "factor MUST be > 1 for buckets to grow".to_string(),
            ));
        }

        if factor - 1.0 < MIN_GROWTH {
            return Err(RankingError::InvalidConfiguration(format!(
                "factor MUST be >= 1 + {MIN_GROWTH:e}"
            )));
        }

        Ok(Self { floor, factor })
    }

    #[must_use]
    pub fn floor(&self) -> u64 {
        self.floor
    }

    #[must_use]
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Lower bound of bucket `index`, rounded up to whole views.
    ///
    /// Products within rounding noise of an integer snap to that integer so
    /// that `100 * 10^3` is exactly `100_000`. Saturates at `u64::MAX`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn bound(&self, index: u64) -> u64 {
        if index == 0 {
            return self.floor;
        }

        let raw = self.floor as f64 * self.factor.powf(index as f64);
        if !raw.is_finite() || raw >= U64_CEILING {
            return u64::MAX;
        }

        let nearest = raw.round();
        if (raw - nearest).abs() <= raw * SNAP_EPSILON {
            nearest as u64
        } else {
            raw.ceil() as u64
        }
    }

    /// Home bucket of a view count, or `None` below the floor.
    ///
    /// The logarithm gives an estimate; the loops settle it against the exact
    /// integer bounds so boundary values land in the upper bucket. Every
    /// accepted factor saturates the bounds at `u64::MAX` long before the
    /// index range runs out, so the upward walk always ends on a bucket that
    /// contains `view_count`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn index_of(&self, view_count: u64) -> Option<u64> {
        if view_count < self.floor {
            return None;
        }

        let estimate = ((view_count as f64 / self.floor as f64).ln() / self.factor.ln()).floor();
        let mut index = if estimate.is_finite() && estimate > 0.0 {
            estimate as u64
        } else {
            0
        };

        while index > 0 && view_count < self.bound(index) {
            index -= 1;
        }

        loop {
            let upper = self.bound(index.saturating_add(1));
            if upper == u64::MAX || view_count < upper {
                break;
            }
            index += 1;
        }

        Some(index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bucket {
    pub lower: u64,
    pub upper: u64,
    pub entries: Vec<VideoRecord>,
}

impl Bucket {
    /// A bucket whose upper bound saturated at `u64::MAX` is open-ended.
    #[must_use]
    pub fn contains(&self, view_count: u64) -> bool {
        view_count >= self.lower && (view_count < self.upper || self.upper == u64::MAX)
    }
}

/// Groups records into view-count buckets ranked by ratio.
///
/// Records below `floor` are left out. Only buckets holding at least one
/// record are returned, ordered by ascending `lower`; entries are sorted by
/// ratio descending and keep input order on ties.
///
/// # Errors
/// Returns [`RankingError::InvalidConfiguration`] when the scale is invalid.
pub fn bucketize(
    records: &[VideoRecord],
    floor: u64,
    factor: f64,
) -> Result<Vec<Bucket>, RankingError> {
    let scale = BucketScale::new(floor, factor)?;

    let mut grouped: BTreeMap<u64, Vec<VideoRecord>> = BTreeMap::new();
    for record in records {
        if let Some(index) = scale.index_of(record.view_count) {
            grouped.entry(index).or_default().push(record.clone());
        }
    }

    Ok(grouped
        .into_iter()
        .map(|(index, mut entries)| {
            entries.sort_by(|lhs, rhs| rhs.ratio.total_cmp(&lhs.ratio));
            Bucket {
                lower: scale.bound(index),
                upper: scale.bound(index.saturating_add(1)),
                entries,
            }
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionOutcome {
    pub buckets: Vec<Bucket>,
    pub removed_ids: Vec<String>,
}

/// Truncates every bucket to `max_per_bucket` entries.
///
/// Ids of the cut tails are returned in bucket order, then rank order. A cap
/// of zero empties every bucket but keeps its bounds in the list.
#[must_use]
pub fn enforce_retention(buckets: Vec<Bucket>, max_per_bucket: usize) -> RetentionOutcome {
    let mut removed_ids = Vec::new();
    let mut kept = Vec::with_capacity(buckets.len());

    for mut bucket in buckets {
        if bucket.entries.len() > max_per_bucket {
            let tail = bucket.entries.split_off(max_per_bucket);
            removed_ids.extend(tail.into_iter().map(|record| record.id));
        }
        kept.push(bucket);
    }

    RetentionOutcome {
        buckets: kept,
        removed_ids,
    }
}

/// Latest record per video id, in insertion order.
///
/// Re-inserting an id moves it to the back, so it loses ratio ties against
/// records that were stored before it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordStore {
    records: Vec<VideoRecord>,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[VideoRecord] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&VideoRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Replaces any record stored under the same id and appends the new one.
    pub fn upsert(&mut self, record: VideoRecord) -> Option<VideoRecord> {
        let previous = self.remove(&record.id);
        self.records.push(record);
        previous
    }

    pub fn remove(&mut self, id: &str) -> Option<VideoRecord> {
        let position = self.records.iter().position(|record| record.id == id)?;
        Some(self.records.remove(position))
    }

    /// Drops every listed id and returns how many records went away.
    pub fn remove_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        let doomed: BTreeSet<&str> = ids.into_iter().collect();
        let before = self.records.len();
        self.records
            .retain(|record| !doomed.contains(record.id.as_str()));
        before - self.records.len()
    }

    /// Serializes the store as one JSON object keyed by video id.
    ///
    /// # Errors
    /// Returns [`RankingError::Storage`] when a record cannot be encoded.
    pub fn to_blob(&self) -> Result<String, RankingError> {
        let mut map = Map::with_capacity(self.records.len());
        for record in &self.records {
            let value = serde_json::to_value(record).map_err(|err| {
                RankingError::Storage(format!("failed to encode record {}: {err}", record.id))
            })?;
            map.insert(record.id.clone(), value);
        }

        serde_json::to_string(&map)
            .map_err(|err| RankingError::Storage(format!("failed to encode store: {err}")))
    }

    /// Decodes a persisted blob. Absent or unparsable blobs yield an empty
    /// store; entries that fail to decode are skipped.
    ///
    /// The mapping key wins over the stored `id` and the ratio is recomputed
    /// from the counters.
    #[must_use]
    pub fn from_blob(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::new();
        };

        let map: Map<String, Value> = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "discarding unreadable ranking store blob");
                return Self::new();
            }
        };

        // Object keys are unique, so entries append without an upsert scan.
        let mut store = Self {
            records: Vec::with_capacity(map.len()),
        };
        for (key, value) in map {
            match serde_json::from_value::<StoredRecord>(value) {
                Ok(stored) => {
                    store.records.push(VideoRecord::new(
                        key,
                        stored.title,
                        stored.view_count,
                        stored.likes,
                        stored.dislikes,
                    ));
                }
                Err(err) => {
                    warn!(id = %key, error = %err, "skipping malformed stored record");
                }
            }
        }

        store
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    #[serde(default)]
    title: String,
    view_count: u64,
    likes: u64,
    dislikes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub store: RecordStore,
    pub buckets: Vec<Bucket>,
    pub removed_ids: Vec<String>,
    pub record: VideoRecord,
    /// Whether the ingested record survived retention.
    pub retained: bool,
}

impl IngestOutcome {
    #[must_use]
    pub fn ratio(&self) -> f64 {
        self.record.ratio
    }
}

/// Merges one observation into `store`, ranks, and prunes.
///
/// The returned store is what the caller persists. Nothing is returned on
/// error, so a rejected observation never reaches storage.
///
/// # Errors
/// Returns [`RankingError::InvalidConfiguration`] for a bad config and
/// [`RankingError::IneligibleRecord`] for an unusable observation.
pub fn ingest(
    observation: VideoObservation,
    mut store: RecordStore,
    config: &RankingConfig,
) -> Result<IngestOutcome, RankingError> {
    config.validate()?;
    let record = observation.into_record()?;

    let replaced = store.upsert(record.clone());
    let buckets = bucketize(store.records(), config.floor, config.factor)?;
    let RetentionOutcome {
        buckets,
        removed_ids,
    } = enforce_retention(buckets, config.max_per_bucket);

    let removed = store.remove_all(removed_ids.iter().map(String::as_str));
    let retained = store.contains(&record.id);

    debug!(
        id = %record.id,
        view_count = record.view_count,
        ratio = record.ratio,
        replaced = replaced.is_some(),
        removed,
        retained,
        "ingested video observation"
    );

    Ok(IngestOutcome {
        store,
        buckets,
        removed_ids,
        record,
        retained,
    })
}

/// Ranks a store without pruning it.
///
/// # Errors
/// Returns [`RankingError::InvalidConfiguration`] for a bad config.
pub fn rank(store: &RecordStore, config: &RankingConfig) -> Result<Vec<Bucket>, RankingError> {
    config.validate()?;
    bucketize(store.records(), config.floor, config.factor)
}

/// String-to-string persistence medium the ranking store is written to.
pub trait KeyValueStore {
    /// # Errors
    /// Returns [`RankingError::Storage`] when the medium cannot be read.
    fn get_item(&self, key: &str) -> Result<Option<String>, RankingError>;

    /// # Errors
    /// Returns [`RankingError::Storage`] when the medium cannot be written.
    fn set_item(&mut self, key: &str, value: &str) -> Result<(), RankingError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryKeyValueStore {
    items: BTreeMap<String, String>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, RankingError> {
        Ok(self.items.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), RankingError> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Reads the record store persisted under `namespace`.
///
/// # Errors
/// Returns [`RankingError::Storage`] when the backend read fails. A corrupt
/// blob is not an error.
pub fn load_store<S: KeyValueStore + ?Sized>(
    backend: &S,
    namespace: &str,
) -> Result<RecordStore, RankingError> {
    let raw = backend.get_item(namespace)?;
    Ok(RecordStore::from_blob(raw.as_deref()))
}

/// Writes `store` under `namespace`.
///
/// # Errors
/// Returns [`RankingError::Storage`] when encoding or the backend write fails.
pub fn persist_store<S: KeyValueStore + ?Sized>(
    backend: &mut S,
    namespace: &str,
    store: &RecordStore,
) -> Result<(), RankingError> {
    let blob = store.to_blob()?;
    backend.set_item(namespace, &blob)
}

/// Load, ingest, persist cycle over a [`KeyValueStore`].
#[derive(Debug)]
pub struct RankingEngine<S> {
    backend: S,
    namespace: String,
    config: RankingConfig,
}

impl<S: KeyValueStore> RankingEngine<S> {
    /// # Errors
    /// Returns [`RankingError::InvalidConfiguration`] for a bad config.
    pub fn new(
        backend: S,
        namespace: impl Into<String>,
        config: RankingConfig,
    ) -> Result<Self, RankingError> {
        config.validate()?;
        Ok(Self {
            backend,
            namespace: namespace.into(),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn backend(&self) -> &S {
        &self.backend
    }

    #[must_use]
    pub fn into_backend(self) -> S {
        self.backend
    }

    /// Ingests an observation and persists the pruned store.
    ///
    /// `None` means the page had nothing to record; storage is left alone.
    ///
    /// # Errors
    /// Propagates [`ingest`] and storage errors; on error nothing is written.
    pub fn observe(
        &mut self,
        observation: Option<VideoObservation>,
    ) -> Result<Option<IngestOutcome>, RankingError> {
        let Some(observation) = observation else {
            return Ok(None);
        };

        let store = load_store(&self.backend, &self.namespace)?;
        let outcome = ingest(observation, store, &self.config)?;
        persist_store(&mut self.backend, &self.namespace, &outcome.store)?;
        Ok(Some(outcome))
    }

    /// # Errors
    /// Returns [`RankingError::Storage`] when the backend read fails.
    pub fn records(&self) -> Result<RecordStore, RankingError> {
        load_store(&self.backend, &self.namespace)
    }

    /// Current rankings of the persisted store, without pruning or writing.
    ///
    /// # Errors
    /// Returns [`RankingError::Storage`] when the backend read fails.
    pub fn rankings(&self) -> Result<Vec<Bucket>, RankingError> {
        rank(&self.records()?, &self.config)
    }
}
