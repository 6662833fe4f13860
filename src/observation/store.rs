//! ObservationStore: append-only persistence and the accepted-event bus.

use crate::db::{self, from_millis, to_millis};
use crate::error::{Error, Result};
use crate::observation::types::{
    AppendOutcome, Domain, Environment, NewObservation, Observation, ObservationAccepted,
    ObservationPayload, Reporter, Role,
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use std::collections::HashSet;

const EVENT_CAPACITY: usize = 1024;

const SELECT_COLUMNS: &str = "seq, id, subject_id, domain, environment, reporter_id, \
     reporter_role, observed_at, recorded_at, idempotency_key, supersedes, payload";

#[derive(Clone)]
pub struct ObservationStore {
    pool: SqlitePool,
    events: broadcast::Sender<ObservationAccepted>,
}

impl ObservationStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { pool, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservationAccepted> {
        self.events.subscribe()
    }

    /// Append a validated observation.
    ///
    /// A repeated `(subject, domain, idempotency key)` returns the prior id as
    /// `Duplicate`; nothing is written and no event is published.
    pub async fn append(&self, observation: &NewObservation) -> Result<AppendOutcome> {
        let domain = observation.domain();

        if let Some(prior_id) = self
            .find_by_key(&observation.subject_id, domain, &observation.idempotency_key)
            .await?
        {
            return Ok(AppendOutcome::Duplicate { prior_id });
        }

        if let Some(target) = &observation.supersedes {
            match self.get(target).await? {
                Some(prior)
                    if prior.subject_id == observation.subject_id && prior.domain() == domain => {}
                _ => {
                    return Err(Error::invalid(format!(
                        "supersedes '{target}' is not a {domain} observation of subject '{}'",
                        observation.subject_id
                    )));
                }
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let definition_id = observation.payload.definition_id().map(str::to_string);
        let payload = observation.payload.body_json()?;

        let inserted = sqlx::query_as::<_, (i64,)>(
            "INSERT INTO observations (id, subject_id, domain, environment, reporter_id,
                 reporter_role, observed_at, recorded_at, idempotency_key, definition_id,
                 supersedes, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING seq",
        )
        .bind(&id)
        .bind(&observation.subject_id)
        .bind(domain.as_str())
        .bind(observation.environment.map(|environment| environment.as_str()))
        .bind(&observation.reporter.id)
        .bind(observation.reporter.role.as_str())
        .bind(to_millis(observation.observed_at))
        .bind(to_millis(db::now()))
        .bind(&observation.idempotency_key)
        .bind(&definition_id)
        .bind(&observation.supersedes)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await;

        let seq = match inserted {
            Ok((seq,)) => seq,
            // Lost a race with a concurrent retry carrying the same key.
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                let prior_id = self
                    .find_by_key(&observation.subject_id, domain, &observation.idempotency_key)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("unique violation without a prior row"))?;
                return Ok(AppendOutcome::Duplicate { prior_id });
            }
            Err(error) => return Err(error.into()),
        };

        tracing::debug!(
            subject_id = %observation.subject_id,
            domain = %domain,
            seq,
            "observation accepted"
        );

        // No subscribers is fine: the recompute loop recovers by seq.
        let _ = self.events.send(ObservationAccepted {
            observation_id: id.clone(),
            seq,
            subject_id: observation.subject_id.clone(),
            domain,
            definition_id,
            observed_at: observation.observed_at,
        });

        Ok(AppendOutcome::Accepted { id, seq })
    }

    /// Id of an earlier observation accepted under the same idempotency key.
    pub async fn find_duplicate(&self, observation: &NewObservation) -> Result<Option<String>> {
        self.find_by_key(
            &observation.subject_id,
            observation.domain(),
            &observation.idempotency_key,
        )
        .await
    }

    pub async fn get(&self, observation_id: &str) -> Result<Option<Observation>> {
        let row = sqlx::query_as::<_, ObservationRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM observations WHERE id = ?"
        ))
        .bind(observation_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch observation")?;

        row.map(ObservationRow::into_observation).transpose()
    }

    async fn find_by_key(
        &self,
        subject_id: &str,
        domain: Domain,
        idempotency_key: &str,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM observations
             WHERE subject_id = ? AND domain = ? AND idempotency_key = ?",
        )
        .bind(subject_id)
        .bind(domain.as_str())
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up idempotency key")?;
        Ok(row.map(|(id,)| id))
    }

    /// Observations for a subject ascending by `(timestamp, seq)`.
    ///
    /// A single statement, so rows committed before the read began are never
    /// skipped or duplicated by concurrent appends.
    pub async fn list_since(
        &self,
        subject_id: &str,
        domain: Option<Domain>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>> {
        self.list_between(subject_id, domain, since, None).await
    }

    /// Observations with `since <= timestamp <= until`, ordered like
    /// [`Self::list_since`]. Superseded rows are included.
    pub async fn list_between(
        &self,
        subject_id: &str,
        domain: Option<Domain>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>> {
        let rows = sqlx::query_as::<_, ObservationRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM observations
             WHERE subject_id = ?
               AND (? IS NULL OR domain = ?)
               AND (? IS NULL OR observed_at >= ?)
               AND (? IS NULL OR observed_at <= ?)
             ORDER BY observed_at ASC, seq ASC"
        ))
        .bind(subject_id)
        .bind(domain.map(|domain| domain.as_str()))
        .bind(domain.map(|domain| domain.as_str()))
        .bind(since.map(to_millis))
        .bind(since.map(to_millis))
        .bind(until.map(to_millis))
        .bind(until.map(to_millis))
        .fetch_all(&self.pool)
        .await
        .context("failed to list observations")?;

        rows.into_iter()
            .map(ObservationRow::into_observation)
            .collect()
    }

    /// Skill-domain observations referencing one definition, up to `until`.
    pub async fn for_definition(
        &self,
        subject_id: &str,
        definition_id: &str,
        until: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let rows = sqlx::query_as::<_, ObservationRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM observations
             WHERE subject_id = ? AND definition_id = ? AND observed_at <= ?
             ORDER BY observed_at ASC, seq ASC"
        ))
        .bind(subject_id)
        .bind(definition_id)
        .bind(to_millis(until))
        .fetch_all(&self.pool)
        .await
        .context("failed to list observations for definition")?;

        rows.into_iter()
            .map(ObservationRow::into_observation)
            .collect()
    }

    /// Ids named by a correction observed at or before `as_of`.
    pub async fn superseded_ids(
        &self,
        subject_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT supersedes FROM observations
             WHERE subject_id = ? AND supersedes IS NOT NULL AND observed_at <= ?",
        )
        .bind(subject_id)
        .bind(to_millis(as_of))
        .fetch_all(&self.pool)
        .await
        .context("failed to list superseded observations")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Accepted events after `seq`, oldest first. Used to catch up after the
    /// event bus lagged.
    pub async fn accepted_after(&self, seq: i64, limit: i64) -> Result<Vec<ObservationAccepted>> {
        let rows: Vec<(i64, String, String, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT seq, id, subject_id, domain, definition_id, observed_at FROM observations
             WHERE seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to read observations after seq")?;

        rows.into_iter()
            .map(|(seq, id, subject_id, domain, definition_id, observed_at)| {
                Ok(ObservationAccepted {
                    observation_id: id,
                    seq,
                    subject_id,
                    domain: parse_column(&domain, "domain")?,
                    definition_id,
                    observed_at: from_millis(observed_at),
                })
            })
            .collect()
    }

    /// Highest assigned seq, 0 when empty.
    pub async fn last_seq(&self) -> Result<i64> {
        let (seq,): (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM observations")
            .fetch_one(&self.pool)
            .await
            .context("failed to read last seq")?;
        Ok(seq.unwrap_or(0))
    }
}

impl std::fmt::Debug for ObservationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationStore").finish_non_exhaustive()
    }
}

fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| anyhow::anyhow!("invalid {column} in database: {e}").into())
}

#[derive(sqlx::FromRow)]
struct ObservationRow {
    seq: i64,
    id: String,
    subject_id: String,
    domain: String,
    environment: Option<String>,
    reporter_id: String,
    reporter_role: String,
    observed_at: i64,
    recorded_at: i64,
    idempotency_key: String,
    supersedes: Option<String>,
    payload: String,
}

impl ObservationRow {
    fn into_observation(self) -> Result<Observation> {
        let domain: Domain = parse_column(&self.domain, "domain")?;
        let environment = self
            .environment
            .as_deref()
            .map(|value| parse_column::<Environment>(value, "environment"))
            .transpose()?;
        let role: Role = parse_column(&self.reporter_role, "reporter_role")?;
        let body: serde_json::Value =
            serde_json::from_str(&self.payload).context("invalid payload json in database")?;

        Ok(Observation {
            id: self.id,
            seq: self.seq,
            subject_id: self.subject_id,
            environment,
            reporter: Reporter {
                id: self.reporter_id,
                role,
            },
            observed_at: from_millis(self.observed_at),
            recorded_at: from_millis(self.recorded_at),
            idempotency_key: self.idempotency_key,
            supersedes: self.supersedes,
            payload: ObservationPayload::from_parts(domain, body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::types::{QualityDimension, QualityOfLifePayload};

    use chrono::{Duration, TimeZone as _};

    async fn setup() -> (ObservationStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("carecoord.db"))
            .await
            .unwrap();
        (ObservationStore::new(pool), dir)
    }

    fn rating(key: &str, rating: u8, observed_at: DateTime<Utc>) -> NewObservation {
        NewObservation {
            subject_id: "s1".into(),
            environment: Some(Environment::Home),
            reporter: Reporter {
                id: "p1".into(),
                role: Role::Parent,
            },
            observed_at,
            idempotency_key: key.into(),
            supersedes: None,
            payload: ObservationPayload::QualityOfLife(QualityOfLifePayload {
                dimension: QualityDimension::Social,
                rating,
                notes: None,
            }),
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn append_is_idempotent_per_key() {
        let (store, _dir) = setup().await;

        let first = store.append(&rating("k1", 6, at(1, 9))).await.unwrap();
        let second = store.append(&rating("k1", 6, at(1, 9))).await.unwrap();

        assert!(matches!(first, AppendOutcome::Accepted { .. }));
        assert_eq!(
            second,
            AppendOutcome::Duplicate {
                prior_id: first.id().to_string()
            }
        );
        let stored = store.list_since("s1", None, None).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn list_since_orders_by_timestamp_then_seq() {
        let (store, _dir) = setup().await;
        store.append(&rating("late", 5, at(3, 9))).await.unwrap();
        store.append(&rating("early", 4, at(1, 9))).await.unwrap();
        store.append(&rating("tie", 7, at(3, 9))).await.unwrap();

        let listed = store
            .list_since("s1", Some(Domain::QualityOfLife), Some(at(1, 0)))
            .await
            .unwrap();
        let keys: Vec<&str> = listed.iter().map(|o| o.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["early", "late", "tie"]);

        let recent = store
            .list_since("s1", None, Some(at(2, 0)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn accepted_events_are_published() {
        let (store, _dir) = setup().await;
        let mut events = store.subscribe();

        let outcome = store.append(&rating("k1", 6, at(1, 9))).await.unwrap();
        let event = events.recv().await.unwrap();

        assert_eq!(event.observation_id, outcome.id());
        assert_eq!(event.domain, Domain::QualityOfLife);
        assert_eq!(store.last_seq().await.unwrap(), event.seq);
        assert_eq!(store.accepted_after(0, 10).await.unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn corrections_must_target_same_subject_and_domain() {
        let (store, _dir) = setup().await;
        let original = store.append(&rating("k1", 2, at(1, 9))).await.unwrap();

        let mut correction = rating("k2", 7, at(1, 10));
        correction.supersedes = Some(original.id().to_string());
        store.append(&correction).await.unwrap();

        let superseded = store.superseded_ids("s1", at(2, 0)).await.unwrap();
        assert!(superseded.contains(original.id()));
        assert!(store.superseded_ids("s1", at(1, 9)).await.unwrap().is_empty());

        let mut dangling = rating("k3", 7, at(1, 11));
        dangling.supersedes = Some("missing".into());
        let error = store.append(&dangling).await.unwrap_err();
        assert!(matches!(error, Error::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn stored_rows_cannot_be_mutated() {
        let (store, _dir) = setup().await;
        store.append(&rating("k1", 6, at(1, 9))).await.unwrap();

        let result = sqlx::query("UPDATE observations SET payload = '{}'")
            .execute(&store.pool)
            .await;
        assert!(result.is_err());

        let listed = store
            .list_between("s1", None, None, Some(at(1, 9) + Duration::minutes(1)))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }
}
