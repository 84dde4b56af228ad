//! Append-only per-flow event journal.
//!
//! One stream per flow, keyed by flow id, with monotone integer sequence
//! numbers. The journal is the single source of truth for a flow: replaying
//! it from sequence zero rebuilds the actor's in-memory graph verbatim.
//! Snapshots are permitted by the interface but not required for correctness
//! and are not implemented.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;

use crate::model::{Event, FlowId, SequencedEvent};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("sequence conflict appending to flow {flow_id} at seq {seq}")]
    SequenceConflict { flow_id: FlowId, seq: u64 },
    #[error("journal backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Per-flow append-only log. Appends for one flow are ordered by the owning
/// actor; the journal only has to reject out-of-order writes.
#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Append `event` at exactly `seq` for the given flow.
    async fn append(&self, flow_id: FlowId, seq: u64, event: &Event) -> Result<(), JournalError>;

    /// Load every event for the flow, ordered by sequence number.
    async fn load(&self, flow_id: FlowId) -> Result<Vec<SequencedEvent>, JournalError>;
}

/// Process-local journal, the default for tests and single-node use.
#[derive(Default)]
pub struct InMemoryJournal {
    streams: Mutex<HashMap<FlowId, Vec<Event>>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventJournal for InMemoryJournal {
    async fn append(&self, flow_id: FlowId, seq: u64, event: &Event) -> Result<(), JournalError> {
        let mut streams = self.streams.lock().expect("journal lock poisoned");
        let stream = streams.entry(flow_id).or_default();
        if stream.len() as u64 != seq {
            return Err(JournalError::SequenceConflict { flow_id, seq });
        }
        stream.push(event.clone());
        Ok(())
    }

    async fn load(&self, flow_id: FlowId) -> Result<Vec<SequencedEvent>, JournalError> {
        let streams = self.streams.lock().expect("journal lock poisoned");
        Ok(streams
            .get(&flow_id)
            .map(|events| {
                events
                    .iter()
                    .enumerate()
                    .map(|(seq, event)| SequencedEvent {
                        flow_id,
                        seq: seq as u64,
                        event: event.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Postgres-backed journal. Events are stored as tagged JSON; the primary key
/// on (flow_id, seq) enforces append ordering.
pub struct SqlJournal {
    pool: PgPool,
}

impl SqlJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_events (
                flow_id UUID NOT NULL,
                seq BIGINT NOT NULL,
                event JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (flow_id, seq)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JournalError::Backend(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl EventJournal for SqlJournal {
    async fn append(&self, flow_id: FlowId, seq: u64, event: &Event) -> Result<(), JournalError> {
        let payload =
            serde_json::to_value(event).map_err(|e| JournalError::Backend(e.into()))?;
        let result = sqlx::query(
            "INSERT INTO flow_events (flow_id, seq, event) VALUES ($1, $2, $3) \
             ON CONFLICT (flow_id, seq) DO NOTHING",
        )
        .bind(flow_id.0)
        .bind(seq as i64)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| JournalError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(JournalError::SequenceConflict { flow_id, seq });
        }
        Ok(())
    }

    async fn load(&self, flow_id: FlowId) -> Result<Vec<SequencedEvent>, JournalError> {
        let rows = sqlx::query(
            "SELECT seq, event FROM flow_events WHERE flow_id = $1 ORDER BY seq ASC",
        )
        .bind(flow_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JournalError::Backend(e.into()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let payload: serde_json::Value = row.get("event");
            let event: Event =
                serde_json::from_value(payload).map_err(|e| JournalError::Backend(e.into()))?;
            events.push(SequencedEvent {
                flow_id,
                seq: seq as u64,
                event,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn committed(flow_id: FlowId) -> Event {
        Event::GraphCommitted {
            flow_id,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_and_load_preserve_order() {
        let journal = InMemoryJournal::new();
        let flow_id = FlowId::generate();
        let created = Event::GraphCreated {
            flow_id,
            function_id: "app/fn".into(),
            ts: Utc::now(),
        };
        journal.append(flow_id, 0, &created).await.unwrap();
        journal.append(flow_id, 1, &committed(flow_id)).await.unwrap();

        let events = journal.load(flow_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[0].event, created);
        assert_eq!(events[1].seq, 1);
    }

    #[tokio::test]
    async fn out_of_order_append_is_rejected() {
        let journal = InMemoryJournal::new();
        let flow_id = FlowId::generate();
        let err = journal.append(flow_id, 3, &committed(flow_id)).await;
        assert!(matches!(
            err,
            Err(JournalError::SequenceConflict { seq: 3, .. })
        ));
    }

    #[tokio::test]
    async fn unknown_flow_loads_empty() {
        let journal = InMemoryJournal::new();
        assert!(journal.load(FlowId::generate()).await.unwrap().is_empty());
    }
}
