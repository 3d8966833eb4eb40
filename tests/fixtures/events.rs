//! Event stream helpers.

use anyhow::{Context, Result, anyhow};
use courier_core::events::{ConnectionUpdate, Event, EventBatch, EventStream};
use courier_core::ConnectionState;
use std::collections::VecDeque;

use super::TEST_TIMEOUT;

/// Reads events one at a time out of batches
pub struct EventProbe {
    stream: EventStream,
    pending: VecDeque<Event>,
}

impl EventProbe {
    /// Wrap a client's event stream.
    pub fn new(stream: EventStream) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
        }
    }

    /// Next whole batch, dropping any partially read one.
    pub async fn next_batch(&mut self) -> Result<EventBatch> {
        self.pending.clear();
        tokio::time::timeout(TEST_TIMEOUT, self.stream.recv())
            .await
            .context("timed out waiting for an event batch")?
            .ok_or_else(|| anyhow!("event stream closed"))
    }

    /// First batch accepted by `predicate`.
    pub async fn batch_matching<F>(&mut self, predicate: F) -> Result<EventBatch>
    where
        F: Fn(&EventBatch) -> bool,
    {
        loop {
            let batch = self.next_batch().await?;
            if predicate(&batch) {
                return Ok(batch);
            }
        }
    }

    /// Next single event.
    pub async fn next(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let batch = tokio::time::timeout(TEST_TIMEOUT, self.stream.recv())
                .await
                .context("timed out waiting for an event")?
                .ok_or_else(|| anyhow!("event stream closed"))?;
            self.pending.extend(batch);
        }
    }

    /// First event accepted by `predicate`.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Result<Event>
    where
        F: Fn(&Event) -> bool,
    {
        loop {
            let event = self.next().await?;
            if predicate(&event) {
                return Ok(event);
            }
        }
    }

    /// First connection update reaching `state`.
    pub async fn wait_for_state(&mut self, state: ConnectionState) -> Result<ConnectionUpdate> {
        match self
            .wait_for(|event| matches!(event, Event::ConnectionUpdate(u) if u.state == state))
            .await?
        {
            Event::ConnectionUpdate(update) => Ok(update),
            other => Err(anyhow!("unexpected event {:?}", other.kind())),
        }
    }
}
