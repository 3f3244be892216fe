//! One polling pass of the outbox: list unsent changes, publish them, mark
//! the published ones sent.

use super::record::{ChangeRecord, ObjectType};
use crate::LedgerClient;
use crate::connection::config::settle_window;
use crate::core::{DbError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// Destination for change notifications, e.g. a message bus topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes one change. An `Err` leaves the change unsent so a later
    /// pass delivers it again.
    async fn publish(&self, message: &ChangeRecord) -> Result<()>;
}

/// Outcome of one [`Dispatcher::dispatch_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub listed: usize,
    pub published: usize,
    pub failed: usize,
    pub registered: usize,
}

pub struct Dispatcher<P> {
    client: LedgerClient,
    publisher: P,
    settle_delay: Option<chrono::Duration>,
    concurrency: usize,
}

impl<P: MessagePublisher> Dispatcher<P> {
    /// A dispatcher using the ledger's configured settle delay.
    pub fn new(client: LedgerClient, publisher: P) -> Self {
        let configured = client.db().config().dispatch_settle_delay;
        // Opening the ledger already validated the configured delay.
        let settle_delay = if configured.is_zero() {
            None
        } else {
            settle_window(configured).ok()
        };
        Self {
            client,
            publisher,
            settle_delay,
            concurrency: 1,
        }
    }

    /// Skip changes younger than `delay`, so writers still committing
    /// nearby numbers are not overtaken.
    ///
    /// # Errors
    /// `InvalidArgument` when `delay` reaches back past the earliest
    /// representable timestamp.
    pub fn with_settle_delay(mut self, delay: Duration) -> Result<Self> {
        self.settle_delay = Some(settle_window(delay)?);
        Ok(self)
    }

    /// Publishes up to `concurrency` messages at once, keeping their order.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Publishes up to `limit` unsent changes and marks the successful ones
    /// sent. Delivery is at least once: a crash between publish and mark
    /// republishes on the next pass.
    pub async fn dispatch_once(&self, limit: i64) -> Result<DispatchReport> {
        let span = info_span!("ledger.dispatch", limit = limit);
        self.dispatch_inner(limit).instrument(span).await
    }

    async fn dispatch_inner(&self, limit: i64) -> Result<DispatchReport> {
        let mut conn = self.client.connect().await?;
        let older_than = match self.settle_delay {
            Some(window) => Some(Utc::now().checked_sub_signed(window).ok_or_else(|| {
                DbError::InvalidArgument("settle delay reaches before the epoch range".into())
            })?),
            None => None,
        };
        let unsent = conn
            .unsent()
            .list_unsent_messages_windowed(limit, older_than)
            .await?;

        let outcomes: Vec<(&ChangeRecord, Result<()>)> = stream::iter(unsent.iter())
            .map(|message| async move { (message, self.publisher.publish(message).await) })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = DispatchReport {
            listed: unsent.len(),
            ..DispatchReport::default()
        };
        let mut published: BTreeMap<ObjectType, Vec<ChangeRecord>> = BTreeMap::new();
        for (message, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    report.published += 1;
                    if let Some(object_type) = message.object_type {
                        published
                            .entry(object_type)
                            .or_default()
                            .push(message.clone());
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    event!(
                        Level::WARN,
                        change_number = message.change_number,
                        error = %err,
                        "publish failed, change stays unsent"
                    );
                }
            }
        }

        for (object_type, batch) in &published {
            report.registered += conn
                .sent_messages()
                .register_messages_sent(*object_type, batch)
                .await?;
        }
        conn.close().await?;

        event!(
            Level::INFO,
            listed = report.listed,
            published = report.published,
            failed = report.failed,
            registered = report.registered,
            "dispatch pass finished"
        );
        Ok(report)
    }
}
