use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cdc_config::shared::CdcConfig;
use cdc_postgres::replication::slots::validate_slot_name;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_postgres::types::PgLsn;
use tracing::{Instrument, error, info, warn};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::destination::Destination;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::replication::apply::{ApplyContext, CheckpointWriter, SessionExit, run_session};
use crate::replication::reconnect::ReconnectionManager;
use crate::replication::session::{PgSlotSource, SessionState, SlotSession, SlotSource};
use crate::router::Router;
use crate::state::position::PositionTracker;
use crate::store::state::{Checkpoint, StateStore};
use crate::types::{StreamCatalogEntry, TableName};
use crate::{bail, cdc_error};

/// Lifecycle of a pipeline.
///
/// `Idle → Streaming → Draining → Closed`, with `Reconnecting` entered from `Streaming` when the
/// session is lost and left again once the slot is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Streaming,
    Reconnecting,
    Draining,
    Closed,
}

#[derive(Debug)]
enum PipelineState {
    NotStarted {
        flow_tx: watch::Sender<FlowState>,
    },
    Started {
        handle: Option<JoinHandle<CdcResult<()>>>,
    },
}

/// Captures the changes of the enabled catalog streams from one replication slot.
#[derive(Debug)]
pub struct Pipeline<Src, St, D> {
    config: Arc<CdcConfig>,
    catalog: Arc<Vec<StreamCatalogEntry>>,
    source: Option<Src>,
    store: St,
    destination: D,
    state: PipelineState,
    flow_rx: watch::Receiver<FlowState>,
    shutdown_tx: ShutdownTx,
}

impl<St, D> Pipeline<PgSlotSource, St, D>
where
    St: StateStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    /// Creates a pipeline streaming from the Postgres server in `config`.
    pub fn for_postgres(
        config: CdcConfig,
        catalog: Vec<StreamCatalogEntry>,
        store: St,
        destination: D,
    ) -> Self {
        let source = PgSlotSource::new(config.pg_connection.clone());
        Self::new(config, catalog, source, store, destination)
    }
}

impl<Src, St, D> Pipeline<Src, St, D>
where
    Src: SlotSource + Send + Sync + 'static,
    St: StateStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: CdcConfig,
        catalog: Vec<StreamCatalogEntry>,
        source: Src,
        store: St,
        destination: D,
    ) -> Self {
        // Receivers are created on demand with `subscribe`.
        let (shutdown_tx, _) = create_shutdown_channel();
        let (flow_tx, flow_rx) = watch::channel(FlowState::Idle);

        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            source: Some(source),
            store,
            destination,
            state: PipelineState::NotStarted { flow_tx },
            flow_rx,
            shutdown_tx,
        }
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Returns the current flow state.
    pub fn state(&self) -> FlowState {
        *self.flow_rx.borrow()
    }

    /// Returns a receiver notified on every flow state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<FlowState> {
        self.flow_rx.clone()
    }

    /// Validates the configuration, checks the stream selection against the last checkpoint and
    /// spawns the flow controller.
    ///
    /// Fails with [`ErrorKind::ResyncRequired`] when a stream was enabled after the last
    /// checkpoint and [`CdcConfig::resync_on_reselect`] is set.
    pub async fn start(&mut self) -> CdcResult<()> {
        let PipelineState::NotStarted { .. } = &self.state else {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline already started",
                "A pipeline can only be started once"
            );
        };

        self.config.validate().map_err(|err| {
            cdc_error!(
                ErrorKind::ConfigError,
                "Invalid pipeline configuration",
                err.to_string(),
                source: err
            )
        })?;
        validate_slot_name(&self.config.slot_name)?;

        info!(slot_name = %self.config.slot_name, "starting pipeline");

        let router = Router::new(self.catalog.clone());
        let tables = router.enabled_tables();
        let streams: BTreeSet<String> = tables.iter().map(TableName::stream_name).collect();

        let checkpoint = self.store.load_checkpoint(&self.config.slot_name).await?;
        check_reselection(
            checkpoint.as_ref(),
            &streams,
            self.config.resync_on_reselect,
        )?;

        let resume_position = checkpoint.as_ref().map(|checkpoint| checkpoint.position);
        match resume_position {
            Some(position) => info!(%position, "resuming from persisted checkpoint"),
            None => info!("no persisted checkpoint, starting from the slot"),
        }

        // A changed selection must be written even if the position does not move.
        let last_persisted = checkpoint
            .filter(|checkpoint| checkpoint.streams == streams)
            .map(|checkpoint| checkpoint.position);

        let Some(source) = self.source.take() else {
            bail!(ErrorKind::InvalidState, "Pipeline source already taken");
        };
        let PipelineState::NotStarted { flow_tx } = std::mem::replace(
            &mut self.state,
            PipelineState::Started { handle: None },
        ) else {
            bail!(ErrorKind::InvalidState, "Pipeline already started");
        };

        let controller = FlowController {
            config: self.config.clone(),
            source,
            ctx: ApplyContext {
                config: self.config.clone(),
                router,
                destination: self.destination.clone(),
                checkpoints: CheckpointWriter::new(
                    self.store.clone(),
                    self.config.slot_name.clone(),
                    streams,
                    last_persisted,
                ),
                sequence: 0,
            },
            tables,
            resume_position,
            flow_tx,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        let span = tracing::info_span!("cdc_pipeline", slot_name = %self.config.slot_name);
        let handle = tokio::spawn(controller.run().instrument(span));
        self.state = PipelineState::Started {
            handle: Some(handle),
        };

        Ok(())
    }

    /// Waits for the flow controller to finish.
    ///
    /// Fatal errors carry the last confirmed position, see [`CdcError::last_confirmed`].
    pub async fn wait(mut self) -> CdcResult<()> {
        let PipelineState::Started { handle } = &mut self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };
        let Some(handle) = handle.take() else {
            return Ok(());
        };

        info!("waiting for the flow controller to complete");

        let mut errors = vec![];

        let result = handle.await.map_err(|err| {
            if err.is_cancelled() {
                cdc_error!(
                    ErrorKind::PipelineCancelled,
                    "Flow controller was cancelled",
                    err
                )
            } else {
                cdc_error!(ErrorKind::PipelinePanic, "Flow controller panicked", err)
            }
        });
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) | Err(err) => errors.push(err),
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        info!("trying to shut down the pipeline");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the pipeline: {}", err);
            return;
        }

        info!("shut down signal successfully sent to the flow controller");
    }

    pub async fn shutdown_and_wait(self) -> CdcResult<()> {
        self.shutdown();
        self.wait().await
    }
}

/// Compares the enabled streams with the ones recorded at the last checkpoint.
///
/// Streams enabled since then have no history in the slot before that checkpoint. Without a
/// checkpoint there is nothing to compare against.
fn check_reselection(
    checkpoint: Option<&Checkpoint>,
    streams: &BTreeSet<String>,
    resync_on_reselect: bool,
) -> CdcResult<()> {
    let Some(checkpoint) = checkpoint else {
        return Ok(());
    };

    let added = streams
        .difference(&checkpoint.streams)
        .cloned()
        .collect::<Vec<_>>();
    if added.is_empty() {
        return Ok(());
    }

    if resync_on_reselect {
        let err = cdc_error!(
            ErrorKind::ResyncRequired,
            "Streams were enabled after the last checkpoint",
            format!(
                "Streams {} were not captured before position {} and need a resynchronization",
                added.join(", "),
                checkpoint.position
            )
        );

        return Err(err.with_last_confirmed(checkpoint.position));
    }

    warn!(
        streams = %added.join(", "),
        position = %checkpoint.position,
        "streams enabled after the last checkpoint only receive changes from now on"
    );

    Ok(())
}

/// Outcome of waiting for something while shutdown may be requested.
enum Interruptible<T> {
    Done(T),
    ShutdownRequested,
}

/// Drives the sessions of one pipeline through the flow states.
struct FlowController<Src, St, D> {
    config: Arc<CdcConfig>,
    source: Src,
    ctx: ApplyContext<D, St>,
    tables: Vec<TableName>,
    resume_position: Option<PgLsn>,
    flow_tx: watch::Sender<FlowState>,
    shutdown_rx: ShutdownRx,
}

impl<Src, St, D> FlowController<Src, St, D>
where
    Src: SlotSource + Send + Sync,
    St: StateStore + Send + Sync,
    D: Destination + Send + Sync,
{
    async fn run(mut self) -> CdcResult<()> {
        let mut manager = ReconnectionManager::new(self.config.reconnection.clone());
        let mut tracker: Option<Mutex<PositionTracker>> = None;

        loop {
            let opened = match self.open().await {
                Interruptible::Done(opened) => opened,
                Interruptible::ShutdownRequested => {
                    self.transition(FlowState::Draining);
                    self.finish().await?;

                    return Ok(());
                }
            };

            let session = match opened {
                Ok(session) => session,
                Err(err) if manager.should_retry(&err) => {
                    if self.retry_after(&mut manager, err).await? {
                        continue;
                    }

                    return Ok(());
                }
                Err(err) => {
                    let err = exhausted_or(err, &mut manager);
                    return Err(self.fail(err, tracker.as_ref()).await);
                }
            };

            let start = session.start_position();
            let tracker: &Mutex<PositionTracker> =
                tracker.get_or_insert_with(|| Mutex::new(PositionTracker::new(start)));
            {
                // Opening a session reports its start as flushed to the server.
                let mut tracker = tracker.lock().await;
                if start > tracker.last_flushed() && start <= tracker.confirmed() {
                    tracker.flushed(start);
                }
            }

            if manager.attempt_count() > 0 {
                let downtime = manager.total_retry_duration().unwrap_or_default();
                info!(
                    resume_lsn = %start,
                    total_downtime_ms = downtime.as_millis() as u64,
                    "reconnection successful, resuming replication"
                );
            }

            self.transition(FlowState::Streaming);

            let outcome = run_session(
                SessionState::new(self.config.slot_name.clone(), session),
                &mut self.ctx,
                tracker,
                self.shutdown_rx.clone(),
            )
            .await;

            if outcome.made_progress {
                manager.record_success();
            }

            let err = match outcome.result {
                Ok(SessionExit::Shutdown) | Ok(SessionExit::IdleStop) => {
                    self.transition(FlowState::Draining);
                    if let Err(err) = self.drain(outcome.session, tracker).await {
                        return Err(self.fail(err, Some(tracker)).await);
                    }
                    self.finish().await?;

                    return Ok(());
                }
                Ok(SessionExit::Closed) => cdc_error!(
                    ErrorKind::SourceConnectionFailed,
                    "Replication stream closed by the server"
                ),
                Err(err) => err,
            };

            if manager.should_retry(&err) {
                // The next session reports its start as flushed, so it has to be durable first.
                if let Err(persist_err) = self.ctx.checkpoints.write(tracker).await {
                    return Err(self.fail(persist_err, Some(tracker)).await);
                }
                if let Err(close_err) = outcome.session.close().await {
                    warn!(error = %close_err, "failed to close the interrupted session");
                }

                let confirmed = tracker.lock().await.confirmed();
                self.resume_position = Some(confirmed);
                manager.set_resume_position(confirmed);

                if self.retry_after(&mut manager, err).await? {
                    continue;
                }

                return Ok(());
            }

            error!(error = %err, "stopping pipeline on fatal error");

            self.transition(FlowState::Draining);
            if let Err(drain_err) = self.drain(outcome.session, tracker).await {
                warn!(error = %drain_err, "failed to drain the session after a fatal error");
            }

            let err = exhausted_or(err, &mut manager);
            return Err(self.fail(err, Some(tracker)).await);
        }
    }

    /// Opens the next session unless shutdown is requested first.
    async fn open(&mut self) -> Interruptible<CdcResult<Src::Session>> {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => Interruptible::ShutdownRequested,
            opened = self.source.open(&self.config.slot_name, self.resume_position, &self.tables) => {
                Interruptible::Done(opened)
            }
        }
    }

    /// Records a retryable `err` and waits for the backoff.
    ///
    /// Returns `true` when the slot should be reopened and `false` when shutdown was requested
    /// while waiting, in which case the pipeline is already closed.
    async fn retry_after(
        &mut self,
        manager: &mut ReconnectionManager,
        err: CdcError,
    ) -> CdcResult<bool> {
        manager.record_failure(err.clone());
        let delay = manager.calculate_backoff();
        self.transition(FlowState::Reconnecting);

        warn!(
            error = %err,
            resume_position = ?manager.resume_position(),
            attempt = manager.attempt_count(),
            delay_ms = delay.as_millis() as u64,
            "replication session lost, reconnecting after backoff"
        );

        match self.sleep(delay).await {
            Interruptible::Done(()) => Ok(true),
            Interruptible::ShutdownRequested => {
                self.transition(FlowState::Draining);
                self.finish().await?;

                Ok(false)
            }
        }
    }

    /// Takes the final checkpoint, acknowledges it and closes the session.
    async fn drain<S: SlotSession>(
        &mut self,
        mut session: SessionState<S>,
        tracker: &Mutex<PositionTracker>,
    ) -> CdcResult<()> {
        self.ctx.checkpoints.write(tracker).await?;

        // The candidate is the checkpoint just persisted.
        let candidate = tracker.lock().await.candidate();
        if let Some(position) = candidate
            && position > session.last_flushed()
        {
            match session.acknowledge(position).await {
                Ok(()) => tracker.lock().await.flushed(position),
                Err(err) => {
                    warn!(%position, error = %err, "failed to acknowledge the final checkpoint")
                }
            }
        }

        let unflushed = tracker.lock().await.has_unflushed();
        info!(last_flushed = %session.last_flushed(), unflushed, "pipeline drained");

        session.close().await
    }

    /// Propagates the shutdown to the destination and closes the pipeline.
    async fn finish(&mut self) -> CdcResult<()> {
        let result = self.ctx.destination.shutdown().await;
        self.transition(FlowState::Closed);

        result
    }

    /// Closes the pipeline after a fatal error and stamps the error with the last confirmed
    /// position.
    async fn fail(&mut self, err: CdcError, tracker: Option<&Mutex<PositionTracker>>) -> CdcError {
        if let Err(finish_err) = self.finish().await {
            warn!(error = %finish_err, "failed to shut down the destination");
        }

        let confirmed = match tracker {
            Some(tracker) => Some(tracker.lock().await.confirmed()),
            None => self.resume_position,
        };

        match confirmed {
            Some(position) => err.with_last_confirmed(position),
            None => err,
        }
    }

    async fn sleep(&mut self, delay: Duration) -> Interruptible<()> {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => Interruptible::ShutdownRequested,
            _ = tokio::time::sleep(delay) => Interruptible::Done(()),
        }
    }

    fn transition(&self, state: FlowState) {
        let previous = self.flow_tx.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "flow state changed");
        }
    }
}

/// Replaces an error that would have been retried by [`ErrorKind::ReconnectionExhausted`] when
/// the retry budget is spent.
fn exhausted_or(err: CdcError, manager: &mut ReconnectionManager) -> CdcError {
    if !(manager.config().enabled && manager.is_retryable(&err) && manager.is_exhausted()) {
        manager.mark_failed(err.to_string());
        return err;
    }

    let duration = manager.total_retry_duration().unwrap_or_default();
    error!(
        attempts = manager.attempt_count(),
        total_duration_ms = duration.as_millis() as u64,
        "reconnection failed, max retries exceeded"
    );
    manager.mark_failed("reconnection attempts exhausted".to_string());

    cdc_error!(
        ErrorKind::ReconnectionExhausted,
        "Reconnection attempts exhausted",
        format!(
            "Gave up after {} attempts over {} ms",
            manager.attempt_count(),
            duration.as_millis()
        ),
        source: err
    )
}
