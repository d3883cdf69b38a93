use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use cdc_postgres::time::POSTGRES_EPOCH;
use futures::Stream;
use pin_project_lite::pin_project;
use postgres_replication::ReplicationStream;
use postgres_replication::protocol::ReplicationMessage;
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;
use tracing::debug;

use crate::cdc_error;
use crate::error::{CdcError, CdcResult, ErrorKind};

/// Unforced status updates repeating the last reported positions are sent at most this often.
const REPEAT_REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Positions sent with the last status update.
#[derive(Debug, Clone, Copy)]
struct Report {
    flush: PgLsn,
    apply: PgLsn,
    sent_at: Instant,
}

pin_project! {
    /// Copy-both stream of one wal2json session.
    #[must_use = "streams do nothing unless polled"]
    pub struct WalStream {
        #[pin]
        inner: ReplicationStream,
        last_report: Option<Report>,
    }
}

impl WalStream {
    pub fn wrap(inner: ReplicationStream) -> Self {
        Self {
            inner,
            last_report: None,
        }
    }

    /// Sends a standby status update with the given positions.
    ///
    /// An unforced update is dropped when it repeats the flush and apply positions of an update
    /// sent less than [`REPEAT_REPORT_INTERVAL`] ago. The write position moves with every
    /// message and is not compared.
    pub async fn send_status_update(
        self: Pin<&mut Self>,
        write: PgLsn,
        flush: PgLsn,
        apply: PgLsn,
        force: bool,
    ) -> CdcResult<()> {
        let this = self.project();

        let repeated = this.last_report.is_some_and(|report| {
            report.flush == flush
                && report.apply == apply
                && report.sent_at.elapsed() < REPEAT_REPORT_INTERVAL
        });
        if repeated && !force {
            return Ok(());
        }

        // Microseconds since 2000-01-01, the server's clock origin.
        let now = POSTGRES_EPOCH.elapsed().map_err(|err| {
            cdc_error!(
                ErrorKind::InvalidState,
                "System clock is before the Postgres epoch",
                err
            )
        })?;

        this.inner
            .standby_status_update(write, flush, apply, now.as_micros() as i64, 0)
            .await?;
        *this.last_report = Some(Report {
            flush,
            apply,
            sent_at: Instant::now(),
        });

        debug!(%write, %flush, %apply, force, "sent standby status update");

        Ok(())
    }
}

impl Stream for WalStream {
    type Item = CdcResult<ReplicationMessage<Bytes>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .inner
            .poll_next(cx)
            .map(|message| message.map(|message| message.map_err(CdcError::from)))
    }
}
