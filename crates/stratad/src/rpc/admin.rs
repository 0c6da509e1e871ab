//! AdminService handlers

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{decode, to_value, Services};
use crate::error::{Status, Violations};
use crate::log_buffer::{LogRecord, Subscription};
use crate::pipeline::{CallContext, CallResult, CallStream};

const DEFAULT_BACKLOG: usize = 100;
const DEFAULT_HEARTBEAT_SECS: u64 = 15;
const MAX_HEARTBEAT_SECS: u64 = 300;
const DEFAULT_AUDIT_PAGE: usize = 100;
const MAX_AUDIT_PAGE: usize = 1000;

pub async fn get_config(services: Arc<Services>, _ctx: CallContext, _request: Value) -> CallResult {
    Ok(services.config.sanitized())
}

pub async fn shutdown(services: Arc<Services>, ctx: CallContext, _request: Value) -> CallResult {
    tracing::warn!(
        user_id = %ctx.user_id().unwrap_or("unknown"),
        request_id = %ctx.request_id,
        "Shutdown requested over RPC"
    );
    services.shutdown.notify_one();
    Ok(json!({ "status": "shutting_down" }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TailLogsRequest {
    /// Recent records replayed before going live
    pub backlog: Option<usize>,
    pub heartbeat_secs: Option<u64>,
}

struct Tail {
    backlog: VecDeque<LogRecord>,
    subscription: Subscription,
    heartbeat: tokio::time::Interval,
    cancel: tokio_util::sync::CancellationToken,
}

enum Next {
    Record(LogRecord),
    Heartbeat,
    Done,
}

impl Tail {
    async fn next(&mut self) -> Next {
        if let Some(record) = self.backlog.pop_front() {
            return Next::Record(record);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Next::Done,
            record = self.subscription.recv() => record.map_or(Next::Done, Next::Record),
            _ = self.heartbeat.tick() => Next::Heartbeat,
        }
    }
}

/// Backlog first, then live records, with heartbeats while idle.
pub async fn tail_logs(
    services: Arc<Services>,
    ctx: CallContext,
    request: Value,
) -> Result<CallStream, Status> {
    let req: TailLogsRequest = decode(request)?;
    let heartbeat_secs = req.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS);
    let mut violations = Violations::new();
    if heartbeat_secs == 0 || heartbeat_secs > MAX_HEARTBEAT_SECS {
        violations.push(
            "heartbeat_secs",
            format!("must be between 1 and {MAX_HEARTBEAT_SECS}"),
        );
    }
    violations.into_result()?;

    // subscribe before the snapshot so nothing falls in between
    let subscription = services.log_buffer.subscribe();
    let backlog = services
        .log_buffer
        .recent(req.backlog.unwrap_or(DEFAULT_BACKLOG))
        .into();

    let period = Duration::from_secs(heartbeat_secs);
    let tail = Tail {
        backlog,
        subscription,
        heartbeat: tokio::time::interval_at(tokio::time::Instant::now() + period, period),
        cancel: ctx.cancel.clone(),
    };

    let stream = futures::stream::unfold(tail, |mut tail| async move {
        match tail.next().await {
            Next::Record(record) => Some((Ok(json!({ "record": record })), tail)),
            Next::Heartbeat => Some((Ok(json!({ "heartbeat": Utc::now() })), tail)),
            Next::Done => None,
        }
    });
    Ok(stream.boxed())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListAuditEntriesRequest {
    pub after_seq: u64,
    pub limit: Option<usize>,
}

pub async fn list_audit_entries(
    services: Arc<Services>,
    _ctx: CallContext,
    request: Value,
) -> CallResult {
    let req: ListAuditEntriesRequest = decode(request)?;
    let limit = req.limit.unwrap_or(DEFAULT_AUDIT_PAGE);
    let mut violations = Violations::new();
    if limit == 0 || limit > MAX_AUDIT_PAGE {
        violations.push("limit", format!("must be between 1 and {MAX_AUDIT_PAGE}"));
    }
    violations.into_result()?;

    let entries = services
        .audit
        .list(req.after_seq, limit)
        .map_err(Status::internal)?;
    let total = services.audit.count().map_err(Status::internal)?;
    let next_after_seq = entries.last().map_or(req.after_seq, |e| e.seq);

    Ok(json!({
        "entries": entries,
        "total": total,
        "next_after_seq": next_after_seq,
    }))
}

pub async fn verify_audit_chain(
    services: Arc<Services>,
    _ctx: CallContext,
    _request: Value,
) -> CallResult {
    let report = services.audit.verify().map_err(Status::internal)?;
    if report.valid {
        tracing::info!(entries = report.entries_checked, "Audit chain verified");
    } else {
        tracing::error!(
            first_broken_seq = ?report.first_broken_seq,
            reason = ?report.reason,
            "Audit chain verification failed"
        );
    }
    to_value(&report)
}
