//! Ordered interceptor chain wrapped around every RPC handler.
//!
//! Each stage gets a `before` hook on the way in and an `after` hook on the
//! way out. A failing `before` short-circuits the call; `after` then runs,
//! in reverse order, for exactly the stages whose `before` was invoked.
//! Stages after the recovery stage, and the handler itself, run under
//! panic protection. Streaming calls use the same chain; the `after` hooks
//! fire when the wrapped stream finishes or is dropped.

mod context;
pub mod stages;

use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream};
use serde_json::Value;

use crate::error::{Code, Status};

pub use context::CallContext;

pub type CallResult = Result<Value, Status>;
pub type CallStream = BoxStream<'static, CallResult>;

/// One stage of the chain
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stages after this one, and the handler, are protected from panics.
    fn recovers_panics(&self) -> bool {
        false
    }

    async fn before(&self, _ctx: &mut CallContext, _request: &Value) -> Result<(), Status> {
        Ok(())
    }

    async fn after(&self, _ctx: &CallContext, _outcome: &Result<(), Status>) {}
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            stages: Arc::new(stages),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    fn recovery_split(&self) -> usize {
        self.stages
            .iter()
            .position(|s| s.recovers_panics())
            .map(|idx| idx + 1)
            .unwrap_or(0)
    }

    async fn run_befores(
        &self,
        range: Range<usize>,
        ctx: &mut CallContext,
        request: &Value,
        entered: &mut usize,
    ) -> Result<(), Status> {
        for idx in range {
            *entered = idx + 1;
            self.stages[idx].before(ctx, request).await?;
        }
        Ok(())
    }

    async fn run_afters(&self, ctx: &CallContext, entered: usize, outcome: &Result<(), Status>) {
        for stage in self.stages[..entered].iter().rev() {
            stage.after(ctx, outcome).await;
        }
    }

    /// Run every `before`, then the handler; returns the result together
    /// with how many stages were entered.
    async fn run_chain<T, F>(
        &self,
        ctx: &mut CallContext,
        request: Value,
        handler: F,
    ) -> (Result<T, Status>, usize)
    where
        T: Send,
        F: FnOnce(CallContext, Value) -> BoxFuture<'static, Result<T, Status>> + Send,
    {
        let split = self.recovery_split();
        let mut entered = 0usize;

        if let Err(status) = self.run_befores(0..split, ctx, &request, &mut entered).await {
            return (Err(status), entered);
        }

        let len = self.stages.len();
        let guarded = async {
            if let Err(status) = self.run_befores(split..len, ctx, &request, &mut entered).await {
                return Err(status);
            }

            if ctx.cancel.is_cancelled() {
                return Err(Status::cancelled());
            }
            ctx.handler_invoked = true;
            let cancel = ctx.cancel.clone();
            let call = handler(ctx.clone(), request);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Status::cancelled()),
                result = call => result,
            }
        };

        let result = if split > 0 {
            match AssertUnwindSafe(guarded).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    ctx.panic = Some(message.clone());
                    Err(Status::internal(format!("panic in {}: {message}", ctx.method)))
                }
            }
        } else {
            guarded.await
        };

        (result, entered)
    }

    /// Unary call.
    pub async fn invoke<F>(&self, mut ctx: CallContext, request: Value, handler: F) -> CallResult
    where
        F: FnOnce(CallContext, Value) -> BoxFuture<'static, CallResult> + Send,
    {
        let (result, entered) = self.run_chain(&mut ctx, request, handler).await;
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.run_afters(&ctx, entered, &outcome).await;
        result
    }

    /// Server-streaming call. The chain is evaluated once, up front; the
    /// returned stream carries the enriched context and completes the chain
    /// when it ends.
    pub async fn invoke_stream<F>(
        &self,
        mut ctx: CallContext,
        request: Value,
        handler: F,
    ) -> Result<WrappedStream, Status>
    where
        F: FnOnce(CallContext, Value) -> BoxFuture<'static, Result<CallStream, Status>> + Send,
    {
        ctx.streaming = true;
        let (result, entered) = self.run_chain(&mut ctx, request, handler).await;
        match result {
            Ok(inner) => Ok(WrappedStream {
                inner,
                pipeline: self.clone(),
                ctx,
                entered,
                finished: false,
            }),
            Err(status) => {
                self.run_afters(&ctx, entered, &Err(status.clone())).await;
                Err(status)
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handler stream plus the pending `after` hooks of its call.
pub struct WrappedStream {
    inner: CallStream,
    pipeline: Pipeline,
    ctx: CallContext,
    entered: usize,
    finished: bool,
}

impl WrappedStream {
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn finish(&mut self, outcome: Result<(), Status>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let pipeline = self.pipeline.clone();
        let ctx = self.ctx.clone();
        let entered = self.entered;
        let task = async move { pipeline.run_afters(&ctx, entered, &outcome).await };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => {
                tracing::warn!(method = %self.ctx.method, "No runtime to complete stream call")
            }
        }
    }
}

impl Stream for WrappedStream {
    type Item = CallResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if this.ctx.cancel.is_cancelled() {
            this.finish(Err(Status::cancelled()));
            return Poll::Ready(None);
        }

        let inner = &mut this.inner;
        let polled = std::panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll_next(cx)));
        match polled {
            Ok(Poll::Ready(None)) => {
                this.finish(Ok(()));
                Poll::Ready(None)
            }
            Ok(Poll::Ready(Some(Err(status)))) => {
                // an error ends the stream
                this.finish(Err(status.clone()));
                Poll::Ready(Some(Err(status)))
            }
            Ok(other) => other,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                this.ctx.panic = Some(message.clone());
                let status = Status::internal(format!("panic in {}: {message}", this.ctx.method));
                this.finish(Err(status.clone()));
                Poll::Ready(Some(Err(status)))
            }
        }
    }
}

impl Drop for WrappedStream {
    fn drop(&mut self) {
        // consumer went away mid-stream
        self.finish(Err(Status::new(Code::Cancelled, "stream dropped")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
        recovers: bool,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn recovers_panics(&self) -> bool {
            self.recovers
        }

        async fn before(&self, _ctx: &mut CallContext, _request: &Value) -> Result<(), Status> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            if self.fail {
                return Err(Status::permission_denied(self.name));
            }
            Ok(())
        }

        async fn after(&self, _ctx: &CallContext, outcome: &Result<(), Status>) {
            let tag = if outcome.is_ok() { "ok" } else { "err" };
            self.log
                .lock()
                .unwrap()
                .push(format!("after:{}:{tag}", self.name));
        }
    }

    fn stage(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail: bool,
        recovers: bool,
    ) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            fail,
            recovers,
        })
    }

    fn ctx() -> CallContext {
        CallContext::new("/test.v1.TestService/Call", Default::default())
    }

    #[tokio::test]
    async fn stages_run_in_order_and_unwind_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            stage("a", &log, false, false),
            stage("b", &log, false, true),
            stage("c", &log, false, false),
        ]);

        let result = pipeline
            .invoke(ctx(), Value::Null, |_, _| async { Ok(Value::from(7)) }.boxed())
            .await;
        assert_eq!(result.unwrap(), Value::from(7));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "before:c", "after:c:ok", "after:b:ok", "after:a:ok"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_handler_and_later_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            stage("a", &log, false, false),
            stage("deny", &log, true, false),
            stage("c", &log, false, false),
        ]);

        let ran = Arc::new(Mutex::new(false));
        let ran_in_handler = ran.clone();
        let err = pipeline
            .invoke(ctx(), Value::Null, move |_, _| {
                async move {
                    *ran_in_handler.lock().unwrap() = true;
                    Ok(Value::Null)
                }
                .boxed()
            })
            .await
            .unwrap_err();

        assert_eq!(err.code, Code::PermissionDenied);
        assert!(!*ran.lock().unwrap());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:deny", "after:deny:err", "after:a:err"]
        );
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            stage("outer", &log, false, false),
            stage("recovery", &log, false, true),
        ]);

        let err = pipeline
            .invoke(ctx(), Value::Null, |_, _| {
                async {
                    if true {
                        panic!("boom");
                    }
                    Ok(Value::Null)
                }
                .boxed()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert_eq!(log.lock().unwrap().last().unwrap(), "after:outer:err");
    }

    #[tokio::test]
    async fn cancelled_call_never_reaches_handler() {
        let pipeline = Pipeline::new(Vec::new());
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = pipeline
            .invoke(ctx, Value::Null, |_, _| async { Ok(Value::Null) }.boxed())
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Cancelled);
    }

    #[tokio::test]
    async fn stream_completion_runs_afters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![stage("a", &log, false, true)]);

        let stream = pipeline
            .invoke_stream(ctx(), Value::Null, |ctx, _| {
                async move {
                    assert!(ctx.streaming);
                    let items = futures::stream::iter(vec![Ok(Value::from(1)), Ok(Value::from(2))]);
                    Ok(items.boxed())
                }
                .boxed()
            })
            .await
            .unwrap();

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);

        // afters are spawned; give the task a turn
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["before:a", "after:a:ok"]);
    }

    #[tokio::test]
    async fn dropped_stream_reports_cancellation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![stage("a", &log, false, false)]);

        let stream = pipeline
            .invoke_stream(ctx(), Value::Null, |_, _| {
                async { Ok(futures::stream::pending::<CallResult>().boxed()) }.boxed()
            })
            .await
            .unwrap();
        drop(stream);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["before:a", "after:a:err"]);
    }
}
