use crate::context::ExecutionContext;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Instrument, info_span};

/// A single processing stage in the chain (C2, §4.2, GLOSSARY).
///
/// `next` is consumed by value: Rust's ownership rules make "call `next` at
/// most once" a compile-time guarantee rather than the runtime-checked
/// invariant the source language needed (§9 design note). Not calling
/// `next` at all is valid and aborts the chain at this middleware; the
/// post-order unwind (rule 4, §4.2) falls out of ordinary Rust stack
/// unwinding through the `.await` points below.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// The remaining links of the chain, handed to a middleware so it can
/// invoke the next stage. Calling `call` recurses one step and returns
/// the accumulated result of everything downstream.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    index: usize,
}

impl<'a> Next<'a> {
    fn new(middlewares: &'a [Arc<dyn Middleware>]) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invoke the next middleware in the chain, or return `Ok(())` as the
    /// tail no-op if the chain is exhausted (§4.2: "Tail `next` is a no-op
    /// that returns nil").
    pub async fn call(self, ctx: &mut ExecutionContext) -> Result<()> {
        match self.middlewares.get(self.index) {
            None => Ok(()),
            Some(mw) => {
                let next = Next {
                    middlewares: self.middlewares,
                    index: self.index + 1,
                };
                let span = info_span!("middleware", name = mw.name());
                mw.process(ctx, next).instrument(span).await
            }
        }
    }
}

/// Ordered, reentrant-safe invocation of middlewares (C2). Immutable after
/// construction; a fresh `Next` is built per request so concurrent
/// executions of the same `Chain` never share call state.
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn run(&self, ctx: &mut ExecutionContext) -> Result<()> {
        Next::new(&self.middlewares).call(ctx).await
    }

    pub fn middlewares_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Deadline;
    use crate::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    fn fresh_ctx() -> ExecutionContext {
        let (_tx, rx) = watch::channel(false);
        let deadline = Deadline::new(tokio::time::Instant::now() + std::time::Duration::from_secs(5), rx);
        ExecutionContext::new(vec![Message::user("hi")], deadline)
    }

    struct Recorder {
        name: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            let result = next.call(ctx).await;
            self.log.lock().unwrap().push(self.name);
            result
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    struct Aborting;

    #[async_trait]
    impl Middleware for Aborting {
        async fn process(&self, ctx: &mut ExecutionContext, _next: Next<'_>) -> Result<()> {
            ctx.set_response(Message::assistant(Some("short-circuited".into()), vec![]));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "aborting"
        }
    }

    #[tokio::test]
    async fn chain_runs_pre_and_post_sections_in_reverse_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            Arc::new(Recorder {
                name: "a",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                name: "b",
                log: log.clone(),
            }),
        ]);
        let mut ctx = fresh_ctx();
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "b", "a"]);
    }

    #[tokio::test]
    async fn middleware_not_calling_next_aborts_chain() {
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_clone = reached.clone();
        struct Counter(Arc<AtomicUsize>);
        #[async_trait]
        impl Middleware for Counter {
            async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                next.call(ctx).await
            }
            fn name(&self) -> &'static str {
                "counter"
            }
        }
        let chain = Chain::new(vec![Arc::new(Aborting), Arc::new(Counter(reached_clone))]);
        let mut ctx = fresh_ctx();
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(reached.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.response().unwrap().content, "short-circuited");
    }

    #[tokio::test]
    async fn errors_propagate_up_through_the_chain() {
        struct Failing;
        #[async_trait]
        impl Middleware for Failing {
            async fn process(&self, _ctx: &mut ExecutionContext, _next: Next<'_>) -> Result<()> {
                Err(crate::error::PipelineError::Validation("bad request".into()))
            }
            fn name(&self) -> &'static str {
                "failing"
            }
        }
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = Chain::new(vec![
            Arc::new(Recorder {
                name: "outer",
                log: log.clone(),
            }),
            Arc::new(Failing),
        ]);
        let mut ctx = fresh_ctx();
        let result = chain.run(&mut ctx).await;
        assert!(result.is_err());
        // "outer" still ran its pre-section before the error propagated up.
        assert_eq!(log.lock().unwrap().first(), Some(&"outer"));
    }
}
