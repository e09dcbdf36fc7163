//! Chain execution as a lazy stream of events.
//!
//! Each unit runs in order against the request's [`ChainContext`]. Tokens a
//! unit emits are forwarded as they arrive. Cancellation is observed before
//! every unit and while a unit is running; in the latter case the unit's
//! future is dropped, which releases any external call it holds.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{ExecutionError, ExternalCallError};
use crate::runtime::context::ChainContext;
use crate::runtime::retry::RetryPolicy;

use super::flow::SplChain;
use super::unit::TokenSink;

/// Progress of one chain execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChainEvent {
    UnitStarted {
        index: usize,
        kind: String,
    },
    Token {
        index: usize,
        text: String,
    },
    UnitFinished {
        index: usize,
        kind: String,
        output: String,
        elapsed_ms: u64,
    },
    Retrying {
        index: usize,
        kind: String,
        attempt: usize,
        delay_ms: u64,
        error: String,
    },
    Failed {
        #[serde(serialize_with = "display")]
        error: ExecutionError,
    },
    Cancelled {
        next_index: usize,
    },
    Done {
        request_id: String,
        answer: String,
        trace: Vec<String>,
    },
}

fn display<S: Serializer>(error: &ExecutionError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

impl ChainEvent {
    /// SSE event name: `error` for failures, `done` at the end, `message` otherwise.
    pub fn sse_name(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "error",
            Self::Done { .. } => "done",
            _ => "message",
        }
    }

    /// Render as one server-sent-event frame.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(format!("event: {}\ndata: {data}\n\n", self.sse_name()))
    }
}

/// Lazy, finite, non-restartable event sequence. Dropping it cancels the run.
pub type ChainEventStream = Pin<Box<dyn Stream<Item = ChainEvent> + Send>>;

/// Final result of a completed execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub request_id: String,
    pub answer: String,
    /// Unit kinds in the order they ran.
    pub trace: Vec<String>,
    /// Output of each unit, by position.
    pub outputs: Vec<String>,
    pub tokens: usize,
}

enum Step {
    Token(String),
    Finished(Result<String, ExternalCallError>),
    Cancelled,
}

/// Runs compiled chains.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainExecutor {
    retry: RetryPolicy,
}

impl ChainExecutor {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Execute `chain` against `ctx`, yielding events as units progress.
    ///
    /// The last event is always one of `Done`, `Failed` or `Cancelled`. The
    /// chain itself is untouched and can serve further requests.
    pub fn execute(&self, chain: Arc<SplChain>, mut ctx: ChainContext, cancel: CancellationToken) -> ChainEventStream {
        let retry = self.retry;
        let max_attempts = retry.max_attempts.max(1);

        Box::pin(async_stream::stream! {
            info!(
                request_id = %ctx.request_id,
                agent_type = %chain.agent_type,
                units = chain.len(),
                "Chain execution started"
            );

            for (index, unit) in chain.units.iter().enumerate() {
                if cancel.is_cancelled() {
                    info!(request_id = %ctx.request_id, next_index = index, "Chain execution cancelled");
                    yield ChainEvent::Cancelled { next_index: index };
                    return;
                }

                let kind = unit.kind().to_string();
                yield ChainEvent::UnitStarted { index, kind: kind.clone() };
                let started = Instant::now();
                let mut attempt = 0;

                let outcome = loop {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let sink = TokenSink::new(tx);

                    let step = {
                        let mut running = unit.run(&mut ctx, &sink);
                        loop {
                            let step = tokio::select! {
                                biased;
                                () = cancel.cancelled() => Step::Cancelled,
                                Some(token) = rx.recv() => Step::Token(token),
                                result = &mut running => Step::Finished(result),
                            };
                            match step {
                                Step::Token(text) => yield ChainEvent::Token { index, text },
                                other => break other,
                            }
                        }
                    };
                    drop(sink);
                    while let Ok(text) = rx.try_recv() {
                        yield ChainEvent::Token { index, text };
                    }

                    match step {
                        Step::Finished(Err(error))
                            if error.retryable && unit.idempotent() && attempt + 1 < max_attempts =>
                        {
                            let delay = retry.delay_for(attempt);
                            attempt += 1;
                            warn!(
                                request_id = %ctx.request_id,
                                index,
                                kind = %kind,
                                attempt,
                                error = %error,
                                "Unit failed, retrying"
                            );
                            yield ChainEvent::Retrying {
                                index,
                                kind: kind.clone(),
                                attempt,
                                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error: error.to_string(),
                            };
                            let cancelled = tokio::select! {
                                biased;
                                () = cancel.cancelled() => true,
                                () = tokio::time::sleep(delay) => false,
                            };
                            if cancelled {
                                break None;
                            }
                        }
                        Step::Finished(result) => break Some(result),
                        Step::Cancelled | Step::Token(_) => break None,
                    }
                };

                match outcome {
                    None => {
                        info!(request_id = %ctx.request_id, index, kind = %kind, "Unit abandoned on cancellation");
                        yield ChainEvent::Cancelled { next_index: index };
                        return;
                    }
                    Some(Err(source)) => {
                        warn!(request_id = %ctx.request_id, index, kind = %kind, error = %source, "Unit failed");
                        yield ChainEvent::Failed {
                            error: ExecutionError::Unit { index, kind, source },
                        };
                        return;
                    }
                    Some(Ok(output)) => {
                        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                        debug!(request_id = %ctx.request_id, index, kind = %kind, elapsed_ms, "Unit finished");
                        ctx.previous_output = Some(output.clone());
                        ctx.trace.push(kind.clone());
                        yield ChainEvent::UnitFinished { index, kind, output, elapsed_ms };
                    }
                }
            }

            if ctx.answer.is_empty() {
                ctx.answer = ctx.previous_output.clone().unwrap_or_default();
            }
            info!(
                request_id = %ctx.request_id,
                units = ctx.trace.len(),
                answer_len = ctx.answer.len(),
                "Chain execution finished"
            );
            yield ChainEvent::Done {
                request_id: ctx.request_id.clone(),
                answer: std::mem::take(&mut ctx.answer),
                trace: std::mem::take(&mut ctx.trace),
            };
        })
    }

    /// Drive [`Self::execute`] to the end.
    ///
    /// # Errors
    ///
    /// The failing unit's error, or [`ExecutionError::Cancelled`].
    #[instrument(skip_all, fields(agent_type = %chain.agent_type, request_id = %ctx.request_id))]
    pub async fn run(
        &self,
        chain: Arc<SplChain>,
        ctx: ChainContext,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut events = self.execute(chain, ctx, cancel);
        let mut outputs = Vec::new();
        let mut tokens = 0;

        while let Some(event) = events.next().await {
            match event {
                ChainEvent::Token { .. } => tokens += 1,
                ChainEvent::UnitFinished { output, .. } => outputs.push(output),
                ChainEvent::Failed { error } => return Err(error),
                ChainEvent::Cancelled { next_index } => return Err(ExecutionError::Cancelled { next_index }),
                ChainEvent::Done {
                    request_id,
                    answer,
                    trace,
                } => {
                    return Ok(ExecutionOutcome {
                        request_id,
                        answer,
                        trace,
                        outputs,
                        tokens,
                    });
                }
                ChainEvent::UnitStarted { .. } | ChainEvent::Retrying { .. } => {}
            }
        }
        Err(ExecutionError::Cancelled {
            next_index: outputs.len(),
        })
    }
}
