//! Tool call scheduling.
//!
//! The scheduler drives every function call emitted by a turn through its
//! lifecycle:
//!
//! ```text
//! validating -> (args invalid)                  -> error
//! validating -> (risk < threshold OR auto-exec) -> queued
//! validating -> (risk >= threshold)             -> awaiting_confirmation
//! awaiting_confirmation -> (approved)           -> queued
//! awaiting_confirmation -> (rejected)           -> cancelled
//! queued -> executing -> success | error | cancelled
//! ```
//!
//! Transitions are forward-only and terminal states are immutable. Function
//! responses are assembled in the order the calls arrived, regardless of
//! completion order; side-effect-free calls may execute concurrently up to
//! the configured fan-out, everything else is serialized.

use crate::config::AgentSettings;
use crate::error::DbError;
use crate::events::AgentEvent;
use crate::registry::ToolRegistry;
use crate::risk::{self, RiskAssessment};
use crate::tools::{DatabaseTool, ToolContext, ToolResult};
use crate::types::{AbortSignal, FunctionCall, FunctionResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, warn};

/// Reserved argument key for a per-call timeout override (milliseconds).
pub const TIMEOUT_OVERRIDE_KEY: &str = "_timeout_ms";

/// Lifecycle states of a scheduled call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolCallState {
    Validating,
    AwaitingConfirmation,
    Queued,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Whether `next` is a legal forward transition from `self`.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Validating, Self::Queued)
                | (Self::Validating, Self::AwaitingConfirmation)
                | (Self::Validating, Self::Error)
                | (Self::Validating, Self::Cancelled)
                | (Self::AwaitingConfirmation, Self::Queued)
                | (Self::AwaitingConfirmation, Self::Cancelled)
                | (Self::Queued, Self::Executing)
                | (Self::Queued, Self::Cancelled)
                | (Self::Executing, Self::Success)
                | (Self::Executing, Self::Error)
                | (Self::Executing, Self::Cancelled)
        )
    }
}

/// Bookkeeping record for one scheduled call.
#[derive(Clone, Debug)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub state: ToolCallState,
    pub error: Option<String>,
    pub confirmation: Option<RiskAssessment>,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
}

impl ToolCallRecord {
    fn new(call: &FunctionCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
            state: ToolCallState::Validating,
            error: None,
            confirmation: None,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
        }
    }

    /// Advance the state machine. Illegal or backward transitions are
    /// rejected; terminal states never change.
    pub fn advance(&mut self, next: ToolCallState) -> bool {
        if !self.state.can_advance_to(next) {
            warn!(
                id = self.id,
                from = ?self.state,
                to = ?next,
                "illegal tool call state transition ignored"
            );
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(OffsetDateTime::now_utc());
        }
        true
    }
}

/// The host's answer to a confirmation request.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfirmationDecision {
    pub approved: bool,
    /// Promote this decision to session scope for identical calls
    pub remember: bool,
}

/// What the host sees when a call needs confirmation.
#[derive(Clone, Debug)]
pub struct ConfirmationRequest {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub assessment: RiskAssessment,
    pub summary: String,
}

/// User-facing confirmation gate, supplied by the host (CLI or web).
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationDecision;
}

/// Handler that rejects everything; the default until a host registers one.
struct RejectAll;

#[async_trait]
impl ConfirmationHandler for RejectAll {
    async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationDecision {
        ConfirmationDecision {
            approved: false,
            remember: false,
        }
    }
}

fn args_fingerprint(args: &Value) -> String {
    // serde_json object key order is stable for a given Value.
    args.to_string()
}

/// Drives tool calls through the state machine and assembles responses.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    settings: Arc<AgentSettings>,
    handler: Mutex<Arc<dyn ConfirmationHandler>>,
    /// Session-scoped remembered approvals: `(tool, args fingerprint)`.
    remembered: Mutex<std::collections::HashSet<(String, String)>>,
}

impl ToolScheduler {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, settings: Arc<AgentSettings>) -> Self {
        Self {
            registry,
            settings,
            handler: Mutex::new(Arc::new(RejectAll)),
            remembered: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Register the user-facing confirmation gate.
    pub async fn on_confirmation_required(&self, handler: Arc<dyn ConfirmationHandler>) {
        *self.handler.lock().await = handler;
    }

    /// Dispatch one turn's calls. Responses come back in call order.
    pub async fn dispatch(
        &self,
        calls: Vec<FunctionCall>,
        ctx: &ToolContext,
        signal: &AbortSignal,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Vec<FunctionResponse> {
        let mut records: Vec<ToolCallRecord> = calls.iter().map(ToolCallRecord::new).collect();
        let mut slots: Vec<Option<FunctionResponse>> = vec![None; calls.len()];

        // Phase 1: validate and gate, in arrival order.
        let mut runnable: Vec<(usize, Arc<dyn DatabaseTool>, bool)> = Vec::new();
        for (idx, call) in calls.iter().enumerate() {
            let record = &mut records[idx];
            let _ = events
                .send(AgentEvent::tool_start(
                    call.id.clone(),
                    call.name.clone(),
                    call.args.clone(),
                ))
                .await;

            if signal.aborted() {
                record.advance(ToolCallState::Cancelled);
                slots[idx] = Some(cancelled_response(call));
                let _ = events
                    .send(AgentEvent::tool_finished(call.id.clone(), false, "cancelled"))
                    .await;
                continue;
            }

            let Some(tool) = self.registry.get(&call.name) else {
                record.advance(ToolCallState::Error);
                let err = DbError::InvalidToolCall(format!("unknown tool '{}'", call.name));
                slots[idx] = Some(FunctionResponse::error(
                    call.id.clone(),
                    call.name.clone(),
                    err.to_response_value(),
                ));
                let _ = events
                    .send(AgentEvent::tool_finished(call.id.clone(), false, err.to_string()))
                    .await;
                continue;
            };

            if let Some(message) = tool.validate(&call.args) {
                record.advance(ToolCallState::Error);
                let err = DbError::InvalidToolCall(message);
                slots[idx] = Some(FunctionResponse::error(
                    call.id.clone(),
                    call.name.clone(),
                    err.to_response_value(),
                ));
                let _ = events
                    .send(AgentEvent::tool_finished(call.id.clone(), false, err.to_string()))
                    .await;
                continue;
            }

            let assessment = risk::evaluate(&call.name, &call.args, &self.settings);
            let gated = assessment.requires_confirmation && !self.settings.auto_execute();
            let fingerprint = (call.name.clone(), args_fingerprint(&call.args));
            let remembered = self.remembered.lock().await.contains(&fingerprint);

            if gated && !remembered {
                record.confirmation = Some(assessment.clone());
                record.advance(ToolCallState::AwaitingConfirmation);
                let summary = describe_call(call);
                let _ = events
                    .send(AgentEvent::tool_awaiting(
                        call.id.clone(),
                        assessment.level,
                        summary.clone(),
                    ))
                    .await;

                let decision = if signal.aborted() {
                    // Cancellation during the gate goes straight to cancelled.
                    None
                } else {
                    let handler = Arc::clone(&*self.handler.lock().await);
                    let request = ConfirmationRequest {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        args: call.args.clone(),
                        assessment: assessment.clone(),
                        summary,
                    };
                    tokio::select! {
                        decision = handler.confirm(request) => Some(decision),
                        () = signal.cancelled() => None,
                    }
                };

                match decision {
                    Some(decision) if decision.approved => {
                        if decision.remember {
                            self.remembered.lock().await.insert(fingerprint);
                        }
                        record.advance(ToolCallState::Queued);
                    }
                    Some(_) => {
                        record.advance(ToolCallState::Cancelled);
                        let err = DbError::RiskRejected(format!(
                            "user rejected '{}' ({:?})",
                            call.name, assessment.level
                        ));
                        slots[idx] = Some(FunctionResponse::error(
                            call.id.clone(),
                            call.name.clone(),
                            err.to_response_value(),
                        ));
                        let _ = events
                            .send(AgentEvent::tool_finished(
                                call.id.clone(),
                                false,
                                "rejected by user",
                            ))
                            .await;
                        continue;
                    }
                    None => {
                        record.advance(ToolCallState::Cancelled);
                        slots[idx] = Some(cancelled_response(call));
                        let _ = events
                            .send(AgentEvent::tool_finished(call.id.clone(), false, "cancelled"))
                            .await;
                        continue;
                    }
                }
            } else {
                record.advance(ToolCallState::Queued);
            }

            let parallel_ok = self
                .registry
                .registration(&call.name)
                .is_some_and(|r| r.is_side_effect_free());
            runnable.push((idx, tool, parallel_ok));
        }

        // Phase 2: execute. Side-effect-free calls fan out under a semaphore;
        // the rest run serially in arrival order.
        let fan_out = Arc::new(Semaphore::new(self.settings.fan_out()));
        let grace = self.settings.cancel_grace();

        let mut parallel_futures = Vec::new();
        let mut serial: Vec<(usize, Arc<dyn DatabaseTool>)> = Vec::new();
        for (idx, tool, parallel_ok) in runnable {
            if parallel_ok {
                let permit_source = Arc::clone(&fan_out);
                let call = calls[idx].clone();
                let tool = Arc::clone(&tool);
                let ctx = ctx.clone();
                let signal = signal.clone();
                let events = events.clone();
                parallel_futures.push(async move {
                    let _permit = permit_source.acquire().await;
                    let outcome = execute_one(&call, tool, &ctx, &signal, &events, grace).await;
                    (idx, outcome)
                });
            } else {
                serial.push((idx, tool));
            }
        }

        let parallel_task = futures::future::join_all(parallel_futures);
        let serial_task = async {
            let mut out = Vec::new();
            for (idx, tool) in serial {
                let outcome =
                    execute_one(&calls[idx], tool, ctx, signal, events, grace).await;
                out.push((idx, outcome));
            }
            out
        };
        let (parallel_results, serial_results) = tokio::join!(parallel_task, serial_task);

        for (idx, (state, response)) in parallel_results.into_iter().chain(serial_results) {
            records[idx].advance(ToolCallState::Executing);
            records[idx].advance(state);
            slots[idx] = Some(response);
        }

        // Every slot is filled by now; assemble in call order.
        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| cancelled_response(&calls[idx]))
            })
            .collect()
    }
}

fn describe_call(call: &FunctionCall) -> String {
    if let Some(sql) = call.args.get("sql").and_then(Value::as_str) {
        return sql.chars().take(120).collect();
    }
    if let Some(command) = call.args.get("command").and_then(Value::as_str) {
        return command.chars().take(120).collect();
    }
    format!("{}({})", call.name, call.args)
}

fn cancelled_response(call: &FunctionCall) -> FunctionResponse {
    FunctionResponse::error(
        call.id.clone(),
        call.name.clone(),
        DbError::Cancelled.to_response_value(),
    )
}

fn timeout_for(call: &FunctionCall, tool: &Arc<dyn DatabaseTool>) -> Duration {
    call.args
        .get(TIMEOUT_OVERRIDE_KEY)
        .and_then(Value::as_u64)
        .map_or_else(|| tool.default_timeout(), Duration::from_millis)
}

/// Run one queued call to a terminal state, emitting running/finished events.
async fn execute_one(
    call: &FunctionCall,
    tool: Arc<dyn DatabaseTool>,
    ctx: &ToolContext,
    signal: &AbortSignal,
    events: &mpsc::Sender<AgentEvent>,
    grace: Duration,
) -> (ToolCallState, FunctionResponse) {
    if signal.aborted() {
        return (ToolCallState::Cancelled, cancelled_response(call));
    }

    let _ = events
        .send(AgentEvent::tool_running(call.id.clone()))
        .await;
    let timeout = timeout_for(call, &tool);
    debug!(id = call.id, name = call.name, timeout_ms = timeout.as_millis() as u64, "executing tool");

    let work = tool.execute(call.args.clone(), ctx, signal);
    futures::pin_mut!(work);

    let outcome: Result<anyhow::Result<ToolResult>, ToolCallState> = tokio::select! {
        result = &mut work => Ok(result),
        () = tokio::time::sleep(timeout) => Err(ToolCallState::Error),
        () = signal.cancelled() => {
            // Cooperative cancel: the tool sees the signal and gets a bounded
            // grace period to wind down before the scheduler detaches.
            match tokio::time::timeout(grace, &mut work).await {
                Ok(result) => Ok(result),
                Err(_) => Err(ToolCallState::Cancelled),
            }
        }
    };

    match outcome {
        Ok(Ok(result)) if signal.aborted() => {
            // Finished during the grace window; still surfaced as cancelled
            // so no post-abort side effects are reported as success.
            let _ = events
                .send(AgentEvent::tool_finished(call.id.clone(), false, "cancelled"))
                .await;
            let _ = result;
            (ToolCallState::Cancelled, cancelled_response(call))
        }
        Ok(Ok(result)) => {
            let _ = events
                .send(AgentEvent::tool_finished(
                    call.id.clone(),
                    true,
                    result.summary.clone(),
                ))
                .await;
            (
                ToolCallState::Success,
                FunctionResponse::ok(call.id.clone(), call.name.clone(), result.data),
            )
        }
        Ok(Err(e)) => {
            let err = match e.downcast::<DbError>() {
                Ok(db_err) => db_err,
                Err(other) => DbError::ToolExecution(other.to_string()),
            };
            let _ = events
                .send(AgentEvent::tool_finished(call.id.clone(), false, err.to_string()))
                .await;
            let state = if err.is_cancellation() {
                ToolCallState::Cancelled
            } else {
                ToolCallState::Error
            };
            (
                state,
                FunctionResponse::error(call.id.clone(), call.name.clone(), err.to_response_value()),
            )
        }
        Err(ToolCallState::Error) => {
            let err = DbError::Timeout(timeout.as_millis() as u64);
            let _ = events
                .send(AgentEvent::tool_finished(call.id.clone(), false, err.to_string()))
                .await;
            (
                ToolCallState::Error,
                FunctionResponse::error(call.id.clone(), call.name.clone(), err.to_response_value()),
            )
        }
        Err(_) => {
            let _ = events
                .send(AgentEvent::tool_finished(call.id.clone(), false, "cancelled"))
                .await;
            (ToolCallState::Cancelled, cancelled_response(call))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterFactory;
    use crate::connection::ConnectionManager;
    use crate::registry::Capability;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHandler {
        approve: bool,
        remember: bool,
        asked: AtomicUsize,
    }

    #[async_trait]
    impl ConfirmationHandler for RecordingHandler {
        async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationDecision {
            self.asked.fetch_add(1, Ordering::SeqCst);
            ConfirmationDecision {
                approved: self.approve,
                remember: self.remember,
            }
        }
    }

    struct SleepTool {
        name: &'static str,
        sleep: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatabaseTool for SleepTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "sleeps, then returns its name"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn default_timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
            signal: &AbortSignal,
        ) -> anyhow::Result<ToolResult> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::select! {
                () = tokio::time::sleep(self.sleep) => {}
                () = signal.cancelled() => {
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    anyhow::bail!(DbError::Cancelled);
                }
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolResult::new(self.name, json!({"tool": self.name})))
        }
    }

    fn test_ctx(settings: &Arc<AgentSettings>) -> ToolContext {
        ToolContext::new(
            Arc::clone(settings),
            Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new()))),
        )
    }

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    fn scheduler_with(
        settings: Arc<AgentSettings>,
        registry: Arc<ToolRegistry>,
    ) -> ToolScheduler {
        ToolScheduler::new(registry, settings)
    }

    fn sleep_tool(
        name: &'static str,
        sleep: Duration,
    ) -> (Arc<dyn DatabaseTool>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let tool = SleepTool {
            name,
            sleep,
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        (Arc::new(tool), peak)
    }

    #[test]
    fn state_machine_is_forward_only() {
        let mut record = ToolCallRecord::new(&call("c1", "sql_execute", json!({})));
        assert!(record.advance(ToolCallState::Queued));
        assert!(record.advance(ToolCallState::Executing));
        assert!(record.advance(ToolCallState::Success));
        // Terminal states are immutable.
        assert!(!record.advance(ToolCallState::Error));
        assert!(!record.advance(ToolCallState::Executing));
        assert_eq!(record.state, ToolCallState::Success);
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn awaiting_confirmation_can_go_straight_to_cancelled() {
        let mut record = ToolCallRecord::new(&call("c1", "sql_execute", json!({})));
        assert!(record.advance(ToolCallState::AwaitingConfirmation));
        assert!(record.advance(ToolCallState::Cancelled));
        assert!(record.state.is_terminal());
    }

    #[tokio::test]
    async fn unknown_tool_yields_invalid_tool_call_response() {
        let settings = Arc::new(AgentSettings::from_overrides(json!({})));
        let registry = Arc::new(ToolRegistry::new());
        let scheduler = scheduler_with(Arc::clone(&settings), registry);
        let ctx = test_ctx(&settings);
        let (tx, _rx) = mpsc::channel(64);

        let responses = scheduler
            .dispatch(
                vec![call("c1", "ghost_tool", json!({}))],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_error);
        assert_eq!(responses[0].response["error"]["kind"], "InvalidToolCallError");
    }

    #[tokio::test]
    async fn rejection_cancels_with_risk_rejected_error() {
        let registry = Arc::new(ToolRegistry::new());
        let (tool, _) = sleep_tool("drop_like", Duration::from_millis(1));
        registry
            .register(tool, [Capability::Modify], [], 50, json!({}))
            .expect("register");
        // Force the gate open for this tool via a low threshold.
        let settings = Arc::new(AgentSettings::from_overrides(
            json!({"risk": {"threshold": "low"}}),
        ));
        let scheduler = scheduler_with(Arc::clone(&settings), registry);
        let handler = Arc::new(RecordingHandler {
            approve: false,
            remember: false,
            asked: AtomicUsize::new(0),
        });
        scheduler
            .on_confirmation_required(Arc::clone(&handler) as Arc<dyn ConfirmationHandler>)
            .await;
        let ctx = test_ctx(&settings);
        let (tx, mut rx) = mpsc::channel(64);

        let responses = scheduler
            .dispatch(
                vec![call("c1", "drop_like", json!({}))],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        assert_eq!(handler.asked.load(Ordering::SeqCst), 1);
        assert!(responses[0].is_error);
        assert_eq!(responses[0].response["error"]["kind"], "RiskRejectedError");

        drop(tx);
        let mut saw_awaiting = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, AgentEvent::ToolAwaitingConfirmation { .. }) {
                saw_awaiting = true;
            }
        }
        assert!(saw_awaiting);
    }

    #[tokio::test]
    async fn remembered_approval_skips_the_gate() {
        let registry = Arc::new(ToolRegistry::new());
        let (tool, _) = sleep_tool("risky_tool", Duration::from_millis(1));
        registry
            .register(tool, [Capability::Modify], [], 50, json!({}))
            .expect("register");
        let settings = Arc::new(AgentSettings::from_overrides(
            json!({"risk": {"threshold": "low"}}),
        ));
        let scheduler = scheduler_with(Arc::clone(&settings), registry);
        let handler = Arc::new(RecordingHandler {
            approve: true,
            remember: true,
            asked: AtomicUsize::new(0),
        });
        scheduler
            .on_confirmation_required(Arc::clone(&handler) as Arc<dyn ConfirmationHandler>)
            .await;
        let ctx = test_ctx(&settings);
        let (tx, _rx) = mpsc::channel(256);

        let args = json!({"target": "t"});
        scheduler
            .dispatch(
                vec![call("c1", "risky_tool", args.clone())],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        scheduler
            .dispatch(
                vec![call("c2", "risky_tool", args)],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        // Identical (tool, args) asked once; the second run skipped the gate.
        assert_eq!(handler.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn responses_keep_call_order_despite_completion_order() {
        let registry = Arc::new(ToolRegistry::new());
        let (slow, _) = sleep_tool("slow_read", Duration::from_millis(80));
        let (fast, _) = sleep_tool("fast_read", Duration::from_millis(1));
        registry
            .register(slow, [Capability::Query], [], 50, json!({}))
            .expect("slow");
        registry
            .register(fast, [Capability::Query], [], 50, json!({}))
            .expect("fast");
        let settings = Arc::new(AgentSettings::from_overrides(json!({})));
        let scheduler = scheduler_with(Arc::clone(&settings), registry);
        let ctx = test_ctx(&settings);
        let (tx, _rx) = mpsc::channel(256);

        let responses = scheduler
            .dispatch(
                vec![
                    call("c1", "slow_read", json!({})),
                    call("c2", "fast_read", json!({})),
                ],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        assert_eq!(responses[0].id, "c1");
        assert_eq!(responses[0].name, "slow_read");
        assert_eq!(responses[1].id, "c2");
    }

    #[tokio::test]
    async fn side_effect_free_calls_run_concurrently() {
        let registry = Arc::new(ToolRegistry::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        for name in ["read_a", "read_b", "read_c"] {
            let tool = SleepTool {
                name,
                sleep: Duration::from_millis(60),
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            };
            registry
                .register(Arc::new(tool), [Capability::Query], [], 50, json!({}))
                .expect("register");
        }
        let settings = Arc::new(AgentSettings::from_overrides(json!({})));
        let scheduler = scheduler_with(Arc::clone(&settings), registry);
        let ctx = test_ctx(&settings);
        let (tx, _rx) = mpsc::channel(256);

        scheduler
            .dispatch(
                vec![
                    call("c1", "read_a", json!({})),
                    call("c2", "read_b", json!({})),
                    call("c3", "read_c", json!({})),
                ],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        assert!(peak.load(Ordering::SeqCst) >= 2, "reads should overlap");
    }

    #[tokio::test]
    async fn side_effectful_calls_serialize() {
        let registry = Arc::new(ToolRegistry::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        for name in ["write_a", "write_b"] {
            let tool = SleepTool {
                name,
                sleep: Duration::from_millis(40),
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            };
            registry
                .register(Arc::new(tool), [Capability::Modify], [], 50, json!({}))
                .expect("register");
        }
        let settings = Arc::new(AgentSettings::from_overrides(
            json!({"auto_execute": true}),
        ));
        let scheduler = scheduler_with(Arc::clone(&settings), registry);
        let ctx = test_ctx(&settings);
        let (tx, _rx) = mpsc::channel(256);

        scheduler
            .dispatch(
                vec![
                    call("c1", "write_a", json!({})),
                    call("c2", "write_b", json!({})),
                ],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        assert_eq!(peak.load(Ordering::SeqCst), 1, "writes must not overlap");
    }

    #[tokio::test]
    async fn timeout_transitions_to_error_with_timeout_kind() {
        let registry = Arc::new(ToolRegistry::new());
        let (tool, _) = sleep_tool("slow_read", Duration::from_secs(30));
        registry
            .register(tool, [Capability::Query], [], 50, json!({}))
            .expect("register");
        let settings = Arc::new(AgentSettings::from_overrides(json!({})));
        let scheduler = scheduler_with(Arc::clone(&settings), registry);
        let ctx = test_ctx(&settings);
        let (tx, _rx) = mpsc::channel(256);

        let responses = scheduler
            .dispatch(
                vec![call("c1", "slow_read", json!({TIMEOUT_OVERRIDE_KEY: 30}))],
                &ctx,
                &AbortSignal::new(),
                &tx,
            )
            .await;
        assert!(responses[0].is_error);
        assert_eq!(responses[0].response["error"]["kind"], "TimeoutError");
    }

    #[tokio::test]
    async fn abort_cancels_pending_and_executing_calls() {
        let registry = Arc::new(ToolRegistry::new());
        let (tool, _) = sleep_tool("slow_read", Duration::from_secs(30));
        registry
            .register(tool, [Capability::Query], [], 50, json!({}))
            .expect("register");
        let settings = Arc::new(AgentSettings::from_overrides(
            json!({"scheduler": {"cancel_grace_ms": 50}}),
        ));
        let scheduler = Arc::new(scheduler_with(Arc::clone(&settings), registry));
        let ctx = test_ctx(&settings);
        let (tx, _rx) = mpsc::channel(256);
        let signal = AbortSignal::new();

        let dispatch = {
            let scheduler = Arc::clone(&scheduler);
            let ctx = ctx.clone();
            let signal = signal.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                scheduler
                    .dispatch(vec![call("c1", "slow_read", json!({}))], &ctx, &signal, &tx)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        signal.abort();
        let responses = dispatch.await.expect("join");
        assert!(responses[0].is_error);
        assert_eq!(responses[0].response["error"]["kind"], "CancelledError");
    }
}
