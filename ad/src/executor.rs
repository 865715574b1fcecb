//! Retry/backoff executor
//!
//! Owns an admitted execution record from provider call to terminal status.
//! Transient provider failures are retried with exponentially doubling
//! delays inside a fixed attempt budget; after primary exhaustion a
//! configured fallback provider gets exactly one attempt. A hard wall-clock
//! timeout bounds the whole run regardless of retry state, and every
//! provider call is followed by a minimum inter-call spacing so concurrent
//! agents do not burst a shared quota.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use runledger::{AgentDef, ExecutionRecord, ExecutionStatus, RunOutcome, now_ms};

use crate::config::ExecutorConfig;
use crate::provider::{InvocationOutput, InvocationRequest, Provider, ProviderError};
use crate::state::StateManager;

/// Executes admitted runs against a primary and optional fallback provider
#[derive(Clone)]
pub struct RunExecutor {
    state: StateManager,
    config: ExecutorConfig,
    /// Last provider call across every clone of this executor; the spacing
    /// gate lives here because the provider quota is shared across agents
    last_call: Arc<tokio::sync::Mutex<Option<tokio::time::Instant>>>,
}

impl RunExecutor {
    /// Create a new executor
    pub fn new(state: StateManager, config: ExecutorConfig) -> Self {
        Self {
            state,
            config,
            last_call: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Drive an admitted record to its terminal status
    ///
    /// This is the only writer that finalizes the record. Errors finalizing
    /// are logged, never propagated: the caller's loop must not halt because
    /// one agent failed.
    pub async fn execute(
        &self,
        record: ExecutionRecord,
        def: AgentDef,
        primary: Arc<dyn Provider>,
        fallback: Option<Arc<dyn Provider>>,
    ) {
        debug!(agent = %def.name, execution_id = %record.id, "execute: called");
        let request = InvocationRequest::from_agent(&def);
        let hard_timeout = Duration::from_millis(self.config.hard_timeout_ms);

        let result = timeout(
            hard_timeout,
            self.attempt_chain(&request, primary.as_ref(), fallback.as_deref()),
        )
        .await;

        let outcome = match result {
            Ok(Ok(output)) => {
                info!(
                    agent = %def.name,
                    execution_id = %record.id,
                    tokens = output.tokens_used,
                    cost_usd = output.cost_usd,
                    "Execution completed"
                );
                RunOutcome {
                    status: ExecutionStatus::Completed,
                    items_processed: output.items_processed,
                    items_failed: output.items_failed,
                    tokens_used: output.tokens_used,
                    cost_usd: output.cost_usd,
                    error_message: None,
                }
            }
            Ok(Err(e)) => {
                warn!(agent = %def.name, execution_id = %record.id, error = %e, "Execution failed");
                RunOutcome::failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    agent = %def.name,
                    execution_id = %record.id,
                    timeout_ms = self.config.hard_timeout_ms,
                    "Execution hit the hard timeout"
                );
                RunOutcome::failed(format!(
                    "Execution timed out after {}ms",
                    self.config.hard_timeout_ms
                ))
            }
        };

        match self.state.finalize_run(&record.id, &record.agent, outcome, now_ms()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(execution_id = %record.id, "Record was already terminal at finalization");
            }
            Err(e) => {
                warn!(execution_id = %record.id, error = %e, "Failed to finalize execution record");
            }
        }
    }

    /// Retry the primary inside the attempt budget, then give a configured
    /// fallback provider one attempt
    async fn attempt_chain(
        &self,
        request: &InvocationRequest,
        primary: &dyn Provider,
        fallback: Option<&dyn Provider>,
    ) -> Result<InvocationOutput, ProviderError> {
        match self.attempt_loop(request, primary).await {
            Ok(output) => Ok(output),
            // Fatal errors never reach the fallback: a bad key or invalid
            // request would fail there identically
            Err(e) if e.is_fatal() => Err(e),
            Err(primary_error) => {
                let Some(fallback) = fallback else {
                    return Err(primary_error);
                };
                info!(
                    agent = %request.agent,
                    provider = fallback.name(),
                    "Primary provider exhausted, attempting fallback"
                );
                match self.call_once(request, fallback).await {
                    Ok(output) => Ok(output),
                    Err(fallback_error) => {
                        warn!(
                            agent = %request.agent,
                            primary_error = %primary_error,
                            fallback_error = %fallback_error,
                            "Fallback provider also failed"
                        );
                        Err(fallback_error)
                    }
                }
            }
        }
    }

    /// The bounded retry loop against one provider
    async fn attempt_loop(
        &self,
        request: &InvocationRequest,
        provider: &dyn Provider,
    ) -> Result<InvocationOutput, ProviderError> {
        let mut last_error = None;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let backoff = Duration::from_millis(self.config.base_delay_ms * 2u64.pow(attempt - 1));
                warn!(
                    agent = %request.agent,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "attempt_loop: retrying after transient error"
                );
                sleep(backoff).await;
            }

            match self.call_once(request, provider).await {
                Ok(output) => {
                    debug!(agent = %request.agent, attempt, "attempt_loop: success");
                    return Ok(output);
                }
                Err(e) if e.is_fatal() => {
                    debug!(agent = %request.agent, attempt, error = %e, "attempt_loop: fatal, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    debug!(agent = %request.agent, attempt, error = %e, "attempt_loop: transient failure");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::InvalidResponse("Attempt budget exhausted".to_string())))
    }

    /// Resolve the agent's providers and run the record on a spawned task
    ///
    /// An agent pointing at an unconfigured provider still owns an admitted
    /// record, so it is finalized failed rather than left running.
    pub fn spawn_run(
        &self,
        record: ExecutionRecord,
        def: AgentDef,
        providers: &crate::provider::ProviderRegistry,
    ) -> tokio::task::JoinHandle<()> {
        let executor = self.clone();
        match providers.pair_for(&def) {
            Some((primary, fallback)) => {
                tokio::spawn(async move { executor.execute(record, def, primary, fallback).await })
            }
            None => {
                warn!(agent = %def.name, provider = %def.provider, "No provider configured for agent");
                tokio::spawn(async move {
                    let outcome = RunOutcome::failed(format!("No provider configured: {}", def.provider));
                    if let Err(e) = executor
                        .state
                        .finalize_run(&record.id, &record.agent, outcome, now_ms())
                        .await
                    {
                        warn!(execution_id = %record.id, error = %e, "Failed to finalize execution record");
                    }
                })
            }
        }
    }

    /// One provider call behind the shared minimum-spacing gate
    ///
    /// The gate applies even after successes: concurrent agents drain into
    /// calls at least `min_spacing_ms` apart instead of bursting the quota.
    async fn call_once(
        &self,
        request: &InvocationRequest,
        provider: &dyn Provider,
    ) -> Result<InvocationOutput, ProviderError> {
        if self.config.min_spacing_ms > 0 {
            let spacing = Duration::from_millis(self.config.min_spacing_ms);
            let mut last_call = self.last_call.lock().await;
            if let Some(last) = *last_call {
                let since = last.elapsed();
                if since < spacing {
                    sleep(spacing - since).await;
                }
            }
            *last_call = Some(tokio::time::Instant::now());
        }
        provider.invoke(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    use runledger::{AdmitOutcome, Ledger};

    /// Scripted provider: fails transiently `fail_times` times, then succeeds
    struct StubProvider {
        name: String,
        fail_times: u32,
        calls: AtomicU32,
        error: fn() -> ProviderError,
    }

    impl StubProvider {
        fn transient(fail_times: u32) -> Self {
            Self {
                name: "stub".to_string(),
                fail_times,
                calls: AtomicU32::new(0),
                error: || ProviderError::Api {
                    status: 529,
                    message: "overloaded".to_string(),
                },
            }
        }

        fn fatal() -> Self {
            Self {
                name: "stub".to_string(),
                fail_times: u32::MAX,
                calls: AtomicU32::new(0),
                error: || ProviderError::Auth("invalid api key".to_string()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(&self, _request: &InvocationRequest) -> Result<InvocationOutput, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err((self.error)())
            } else {
                Ok(InvocationOutput {
                    items_processed: 1,
                    items_failed: 0,
                    tokens_used: 100,
                    cost_usd: 0.01,
                })
            }
        }
    }

    /// Provider whose call never returns; only the hard timeout ends it
    struct HangingProvider;

    #[async_trait::async_trait]
    impl Provider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn invoke(&self, _request: &InvocationRequest) -> Result<InvocationOutput, ProviderError> {
            sleep(Duration::from_secs(86_400)).await;
            Ok(InvocationOutput::default())
        }
    }

    fn config(max_attempts: u32, base_delay_ms: u64, min_spacing_ms: u64, hard_timeout_ms: u64) -> ExecutorConfig {
        ExecutorConfig {
            max_attempts,
            base_delay_ms,
            min_spacing_ms,
            hard_timeout_ms,
        }
    }

    async fn admitted_record(state: &StateManager, agent: &str) -> (ExecutionRecord, AgentDef) {
        let def = AgentDef::new(agent, "stub", "stub-model");
        state.create_agent(def.clone()).await.unwrap();
        let AdmitOutcome::Admitted(record) = state.admit_run(agent, "manual", now_ms()).await.unwrap() else {
            panic!("expected admission");
        };
        (record, def)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_run_completes_on_fourth_attempt() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let (record, def) = admitted_record(&state, "a").await;

        let provider = Arc::new(StubProvider::transient(3));
        let executor = RunExecutor::new(state.clone(), config(4, 5_000, 0, 600_000));

        let started = Instant::now();
        executor.execute(record.clone(), def, provider.clone(), None).await;

        // Three transient failures, success on the fourth attempt
        assert_eq!(provider.calls(), 4);
        // Delays follow the doubling sequence: 5s + 10s + 20s
        assert_eq!(started.elapsed(), Duration::from_secs(35));

        let finalized = state.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(finalized.status, ExecutionStatus::Completed);
        assert_eq!(finalized.tokens_used, 100);
        assert_eq!(finalized.items_processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_finalizes_failed_with_provider_error() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let (record, def) = admitted_record(&state, "a").await;

        let provider = Arc::new(StubProvider::transient(u32::MAX));
        let executor = RunExecutor::new(state.clone(), config(4, 5_000, 0, 600_000));

        executor.execute(record.clone(), def, provider.clone(), None).await;

        assert_eq!(provider.calls(), 4);
        let finalized = state.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(finalized.status, ExecutionStatus::Failed);
        assert!(finalized.error_message.unwrap().contains("529"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_fails_immediately_without_retry() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let (record, def) = admitted_record(&state, "a").await;

        let provider = Arc::new(StubProvider::fatal());
        let fallback = Arc::new(StubProvider::transient(0));
        let executor = RunExecutor::new(state.clone(), config(4, 5_000, 0, 600_000));

        let started = Instant::now();
        executor
            .execute(record.clone(), def, provider.clone(), Some(fallback.clone()))
            .await;

        // One call, no backoff, and the fallback is never consulted
        assert_eq!(provider.calls(), 1);
        assert_eq!(fallback.calls(), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let finalized = state.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(finalized.status, ExecutionStatus::Failed);
        assert!(finalized.error_message.unwrap().contains("invalid api key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_attempted_once_after_primary_exhaustion() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let (record, def) = admitted_record(&state, "a").await;

        let primary = Arc::new(StubProvider::transient(u32::MAX));
        let fallback = Arc::new(StubProvider::transient(0));
        let executor = RunExecutor::new(state.clone(), config(2, 1_000, 0, 600_000));

        executor
            .execute(record.clone(), def, primary.clone(), Some(fallback.clone()))
            .await;

        assert_eq!(primary.calls(), 2);
        assert_eq!(fallback.calls(), 1);

        let finalized = state.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(finalized.status, ExecutionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_finalizes_failed() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let (record, def) = admitted_record(&state, "a").await;

        let executor = RunExecutor::new(state.clone(), config(4, 5_000, 0, 1_000));

        executor.execute(record.clone(), def, Arc::new(HangingProvider), None).await;

        let finalized = state.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(finalized.status, ExecutionStatus::Failed);
        assert!(finalized.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_spacing_gates_consecutive_calls_even_on_success() {
        let state = StateManager::spawn_with(Ledger::open_in_memory().unwrap());
        let provider = Arc::new(StubProvider::transient(0));
        let executor = RunExecutor::new(state.clone(), config(1, 0, 2_000, 600_000));

        // Two back-to-back successful runs through the same executor: the
        // second provider call waits out the shared spacing gate
        let (first, def) = admitted_record(&state, "a").await;
        let started = Instant::now();
        executor.execute(first, def, provider.clone(), None).await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        let (second, def) = admitted_record(&state, "b").await;
        executor.execute(second, def, provider.clone(), None).await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(provider.calls(), 2);
    }
}
