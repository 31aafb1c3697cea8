//! Validation gate.
//!
//! Runs injected checks against a result a worker wrote to the durable store.
//! What a check examines is up to the caller; the gate only orders them,
//! collects reports and decides acceptance from their severities.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::durable::DurableStore;
use crate::error::Result;
use crate::model::{DurableFact, FactRef, Severity, ValidationReport, Verdict, WorkItem};
use crate::telemetry::metrics;

/// What a check gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub work_item: &'a WorkItem,
    pub attempt: u32,
    pub result: &'a DurableFact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// A validation check.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome;
}

type CheckFuture = Pin<Box<dyn Future<Output = CheckOutcome> + Send>>;

/// A check backed by a closure over an owned copy of the result.
pub struct FnCheck<F> {
    name: String,
    severity: Severity,
    f: F,
}

#[async_trait]
impl<F> Check for FnCheck<F>
where
    F: Fn(DurableFact) -> CheckFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        (self.f)(ctx.result.clone()).await
    }
}

/// Build a check from an async closure over the result fact.
pub fn check_fn<F, Fut>(name: impl Into<String>, severity: Severity, f: F) -> Arc<dyn Check>
where
    F: Fn(DurableFact) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CheckOutcome> + Send + 'static,
{
    Arc::new(FnCheck {
        name: name.into(),
        severity,
        f: move |fact| -> CheckFuture { Box::pin(f(fact)) },
    })
}

/// Passes when the result is a JSON object carrying every listed field with a
/// non-null value.
pub struct RequiredFields {
    name: String,
    fields: Vec<String>,
    severity: Severity,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "required_fields".to_string(),
            fields: fields.into_iter().map(Into::into).collect(),
            severity: Severity::Blocking,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Check for RequiredFields {
    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let Some(object) = ctx.result.value.as_object() else {
            return CheckOutcome::fail("result is not a JSON object");
        };
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| object.get(f.as_str()).is_none_or(|v| v.is_null()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            CheckOutcome::pass("all required fields present")
        } else {
            CheckOutcome::fail(format!("missing {}", missing.join(", ")))
        }
    }
}

pub struct ValidationGate {
    durable: Arc<DurableStore>,
}

impl ValidationGate {
    pub fn new(durable: Arc<DurableStore>) -> Self {
        Self { durable }
    }

    /// Run every check in order against the fact at `result_ref`.
    ///
    /// All checks run even after a failure. A result that cannot be loaded
    /// yields a single failed report at blocking severity.
    pub async fn validate(
        &self,
        result_ref: &FactRef,
        work_item: &WorkItem,
        attempt: u32,
        checks: &[Arc<dyn Check>],
    ) -> Result<Verdict> {
        let result = match self.durable.resolve_ref(result_ref).await {
            Ok(fact) => fact,
            Err(e) => {
                warn!(
                    work_item_id = %work_item.id,
                    %result_ref,
                    error = %e,
                    "result could not be loaded for validation"
                );
                let verdict = Verdict::new(vec![ValidationReport {
                    check_name: "result_ref".to_string(),
                    passed: false,
                    detail: format!("result {result_ref} unavailable: {e}"),
                    severity: Severity::Blocking,
                }]);
                record_run(&verdict);
                return Ok(verdict);
            }
        };

        let ctx = CheckContext {
            work_item,
            attempt,
            result: &result,
        };
        let mut reports = Vec::with_capacity(checks.len());
        for check in checks {
            let outcome = check.run(&ctx).await;
            debug!(
                work_item_id = %work_item.id,
                attempt,
                check = check.name(),
                passed = outcome.passed,
                "check finished"
            );
            reports.push(ValidationReport {
                check_name: check.name().to_string(),
                passed: outcome.passed,
                detail: outcome.detail,
                severity: check.severity(),
            });
        }
        let verdict = Verdict::new(reports);
        record_run(&verdict);
        Ok(verdict)
    }
}

fn record_run(verdict: &Verdict) {
    metrics::validation_runs().add(
        1,
        &[KeyValue::new("accepted", verdict.accepted().to_string())],
    );
}
