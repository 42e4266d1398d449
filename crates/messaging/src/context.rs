//! Per-operation context: the tenant and trace span an operation runs under.
//!
//! A context is created at the edge (HTTP request, consumed message, scheduler
//! tick) and passed down explicitly. Every message produced within the
//! operation takes its `tenant` and `span` headers from it.

use std::str::FromStr;

use common::Tenant;
use rand::Rng;

use crate::envelope::{Headers, SPAN_HEADER, TENANT_HEADER};
use crate::error::MessagingError;

/// Trace context in W3C `traceparent` text form:
/// `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    trace_id: u128,
    span_id: u64,
    sampled: bool,
}

impl SpanContext {
    /// Starts a new trace.
    pub fn new_root() -> Self {
        let mut rng = rand::rng();
        Self {
            trace_id: rng.random::<u128>().max(1),
            span_id: rng.random::<u64>().max(1),
            sampled: true,
        }
    }

    /// Creates a span in the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: rand::rng().random::<u64>().max(1),
            sampled: self.sampled,
        }
    }

    pub fn trace_id(&self) -> u128 {
        self.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.span_id
    }
}

impl std::fmt::Display for SpanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }
}

impl FromStr for SpanContext {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| MessagingError::InvalidHeader {
            header: SPAN_HEADER,
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.trim().split('-').collect();
        let [version, trace, span, flags] = parts.as_slice() else {
            return Err(invalid("expected 4 '-'-separated fields"));
        };
        if *version != "00" {
            return Err(invalid("unsupported version"));
        }
        if trace.len() != 32 || span.len() != 16 || flags.len() != 2 {
            return Err(invalid("wrong field width"));
        }

        let trace_id = u128::from_str_radix(trace, 16).map_err(|_| invalid("bad trace id"))?;
        let span_id = u64::from_str_radix(span, 16).map_err(|_| invalid("bad span id"))?;
        let flags = u8::from_str_radix(flags, 16).map_err(|_| invalid("bad flags"))?;
        if trace_id == 0 || span_id == 0 {
            return Err(invalid("all-zero id"));
        }

        Ok(Self {
            trace_id,
            span_id,
            sampled: flags & 0x01 == 1,
        })
    }
}

/// The tenant and span of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    tenant: Tenant,
    span: SpanContext,
}

impl OperationContext {
    /// Opens an operation for a tenant with a fresh trace.
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            span: SpanContext::new_root(),
        }
    }

    /// Opens an operation continuing an existing trace.
    pub fn with_span(tenant: Tenant, span: SpanContext) -> Self {
        Self { tenant, span }
    }

    /// Same tenant, new span in the same trace.
    pub fn child(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            span: self.span.child(),
        }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn span(&self) -> &SpanContext {
        &self.span
    }

    /// Headers every message produced in this operation carries.
    pub fn headers(&self) -> Headers {
        Headers::from([
            (TENANT_HEADER.to_string(), self.tenant.to_header()),
            (SPAN_HEADER.to_string(), self.span.to_string()),
        ])
    }
}
