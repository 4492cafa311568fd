//! Traffic recording and lightweight security analytics.
//!
//! Every message that crosses the gateway is appended to a bounded in-memory
//! ring and synchronously scanned against the detection rule table before it
//! becomes visible to readers — an entry is never observed partially
//! annotated, and never mutated after append. History is explicitly
//! best-effort: strict FIFO eviction at capacity, no persistence.

pub mod rules;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use rules::{Finding, RuleScanner, ScannerError};

/// Default ring capacity.
pub const DEFAULT_TRAFFIC_CAPACITY: usize = 1000;

/// Which way a message crossed the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to gateway
    Inbound,
    /// Gateway to client
    Outbound,
}

/// One recorded message. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficEntry {
    /// Monotonically increasing entry id
    pub id: u64,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    /// Session the message belonged to, when known
    pub session_id: Option<String>,
    /// Correlation id shared by a request and its response
    pub correlation_id: Option<Uuid>,
    /// Method name, for requests and notifications
    pub method: Option<String>,
    /// True when the message carries a JSON-RPC error payload
    pub is_error: bool,
    /// The message body as recorded
    pub message: Value,
    /// Detection-rule matches, attached at append time
    pub findings: Vec<Finding>,
}

/// Aggregate traffic statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficStats {
    pub total_messages: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub errors: usize,
    /// Request count per method name
    pub methods: HashMap<String, u64>,
    /// Finding count per rule name
    pub findings: HashMap<String, u64>,
}

/// Bounded, scan-on-append traffic log.
pub struct TrafficLogger {
    entries: Mutex<VecDeque<TrafficEntry>>,
    capacity: usize,
    next_id: AtomicU64,
    scanner: RuleScanner,
}

impl TrafficLogger {
    /// Create a logger holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, ScannerError> {
        Ok(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_id: AtomicU64::new(1),
            scanner: RuleScanner::new()?,
        })
    }

    /// Record a message, scanning it for findings before it becomes visible.
    ///
    /// Returns the entry id.
    pub fn record(
        &self,
        direction: Direction,
        message: &Value,
        session_id: Option<&str>,
        correlation_id: Option<Uuid>,
    ) -> u64 {
        let serialized = message.to_string();
        let findings = self.scanner.scan(&serialized);

        self.push(TrafficEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            direction,
            timestamp: Utc::now(),
            session_id: session_id.map(str::to_string),
            correlation_id,
            method: message
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string),
            is_error: message.get("error").is_some(),
            message: message.clone(),
            findings,
        })
    }

    /// Record an inbound body that failed envelope validation.
    ///
    /// The raw text is kept as a string payload and annotated with a
    /// synthetic `protocol_violation` finding carrying the rejection detail,
    /// plus whatever the rule table matches in the raw text.
    pub fn record_rejected(&self, raw: &str, session_id: Option<&str>, detail: &str) -> u64 {
        let mut findings = vec![Finding::protocol_violation(detail)];
        findings.extend(self.scanner.scan(raw));

        self.push(TrafficEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            direction: Direction::Inbound,
            timestamp: Utc::now(),
            session_id: session_id.map(str::to_string),
            correlation_id: None,
            method: None,
            is_error: true,
            message: Value::String(raw.to_string()),
            findings,
        })
    }

    fn push(&self, entry: TrafficEntry) -> u64 {
        let id = entry.id;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// The most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Entries recorded strictly after `timestamp`, oldest first.
    pub fn since(&self, timestamp: DateTime<Utc>) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| e.timestamp > timestamp)
            .cloned()
            .collect()
    }

    /// Aggregate statistics over the retained window.
    pub fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let mut stats = TrafficStats {
            total_messages: entries.len(),
            inbound: 0,
            outbound: 0,
            errors: 0,
            methods: HashMap::new(),
            findings: HashMap::new(),
        };

        for entry in entries.iter() {
            match entry.direction {
                Direction::Inbound => stats.inbound += 1,
                Direction::Outbound => stats.outbound += 1,
            }
            if entry.is_error {
                stats.errors += 1;
            }
            if let Some(method) = &entry.method {
                *stats.methods.entry(method.clone()).or_insert(0) += 1;
            }
            for finding in &entry.findings {
                *stats.findings.entry(finding.rule.clone()).or_insert(0) += 1;
            }
        }

        stats
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when nothing has been recorded (or everything was evicted).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
