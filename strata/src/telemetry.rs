//! Best-effort metrics emission.
//!
//! Durations, usage gauges and run counts are sent as JSON datagrams to the
//! configured UDP endpoint. Emission is fire-and-forget: a missing endpoint,
//! an unresolvable host or a send failure never fails the operation being
//! measured.

use std::net::UdpSocket;
use std::time::Instant;

use serde::Serialize;

#[derive(Serialize)]
struct Datagram<'a> {
    origin: &'a str,
    name: &'a str,
    value: f64,
    unit: &'a str,
}

const ORIGIN: &str = "strata";

/// Handle for emitting metrics. Cheap to clone; components hold their own
/// copy and emit at the points they measure.
#[derive(Clone, Debug, Default)]
pub struct Emitter {
    endpoint: Option<String>,
}

impl Emitter {
    pub fn new(endpoint: Option<String>) -> Self {
        Self { endpoint }
    }

    /// Emit the wall-clock elapsed since `from` under `name`, in nanoseconds.
    pub fn try_emit_duration_from(&self, name: &str, from: Instant) {
        let elapsed = from.elapsed();
        self.send(name, elapsed.as_nanos() as f64, "nanos");
    }

    /// Emit a byte-count gauge.
    pub fn try_emit_usage(&self, name: &str, bytes: i64) {
        self.send(name, bytes as f64, "bytes");
    }

    /// Count one invocation of a top-level action, tagged by outcome.
    pub fn try_increment_run_count(&self, action: &str, failed: bool) {
        let name = if failed {
            format!("{}.run.fail", action)
        } else {
            format!("{}.run.success", action)
        };
        self.send(&name, 1.0, "count");
    }

    /// Record a terminal error for an action.
    pub fn try_emit_error(&self, action: &str, message: &str, exit_code: i32) {
        tracing::debug!(action, message, exit_code, "emitting-error-metric");
        self.send(&format!("{}.error", action), exit_code as f64, "count");
    }

    fn send(&self, name: &str, value: f64, unit: &str) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let datagram = Datagram {
            origin: ORIGIN,
            name,
            value,
            unit,
        };
        let Ok(payload) = serde_json::to_vec(&datagram) else {
            return;
        };

        // Bind an ephemeral socket per send; metric volume is a handful of
        // datagrams per CLI invocation.
        match UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => {
                if let Err(e) = socket.send_to(&payload, endpoint) {
                    tracing::debug!(endpoint, error = %e, "metric-send-failed");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "metric-socket-failed");
            }
        }
    }
}
