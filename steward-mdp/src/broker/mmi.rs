//! Management namespace.
//!
//! Requests addressed to the reserved `mmi.` prefix never reach a worker;
//! the broker synthesizes the reply inline on its own loop and returns it
//! as a single FINAL. Handlers are O(1) and never block.

use bytes::Bytes;
use tracing::debug;

use crate::broker::state::BrokerState;

const STATUS_OK: &[u8] = b"200";
const STATUS_NOT_FOUND: &[u8] = b"404";
const STATUS_NOT_IMPLEMENTED: &[u8] = b"501";

impl BrokerState {
    /// Answer one management query. Returns the reply body frames.
    pub(crate) fn management_reply(&self, name: &str, body: &[Bytes]) -> Vec<Bytes> {
        debug!("[BROKER] Management query {}", name);
        match name {
            // "Is this service available?" - it is when at least one worker
            // is registered for it, or work is already queued for it.
            "mmi.service" => {
                let status = self
                    .queried_service(body)
                    .filter(|svc| svc.available())
                    .map_or(STATUS_NOT_FOUND, |_| STATUS_OK);
                vec![Bytes::from_static(status)]
            }

            // Worker census for a service (idle + busy), as decimal text.
            "mmi.workers" => {
                let count = self
                    .queried_service(body)
                    .map_or(0, |svc| svc.registered);
                vec![Bytes::from(count.to_string())]
            }

            // Liveness probe.
            "mmi.heartbeat" => vec![Bytes::from_static(STATUS_OK)],

            // Broker metadata: version, uptime in seconds, service count.
            "mmi.broker" => vec![
                Bytes::from_static(env!("CARGO_PKG_VERSION").as_bytes()),
                Bytes::from(self.started_at.elapsed().as_secs().to_string()),
                Bytes::from(self.services.len().to_string()),
            ],

            _ => vec![Bytes::from_static(STATUS_NOT_IMPLEMENTED)],
        }
    }

    /// Resolve the service named by the first body frame, if any.
    fn queried_service(&self, body: &[Bytes]) -> Option<&crate::broker::state::ServiceState> {
        let name = body.first()?;
        let name = std::str::from_utf8(name).ok()?;
        self.services.get(name)
    }
}
