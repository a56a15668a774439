//! Enriched request types handed to middleware and handlers.

use soarpc_client::Client;
use soarpc_common::{Context, Control, JobRequest, Value};

/// A job request as the job middleware sees it: the wire request plus a
/// nested client configured for this server's outbound routing, with the
/// job's context already propagated.
pub struct EnrichedJobRequest {
    pub request: JobRequest,
    pub client: Client,
}

/// One action as handlers see it: the action name and body plus the job's
/// context and control headers, and the context-propagating nested client.
pub struct EnrichedActionRequest {
    pub action: String,
    pub body: Value,
    pub context: Context,
    pub control: Control,
    pub client: Client,
}

impl EnrichedActionRequest {
    /// Whether the given switch is active in the request context.
    pub fn switch_is_active(&self, switch: i64) -> bool {
        self.context.switches.contains(&switch)
    }
}
