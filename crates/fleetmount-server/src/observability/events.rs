//! Structured Events
//!
//! Structured event logging with consistent fields across the server.
//! Each event type has a dedicated function so field names stay stable for
//! log queries.
//!
//! Event types:
//! - `context_created` / `context_closed` - Topology context lifecycle
//! - `mastership_gained` / `mastership_lost` - Singleton election outcome
//! - `singleton_registration_failed` - Candidate registration attempt failed
//! - `device_connected` / `device_connection_failed` - Owner-side session state
//! - `mount_registered` / `mount_unregistered` - Local mount point lifecycle
//! - `schema_resolution_failed` - Slave could not build a schema context
//! - `actor_spawned` / `actor_stopped` - Device actor lifecycle

use tracing::{error, info, warn};

/// Emit a topology context created event
pub fn context_created(node_id: &str, member: &str) {
    info!(
        event_type = "context_created",
        node_id = %node_id,
        member = %member,
        "Topology context created"
    );
}

/// Emit a topology context closed event
pub fn context_closed(node_id: &str, member: &str) {
    info!(
        event_type = "context_closed",
        node_id = %node_id,
        member = %member,
        "Topology context closed"
    );
}

/// Emit a mastership gained event
pub fn mastership_gained(node_id: &str, member: &str) {
    info!(
        event_type = "mastership_gained",
        node_id = %node_id,
        member = %member,
        "Mastership gained"
    );
}

/// Emit a mastership lost event
pub fn mastership_lost(node_id: &str, member: &str) {
    info!(
        event_type = "mastership_lost",
        node_id = %node_id,
        member = %member,
        "Mastership lost"
    );
}

/// Emit a singleton registration failure event
pub fn singleton_registration_failed(node_id: &str, attempt: u32, max_attempts: u32, error: &str) {
    warn!(
        event_type = "singleton_registration_failed",
        node_id = %node_id,
        attempt = attempt,
        max_attempts = max_attempts,
        error = %error,
        "Singleton registration failed"
    );
}

/// Emit a device connected event
pub fn device_connected(node_id: &str, address: &str, member: &str, capabilities: usize) {
    info!(
        event_type = "device_connected",
        node_id = %node_id,
        address = %address,
        member = %member,
        capabilities = capabilities,
        "Device connected"
    );
}

/// Emit a device connection failure event
pub fn device_connection_failed(node_id: &str, address: &str, attempts: u32, error: &str) {
    error!(
        event_type = "device_connection_failed",
        node_id = %node_id,
        address = %address,
        attempts = attempts,
        error = %error,
        "Device connection failed"
    );
}

/// Emit a mount registered event
pub fn mount_registered(node_id: &str, role: &str, master: &str) {
    info!(
        event_type = "mount_registered",
        node_id = %node_id,
        role = %role,
        master = %master,
        "Mount point registered"
    );
}

/// Emit a mount unregistered event
pub fn mount_unregistered(node_id: &str, role: &str, reason: &str) {
    info!(
        event_type = "mount_unregistered",
        node_id = %node_id,
        role = %role,
        reason = %reason,
        "Mount point unregistered"
    );
}

/// Emit a schema resolution failure event
pub fn schema_resolution_failed(node_id: &str, attempt: u32, will_retry: bool, error: &str) {
    error!(
        event_type = "schema_resolution_failed",
        node_id = %node_id,
        attempt = attempt,
        will_retry = will_retry,
        error = %error,
        "Schema resolution failed"
    );
}

/// Emit an actor spawned event
pub fn actor_spawned(actor_type: &str, actor_id: &str, member: &str) {
    info!(
        event_type = "actor_spawned",
        actor_type = %actor_type,
        actor_id = %actor_id,
        member = %member,
        "Actor spawned"
    );
}

/// Emit an actor stopped event
pub fn actor_stopped(actor_type: &str, actor_id: &str, reason: &str, member: &str) {
    info!(
        event_type = "actor_stopped",
        actor_type = %actor_type,
        actor_id = %actor_id,
        reason = %reason,
        member = %member,
        "Actor stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_functions_dont_panic() {
        context_created("node-1", "member-1");
        context_closed("node-1", "member-1");
        mastership_gained("node-1", "member-1");
        mastership_lost("node-1", "member-1");
        singleton_registration_failed("node-1", 1, 3, "provider unavailable");
        device_connected("node-1", "127.0.0.1:1234", "member-1", 4);
        device_connection_failed("node-1", "127.0.0.1:1234", 3, "refused");
        mount_registered("node-1", "slave", "member-1");
        mount_unregistered("node-1", "slave", "disconnected");
        schema_resolution_failed("node-1", 1, true, "ask timeout");
        actor_spawned("DeviceActor", "node-1", "member-1");
        actor_stopped("DeviceActor", "node-1", "context_closed", "member-1");
    }
}
