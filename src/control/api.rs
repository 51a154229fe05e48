use crate::{EndpointStatus, active_endpoint, get_endpoint_status};

/// Fetch the active endpoint's status snapshot, if one is installed.
pub fn get_status() -> Option<EndpointStatus> {
    get_endpoint_status()
}

/// Flip the running flag of the client stream with the given id.
pub fn set_running(client_id: u32, running: bool) -> bool {
    let Some(endpoint) = active_endpoint() else {
        return false;
    };
    match endpoint.client_by_id(client_id) {
        Some(client) => {
            client.set_running(running);
            true
        }
        None => false,
    }
}

/// Request or revoke the mixing loop on the active endpoint.
pub fn set_mixing_enabled(enabled: bool) -> bool {
    match active_endpoint() {
        Some(endpoint) => {
            endpoint.set_callback_enabled(enabled);
            true
        }
        None => false,
    }
}
