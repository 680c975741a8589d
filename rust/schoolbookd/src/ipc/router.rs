use super::handlers;
use super::helpers::err;
use super::types::{AppState, Request};

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::students::try_handle,
    handlers::representatives::try_handle,
    handlers::teachers::try_handle,
    handlers::subjects::try_handle,
    handlers::calendar::try_handle,
    handlers::sections::try_handle,
    handlers::assignments::try_handle,
    handlers::evaluations::try_handle,
    handlers::grades::try_handle,
    handlers::reports::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    for try_handle in HANDLERS {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    tracing::warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
