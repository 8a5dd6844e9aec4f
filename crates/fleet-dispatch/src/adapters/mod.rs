//! Destination adapters: one per [`fleet_db::models::DestinationKind`],
//! each turning a projected payload into an outbound call and reporting
//! back the shape [`crate::retry`] needs to classify the result.

pub mod chat;
pub mod email;
pub mod storage;
pub mod webhook;

use fleet_db::models::DestinationKind;

/// Delivery-log `response_body` cap.
pub const MAX_RESPONSE_BODY_BYTES: usize = 50 * 1024;

/// The outcome of a single delivery attempt, before retry classification.
pub struct AttemptResult {
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

impl AttemptResult {
    pub fn ok(response_status: Option<u16>, response_body: Option<String>) -> Self {
        Self {
            response_status,
            response_body,
            error: None,
        }
    }

    pub fn network_error(error: impl std::fmt::Display) -> Self {
        Self {
            response_status: None,
            response_body: None,
            error: Some(error.to_string()),
        }
    }
}

/// Truncate `body` to [`MAX_RESPONSE_BODY_BYTES`] on a char boundary, so the
/// persisted `delivery_logs.response_body` never grows unbounded on a
/// destination that echoes something huge back.
fn truncate_response_body(body: String) -> String {
    if body.len() <= MAX_RESPONSE_BODY_BYTES {
        return body;
    }
    let mut end = MAX_RESPONSE_BODY_BYTES;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Run the adapter matching `kind` against `destination_config` and the
/// field-mapped `payload`, truncating any response body to the
/// delivery-log cap before it reaches the caller.
pub async fn dispatch(
    client: &reqwest::Client,
    kind: DestinationKind,
    destination_config: &serde_json::Value,
    payload: &serde_json::Value,
) -> AttemptResult {
    let mut result = match kind {
        DestinationKind::Webhook => webhook::send(client, destination_config, payload).await,
        DestinationKind::Email => email::send(client, destination_config, payload).await,
        DestinationKind::Storage => storage::send(destination_config, payload).await,
        DestinationKind::Chat => chat::send(client, destination_config, payload).await,
    };
    result.response_body = result.response_body.map(truncate_response_body);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_oversized_body_to_the_cap() {
        let body = "x".repeat(MAX_RESPONSE_BODY_BYTES + 100);
        let truncated = truncate_response_body(body);
        assert_eq!(truncated.len(), MAX_RESPONSE_BODY_BYTES);
    }

    #[test]
    fn leaves_small_body_unchanged() {
        let body = "ok".to_string();
        assert_eq!(truncate_response_body(body.clone()), body);
    }
}
