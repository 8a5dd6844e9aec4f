//! Webhook destination adapter: POST the field-mapped payload to a
//! configured URL, signed with an HMAC-SHA256 of the request body so the
//! receiving endpoint can verify it came from this server.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::AttemptResult;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "X-Fleet-Signature";

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub async fn send(client: &reqwest::Client, destination_config: &serde_json::Value, payload: &serde_json::Value) -> AttemptResult {
    let Some(url) = destination_config.get("url").and_then(|v| v.as_str()) else {
        return AttemptResult::network_error("webhook destination missing \"url\"");
    };
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => return AttemptResult::network_error(e),
    };

    let mut request = client.post(url).header("Content-Type", "application/json");
    if let Some(secret) = destination_config.get("secret").and_then(|v| v.as_str()) {
        request = request.header(SIGNATURE_HEADER, sign(secret, &body));
    }

    match request.body(body).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let response_body = response.text().await.ok();
            AttemptResult::ok(Some(status), response_body)
        }
        Err(e) => AttemptResult::network_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn delivers_successfully_and_carries_signature_when_secret_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let config = serde_json::json!({"url": format!("{}/hook", server.uri()), "secret": "s3cret"});
        let result = send(&client, &config, &serde_json::json!({"hello": "world"})).await;

        assert_eq!(result.response_status, Some(200));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn surfaces_non_2xx_status_without_treating_it_as_a_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let config = serde_json::json!({"url": server.uri()});
        let result = send(&client, &config, &serde_json::json!({})).await;

        assert_eq!(result.response_status, Some(500));
    }

    #[tokio::test]
    async fn missing_url_is_reported_as_an_error_without_panicking() {
        let client = reqwest::Client::new();
        let result = send(&client, &serde_json::json!({}), &serde_json::json!({})).await;
        assert!(result.error.is_some());
    }
}
