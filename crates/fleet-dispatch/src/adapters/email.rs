//! Email destination adapter: POST to a transactional-email HTTP relay
//! (the connection's `url` plus bearer `api_key`, matching the shape of
//! providers like Postmark/SendGrid's send API). The mapped payload must
//! already carry `to`, `subject`, and `body`; that projection is the
//! route's `field_mapping` responsibility, not this adapter's.

use super::AttemptResult;

pub async fn send(client: &reqwest::Client, destination_config: &serde_json::Value, payload: &serde_json::Value) -> AttemptResult {
    let Some(url) = destination_config.get("url").and_then(|v| v.as_str()) else {
        return AttemptResult::network_error("email destination missing \"url\"");
    };
    for field in ["to", "subject", "body"] {
        if payload.get(field).is_none() {
            return AttemptResult::network_error(format!("email payload missing \"{field}\" after field mapping"));
        }
    }

    let mut request = client.post(url);
    if let Some(api_key) = destination_config.get("api_key").and_then(|v| v.as_str()) {
        request = request.bearer_auth(api_key);
    }
    if let Some(from) = destination_config.get("from").and_then(|v| v.as_str()) {
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("from".to_string(), serde_json::Value::String(from.to_string()));
        }
        request = request.json(&body);
    } else {
        request = request.json(payload);
    }

    match request.send().await {
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
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn valid_payload() -> serde_json::Value {
        serde_json::json!({"to": "a@example.com", "subject": "Hi", "body": "text"})
    }

    #[tokio::test]
    async fn sends_bearer_auth_header_when_api_key_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let config = serde_json::json!({"url": server.uri(), "api_key": "test-key"});
        let result = send(&client, &config, &valid_payload()).await;
        assert_eq!(result.response_status, Some(202));
    }

    #[tokio::test]
    async fn missing_required_field_fails_before_any_request_is_made() {
        let client = reqwest::Client::new();
        let config = serde_json::json!({"url": "http://127.0.0.1:1"});
        let result = send(&client, &config, &serde_json::json!({"to": "a@example.com"})).await;
        assert!(result.error.is_some());
    }
}
