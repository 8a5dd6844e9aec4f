//! Chat destination adapter: POST to an incoming-webhook style URL (Slack,
//! Discord, Teams), wrapping the mapped payload under a `text` field when
//! the route didn't already shape one via `field_mapping`.

use super::AttemptResult;

pub async fn send(client: &reqwest::Client, destination_config: &serde_json::Value, payload: &serde_json::Value) -> AttemptResult {
    let Some(url) = destination_config.get("url").and_then(|v| v.as_str()) else {
        return AttemptResult::network_error("chat destination missing \"url\"");
    };

    let body = if payload.get("text").is_some() {
        payload.clone()
    } else {
        serde_json::json!({ "text": payload.to_string() })
    };

    match client.post(url).json(&body).send().await {
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
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn wraps_mapped_text_when_no_text_field_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let config = serde_json::json!({"url": server.uri()});
        let result = send(&client, &config, &serde_json::json!({"task": "done"})).await;
        assert_eq!(result.response_status, Some(200));
    }

    #[tokio::test]
    async fn passes_preformatted_text_field_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let config = serde_json::json!({"url": server.uri()});
        let result = send(&client, &config, &serde_json::json!({"text": "hi"})).await;
        assert_eq!(result.response_status, Some(200));
    }
}
