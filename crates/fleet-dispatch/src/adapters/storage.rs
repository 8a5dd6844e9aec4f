//! Storage destination adapter: write the mapped payload to a local
//! directory as JSON, the way [`fleet_core::deliverables::write_files`]
//! writes uploaded files. No cloud-storage SDK is in the
//! dependency stack; a destination's `path` is resolved under a configured
//! root the same way deliverable uploads are.

use std::path::Path;

use super::AttemptResult;

pub async fn send(destination_config: &serde_json::Value, payload: &serde_json::Value) -> AttemptResult {
    let Some(root) = destination_config.get("root").and_then(|v| v.as_str()) else {
        return AttemptResult::network_error("storage destination missing \"root\"");
    };
    let subdir = destination_config.get("path").and_then(|v| v.as_str()).unwrap_or("");

    let dir = Path::new(root).join(subdir);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return AttemptResult::network_error(anyhow::anyhow!(e).context("failed to create storage directory"));
    }

    let file_name = format!("{}.json", uuid::Uuid::new_v4());
    let file_path = dir.join(&file_name);
    let body = match serde_json::to_vec_pretty(payload) {
        Ok(body) => body,
        Err(e) => return AttemptResult::network_error(e),
    };

    match tokio::fs::write(&file_path, &body).await {
        Ok(()) => AttemptResult::ok(Some(200), Some(file_path.display().to_string())),
        Err(e) => AttemptResult::network_error(anyhow::anyhow!(e).context("failed to write storage delivery")),
    }
}
