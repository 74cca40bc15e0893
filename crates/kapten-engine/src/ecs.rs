//! Runtime identifier of the executing container.

use serde_json::Value;
use tracing::{info, warn};

/// The ECS task id from the container metadata endpoint when running in
/// prod, else `"local"`. A metadata failure is logged and degrades to
/// `"local"`; the id is informational and must not fail the run.
pub(crate) async fn fetch_task_id() -> String {
    if std::env::var("IS_PROD").as_deref() != Ok("1") {
        return "local".to_owned();
    }
    let Ok(base) = std::env::var("ECS_CONTAINER_METADATA_URI_V4") else {
        warn!("IS_PROD is set but ECS_CONTAINER_METADATA_URI_V4 is not");
        return "local".to_owned();
    };
    match fetch_from_metadata(&base).await {
        Some(id) => {
            info!("Task running as ECS task {id}");
            id
        }
        None => {
            warn!("could not read the ECS task id from {base}");
            "local".to_owned()
        }
    }
}

async fn fetch_from_metadata(base: &str) -> Option<String> {
    let body: Value = reqwest::get(format!("{base}/task"))
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    let arn = body.get("TaskARN")?.as_str()?;
    arn.rsplit('/').next().map(str::to_owned)
}
