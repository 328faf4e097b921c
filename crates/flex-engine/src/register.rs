use std::time::Duration;

use flex_core::CapabilityRegistry;

/// Pushes every active capability in `registry` to `url` (a peer
/// engine's `POST /v1/capabilities`), retrying with a short linear
/// backoff up to `max_retries` times. Mirrors the provider client's
/// `Client::post(url).json(&body).send().await?` shape in
/// `tandem-providers`, aimed at a sibling engine instead of a model API.
pub async fn self_register(
    url: &str,
    max_retries: u32,
    registry: &CapabilityRegistry,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let records = registry.get_snapshot().await.active;

    for record in records {
        let mut attempt = 0;
        loop {
            let result = client.post(url).json(&record).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        target: "flex.obs",
                        capability_id = %record.capability_id,
                        %url,
                        "capability self-registered"
                    );
                    break;
                }
                Ok(response) => {
                    tracing::warn!(
                        target: "flex.obs",
                        capability_id = %record.capability_id,
                        status = %response.status(),
                        attempt,
                        "capability self-registration rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "flex.obs",
                        capability_id = %record.capability_id,
                        error = %err,
                        attempt,
                        "capability self-registration request failed"
                    );
                }
            }
            attempt += 1;
            if attempt > max_retries {
                anyhow::bail!("giving up self-registering {} after {attempt} attempts", record.capability_id);
            }
            tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
        }
    }

    Ok(())
}
