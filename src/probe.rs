use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::AttachParams, Api};
use tokio::time::timeout;
use tracing::debug;

use crate::{Error, Result};

/// Bound on the whole probe exchange; the reconcile deadline is the outer
/// limit, this keeps a wedged container from eating it entirely.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes used under `mount_path`, measured with `du` inside the session
/// container. Every failure mode maps onto [`Error::Probe`]; the caller
/// skips the scale check for the cycle rather than aborting convergence.
pub async fn used_bytes(
    pods: &Api<Pod>,
    pod_name: &str,
    container: &str,
    mount_path: &str,
) -> Result<u128> {
    let exchange = async {
        let mut attached = pods
            .exec(
                pod_name,
                vec!["du", "-hs", "-BK", mount_path],
                &AttachParams::default().container(container).stderr(false),
            )
            .await
            .map_err(|e| Error::Probe(format!("exec in {pod_name}: {e}")))?;

        let stdout = attached
            .stdout()
            .ok_or_else(|| Error::Probe("exec returned no stdout".to_string()))?;
        let mut stream = tokio_util::io::ReaderStream::new(stdout);
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Probe(format!("reading du output: {e}")))?;
            output.push_str(&String::from_utf8_lossy(&chunk));
        }
        attached
            .join()
            .await
            .map_err(|e| Error::Probe(format!("du did not complete: {e}")))?;
        debug!(%pod_name, %output, "volume probe");
        parse_du_kilobytes(&output)
    };
    timeout(PROBE_TIMEOUT, exchange)
        .await
        .map_err(|_| Error::Probe(format!("probe of {pod_name} timed out")))?
}

/// Parses `du -hs -BK` output of the form `9000000K\t/home/jovyan`.
pub fn parse_du_kilobytes(output: &str) -> Result<u128> {
    let field = output
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Probe(format!("empty du output {output:?}")))?;
    let digits = field.strip_suffix('K').unwrap_or(field);
    let kilobytes: u128 = digits
        .parse()
        .map_err(|_| Error::Probe(format!("unparsable du output {output:?}")))?;
    Ok(kilobytes << 10)
}

/// Integer utilization percentage.
pub fn usage_percent(used_bytes: u128, capacity_bytes: u128) -> u64 {
    if capacity_bytes == 0 {
        return 100;
    }
    (used_bytes.saturating_mul(100) / capacity_bytes) as u64
}
