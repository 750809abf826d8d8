use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, UpdateError};
use crate::generation::{GenerationKind, GenerationStore};
use crate::patch_format::{PatchMeta, HEADER_LEN};
use crate::remote::RemoteClient;

/// Stream the patch at `url` into the `Temp` generation.
///
/// The header is read and judged before any body byte is stored, so a stale or
/// unsupported patch costs at most one network chunk. `on_progress(received, total)`
/// counts header bytes too; `total` is `0` when the server sends no length.
/// Returns the patch version embedded in the header.
pub async fn download_patch<F>(
    remote: &RemoteClient,
    store: &GenerationStore,
    url: &str,
    current_version: u32,
    chunk_size: usize,
    mut on_progress: F,
) -> Result<u32>
where
    F: FnMut(u64, u64),
{
    store.reset_temp()?;

    let mut response = remote.open_patch(url).await?;
    let total = response.content_length().unwrap_or(0);
    if response.content_length().is_some() && total < HEADER_LEN as u64 {
        return Err(UpdateError::Corrupt(format!(
            "patch of {total} bytes is shorter than its {HEADER_LEN}-byte header"
        )));
    }

    let mut pending: Vec<u8> = Vec::with_capacity(chunk_size.max(HEADER_LEN));
    while pending.len() < HEADER_LEN {
        match response.chunk().await.map_err(|e| UpdateError::network(url, e))? {
            Some(bytes) => pending.extend_from_slice(&bytes),
            None => {
                return Err(UpdateError::Corrupt(format!(
                    "patch stream ended after {} header bytes",
                    pending.len()
                )))
            }
        }
    }
    let body_head = pending.split_off(HEADER_LEN);

    let meta = PatchMeta::parse(&pending)?;
    meta.verify_header()?;
    if meta.version() <= current_version {
        return Err(UpdateError::Stale {
            remote: meta.version(),
            local: current_version,
        });
    }

    let meta_path = store.meta_file(GenerationKind::Temp);
    tokio::fs::write(&meta_path, meta.as_bytes())
        .await
        .map_err(|e| UpdateError::storage(&meta_path, e))?;
    let mut received = HEADER_LEN as u64;
    on_progress(received, total);
    debug!(version = meta.version(), total, "patch header accepted");

    let data_path = store.data_file(GenerationKind::Temp);
    let mut data = File::create(&data_path)
        .await
        .map_err(|e| UpdateError::storage(&data_path, e))?;

    let mut buf = body_head;
    loop {
        let mut start = 0;
        while buf.len() - start >= chunk_size {
            data.write_all(&buf[start..start + chunk_size])
                .await
                .map_err(|e| UpdateError::storage(&data_path, e))?;
            start += chunk_size;
            received += chunk_size as u64;
            on_progress(received, total);
        }
        buf.drain(..start);

        match response.chunk().await.map_err(|e| UpdateError::network(url, e))? {
            Some(bytes) => buf.extend_from_slice(&bytes),
            None => break,
        }
    }
    if !buf.is_empty() {
        data.write_all(&buf)
            .await
            .map_err(|e| UpdateError::storage(&data_path, e))?;
        received += buf.len() as u64;
        on_progress(received, total);
    }

    data.flush().await.map_err(|e| UpdateError::storage(&data_path, e))?;
    data.sync_all().await.map_err(|e| UpdateError::storage(&data_path, e))?;

    info!(version = meta.version(), bytes = received, "patch downloaded");
    Ok(meta.version())
}
