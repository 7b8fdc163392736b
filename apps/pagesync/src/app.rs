//! Wires configuration, source image, destination and display together.

use std::sync::Arc;

use anyhow::Context;
use pagesync_transfer::FileImage;
use pagesync_upload::{DirectoryPageStore, ImageMetadata, ImageUploader};

use crate::config::Config;
use crate::display;

/// Runs one upload session.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let source_path = config.source.clone();
    tracing::info!(path = %source_path.display(), "hashing source image");
    let (image, metadata) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let metadata = ImageMetadata::from_file(&source_path)
            .with_context(|| format!("reading {}", source_path.display()))?;
        let image = FileImage::open(&source_path)?;
        Ok((image, metadata))
    })
    .await??;

    let store = DirectoryPageStore::open(&config.destination, &config.object_name())
        .await?
        .with_page_size(config.page_size);
    let mut uploader = ImageUploader::new(Arc::new(store), config.upload_options())
        .with_overwrite(config.overwrite);
    let events = uploader
        .take_events()
        .context("upload events already taken")?;
    let renderer = tokio::spawn(display::render(events));

    let result = uploader.sync(image, &metadata).await;
    // Closes the event channel so the display drains and exits.
    drop(uploader);
    renderer.await?;

    let result = result?;
    tracing::info!(
        bytes = result.bytes_transferred,
        hash = %metadata.content_hash,
        "upload finished"
    );
    Ok(())
}
