use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{SourceError, Transport};
use crate::index::{Composable, Index};
use crate::store::STORE_DIR_NAME;
use crate::task::{TaskAdapter, TransferContext, TransferError};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A build output directory on a local (or mounted) filesystem
#[derive(Debug, Clone)]
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn fetch_index(&self, name: &str) -> Result<Index, SourceError> {
        let path = self.root.join(name);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::IndexNotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    fn task(&self, composable: &Composable) -> Arc<dyn TaskAdapter> {
        Arc::new(FileTask {
            path: self
                .root
                .join(STORE_DIR_NAME)
                .join(composable.hash.as_str()),
        })
    }
}

#[derive(Debug)]
struct FileTask {
    path: PathBuf,
}

#[async_trait]
impl TaskAdapter for FileTask {
    async fn start(&self, ctx: &mut TransferContext) -> Result<(), TransferError> {
        let offset = ctx.progress.get();

        let mut input = tokio::fs::File::open(&self.path).await?;
        input.seek(SeekFrom::Start(offset)).await?;

        let mut output = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&ctx.output)
            .await?;
        output.set_len(offset).await?;
        output.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = ctx.interrupted() => {
                    output.flush().await?;
                    return Err(TransferError::Interrupted);
                }
                read = input.read(&mut buffer) => read?,
            };
            if read == 0 {
                break;
            }
            output.write_all(&buffer[..read]).await?;
            ctx.progress.add(read as u64);
        }
        output.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::NixHash;
    use crate::task::{Progress, Signal};
    use tempfile::TempDir;
    use tokio::sync::watch;

    #[tokio::test]
    async fn test_copy_resumes_from_offset() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("src").join(STORE_DIR_NAME);
        tokio::fs::create_dir_all(&store).await.unwrap();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(store.join("abc"), &data).await.unwrap();

        // pretend the first 1000 bytes already landed, with junk after them
        let output = temp.path().join("out");
        let mut partial = data[..1000].to_vec();
        partial.extend_from_slice(b"junk");
        tokio::fs::write(&output, &partial).await.unwrap();

        let transport = FileTransport::new(temp.path().join("src"));
        let composable = Composable::new(NixHash::from("abc"), data.len() as u64);
        let adapter = transport.task(&composable);

        let progress = Progress::default();
        progress.add(1000);
        let (_tx, rx) = watch::channel(Signal::Run);
        let mut ctx = TransferContext::new(composable, output.clone(), progress.clone(), rx);

        adapter.start(&mut ctx).await.unwrap();
        assert_eq!(progress.get(), data.len() as u64);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_chunk_fails() {
        let temp = TempDir::new().unwrap();
        let transport = FileTransport::new(temp.path());
        let composable = Composable::new(NixHash::from("missing"), 1);
        let adapter = transport.task(&composable);

        let (_tx, rx) = watch::channel(Signal::Run);
        let mut ctx =
            TransferContext::new(composable, temp.path().join("out"), Progress::default(), rx);
        assert!(matches!(
            adapter.start(&mut ctx).await,
            Err(TransferError::Io(_))
        ));

        assert!(matches!(
            transport.fetch_index("nereid.json").await,
            Err(SourceError::IndexNotFound(_))
        ));
    }
}
