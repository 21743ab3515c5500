use std::path::PathBuf;

use futures::{stream::BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;

use crate::words::Chunk;

/// Lines of every file in `paths`, one after another, or stdin when empty.
///
/// Files that cannot be opened are logged and skipped.
pub async fn open_input(paths: &[PathBuf]) -> BoxStream<'static, Chunk> {
    let lines: BoxStream<'static, std::io::Result<String>> = if paths.is_empty() {
        LinesStream::new(BufReader::new(tokio::io::stdin()).lines()).boxed()
    } else {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            match tokio::fs::File::open(path).await {
                Ok(file) => files.push(LinesStream::new(BufReader::new(file).lines())),
                Err(e) => log::warn!("skipping {}: {}", path.display(), e),
            }
        }
        futures::stream::iter(files).flatten().boxed()
    };

    lines
        .filter_map(|line| async move {
            match line {
                Ok(line) => Some(Chunk::Line(line)),
                Err(e) => {
                    log::warn!("skipping unreadable input: {}", e);
                    None
                }
            }
        })
        .boxed()
}

#[cfg(test)]
#[path = "input_test.rs"]
mod input_test;
