// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs::File, io, path::Path, sync::Arc};

use bytes::Bytes;
use tokio::fs;

/// The destination file, opened once and written by every segment at its own
/// offset.
///
/// Writes go through positional I/O on the blocking pool, so segments never
/// share a cursor and need no lock as long as their ranges are disjoint.
#[derive(Debug, Clone)]
pub(crate) struct SharedFile {
    inner: Arc<File>,
}

impl SharedFile {
    /// Create (or truncate) `path` and size it to `len` when known. A file
    /// that cannot be sized is removed again.
    pub async fn create(path: &Path, len: Option<u64>) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)
            .await?;
        let sized = match len {
            Some(len) => file.set_len(len).await,
            None => Ok(()),
        };
        if let Err(e) = sized {
            drop(file);
            let _ = remove_partial(path).await;
            return Err(e);
        }

        Ok(Self {
            inner: Arc::new(file.into_std().await),
        })
    }

    pub async fn write_all_at(&self, buf: Bytes, offset: u64) -> io::Result<()> {
        let file = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || write_all_at(&file, &buf, offset))
            .await
            .map_err(io::Error::other)?
    }

    pub async fn sync_all(&self) -> io::Result<()> {
        let file = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(io::Error::other)?
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Remove a partially written destination; a missing file is fine.
pub(crate) async fn remove_partial(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
