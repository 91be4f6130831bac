use std::pin::Pin;
use std::task::{Context, Poll};

use md5::{Digest, Md5};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

pin_project! {
    /// Passes bytes through unchanged while feeding them into an MD5 digest.
    pub struct Md5Reader<R> {
        #[pin]
        inner: R,
        hasher: Md5,
        bytes_read: u64,
    }
}

impl<R> Md5Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Hex digest of everything read so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

impl<R: AsyncRead> AsyncRead for Md5Reader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let filled_before = buf.filled().len();
        let poll = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[filled_before..];
            this.hasher.update(fresh);
            *this.bytes_read += fresh.len() as u64;
        }
        poll
    }
}
