//! In-memory duplex pair.
//!
//! Stands in for the WebSocket tunnel in tests: two [`PipeStream`]s share a
//! pair of buffers, and reads park until the peer writes or closes.

use super::ByteStream;
use crate::error::{Result, TorError};
use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Poll, Waker};

struct HalfPipe {
    buf: VecDeque<u8>,
    closed: bool,
    read_waker: Option<Waker>,
}

impl HalfPipe {
    fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            buf: VecDeque::new(),
            closed: false,
            read_waker: None,
        }))
    }
}

pub struct PipeStream {
    incoming: Rc<RefCell<HalfPipe>>,
    outgoing: Rc<RefCell<HalfPipe>>,
}

/// Create a connected pair of in-memory byte streams.
pub fn pipe() -> (PipeStream, PipeStream) {
    let ab = HalfPipe::new();
    let ba = HalfPipe::new();
    (
        PipeStream {
            incoming: Rc::clone(&ba),
            outgoing: Rc::clone(&ab),
        },
        PipeStream {
            incoming: ab,
            outgoing: ba,
        },
    )
}

#[async_trait(?Send)]
impl ByteStream for PipeStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        futures::future::poll_fn(|cx| {
            let mut half = self.incoming.borrow_mut();
            if !half.buf.is_empty() {
                let n = buf.len().min(half.buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = half.buf.pop_front().expect("len checked");
                }
                Poll::Ready(Ok(n))
            } else if half.closed {
                Poll::Ready(Ok(0))
            } else {
                half.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut half = self.outgoing.borrow_mut();
        if half.closed {
            return Err(TorError::Closed);
        }
        half.buf.extend(buf.iter().copied());
        if let Some(waker) = half.read_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        for half in [&self.incoming, &self.outgoing] {
            let mut half = half.borrow_mut();
            half.closed = true;
            if let Some(waker) = half.read_waker.take() {
                waker.wake();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn bytes_cross_the_pipe() {
        let (mut a, mut b) = pipe();
        block_on(async {
            a.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            crate::transport::read_exact(&mut b, &mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });
    }

    #[test]
    fn close_unblocks_reader_with_eof() {
        let (mut a, mut b) = pipe();
        block_on(async {
            b.close().await.unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(a.read(&mut buf).await.unwrap(), 0);
        });
    }
}
