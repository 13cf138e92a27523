//! Token-bucket throttled output.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};

/// Byte-granular token bucket. Reservations may drive the balance
/// negative; the caller then waits until it would be back at zero.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// - `refill_per_sec`: sustained bytes per second
    /// - `burst`: bytes that may go out without delay
    pub fn new(refill_per_sec: u64, burst: u64) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(1) as f64,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn burst(&self) -> usize {
        self.capacity as usize
    }

    /// Take `n` tokens at `now` and return how long to wait before sending.
    pub fn reserve_at(&mut self, n: usize, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_per_sec)
        }
    }
}

/// Writer that paces output through a [`TokenBucket`]. Without a bucket
/// (trusted peers) it writes straight through.
pub struct ThrottledWriter<W> {
    inner: W,
    bucket: Option<TokenBucket>,
}

impl<W: AsyncWrite + Unpin> ThrottledWriter<W> {
    pub fn new(inner: W, bucket: Option<TokenBucket>) -> Self {
        Self { inner, bucket }
    }

    pub fn unlimited(inner: W) -> Self {
        Self::new(inner, None)
    }

    pub fn is_throttled(&self) -> bool {
        self.bucket.is_some()
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.bucket.as_mut() {
            None => self.inner.write_all(buf).await?,
            Some(bucket) => {
                for chunk in buf.chunks(bucket.burst().max(1)) {
                    let wait = bucket.reserve_at(chunk.len(), Instant::now());
                    if !wait.is_zero() {
                        sleep(wait).await;
                    }
                    self.inner.write_all(chunk).await?;
                    self.inner.flush().await?;
                }
            }
        }
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
