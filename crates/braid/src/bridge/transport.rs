//! Relaying a stream's pull contract across a byte transport.
//!
//! [`serve`] runs on the producing side and answers pull requests from a
//! local stream. [`connect`] runs on the consuming side and returns a
//! [`PullStream`] whose pulls and cancels travel over the wire. The two sides
//! may live on different threads or runtimes; the transport is any
//! `AsyncRead + AsyncWrite` (a socket, a pipe pair, an in-memory duplex).

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{BridgeRequest, BridgeResponse};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::stream::{Controller, PullSource, PullStream, Reader};

/// Serves `stream` to the peer on `io` until the stream terminates, the peer
/// cancels, or the peer hangs up. The stream is cancelled in the latter two
/// cases.
pub async fn serve<T, IO>(stream: PullStream<T>, io: IO) -> Result<()>
where
    T: Serialize + Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let mut requests = FramedRead::new(read_half, JsonCodec::<BridgeRequest>::new());
    let mut responses = FramedWrite::new(write_half, JsonCodec::<BridgeResponse<T>>::new());
    let mut reader = stream.into_reader()?;
    let mut owed = 0usize;

    loop {
        let request = if owed == 0 {
            requests.next().await
        } else {
            tokio::select! {
                biased;
                request = requests.next() => request,
                next = reader.read() => {
                    owed -= 1;
                    let response = match next {
                        Ok(Some(chunk)) => BridgeResponse::Chunk { chunk },
                        Ok(None) => BridgeResponse::Done,
                        Err(e) => BridgeResponse::Error { message: e.to_string() },
                    };
                    let last = !matches!(response, BridgeResponse::Chunk { .. });
                    responses.send(response).await?;
                    if last {
                        tracing::debug!("Bridged stream terminated");
                        return Ok(());
                    }
                    continue;
                }
            }
        };

        match request.transpose()? {
            Some(BridgeRequest::PullRequest { desired_size }) => {
                tracing::trace!(desired_size, "Bridge pull request");
                owed = owed.saturating_add(desired_size.max(1));
            }
            Some(BridgeRequest::Cancel { reason }) => {
                tracing::debug!(reason = ?reason, "Bridge peer cancelled");
                abandon(&mut reader, reason).await;
                return Ok(());
            }
            None => {
                tracing::debug!("Bridge peer hung up");
                abandon(&mut reader, Some("bridge peer hung up".to_string())).await;
                return Ok(());
            }
        }
    }
}

async fn abandon<T: Send + 'static>(reader: &mut Reader<T>, reason: Option<String>) {
    if let Err(e) = reader.cancel(reason).await {
        tracing::debug!(error = %e, "Failed to cancel bridged stream");
    }
}

/// Opens the consuming end of a bridge. Nothing is sent until the first read.
pub fn connect<T, IO>(io: IO) -> PullStream<T>
where
    T: DeserializeOwned + Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    connect_with_config(io, StreamConfig::default())
}

/// Like [`connect`]; each pull requests up to the configured high-water mark.
pub fn connect_with_config<T, IO>(io: IO, config: StreamConfig) -> PullStream<T>
where
    T: DeserializeOwned + Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    PullStream::with_config(
        RemoteSource {
            requests: FramedWrite::new(write_half, JsonCodec::new()),
            responses: FramedRead::new(read_half, JsonCodec::new()),
        },
        config,
    )
}

struct RemoteSource<T, IO> {
    requests: FramedWrite<WriteHalf<IO>, JsonCodec<BridgeRequest>>,
    responses: FramedRead<ReadHalf<IO>, JsonCodec<BridgeResponse<T>>>,
}

#[async_trait::async_trait]
impl<T, IO> PullSource<T> for RemoteSource<T, IO>
where
    T: DeserializeOwned + Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn pull(&mut self, controller: &Controller<T>) -> Result<()> {
        let desired_size = controller.desired_size().unwrap_or(0).max(1) as usize;
        self.requests
            .send(BridgeRequest::PullRequest { desired_size })
            .await?;

        for _ in 0..desired_size {
            match self.responses.next().await.transpose()? {
                Some(BridgeResponse::Chunk { chunk }) => controller.enqueue(chunk)?,
                Some(BridgeResponse::Done) => return controller.close(),
                Some(BridgeResponse::Error { message }) => {
                    return Err(StreamError::Remote(message));
                }
                None => {
                    return Err(StreamError::Io(
                        "bridge closed before the stream completed".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> Result<()> {
        self.requests.send(BridgeRequest::Cancel { reason }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Endless source that records the reason it was cancelled with.
    struct Ticker {
        next: u32,
        cancelled: Arc<Mutex<Option<Option<String>>>>,
    }

    #[async_trait::async_trait]
    impl PullSource<u32> for Ticker {
        async fn pull(&mut self, controller: &Controller<u32>) -> Result<()> {
            controller.enqueue(self.next)?;
            self.next += 1;
            Ok(())
        }

        async fn cancel(&mut self, reason: Option<String>) -> Result<()> {
            *self.cancelled.lock().unwrap() = Some(reason);
            Ok(())
        }
    }

    fn ticker() -> (PullStream<u32>, Arc<Mutex<Option<Option<String>>>>) {
        let cancelled = Arc::new(Mutex::new(None));
        let stream = PullStream::new(Ticker {
            next: 0,
            cancelled: Arc::clone(&cancelled),
        });
        (stream, cancelled)
    }

    #[tokio::test]
    async fn relays_every_value() {
        let (client, server) = tokio::io::duplex(1024);
        let served = tokio::spawn(serve(PullStream::iter(0..5u32), server));

        let values: Vec<u32> = connect(client).into_reader().unwrap().read_all().await.unwrap();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn honours_consumer_high_water_mark() {
        let (client, server) = tokio::io::duplex(1024);
        let served = tokio::spawn(serve(PullStream::iter(0..7u32), server));

        let stream = connect_with_config(client, StreamConfig::new(3).unwrap());
        let values: Vec<u32> = stream.into_reader().unwrap().read_all().await.unwrap();
        assert_eq!(values, (0..7).collect::<Vec<_>>());
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remote_error_arrives_as_remote() {
        let (client, server) = tokio::io::duplex(1024);
        let upstream = PullStream::from_stream(futures::stream::iter(vec![
            Ok(1u32),
            Err(StreamError::message("producer failed")),
        ]));
        tokio::spawn(serve(upstream, server));

        let mut reader = connect::<u32, _>(client).into_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(1));
        match reader.read().await {
            Err(StreamError::Remote(message)) => assert_eq!(message, "producer failed"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_reaches_producer_with_reason() {
        let (client, server) = tokio::io::duplex(1024);
        let (upstream, cancelled) = ticker();
        let served = tokio::spawn(serve(upstream, server));

        let mut reader = connect::<u32, _>(client).into_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), Some(1));
        reader.cancel(Some("enough".into())).await.unwrap();

        served.await.unwrap().unwrap();
        assert_eq!(*cancelled.lock().unwrap(), Some(Some("enough".to_string())));
    }

    #[tokio::test]
    async fn hangup_cancels_producer() {
        let (client, server) = tokio::io::duplex(1024);
        let (upstream, cancelled) = ticker();
        let served = tokio::spawn(serve(upstream, server));

        let mut reader = connect::<u32, _>(client).into_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        drop(reader);

        tokio::time::timeout(Duration::from_secs(5), served)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(cancelled.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn huge_pull_requests_saturate_credit() {
        let (client, server) = tokio::io::duplex(1024);
        let served = tokio::spawn(serve(PullStream::iter(0..3u32), server));

        let (read_half, write_half) = tokio::io::split(client);
        let mut requests = FramedWrite::new(write_half, JsonCodec::<BridgeRequest>::new());
        let mut responses = FramedRead::new(read_half, JsonCodec::<BridgeResponse<u32>>::new());
        for _ in 0..2 {
            let request = BridgeRequest::PullRequest {
                desired_size: usize::MAX,
            };
            requests.send(request).await.unwrap();
        }

        let mut frames = Vec::new();
        while let Some(frame) = responses.next().await {
            frames.push(frame.unwrap());
        }
        assert_eq!(
            frames,
            vec![
                BridgeResponse::Chunk { chunk: 0 },
                BridgeResponse::Chunk { chunk: 1 },
                BridgeResponse::Chunk { chunk: 2 },
                BridgeResponse::Done,
            ]
        );
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn truncated_transport_is_io_error() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);

        let mut reader = connect::<u32, _>(client).into_reader().unwrap();
        assert!(matches!(reader.read().await, Err(StreamError::Io(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bridges_across_threads() {
        let (near, far) = std::os::unix::net::UnixStream::pair().unwrap();

        let producer = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                far.set_nonblocking(true).unwrap();
                let far = tokio::net::UnixStream::from_std(far).unwrap();
                let words = ["alpha", "beta", "gamma"].map(String::from);
                let words = PullStream::iter(words);
                serve(words, far).await
            })
        });

        near.set_nonblocking(true).unwrap();
        let near = tokio::net::UnixStream::from_std(near).unwrap();
        let words: Vec<String> = connect(near).into_reader().unwrap().read_all().await.unwrap();
        assert_eq!(words, vec!["alpha", "beta", "gamma"]);

        producer.join().unwrap().unwrap();
    }
}
