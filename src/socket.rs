use crate::{
    config::{ClientConfig, ServerConfig},
    connection::{Connection, Session},
    endpoint::Endpoint,
    handshake::{
        ClientHandshake, HandshakeRequest, HandshakeResponse, Negotiated, Negotiator, Upgrade,
    },
    CloseReason, Error, HandshakeError, Role,
};
use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use std::{io, sync::Arc, time::Instant};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    time::timeout,
};
use url::Url;

const READ_BUFFER_SIZE: usize = 16 * 1024;

enum Event {
    Read(io::Result<usize>),
    Wrote(io::Result<usize>),
    Wakeup,
    Deadline,
}

/// A [`Connection`] driven over a tokio stream.
pub struct WebSocket<Stream> {
    stream: BufStream<Stream>,
    connection: Connection,
}

impl<Stream> WebSocket<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
{
    /// Read an upgrade request from `stream` and answer it.
    ///
    /// A request that is not a WebSocket upgrade gets a 400 and
    /// [`HandshakeError::NotWebSocket`].
    pub async fn accept(
        stream: Stream,
        config: &ServerConfig,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Self, Error> {
        WebSocket::accept_with(stream, &Negotiator::new(config.clone()), endpoint).await
    }

    pub async fn accept_with(
        stream: Stream,
        negotiator: &Negotiator,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Self, Error> {
        let config = &negotiator.config().config;
        let mut stream = BufStream::new(stream);
        let negotiated = with_timeout(
            config.handshake_timeout(),
            server_handshake(&mut stream, negotiator),
        )
        .await?;

        Ok(WebSocket {
            stream,
            connection: Connection::new(Role::Server, config, negotiated, endpoint),
        })
    }

    /// Send an upgrade request for `url` over `stream` and check the answer.
    pub async fn connect(
        url: &Url,
        stream: Stream,
        config: &ClientConfig,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Self, Error> {
        let client = ClientHandshake::prepare_request(url, config)?;
        let mut stream = BufStream::new(stream);
        let negotiated = with_timeout(
            config.config.handshake_timeout(),
            client_handshake(&mut stream, client, config.config.max_handshake_len()),
        )
        .await?;
        debug!("connected to {}", url);

        Ok(WebSocket {
            stream,
            connection: Connection::new(Role::Client, &config.config, negotiated, endpoint),
        })
    }

    /// A handle for sending from other tasks.
    pub fn session(&self) -> Session {
        self.connection.session().clone()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn get_ref(&self) -> &Stream {
        self.stream.get_ref()
    }

    /// Open the connection and drive it until it closes.
    ///
    /// Reads and writes run side by side, so a peer that stops reading only
    /// stalls the write half; the close timeout still fires. Once CLOSED,
    /// whatever is queued is written and the transport shut down, bounded by
    /// the close timeout too.
    pub async fn run(self) -> Result<CloseReason, Error> {
        let WebSocket {
            stream,
            mut connection,
        } = self;
        let notifier = connection.notifier();
        let (mut reader, mut writer) = tokio::io::split(stream);
        connection.open(Instant::now())?;

        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut pending = Bytes::new();
        let mut unflushed = false;

        loop {
            connection.tick(Instant::now());
            if connection.is_closed() {
                break;
            }
            if pending.is_empty() {
                if let Some(next) = connection.next_outbound(Instant::now()) {
                    pending = next;
                }
            }

            let writing = !pending.is_empty() || unflushed;
            let deadline = connection.next_deadline();
            let event = tokio::select! {
                result = reader.read_buf(&mut buffer) => Event::Read(result),
                result = write_some(&mut writer, &pending), if writing => Event::Wrote(result),
                _ = notifier.notified() => Event::Wakeup,
                _ = sleep_until(deadline) => Event::Deadline,
            };

            match event {
                Event::Read(Ok(0)) => connection.transport_closed(),
                Event::Read(Ok(_)) => {
                    connection.receive(&buffer, Instant::now());
                    buffer.clear();
                }
                Event::Read(Err(error)) | Event::Wrote(Err(error)) => {
                    connection.transport_failed(error.into())
                }
                Event::Wrote(Ok(_)) if pending.is_empty() => unflushed = false,
                Event::Wrote(Ok(0)) => connection
                    .transport_failed(io::Error::from(io::ErrorKind::WriteZero).into()),
                Event::Wrote(Ok(written)) => {
                    pending.advance(written);
                    unflushed = true;
                }
                Event::Wakeup | Event::Deadline => {}
            }
        }

        let close_timeout = connection.config().close_timeout();
        match timeout(close_timeout, drain(&mut writer, pending, &mut connection)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!("shutdown failed: {}", error),
            Err(_) => debug!("shutdown timed out after {:?}", close_timeout),
        }

        Ok(connection
            .close_reason()
            .unwrap_or_else(|| CloseReason::abnormal("")))
    }
}

/// Write part of `pending`, or flush once it is all written.
async fn write_some(
    writer: &mut (impl AsyncWrite + Unpin),
    pending: &[u8],
) -> io::Result<usize> {
    if pending.is_empty() {
        writer.flush().await?;
        Ok(0)
    } else {
        writer.write(pending).await
    }
}

async fn drain(
    writer: &mut (impl AsyncWrite + Unpin),
    mut pending: Bytes,
    connection: &mut Connection,
) -> Result<(), Error> {
    loop {
        writer.write_all(&pending).await?;
        match connection.next_outbound(Instant::now()) {
            Some(next) => pending = next,
            None => break,
        }
    }
    writer.shutdown().await?;
    Ok(())
}

async fn server_handshake(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    negotiator: &Negotiator,
) -> Result<Negotiated, Error> {
    let max_len = negotiator.config().config.max_handshake_len();
    let request = HandshakeRequest::read(stream, max_len).await?;
    match negotiator.upgrade(&request) {
        Upgrade::Accepted {
            response,
            negotiated,
        } => {
            response.write(stream).await?;
            debug!("accepted upgrade for {}", request.resource);
            Ok(negotiated)
        }
        Upgrade::NotApplicable => {
            HandshakeResponse::rejection(400, "Bad Request")
                .write(stream)
                .await?;
            Err(HandshakeError::NotWebSocket.into())
        }
        Upgrade::Failed { response, error } => {
            response.write(stream).await?;
            Err(error.into())
        }
    }
}

async fn client_handshake(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    client: ClientHandshake,
    max_len: usize,
) -> Result<Negotiated, Error> {
    client.request().write(stream).await?;
    let response = HandshakeResponse::read(stream, max_len).await?;
    Ok(client.validate_server_response(&response)?)
}

async fn with_timeout<F>(duration: std::time::Duration, handshake: F) -> Result<Negotiated, Error>
where
    F: std::future::Future<Output = Result<Negotiated, Error>>,
{
    timeout(duration, handshake)
        .await
        .map_err(|_| Error::Handshake(HandshakeError::Timeout))?
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
