use anyhow::{anyhow, Context, Result};
use std::{fs::File, io::BufReader, net::ToSocketAddrs, path::PathBuf, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::{rustls, TlsAcceptor};
use wolframite::{
    CloseReason, Endpoint, EndpointError, Error, Message, Negotiator, ServerConfig, Session,
    WebSocket,
};

#[derive(argh::FromArgs)]
#[argh(description = "echo server example")]
struct Args {
    #[argh(option, description = "address to bind to")]
    bind: String,

    #[argh(option, description = "cert private key")]
    key: Option<PathBuf>,

    #[argh(option, description = "certificate")]
    cert: Option<PathBuf>,

    #[argh(option, description = "subprotocol to offer, may be repeated")]
    subprotocol: Vec<String>,
}

struct Echo;

impl Endpoint for Echo {
    fn on_open(&self, session: &Session) -> Result<(), EndpointError> {
        log::info!("open, subprotocol {:?}", session.subprotocol());
        Ok(())
    }

    fn on_message(&self, session: &Session, message: Message) -> Result<(), EndpointError> {
        log::info!("echoing {:?} message of {} bytes", message.kind(), message.len());
        session.send(message)?;
        Ok(())
    }

    fn on_close(&self, _session: &Session, reason: &CloseReason) {
        log::info!("closed: {}", reason);
    }

    fn on_error(&self, _session: &Session, error: &Error) {
        log::warn!("error: {}", error);
    }
}

async fn handle(
    stream: impl AsyncRead + AsyncWrite + Unpin,
    negotiator: &Negotiator,
) -> Result<()> {
    let ws = WebSocket::accept_with(stream, negotiator, Arc::new(Echo))
        .await
        .context("accept")?;
    let reason = ws.run().await.context("run")?;
    println!("client left: {}", reason);
    Ok(())
}

fn spawn_client<F>(future: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            println!("error: {:?}", err);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let addr = args
        .bind
        .to_socket_addrs()
        .context("to socket address")?
        .next()
        .ok_or_else(|| anyhow!("to socket address"))?;

    let config = args
        .subprotocol
        .iter()
        .fold(ServerConfig::default(), |config, subprotocol| {
            config.with_subprotocol(subprotocol.as_str())
        });
    let negotiator = Arc::new(Negotiator::new(config));

    match (args.cert.as_ref(), args.key.as_ref()) {
        (Some(cert), Some(key)) => {
            let certs = rustls_pemfile::certs(&mut BufReader::new(
                File::open(cert).context("open cert file")?,
            ))
            .collect::<Result<Vec<_>, _>>()
            .context("parse cert file")?;

            let key = rustls_pemfile::private_key(&mut BufReader::new(
                File::open(key).context("open key file")?,
            ))
            .context("parse key file")?
            .ok_or_else(|| anyhow!("no key file"))?;

            let config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("server config")?;
            let acceptor = TlsAcceptor::from(Arc::new(config));

            let listener = TcpListener::bind(addr).await.context("bind tls")?;

            loop {
                let (stream, peer_addr) = listener.accept().await.context("accept tls tcp")?;
                println!("new client at {}", peer_addr);

                let acceptor = acceptor.clone();
                let negotiator = negotiator.clone();
                spawn_client(async move {
                    let stream = acceptor.accept(stream).await.context("accept tls tls")?;
                    handle(stream, &negotiator).await.context("handle")
                });
            }
        }

        (None, None) => {
            let listener = TcpListener::bind(addr).await.context("bind")?;
            loop {
                let (stream, peer_addr) = listener.accept().await.context("accept tcp")?;
                println!("new client at {}", peer_addr);

                let negotiator = negotiator.clone();
                spawn_client(async move { handle(stream, &negotiator).await.context("handle") });
            }
        }

        _ => {
            anyhow::bail!("if using tls, both --cert and --key must be passed");
        }
    }
}
