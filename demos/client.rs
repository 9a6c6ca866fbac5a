use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::{fs::File, io::BufReader, net::ToSocketAddrs, path::PathBuf, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};
use url::Url;
use wolframite::{CloseReason, Endpoint, EndpointError, Error, Message, Session, WebSocket};

#[derive(argh::FromArgs)]
#[argh(description = "client example")]
struct Args {
    #[argh(option, description = "remote host to connect to")]
    request: Url,

    #[argh(option, description = "domain (CN) of the remote host")]
    domain: Option<String>,

    #[argh(option, description = "ca certificate")]
    ca: Option<PathBuf>,

    #[argh(option, description = "text message to send, may be repeated")]
    send: Vec<String>,
}

/// Sends every message on open and closes once as many have come back.
struct Printer {
    outgoing: Vec<String>,
    received: Mutex<usize>,
}

impl Endpoint for Printer {
    fn on_open(&self, session: &Session) -> Result<(), EndpointError> {
        for text in &self.outgoing {
            session.send_text(text.as_str())?;
        }
        if self.outgoing.is_empty() {
            session.close(CloseReason::normal())?;
        }
        Ok(())
    }

    fn on_message(&self, session: &Session, message: Message) -> Result<(), EndpointError> {
        println!("server sent: {:?}", message);
        let mut received = self.received.lock();
        *received += 1;
        if *received == self.outgoing.len() {
            session.close(CloseReason::normal())?;
        }
        Ok(())
    }

    fn on_error(&self, _session: &Session, error: &Error) {
        println!("error: {}", error);
    }
}

async fn do_connect(
    url: Url,
    stream: impl AsyncRead + AsyncWrite + Unpin,
    outgoing: Vec<String>,
) -> Result<()> {
    let printer = Arc::new(Printer {
        outgoing,
        received: Mutex::new(0),
    });
    let ws = WebSocket::connect(&url, stream, &wolframite::ClientConfig::default(), printer)
        .await
        .context("connect")?;

    let reason = ws.run().await?;
    if reason.is_normal() {
        println!("closed normally");
    } else {
        anyhow::bail!("closed: {}", reason);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let addr = (
        args.request.host_str().ok_or_else(|| anyhow!("no host"))?,
        args.request
            .port_or_known_default()
            .ok_or_else(|| anyhow!("no port"))?,
    )
        .to_socket_addrs()
        .context("to socket address")?
        .next()
        .ok_or_else(|| anyhow!("get socket address"))?;

    if args.request.scheme() == "wss" {
        let mut root_cert_store = RootCertStore::empty();
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca) = args.ca.as_ref() {
            let ca_file = File::open(ca).context("read ca file")?;
            let mut buf_reader = BufReader::new(ca_file);
            rustls_pemfile::certs(&mut buf_reader)
                .collect::<Result<Vec<_>, _>>()
                .context("read certs from CA")?
                .into_iter()
                .map(|cert| root_cert_store.add(cert))
                .collect::<Result<Vec<_>, _>>()
                .context("add certs to root store")?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let host = args
            .domain
            .clone()
            .or_else(|| args.request.host_str().map(String::from))
            .ok_or_else(|| anyhow!("no host"))?;
        let dns_name = ServerName::try_from(host)
            .context("server name")?
            .to_owned();

        let tcp_stream = TcpStream::connect(addr).await.context("connect")?;
        let tls_stream = connector
            .connect(dns_name, tcp_stream)
            .await
            .context("tls")?;

        do_connect(args.request, tls_stream, args.send).await?;
    } else {
        do_connect(
            args.request,
            TcpStream::connect(addr).await.context("connect")?,
            args.send,
        )
        .await?;
    }

    Ok(())
}
