pub mod handler;
pub mod serve;
pub mod tls;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::cache::Cache;
use crate::settings::Settings;
use crate::storage::StorageProvider;

/// Everything a request handler needs, shared across all connections.
pub struct App {
    pub settings: Arc<Settings>,
    pub cache: Arc<Cache>,
    pub providers: HashMap<String, Arc<dyn StorageProvider>>,
}

pub async fn run(listener: TcpListener, app: Arc<App>) -> Result<()> {
    let acceptor = match &app.settings.tls_certificate_dir {
        Some(dir) => Some(tls::build_acceptor(dir, &app.settings.host_names())?),
        None => None,
    };
    let address = listener
        .local_addr()
        .context("listener has no local address")?;
    info!(%address, tls = acceptor.is_some(), "pennycdn listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, peer, app).await,
                    Err(err) => debug!(%peer, error = %err, "tls handshake failed"),
                },
                None => serve_connection(stream, peer, app).await,
            }
        });
    }
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, app: Arc<App>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handler::handle(req, peer, app.clone()));
    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(%peer, error = %err, "connection error");
    }
}
