use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, info_span, warn, Instrument};

use crate::session::Peer;
use crate::smtpd::{SessionError, Smtpd, SmtpdConfig};

/// Serve the one session tcpserver handed us.
pub async fn serve_stdio(config: Arc<SmtpdConfig>, peer: Peer) -> Result<(), SessionError> {
    let span = info_span!("smtpd", remote_ip = %peer.remote_ip);
    // client bytes on stdin, replies on stdout
    let transport = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    let res = Smtpd::new(config, Box::new(transport), peer)
        .run()
        .instrument(span)
        .await;
    if let Err(e) = &res {
        info!("session ended: {}", e);
    }
    res
}

/// Bind every port on `address` and serve until one of the listeners fails.
pub async fn run(config: Arc<SmtpdConfig>, address: &str, ports: &[u16]) -> Result<()> {
    let mut handles = vec![];

    for &port in ports {
        let addr = format!("{}:{}", address, port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("Listening on {}", addr);

        let config = config.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = serve(listener, config).await {
                warn!("Server on port {} failed: {:#}", port, e);
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }
    Ok(())
}

/// Accept loop: one task per connection.
pub async fn serve(listener: TcpListener, config: Arc<SmtpdConfig>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, client_addr)) => {
                let config = config.clone();
                tokio::spawn(async move {
                    handle_client(config, stream, client_addr).await;
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

async fn handle_client(config: Arc<SmtpdConfig>, stream: TcpStream, client_addr: SocketAddr) {
    let local_ip = match stream.local_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            warn!(remote = %client_addr, "no local address: {}", e);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let peer = Peer {
        local_host: local_ip.clone(),
        local_ip,
        remote_ip: client_addr.ip().to_string(),
        ..Peer::default()
    };

    let span = info_span!("smtpd", remote_ip = %client_addr.ip(), port = client_addr.port());
    async move {
        info!("New connection");
        match Smtpd::new(config, Box::new(stream), peer).run().await {
            Ok(()) => info!("Connection closed"),
            Err(e) => info!("Connection dropped: {}", e),
        }
    }
    .instrument(span)
    .await
}
