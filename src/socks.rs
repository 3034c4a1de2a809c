//! SOCKS5-mode front-end.
//!
//! The SOCKS5 protocol itself (handshake, command parsing, replies and the
//! TCP relay) is handled by `fast-socks5`. This module only sits between the
//! command being read and the outbound connection being made: it turns the
//! engine's target into a [`RequestMeta`], routes it through the
//! [`Pipeline`], and hands the final address back to the engine.

use crate::addr::{Command, DestinationSpec, RequestMeta};
use crate::error::{ProxyError, Result};
use crate::pipeline::Pipeline;
use crate::proxy::accept_retrying;
use fast_socks5::server::{run_tcp_proxy, Socks5ServerProtocol, SocksServerError};
use fast_socks5::util::target_addr::TargetAddr;
use fast_socks5::{ReplyError, Socks5Command};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

/// SOCKS5 proxy front-end.
#[derive(Clone)]
pub struct SocksFrontend {
    pipeline: Pipeline,
    connect_timeout: Duration,
}

impl SocksFrontend {
    pub fn new(pipeline: Pipeline, connect_timeout: Duration) -> Self {
        Self {
            pipeline,
            connect_timeout,
        }
    }

    /// Accepts connections forever, one task per connection.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = accept_retrying(|| listener.accept()).await;
            trace!(peer = %peer_addr, "Accepted SOCKS5 connection");

            let frontend = self.clone();
            tokio::spawn(async move {
                if let Err(e) = frontend.handle(stream).await {
                    debug!(peer = %peer_addr, error = %e, "SOCKS5 session ended with error");
                }
            });
        }
    }

    /// Runs one SOCKS5 session.
    pub async fn handle(&self, stream: TcpStream) -> Result<()> {
        let (proto, cmd, target) = Socks5ServerProtocol::accept_no_auth(stream)
            .await
            .map_err(socks_error)?
            .read_command()
            .await
            .map_err(socks_error)?;

        let request = RequestMeta::new(command_kind(&cmd), destination_of(&target));

        let routed = match self.pipeline.route(&request).await {
            Ok(routed) => routed,
            Err(e) => {
                warn!(requested = %request.destination, error = %e, "Resolution failed");
                proto
                    .reply_error(&ReplyError::HostUnreachable)
                    .await
                    .map_err(socks_error)?;
                return Err(e);
            }
        };

        match cmd {
            Socks5Command::TCPConnect => {
                debug!(requested = %request.destination, target = %routed.addr, "Connecting");
                run_tcp_proxy(
                    proto,
                    &TargetAddr::Ip(routed.addr),
                    self.connect_timeout,
                    true,
                )
                .await
                .map_err(socks_error)?;
                Ok(())
            }
            _ => {
                proto
                    .reply_error(&ReplyError::CommandNotSupported)
                    .await
                    .map_err(socks_error)?;
                Err(ProxyError::Socks {
                    message: format!("unsupported command {}", request.command),
                })
            }
        }
    }
}

/// Maps the engine's command to the pipeline's command kind.
fn command_kind(cmd: &Socks5Command) -> Command {
    match cmd {
        Socks5Command::TCPConnect => Command::Connect,
        Socks5Command::TCPBind => Command::Bind,
        Socks5Command::UDPAssociate => Command::Associate,
    }
}

/// Maps the engine's target address to a destination.
fn destination_of(target: &TargetAddr) -> DestinationSpec {
    match target {
        TargetAddr::Ip(addr) => DestinationSpec::Ip(*addr),
        TargetAddr::Domain(fqdn, port) => DestinationSpec::Domain {
            fqdn: fqdn.clone(),
            port: *port,
        },
    }
}

fn socks_error(e: SocksServerError) -> ProxyError {
    ProxyError::Socks {
        message: e.to_string(),
    }
}
